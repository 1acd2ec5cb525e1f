//! The `#~` stream: table schemas, row storage, and its binary layout.
//!
//! Rows are stored as plain column values. Heap and table indices are kept
//! as read; coded indices stay encoded and are taken apart with
//! [`Coded::decode`]. Column widths are a function of the heap sizes and
//! row counts, so they are recomputed on every write.

use crate::error::{Error, Result};

/// Table identifiers (ECMA-335 II.22)
pub(crate) mod id {
    pub(crate) const MODULE: usize = 0x00;
    pub(crate) const TYPE_REF: usize = 0x01;
    pub(crate) const TYPE_DEF: usize = 0x02;
    pub(crate) const FIELD_PTR: usize = 0x03;
    pub(crate) const FIELD: usize = 0x04;
    pub(crate) const METHOD_PTR: usize = 0x05;
    pub(crate) const METHOD_DEF: usize = 0x06;
    pub(crate) const PARAM_PTR: usize = 0x07;
    pub(crate) const PARAM: usize = 0x08;
    pub(crate) const INTERFACE_IMPL: usize = 0x09;
    pub(crate) const MEMBER_REF: usize = 0x0A;
    pub(crate) const CONSTANT: usize = 0x0B;
    pub(crate) const CUSTOM_ATTRIBUTE: usize = 0x0C;
    pub(crate) const FIELD_MARSHAL: usize = 0x0D;
    pub(crate) const DECL_SECURITY: usize = 0x0E;
    pub(crate) const CLASS_LAYOUT: usize = 0x0F;
    pub(crate) const FIELD_LAYOUT: usize = 0x10;
    pub(crate) const STANDALONE_SIG: usize = 0x11;
    pub(crate) const EVENT_MAP: usize = 0x12;
    pub(crate) const EVENT_PTR: usize = 0x13;
    pub(crate) const EVENT: usize = 0x14;
    pub(crate) const PROPERTY_MAP: usize = 0x15;
    pub(crate) const PROPERTY_PTR: usize = 0x16;
    pub(crate) const PROPERTY: usize = 0x17;
    pub(crate) const METHOD_SEMANTICS: usize = 0x18;
    pub(crate) const METHOD_IMPL: usize = 0x19;
    pub(crate) const MODULE_REF: usize = 0x1A;
    pub(crate) const TYPE_SPEC: usize = 0x1B;
    pub(crate) const IMPL_MAP: usize = 0x1C;
    pub(crate) const FIELD_RVA: usize = 0x1D;
    pub(crate) const ENC_LOG: usize = 0x1E;
    pub(crate) const ENC_MAP: usize = 0x1F;
    pub(crate) const ASSEMBLY: usize = 0x20;
    pub(crate) const ASSEMBLY_PROCESSOR: usize = 0x21;
    pub(crate) const ASSEMBLY_OS: usize = 0x22;
    pub(crate) const ASSEMBLY_REF: usize = 0x23;
    pub(crate) const ASSEMBLY_REF_PROCESSOR: usize = 0x24;
    pub(crate) const ASSEMBLY_REF_OS: usize = 0x25;
    pub(crate) const FILE: usize = 0x26;
    pub(crate) const EXPORTED_TYPE: usize = 0x27;
    pub(crate) const MANIFEST_RESOURCE: usize = 0x28;
    pub(crate) const NESTED_CLASS: usize = 0x29;
    pub(crate) const GENERIC_PARAM: usize = 0x2A;
    pub(crate) const METHOD_SPEC: usize = 0x2B;
    pub(crate) const GENERIC_PARAM_CONSTRAINT: usize = 0x2C;
}

/// Number of table identifiers this reader understands
pub(crate) const TABLE_COUNT: usize = 0x2D;

/// Tables whose rows must be sorted by their primary key
const SORTED: u64 = 0x0000_1600_3301_FA00;

/// Coded index kinds (ECMA-335 II.24.2.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Coded {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl Coded {
    /// Target tables in tag order; `None` marks an unused tag
    fn targets(self) -> &'static [Option<usize>] {
        use id::*;
        match self {
            Self::TypeDefOrRef => &[Some(TYPE_DEF), Some(TYPE_REF), Some(TYPE_SPEC)],
            Self::HasConstant => &[Some(FIELD), Some(PARAM), Some(PROPERTY)],
            Self::HasCustomAttribute => &[
                Some(METHOD_DEF),
                Some(FIELD),
                Some(TYPE_REF),
                Some(TYPE_DEF),
                Some(PARAM),
                Some(INTERFACE_IMPL),
                Some(MEMBER_REF),
                Some(MODULE),
                Some(DECL_SECURITY),
                Some(PROPERTY),
                Some(EVENT),
                Some(STANDALONE_SIG),
                Some(MODULE_REF),
                Some(TYPE_SPEC),
                Some(ASSEMBLY),
                Some(ASSEMBLY_REF),
                Some(FILE),
                Some(EXPORTED_TYPE),
                Some(MANIFEST_RESOURCE),
                Some(GENERIC_PARAM),
                Some(GENERIC_PARAM_CONSTRAINT),
                Some(METHOD_SPEC),
            ],
            Self::HasFieldMarshal => &[Some(FIELD), Some(PARAM)],
            Self::HasDeclSecurity => &[Some(TYPE_DEF), Some(METHOD_DEF), Some(ASSEMBLY)],
            Self::MemberRefParent => &[
                Some(TYPE_DEF),
                Some(TYPE_REF),
                Some(MODULE_REF),
                Some(METHOD_DEF),
                Some(TYPE_SPEC),
            ],
            Self::HasSemantics => &[Some(EVENT), Some(PROPERTY)],
            Self::MethodDefOrRef => &[Some(METHOD_DEF), Some(MEMBER_REF)],
            Self::MemberForwarded => &[Some(FIELD), Some(METHOD_DEF)],
            Self::Implementation => &[Some(FILE), Some(ASSEMBLY_REF), Some(EXPORTED_TYPE)],
            Self::CustomAttributeType => &[None, None, Some(METHOD_DEF), Some(MEMBER_REF), None],
            Self::ResolutionScope => &[
                Some(MODULE),
                Some(MODULE_REF),
                Some(ASSEMBLY_REF),
                Some(TYPE_REF),
            ],
            Self::TypeOrMethodDef => &[Some(TYPE_DEF), Some(METHOD_DEF)],
        }
    }

    fn tag_bits(self) -> u32 {
        match self.targets().len() {
            0..=2 => 1,
            3..=4 => 2,
            5..=8 => 3,
            9..=16 => 4,
            _ => 5,
        }
    }

    /// Splits a coded value into its target table and row
    pub(crate) fn decode(self, value: u32) -> Result<(usize, u32)> {
        let bits = self.tag_bits();
        let tag = (value & ((1 << bits) - 1)) as usize;
        match self.targets().get(tag) {
            Some(Some(table)) => Ok((*table, value >> bits)),
            _ => Err(Error::malformed(format!("invalid {self:?} tag {tag}"))),
        }
    }

    /// Combines a target table and row into a coded value
    pub(crate) fn encode(self, table: usize, row: u32) -> Result<u32> {
        let tag = self
            .targets()
            .iter()
            .position(|t| *t == Some(table))
            .ok_or_else(|| Error::internal(format!("table {table:#x} is not a {self:?} target")))?;
        Ok((row << self.tag_bits()) | tag as u32)
    }
}

/// Column kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Col {
    U16,
    U32,
    Str,
    Guid,
    Blob,
    Table(usize),
    Coded(Coded),
}

/// Column layout of `table`
pub(crate) fn schema(table: usize) -> &'static [Col] {
    use id::*;
    use Col::{Blob, Guid, Str, Table, U16, U32};
    const TDOR: Col = Col::Coded(Coded::TypeDefOrRef);
    match table {
        MODULE => &[U16, Str, Guid, Guid, Guid],
        TYPE_REF => &[Col::Coded(Coded::ResolutionScope), Str, Str],
        TYPE_DEF => &[U32, Str, Str, TDOR, Table(FIELD), Table(METHOD_DEF)],
        FIELD_PTR => &[Table(FIELD)],
        FIELD => &[U16, Str, Blob],
        METHOD_PTR => &[Table(METHOD_DEF)],
        METHOD_DEF => &[U32, U16, U16, Str, Blob, Table(PARAM)],
        PARAM_PTR => &[Table(PARAM)],
        PARAM => &[U16, U16, Str],
        INTERFACE_IMPL => &[Table(TYPE_DEF), TDOR],
        MEMBER_REF => &[Col::Coded(Coded::MemberRefParent), Str, Blob],
        CONSTANT => &[U16, Col::Coded(Coded::HasConstant), Blob],
        CUSTOM_ATTRIBUTE => &[
            Col::Coded(Coded::HasCustomAttribute),
            Col::Coded(Coded::CustomAttributeType),
            Blob,
        ],
        FIELD_MARSHAL => &[Col::Coded(Coded::HasFieldMarshal), Blob],
        DECL_SECURITY => &[U16, Col::Coded(Coded::HasDeclSecurity), Blob],
        CLASS_LAYOUT => &[U16, U32, Table(TYPE_DEF)],
        FIELD_LAYOUT => &[U32, Table(FIELD)],
        STANDALONE_SIG => &[Blob],
        EVENT_MAP => &[Table(TYPE_DEF), Table(EVENT)],
        EVENT_PTR => &[Table(EVENT)],
        EVENT => &[U16, Str, TDOR],
        PROPERTY_MAP => &[Table(TYPE_DEF), Table(PROPERTY)],
        PROPERTY_PTR => &[Table(PROPERTY)],
        PROPERTY => &[U16, Str, Blob],
        METHOD_SEMANTICS => &[U16, Table(METHOD_DEF), Col::Coded(Coded::HasSemantics)],
        METHOD_IMPL => &[
            Table(TYPE_DEF),
            Col::Coded(Coded::MethodDefOrRef),
            Col::Coded(Coded::MethodDefOrRef),
        ],
        MODULE_REF => &[Str],
        TYPE_SPEC => &[Blob],
        IMPL_MAP => &[U16, Col::Coded(Coded::MemberForwarded), Str, Table(MODULE_REF)],
        FIELD_RVA => &[U32, Table(FIELD)],
        ENC_LOG => &[U32, U32],
        ENC_MAP => &[U32],
        ASSEMBLY => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
        ASSEMBLY_PROCESSOR => &[U32],
        ASSEMBLY_OS => &[U32, U32, U32],
        ASSEMBLY_REF => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
        ASSEMBLY_REF_PROCESSOR => &[U32, Table(ASSEMBLY_REF)],
        ASSEMBLY_REF_OS => &[U32, U32, U32, Table(ASSEMBLY_REF)],
        FILE => &[U32, Str, Blob],
        EXPORTED_TYPE => &[U32, U32, Str, Str, Col::Coded(Coded::Implementation)],
        MANIFEST_RESOURCE => &[U32, U32, Str, Col::Coded(Coded::Implementation)],
        NESTED_CLASS => &[Table(TYPE_DEF), Table(TYPE_DEF)],
        GENERIC_PARAM => &[U16, U16, Col::Coded(Coded::TypeOrMethodDef), Str],
        METHOD_SPEC => &[Col::Coded(Coded::MethodDefOrRef), Blob],
        GENERIC_PARAM_CONSTRAINT => &[Table(GENERIC_PARAM), TDOR],
        _ => &[],
    }
}

/// One table row: column values in schema order
pub(crate) type Row = Vec<u32>;

/// Every table of a module, plus the heap index widths they were read with
#[derive(Debug, Clone, Default)]
pub(crate) struct TableSet {
    tables: Vec<Vec<Row>>,
    /// `HeapSizes` bits: 0x01 strings, 0x02 GUIDs, 0x04 blobs are 4 bytes wide
    pub(crate) heap_sizes: u8,
}

impl TableSet {
    pub(crate) fn new() -> Self {
        Self {
            tables: vec![Vec::new(); TABLE_COUNT],
            heap_sizes: 0,
        }
    }

    /// Rows of `table`
    pub(crate) fn rows(&self, table: usize) -> &[Row] {
        &self.tables[table]
    }

    /// The row at 1-based `rid`
    pub(crate) fn row(&self, table: usize, rid: u32) -> Result<&Row> {
        rid.checked_sub(1)
            .and_then(|i| self.tables[table].get(i as usize))
            .ok_or_else(|| Error::malformed(format!("row {rid} of table {table:#04x} does not exist")))
    }

    pub(crate) fn len(&self, table: usize) -> u32 {
        self.tables[table].len() as u32
    }

    /// Appends a row and returns its 1-based rid
    pub(crate) fn push(&mut self, table: usize, row: Row) -> u32 {
        self.tables[table].push(row);
        self.tables[table].len() as u32
    }

    /// Sorts `table` by the column `key`, keeping the order of equal keys
    pub(crate) fn sort_by_column(&mut self, table: usize, key: usize) {
        self.tables[table].sort_by_key(|row| row[key]);
    }

    /// Sets the heap width flags from the heap lengths
    pub(crate) fn size_heaps(&mut self, strings: usize, guids: usize, blobs: usize) {
        self.heap_sizes = u8::from(strings >= 0x10000)
            | (u8::from(guids >= 0x10000) << 1)
            | (u8::from(blobs >= 0x10000) << 2);
    }

    fn widths(&self) -> Widths {
        let mut counts = [0u32; TABLE_COUNT];
        for (table, rows) in self.tables.iter().enumerate() {
            counts[table] = rows.len() as u32;
        }
        Widths::new(counts, self.heap_sizes)
    }

    /// Parses a `#~` stream
    pub(crate) fn read(stream: &[u8]) -> Result<Self> {
        let short = || Error::malformed("table stream is truncated");
        let header = stream.get(..24).ok_or_else(short)?;
        let heap_sizes = header[6];
        let valid = u64::from_le_bytes(header[8..16].try_into().map_err(|_| short())?);
        if valid >> TABLE_COUNT != 0 {
            return Err(Error::malformed(format!(
                "unsupported tables present (valid mask {valid:#018x})"
            )));
        }

        let mut counts = [0u32; TABLE_COUNT];
        let mut at = 24;
        for (table, count) in counts.iter_mut().enumerate() {
            if valid & (1 << table) != 0 {
                *count = read_u32(stream, at).ok_or_else(short)?;
                at += 4;
            }
        }
        if heap_sizes & 0x40 != 0 {
            at += 4;
        }

        let widths = Widths::new(counts, heap_sizes);
        let mut set = Self {
            tables: vec![Vec::new(); TABLE_COUNT],
            heap_sizes,
        };
        for (table, &count) in counts.iter().enumerate() {
            let columns = schema(table);
            let mut rows = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let mut row = Vec::with_capacity(columns.len());
                for &column in columns {
                    let width = widths.of(column);
                    let value = match width {
                        2 => stream
                            .get(at..at + 2)
                            .map(|b| u32::from(u16::from_le_bytes([b[0], b[1]]))),
                        _ => read_u32(stream, at),
                    }
                    .ok_or_else(short)?;
                    row.push(value);
                    at += width;
                }
                rows.push(row);
            }
            set.tables[table] = rows;
        }
        Ok(set)
    }

    /// Serializes the tables as a `#~` stream
    pub(crate) fn write(&self) -> Result<Vec<u8>> {
        let widths = self.widths();
        let mut valid = 0u64;
        for (table, rows) in self.tables.iter().enumerate() {
            if !rows.is_empty() {
                valid |= 1 << table;
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&[2, 0, self.heap_sizes, 1]);
        out.extend_from_slice(&valid.to_le_bytes());
        out.extend_from_slice(&SORTED.to_le_bytes());
        for rows in self.tables.iter().filter(|rows| !rows.is_empty()) {
            out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
        }
        for (table, rows) in self.tables.iter().enumerate() {
            let columns = schema(table);
            for row in rows {
                if row.len() != columns.len() {
                    return Err(Error::internal(format!(
                        "row of table {table:#04x} has {} columns, expected {}",
                        row.len(),
                        columns.len()
                    )));
                }
                for (&column, &value) in columns.iter().zip(row) {
                    match widths.of(column) {
                        2 => {
                            let narrow = u16::try_from(value).map_err(|_| {
                                Error::internal(format!(
                                    "value {value:#x} does not fit a column of table {table:#04x}"
                                ))
                            })?;
                            out.extend_from_slice(&narrow.to_le_bytes());
                        }
                        _ => out.extend_from_slice(&value.to_le_bytes()),
                    }
                }
            }
        }
        while out.len() % 4 != 0 {
            out.push(0);
        }
        Ok(out)
    }
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

struct Widths {
    counts: [u32; TABLE_COUNT],
    heap_sizes: u8,
}

impl Widths {
    fn new(counts: [u32; TABLE_COUNT], heap_sizes: u8) -> Self {
        Self { counts, heap_sizes }
    }

    fn of(&self, column: Col) -> usize {
        let wide = |flag: u8| if self.heap_sizes & flag != 0 { 4 } else { 2 };
        match column {
            Col::U16 => 2,
            Col::U32 => 4,
            Col::Str => wide(0x01),
            Col::Guid => wide(0x02),
            Col::Blob => wide(0x04),
            Col::Table(table) => {
                if self.counts[table] < 0x10000 {
                    2
                } else {
                    4
                }
            }
            Col::Coded(coded) => {
                let largest = coded
                    .targets()
                    .iter()
                    .flatten()
                    .map(|&t| self.counts[t])
                    .max()
                    .unwrap_or(0);
                if largest < (1 << (16 - coded.tag_bits())) {
                    2
                } else {
                    4
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coded_index_tags() {
        assert_eq!(Coded::HasCustomAttribute.tag_bits(), 5);
        assert_eq!(Coded::MemberRefParent.tag_bits(), 3);
        assert_eq!(Coded::CustomAttributeType.tag_bits(), 3);
        assert_eq!(Coded::TypeDefOrRef.encode(id::TYPE_REF, 3).unwrap(), 0b1101);
        assert_eq!(Coded::TypeDefOrRef.decode(0b1101).unwrap(), (id::TYPE_REF, 3));
        assert_eq!(
            Coded::CustomAttributeType.decode(Coded::CustomAttributeType.encode(id::MEMBER_REF, 7).unwrap()).unwrap(),
            (id::MEMBER_REF, 7)
        );
        assert!(Coded::CustomAttributeType.decode(1).is_err());
        assert!(Coded::HasSemantics.encode(id::FIELD, 1).is_err());
    }

    #[test]
    fn test_stream_layout_and_read_back() {
        let mut set = TableSet::new();
        set.push(id::MODULE, vec![0, 10, 1, 0, 0]);
        set.push(id::TYPE_REF, vec![Coded::ResolutionScope.encode(id::ASSEMBLY_REF, 1).unwrap(), 20, 30]);
        set.push(id::ASSEMBLY_REF, vec![4, 0, 0, 0, 0, 0, 40, 0, 0]);

        let bytes = set.write().unwrap();
        assert_eq!(bytes[4], 2);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0x8_0000_0003);
        // header, three row counts, then 10 + 6 + 20 bytes of rows
        assert_eq!(bytes.len(), 24 + 12 + 36);

        let read = TableSet::read(&bytes).unwrap();
        assert_eq!(read.rows(id::TYPE_REF), set.rows(id::TYPE_REF));
        assert_eq!(read.row(id::ASSEMBLY_REF, 1).unwrap()[6], 40);
        assert!(read.row(id::ASSEMBLY_REF, 2).is_err());
    }

    #[test]
    fn test_wide_heaps_widen_columns() {
        let mut set = TableSet::new();
        set.push(id::MODULE_REF, vec![0x12345]);
        assert!(set.write().is_err());
        set.size_heaps(0x20000, 16, 1);
        let bytes = set.write().unwrap();
        assert_eq!(bytes[6], 0x01);
        let read = TableSet::read(&bytes).unwrap();
        assert_eq!(read.rows(id::MODULE_REF), &[vec![0x12345]]);
    }
}
