//! Reading a [`Module`] out of a PE image.
//!
//! Type tokens are renumbered over the types that end up in the model, so
//! an image whose `<Module>` row carries no members decodes with its first
//! real type at `0x02000001`. Member tokens keep their image rows. Flag bits
//! that only describe which side tables hold data (defaults, marshalling,
//! security, field RVAs) are cleared; the writer derives them again.
//!
//! Method bodies keep their byte code. `ldstr` operands and member
//! references are re-pointed into the module's own user string and member
//! reference lists, and TypeDef operands follow the renumbering; every other
//! token operand keeps its image value.

use super::heap::Heaps;
use super::pe::{PeImage, Streams};
use super::signature;
use super::tables::{id, Coded, Row, TableSet};
use crate::error::{Error, Result};
use crate::module::{
    known, table, Accessor, AssemblyRef, ClassLayout, Constant, CustomAttribute, EventDef,
    ExportScope, ExportedType, FieldAttributes, FieldDef, GenericParam, MemberRef,
    MethodAttributes, MethodBody, MethodDef, MethodImplAttributes, MethodOverride, MethodRef,
    Module, PInvoke, ParamAttributes, PropertyAttributes, PropertyDef, Token, TypeAttributes,
    TypeDef, TypeName, TypeScope, TypeSig,
};
use crate::version::VersionSpec;
use std::collections::HashMap;
use std::ops::Range;
use tracing::trace;

/// Semantics bits of MethodSemantics rows
mod semantics {
    pub(super) const SETTER: u32 = 0x01;
    pub(super) const GETTER: u32 = 0x02;
    pub(super) const ADD_ON: u32 = 0x08;
    pub(super) const REMOVE_ON: u32 = 0x10;
    pub(super) const FIRE: u32 = 0x20;
}

type Key = (usize, u32);

/// Decodes the module stored in a PE image
pub(crate) fn read_module(data: &[u8]) -> Result<Module> {
    let pe = PeImage::parse(data)?;
    let streams = Streams::parse(pe.metadata()?)?;
    let tables = TableSet::read(streams.tables)?;
    let heaps = Heaps {
        strings: streams.strings,
        blobs: streams.blobs,
        guids: streams.guids,
        user_strings: streams.user_strings,
    };
    Decoder::new(&pe, heaps, &tables)?.module()
}

/// Reads the assembly name from a PE image without decoding declarations
pub(crate) fn read_assembly_name(data: &[u8]) -> Result<String> {
    let pe = PeImage::parse(data)?;
    let streams = Streams::parse(pe.metadata()?)?;
    let tables = TableSet::read(streams.tables)?;
    let heaps = Heaps {
        strings: streams.strings,
        ..Heaps::default()
    };
    let assembly = tables
        .rows(id::ASSEMBLY)
        .first()
        .ok_or_else(|| Error::malformed("image has no assembly manifest"))?;
    Ok(heaps.string(assembly[7])?.to_string())
}

/// `[start, end)` row ranges of a child list column (FieldList, MethodList, ...)
fn list_ranges(tables: &TableSet, owner: usize, column: usize, child: usize) -> Vec<Range<u32>> {
    let owners = tables.rows(owner);
    let end = tables.len(child) + 1;
    owners
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let next = owners.get(i + 1).map_or(end, |next| next[column]);
            row[column].clamp(1, end)..next.clamp(1, end)
        })
        .collect()
}

struct Decoder<'a> {
    pe: &'a PeImage<'a>,
    heaps: Heaps<'a>,
    tables: &'a TableSet,
    core_ref: Option<u32>,
    type_refs: Vec<TypeName>,
    def_names: Vec<String>,
    def_tokens: Vec<Token>,
    method_owner: Vec<u32>,
    field_ranges: Vec<Range<u32>>,
    method_ranges: Vec<Range<u32>>,
    param_ranges: Vec<Range<u32>>,
    attributes: HashMap<Key, Vec<CustomAttribute>>,
}

impl<'a> Decoder<'a> {
    fn new(pe: &'a PeImage<'a>, heaps: Heaps<'a>, tables: &'a TableSet) -> Result<Self> {
        let mut decoder = Self {
            pe,
            heaps,
            tables,
            core_ref: None,
            type_refs: Vec::new(),
            def_names: Vec::new(),
            def_tokens: Vec::new(),
            method_owner: vec![0; tables.len(id::METHOD_DEF) as usize],
            field_ranges: list_ranges(tables, id::TYPE_DEF, 4, id::FIELD),
            method_ranges: list_ranges(tables, id::TYPE_DEF, 5, id::METHOD_DEF),
            param_ranges: list_ranges(tables, id::METHOD_DEF, 5, id::PARAM),
            attributes: HashMap::new(),
        };

        for (rid, row) in (1..).zip(tables.rows(id::ASSEMBLY_REF)) {
            let name = heaps.string(row[6])?;
            if decoder.core_ref.is_none() && AssemblyRef::is_core_name(name) {
                decoder.core_ref = Some(rid);
            }
        }
        for (i, range) in decoder.method_ranges.clone().into_iter().enumerate() {
            for method in range {
                decoder.method_owner[method as usize - 1] = i as u32 + 1;
            }
        }
        decoder.type_refs = decoder.resolve_type_refs()?;
        decoder.def_names = decoder.type_def_names()?;
        decoder.attributes = decoder.custom_attributes()?;
        Ok(decoder)
    }

    fn string(&self, index: u32) -> Result<String> {
        self.heaps.string(index).map(str::to_string)
    }

    fn blob(&self, index: u32) -> Result<&'a [u8]> {
        self.heaps.blob(index)
    }

    fn name_of(&self, token: Token) -> Result<TypeName> {
        let unknown = || Error::malformed(format!("signature names unknown type {token}"));
        let index = (token.row() as usize).checked_sub(1).ok_or_else(unknown)?;
        match token.table() {
            table::TYPE_DEF => self.def_names.get(index).map(|n| TypeName::local(n.as_str())),
            table::TYPE_REF => self.type_refs.get(index).cloned(),
            _ => None,
        }
        .ok_or_else(unknown)
    }

    fn resolve_type_refs(&self) -> Result<Vec<TypeName>> {
        let rows = self.tables.rows(id::TYPE_REF);
        let mut resolved: Vec<Option<TypeName>> = vec![None; rows.len()];
        for rid in 1..=rows.len() as u32 {
            self.resolve_type_ref(rid, &mut resolved, 0)?;
        }
        Ok(resolved.into_iter().flatten().collect())
    }

    fn resolve_type_ref(
        &self,
        rid: u32,
        resolved: &mut Vec<Option<TypeName>>,
        depth: usize,
    ) -> Result<TypeName> {
        if let Some(Some(name)) = resolved.get(rid as usize - 1) {
            return Ok(name.clone());
        }
        if depth > resolved.len() {
            return Err(Error::malformed("cyclic type reference scopes"));
        }
        let row = self.tables.row(id::TYPE_REF, rid)?;
        let simple = qualified(self.heaps.string(row[2])?, self.heaps.string(row[1])?);
        let (scope_table, scope_rid) = Coded::ResolutionScope.decode(row[0])?;
        let name = match scope_table {
            id::TYPE_REF if scope_rid != 0 => {
                let outer = self.resolve_type_ref(scope_rid, resolved, depth + 1)?;
                TypeName {
                    scope: outer.scope,
                    full_name: format!("{}/{simple}", outer.full_name),
                }
            }
            id::ASSEMBLY_REF if scope_rid != 0 => {
                if Some(scope_rid) == self.core_ref {
                    TypeName::core(simple)
                } else {
                    let assembly = self.tables.row(id::ASSEMBLY_REF, scope_rid)?;
                    TypeName::external(self.string(assembly[6])?, simple)
                }
            }
            id::MODULE_REF if scope_rid != 0 => TypeName {
                scope: TypeScope::ModuleRef(self.string(self.tables.row(id::MODULE_REF, scope_rid)?[0])?),
                full_name: simple,
            },
            _ => TypeName::local(simple),
        };
        resolved[rid as usize - 1] = Some(name.clone());
        Ok(name)
    }

    fn type_def_names(&self) -> Result<Vec<String>> {
        let enclosing = self.enclosing_rows();
        let rows = self.tables.rows(id::TYPE_DEF);
        let mut names = Vec::with_capacity(rows.len());
        for rid in 1..=rows.len() as u32 {
            let mut name = self.simple_def_name(rid)?;
            let mut current = enclosing.get(&rid).copied();
            let mut steps = 0;
            while let Some(outer) = current {
                steps += 1;
                if steps > rows.len() {
                    return Err(Error::malformed("cyclic nested type chain"));
                }
                name = format!("{}/{name}", self.simple_def_name(outer)?);
                current = enclosing.get(&outer).copied();
            }
            names.push(name);
        }
        Ok(names)
    }

    fn simple_def_name(&self, rid: u32) -> Result<String> {
        let row = self.tables.row(id::TYPE_DEF, rid)?;
        Ok(qualified(self.heaps.string(row[2])?, self.heaps.string(row[1])?))
    }

    fn enclosing_rows(&self) -> HashMap<u32, u32> {
        self.tables
            .rows(id::NESTED_CLASS)
            .iter()
            .map(|row| (row[0], row[1]))
            .collect()
    }

    /// A TypeDefOrRef coded index as a signature; null decodes to `None`
    fn type_def_or_ref(&self, value: u32) -> Result<Option<TypeSig>> {
        let (target, rid) = Coded::TypeDefOrRef.decode(value)?;
        if rid == 0 {
            return Ok(None);
        }
        self.parent_sig(target, rid).map(Some)
    }

    fn parent_sig(&self, target: usize, rid: u32) -> Result<TypeSig> {
        Ok(match target {
            id::TYPE_DEF => TypeSig::Class(self.name_of(Token::new(table::TYPE_DEF, rid))?),
            id::TYPE_REF => {
                let name = self.name_of(Token::new(table::TYPE_REF, rid))?;
                if name.scope == TypeScope::CoreLibrary {
                    TypeSig::core(&name.full_name)
                } else {
                    TypeSig::Class(name)
                }
            }
            id::TYPE_SPEC => {
                let blob = self.blob(self.tables.row(id::TYPE_SPEC, rid)?[0])?;
                signature::read_type(blob, &|t| self.name_of(t))?
            }
            other => {
                return Err(Error::malformed(format!(
                    "table {other:#04x} cannot be used as a parent type"
                )))
            }
        })
    }

    fn member_ref(&self, rid: u32) -> Result<MemberRef> {
        let row = self.tables.row(id::MEMBER_REF, rid)?;
        let (target, parent_rid) = Coded::MemberRefParent.decode(row[0])?;
        if matches!(target, id::MODULE_REF | id::METHOD_DEF) {
            return Err(Error::malformed(format!(
                "member reference {rid} has an unsupported parent kind"
            )));
        }
        Ok(MemberRef {
            parent: self.parent_sig(target, parent_rid)?,
            name: self.string(row[1])?,
            signature: signature::read_member(self.blob(row[2])?, &|t| self.name_of(t))?,
        })
    }

    fn custom_attributes(&self) -> Result<HashMap<Key, Vec<CustomAttribute>>> {
        let mut out: HashMap<Key, Vec<CustomAttribute>> = HashMap::new();
        for row in self.tables.rows(id::CUSTOM_ATTRIBUTE) {
            let parent = Coded::HasCustomAttribute.decode(row[0])?;
            let (ctor_table, ctor_rid) = Coded::CustomAttributeType.decode(row[1])?;
            let (attribute_type, constructor) = match ctor_table {
                id::METHOD_DEF => {
                    let owner = (ctor_rid as usize)
                        .checked_sub(1)
                        .and_then(|i| self.method_owner.get(i))
                        .copied()
                        .filter(|&owner| owner != 0)
                        .ok_or_else(|| Error::malformed("attribute constructor has no owner"))?;
                    let method = self.tables.row(id::METHOD_DEF, ctor_rid)?;
                    let sig = signature::read_method(self.blob(method[4])?, &|t| self.name_of(t))?;
                    (
                        self.name_of(Token::new(table::TYPE_DEF, owner))?,
                        sig.parameters.into_iter().map(|p| p.param_type).collect(),
                    )
                }
                _ => {
                    let member = self.tables.row(id::MEMBER_REF, ctor_rid)?;
                    let (target, parent_rid) = Coded::MemberRefParent.decode(member[0])?;
                    let attribute_type = match target {
                        id::TYPE_DEF => self.name_of(Token::new(table::TYPE_DEF, parent_rid))?,
                        id::TYPE_REF => self.name_of(Token::new(table::TYPE_REF, parent_rid))?,
                        _ => {
                            return Err(Error::malformed(
                                "attribute constructor parent is not a named type",
                            ))
                        }
                    };
                    let sig = signature::read_method(self.blob(member[2])?, &|t| self.name_of(t))?;
                    (
                        attribute_type,
                        sig.parameters.into_iter().map(|p| p.param_type).collect(),
                    )
                }
            };
            out.entry(parent).or_default().push(CustomAttribute {
                attribute_type,
                constructor,
                value: self.blob(row[2])?.to_vec(),
            });
        }
        Ok(out)
    }

    fn attributes_of(&mut self, table: usize, rid: u32) -> Vec<CustomAttribute> {
        self.attributes.remove(&(table, rid)).unwrap_or_default()
    }

    fn keyed_blobs(&self, table: usize, coded: Coded, parent: usize, value: usize) -> Result<HashMap<Key, Row>> {
        self.tables
            .rows(table)
            .iter()
            .map(|row| Ok((coded.decode(row[parent])?, vec![row[value], row[0]])))
            .collect()
    }

    fn module(mut self) -> Result<Module> {
        let assembly = self
            .tables
            .rows(id::ASSEMBLY)
            .first()
            .cloned()
            .ok_or_else(|| Error::malformed("image has no assembly manifest"))?;
        let module_row = self
            .tables
            .rows(id::MODULE)
            .first()
            .cloned()
            .ok_or_else(|| Error::malformed("image has no module row"))?;

        let version = VersionSpec::full(
            assembly[1],
            assembly[2],
            assembly[3],
            assembly[4],
        );
        let mut module = Module::new(self.string(assembly[7])?, version);
        module.hash_algorithm = assembly[0];
        module.assembly_flags = assembly[5] & !0x0001;
        module.public_key = self.blob(assembly[6])?.to_vec();
        module.culture = self.string(assembly[8])?;
        module.module_name = self.string(module_row[1])?;
        module.mvid = self.heaps.guid(module_row[2])?;
        module.assembly_attributes = self.attributes_of(id::ASSEMBLY, 1);
        module.module_attributes = self.attributes_of(id::MODULE, 1);

        module.assembly_refs = self
            .tables
            .rows(id::ASSEMBLY_REF)
            .iter()
            .map(|row| {
                Ok(AssemblyRef {
                    version: VersionSpec::full(row[0], row[1], row[2], row[3]),
                    flags: row[4],
                    public_key_or_token: self.blob(row[5])?.to_vec(),
                    name: self.string(row[6])?,
                    culture: self.string(row[7])?,
                    hash_value: self.blob(row[8])?.to_vec(),
                })
            })
            .collect::<Result<_>>()?;
        module.exported_types = self.exported_types()?;

        let (types, bodies) = self.types()?;
        module.types = types;
        for (t, m, rva) in bodies {
            let body = self.body(&mut module, rva)?;
            module.types[t].methods[m].body = Some(body);
        }
        Ok(module)
    }

    fn exported_types(&self) -> Result<Vec<ExportedType>> {
        self.tables
            .rows(id::EXPORTED_TYPE)
            .iter()
            .map(|row| {
                let (target, rid) = Coded::Implementation.decode(row[4])?;
                let scope = match target {
                    id::ASSEMBLY_REF => {
                        ExportScope::Assembly(self.string(self.tables.row(id::ASSEMBLY_REF, rid)?[6])?)
                    }
                    id::EXPORTED_TYPE if rid != 0 => ExportScope::Enclosing(rid as usize - 1),
                    _ => {
                        return Err(Error::malformed(
                            "multi-file assemblies are not supported",
                        ))
                    }
                };
                Ok(ExportedType {
                    flags: row[0],
                    type_def_id: row[1],
                    name: self.string(row[2])?,
                    namespace: self.string(row[3])?,
                    scope,
                })
            })
            .collect()
    }

    /// Builds every type; returns them with the `(type, method, rva)` of each body to read
    #[allow(clippy::type_complexity)]
    fn types(&mut self) -> Result<(Vec<TypeDef>, Vec<(usize, usize, u32)>)> {
        let tables = self.tables;
        if !tables.rows(id::FILE).is_empty() {
            return Err(Error::malformed("multi-file assemblies are not supported"));
        }
        let type_count = tables.len(id::TYPE_DEF);

        // <Module> without members has no counterpart in the model
        let skip_global = type_count > 0
            && self.def_names[0] == known::GLOBAL_TYPE
            && self.field_ranges[0].is_empty()
            && self.method_ranges[0].is_empty();
        let mut def_tokens = vec![Token::NULL; type_count as usize];
        let mut next = 1;
        for (rid, token) in (1..).zip(def_tokens.iter_mut()) {
            if rid == 1 && skip_global {
                continue;
            }
            *token = Token::new(table::TYPE_DEF, next);
            next += 1;
        }

        let enclosing = self.enclosing_rows();
        let constants: HashMap<Key, Row> = self.keyed_blobs(id::CONSTANT, Coded::HasConstant, 1, 2)?;
        let marshals: HashMap<Key, Row> = self.keyed_blobs(id::FIELD_MARSHAL, Coded::HasFieldMarshal, 0, 1)?;
        let field_offsets: HashMap<u32, u32> =
            tables.rows(id::FIELD_LAYOUT).iter().map(|r| (r[1], r[0])).collect();
        let layouts: HashMap<u32, ClassLayout> = tables
            .rows(id::CLASS_LAYOUT)
            .iter()
            .map(|r| {
                (
                    r[2],
                    ClassLayout {
                        packing: r[0] as u16,
                        class_size: r[1],
                    },
                )
            })
            .collect();
        let impl_maps: HashMap<Key, Row> = tables
            .rows(id::IMPL_MAP)
            .iter()
            .map(|r| Ok((Coded::MemberForwarded.decode(r[1])?, r.clone())))
            .collect::<Result<_>>()?;
        let mut accessors: HashMap<Key, Vec<(u32, u32)>> = HashMap::new();
        for row in tables.rows(id::METHOD_SEMANTICS) {
            accessors
                .entry(Coded::HasSemantics.decode(row[2])?)
                .or_default()
                .push((row[0], row[1]));
        }
        let property_ranges = self.map_ranges(id::PROPERTY_MAP, id::PROPERTY);
        let event_ranges = self.map_ranges(id::EVENT_MAP, id::EVENT);

        let heaps = self.heaps;
        let constant = |key: Key| -> Result<Option<Constant>> {
            constants
                .get(&key)
                .map(|row| {
                    Ok(Constant {
                        element_type: (row[1] & 0xFF) as u8,
                        value: heaps.blob(row[0])?.to_vec(),
                    })
                })
                .transpose()
        };
        let marshal = |key: Key| -> Result<Option<Vec<u8>>> {
            marshals
                .get(&key)
                .map(|row| heaps.blob(row[0]).map(<[u8]>::to_vec))
                .transpose()
        };

        let mut types = Vec::new();
        let mut bodies = Vec::new();
        for rid in 1..=type_count {
            let token = def_tokens[rid as usize - 1];
            if token.is_null() {
                continue;
            }
            let row = tables.row(id::TYPE_DEF, rid)?;
            let mut ty = TypeDef::new(self.string(row[2])?, self.string(row[1])?, row[0] & !TypeAttributes::HAS_SECURITY);
            ty.token = token;
            ty.extends = self.type_def_or_ref(row[3])?;
            ty.enclosing = enclosing
                .get(&rid)
                .and_then(|&outer| (outer as usize).checked_sub(1))
                .and_then(|i| def_tokens.get(i).copied())
                .filter(|t| !t.is_null());
            ty.layout = layouts.get(&rid).copied();
            ty.generic_params = self.generic_params(id::TYPE_DEF, rid)?;
            ty.attributes = self.attributes_of(id::TYPE_DEF, rid);
            for interface in tables.rows(id::INTERFACE_IMPL).iter().filter(|r| r[0] == rid) {
                if let Some(sig) = self.type_def_or_ref(interface[1])? {
                    ty.interfaces.push(sig);
                }
            }

            for field_rid in self.field_ranges[rid as usize - 1].clone() {
                let field = tables.row(id::FIELD, field_rid)?;
                let mut def = FieldDef::new(
                    self.string(field[1])?,
                    field[0] as u16
                        & !(FieldAttributes::HAS_DEFAULT
                            | FieldAttributes::HAS_FIELD_MARSHAL
                            | FieldAttributes::HAS_FIELD_RVA),
                    signature::read_field(self.blob(field[2])?, &|t| self.name_of(t))?,
                );
                def.token = Token::new(table::FIELD, field_rid);
                def.constant = constant((id::FIELD, field_rid))?;
                def.marshal = marshal((id::FIELD, field_rid))?;
                def.offset = field_offsets.get(&field_rid).copied();
                def.attributes = self.attributes_of(id::FIELD, field_rid);
                ty.fields.push(def);
            }

            for method_rid in self.method_ranges[rid as usize - 1].clone() {
                let method = tables.row(id::METHOD_DEF, method_rid)?;
                let flags = method[2] as u16 & !MethodAttributes::HAS_SECURITY;
                let mut def = MethodDef::new(self.string(method[3])?, flags)
                    .with_impl_flags(method[1] as u16);
                def.token = Token::new(table::METHOD_DEF, method_rid);
                def.signature = signature::read_method(self.blob(method[4])?, &|t| self.name_of(t))?;
                def.generic_params = self.generic_params(id::METHOD_DEF, method_rid)?;
                def.attributes = self.attributes_of(id::METHOD_DEF, method_rid);
                if let Some(map) = impl_maps.get(&(id::METHOD_DEF, method_rid)) {
                    def.pinvoke = Some(PInvoke {
                        flags: map[0] as u16,
                        entry: self.string(map[2])?,
                        module: self.string(tables.row(id::MODULE_REF, map[3])?[0])?,
                    });
                }

                for param_rid in self.param_ranges[method_rid as usize - 1].clone() {
                    let param = tables.row(id::PARAM, param_rid)?;
                    let sequence = param[1] as usize;
                    let attributes = self.attributes_of(id::PARAM, param_rid);
                    let param_marshal = marshal((id::PARAM, param_rid))?;
                    if sequence == 0 {
                        def.return_attributes = attributes;
                        def.return_marshal = param_marshal;
                        continue;
                    }
                    let Some(target) = def.signature.parameters.get_mut(sequence - 1) else {
                        trace!("ignoring parameter row {} past the signature", param_rid);
                        continue;
                    };
                    target.name = self.string(param[2])?;
                    target.flags = param[0] as u16
                        & !(ParamAttributes::HAS_DEFAULT | ParamAttributes::HAS_FIELD_MARSHAL);
                    target.default = constant((id::PARAM, param_rid))?;
                    target.marshal = param_marshal;
                    target.attributes = attributes;
                }

                let code_type = def.impl_flags & MethodImplAttributes::CODE_TYPE_MASK;
                if method[0] != 0
                    && code_type == MethodImplAttributes::IL
                    && def.flags & MethodAttributes::ABSTRACT == 0
                {
                    bodies.push((types.len(), ty.methods.len(), method[0]));
                }
                ty.methods.push(def);
            }

            if let Some(range) = property_ranges.get(&rid) {
                for property_rid in range.clone() {
                    let property = tables.row(id::PROPERTY, property_rid)?;
                    let (has_this, property_type, parameters) =
                        signature::read_property(self.blob(property[2])?, &|t| self.name_of(t))?;
                    let mut def = PropertyDef::new(self.string(property[1])?, property_type);
                    def.token = Token::new(table::PROPERTY, property_rid);
                    def.flags = property[0] as u16 & !PropertyAttributes::HAS_DEFAULT;
                    def.has_this = has_this;
                    def.parameters = parameters;
                    def.constant = constant((id::PROPERTY, property_rid))?;
                    def.attributes = self.attributes_of(id::PROPERTY, property_rid);
                    for &(kind, method) in accessors.get(&(id::PROPERTY, property_rid)).into_iter().flatten() {
                        let accessor = Some(Accessor::Method(Token::new(table::METHOD_DEF, method)));
                        match kind {
                            semantics::GETTER => def.getter = accessor,
                            semantics::SETTER => def.setter = accessor,
                            _ => trace!("dropping other accessor of property {}", def.name),
                        }
                    }
                    ty.properties.push(def);
                }
            }

            if let Some(range) = event_ranges.get(&rid) {
                for event_rid in range.clone() {
                    let event = tables.row(id::EVENT, event_rid)?;
                    let event_type = self
                        .type_def_or_ref(event[2])?
                        .ok_or_else(|| Error::malformed("event without a type"))?;
                    let mut def = EventDef::new(self.string(event[1])?, event_type);
                    def.token = Token::new(table::EVENT, event_rid);
                    def.flags = event[0] as u16;
                    def.attributes = self.attributes_of(id::EVENT, event_rid);
                    for &(kind, method) in accessors.get(&(id::EVENT, event_rid)).into_iter().flatten() {
                        let accessor = Some(Accessor::Method(Token::new(table::METHOD_DEF, method)));
                        match kind {
                            semantics::ADD_ON => def.adder = accessor,
                            semantics::REMOVE_ON => def.remover = accessor,
                            semantics::FIRE => def.raiser = accessor,
                            _ => trace!("dropping other accessor of event {}", def.name),
                        }
                    }
                    ty.events.push(def);
                }
            }

            for method_impl in tables.rows(id::METHOD_IMPL).iter().filter(|r| r[0] == rid) {
                ty.overrides.push(MethodOverride {
                    body: self.method_ref(method_impl[1])?,
                    declaration: self.method_ref(method_impl[2])?,
                });
            }

            types.push(ty);
        }
        self.def_tokens = def_tokens;
        Ok((types, bodies))
    }

    fn method_ref(&self, value: u32) -> Result<MethodRef> {
        match Coded::MethodDefOrRef.decode(value)? {
            (id::METHOD_DEF, rid) => Ok(MethodRef::Def(Token::new(table::METHOD_DEF, rid))),
            (_, rid) => self.member_ref(rid).map(MethodRef::Ref),
        }
    }

    /// PropertyMap / EventMap rows as owner rid to child range
    fn map_ranges(&self, map: usize, child: usize) -> HashMap<u32, Range<u32>> {
        let ranges = list_ranges(self.tables, map, 1, child);
        self.tables
            .rows(map)
            .iter()
            .zip(ranges)
            .map(|(row, range)| (row[0], range))
            .collect()
    }

    fn generic_params(&mut self, owner_table: usize, owner: u32) -> Result<Vec<GenericParam>> {
        let tables = self.tables;
        let mut rows: Vec<(u32, &Row)> = Vec::new();
        for (rid, row) in (1..).zip(tables.rows(id::GENERIC_PARAM)) {
            if Coded::TypeOrMethodDef.decode(row[2])? == (owner_table, owner) {
                rows.push((rid, row));
            }
        }
        rows.sort_by_key(|(_, row)| row[0]);

        let mut params = Vec::with_capacity(rows.len());
        for (rid, row) in rows {
            let mut param = GenericParam::new(self.string(row[3])?);
            param.flags = row[1] as u16;
            for constraint in tables.rows(id::GENERIC_PARAM_CONSTRAINT).iter().filter(|c| c[0] == rid) {
                if let Some(sig) = self.type_def_or_ref(constraint[1])? {
                    param.constraints.push(sig);
                }
            }
            param.attributes = self.attributes_of(id::GENERIC_PARAM, rid);
            params.push(param);
        }
        Ok(params)
    }

    fn body(&self, module: &mut Module, rva: u32) -> Result<MethodBody> {
        let data = self
            .pe
            .at_rva(rva)
            .ok_or_else(|| Error::malformed(format!("method body at {rva:#x} lies outside every section")))?;
        let truncated = || Error::malformed(format!("method body at {rva:#x} is truncated"));
        let first = *data.first().ok_or_else(truncated)?;
        let mut body = match first & 0x03 {
            0x02 => {
                let size = (first >> 2) as usize;
                MethodBody::new(data.get(1..1 + size).ok_or_else(truncated)?.to_vec())
            }
            0x03 => {
                let header = data.get(..12).ok_or_else(truncated)?;
                let flags = u16::from_le_bytes([header[0], header[1]]);
                let header_size = ((flags >> 12) as usize) * 4;
                let code_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
                let code = data
                    .get(header_size..header_size + code_size)
                    .ok_or_else(truncated)?
                    .to_vec();

                let mut exception_sections = Vec::new();
                if flags & 0x08 != 0 {
                    let start = (header_size + code_size + 3) & !3;
                    let mut at = start;
                    loop {
                        let kind = *data.get(at).ok_or_else(truncated)?;
                        let size = if kind & 0x40 != 0 {
                            let b = data.get(at + 1..at + 4).ok_or_else(truncated)?;
                            u32::from_le_bytes([b[0], b[1], b[2], 0]) as usize
                        } else {
                            *data.get(at + 1).ok_or_else(truncated)? as usize
                        };
                        if size == 0 {
                            return Err(Error::malformed(format!(
                                "empty data section in method body at {rva:#x}"
                            )));
                        }
                        at += size;
                        if kind & 0x80 == 0 {
                            break;
                        }
                        at = (at + 3) & !3;
                    }
                    exception_sections = data.get(start..at).ok_or_else(truncated)?.to_vec();
                }

                MethodBody {
                    max_stack: u16::from_le_bytes([header[2], header[3]]),
                    init_locals: flags & 0x10 != 0,
                    local_signature: Token::from_value(u32::from_le_bytes([
                        header[8], header[9], header[10], header[11],
                    ])),
                    code,
                    exception_sections,
                }
            }
            _ => {
                return Err(Error::malformed(format!(
                    "unknown method header format at {rva:#x}"
                )))
            }
        };

        for (offset, token) in body.token_operands() {
            let relinked = match token.table() {
                table::USER_STRING => module.intern_user_string(&self.heaps.user_string(token.row())?),
                table::MEMBER_REF => module.import_member(self.member_ref(token.row())?),
                table::TYPE_DEF => (token.row() as usize)
                    .checked_sub(1)
                    .and_then(|i| self.def_tokens.get(i).copied())
                    .filter(|t| !t.is_null())
                    .ok_or_else(|| Error::malformed(format!("method body references unknown type {token}")))?,
                _ => continue,
            };
            body.patch_token(offset, relinked);
        }
        Ok(body)
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}
