//! The PE container around a module's metadata.
//!
//! Reading locates the CLI header through the COM descriptor data
//! directory and maps RVAs through the section table. Writing produces a
//! minimal IL-only PE32 DLL with a single `.text` section:
//!
//! ```text
//! 0x0000  DOS header, PE signature, COFF and optional headers, section table
//! 0x0200  .text (RVA 0x2000)
//!           8 reserved bytes
//!           CLI header
//!           method bodies
//!           metadata root and streams
//! ```

use crate::error::{Error, Result};

/// RVA of the `.text` section in written images
pub(crate) const TEXT_RVA: u32 = 0x2000;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x2000;
const HEADERS_SIZE: u32 = 0x200;
const PE_OFFSET: usize = 0x80;
const CLI_HEADER_LEN: u32 = 72;
const CLI_HEADER_RVA: u32 = TEXT_RVA + 8;
/// RVA of the first method body in written images
pub(crate) const BODY_RVA: u32 = CLI_HEADER_RVA + CLI_HEADER_LEN;
const COM_DESCRIPTOR: usize = 14;
const METADATA_VERSION: &str = "v4.0.30319";

#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_offset: u32,
    raw_size: u32,
}

/// A parsed PE file with a CLI header
#[derive(Debug)]
pub(crate) struct PeImage<'a> {
    data: &'a [u8],
    sections: Vec<Section>,
    metadata_rva: u32,
    metadata_size: u32,
}

fn u16_at(data: &[u8], at: usize) -> Option<u16> {
    let b = data.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn u32_at(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl<'a> PeImage<'a> {
    /// Parses the PE headers and the CLI header
    pub(crate) fn parse(data: &'a [u8]) -> Result<Self> {
        let short = || Error::malformed("PE headers are truncated");
        if data.get(..2) != Some(b"MZ".as_slice()) {
            return Err(Error::malformed("missing DOS header"));
        }
        let pe = u32_at(data, 0x3C).ok_or_else(short)? as usize;
        if data.get(pe..pe + 4) != Some(b"PE\0\0".as_slice()) {
            return Err(Error::malformed("missing PE signature"));
        }
        let coff = pe + 4;
        let section_count = u16_at(data, coff + 2).ok_or_else(short)? as usize;
        let optional_size = u16_at(data, coff + 16).ok_or_else(short)? as usize;
        let optional = coff + 20;
        let directories = match u16_at(data, optional).ok_or_else(short)? {
            0x10B => optional + 96,
            0x20B => optional + 112,
            magic => {
                return Err(Error::malformed(format!(
                    "unknown optional header magic {magic:#x}"
                )))
            }
        };
        let directory_count = u32_at(data, directories - 4).ok_or_else(short)? as usize;
        if directory_count <= COM_DESCRIPTOR {
            return Err(Error::malformed("image has no CLI header directory"));
        }
        let cli_rva = u32_at(data, directories + COM_DESCRIPTOR * 8).ok_or_else(short)?;
        if cli_rva == 0 {
            return Err(Error::malformed("image has no CLI header"));
        }

        let table = optional + optional_size;
        let mut sections = Vec::with_capacity(section_count);
        for i in 0..section_count {
            let at = table + i * 40;
            sections.push(Section {
                virtual_size: u32_at(data, at + 8).ok_or_else(short)?,
                virtual_address: u32_at(data, at + 12).ok_or_else(short)?,
                raw_size: u32_at(data, at + 16).ok_or_else(short)?,
                raw_offset: u32_at(data, at + 20).ok_or_else(short)?,
            });
        }

        let mut image = Self {
            data,
            sections,
            metadata_rva: 0,
            metadata_size: 0,
        };
        let cli = image
            .at_rva(cli_rva)
            .and_then(|cli| cli.get(..CLI_HEADER_LEN as usize))
            .ok_or_else(|| Error::malformed("CLI header lies outside every section"))?;
        image.metadata_rva = u32_at(cli, 8).ok_or_else(short)?;
        image.metadata_size = u32_at(cli, 12).ok_or_else(short)?;
        Ok(image)
    }

    /// Bytes from `rva` to the end of the section's raw data
    pub(crate) fn at_rva(&self, rva: u32) -> Option<&'a [u8]> {
        let section = self.sections.iter().find(|s| {
            rva >= s.virtual_address && rva - s.virtual_address < s.virtual_size.max(s.raw_size)
        })?;
        let offset = (rva - section.virtual_address) as usize;
        if offset >= section.raw_size as usize {
            return None;
        }
        let start = section.raw_offset as usize + offset;
        let end = (section.raw_offset as usize + section.raw_size as usize).min(self.data.len());
        self.data.get(start..end)
    }

    /// The metadata root and everything it spans
    pub(crate) fn metadata(&self) -> Result<&'a [u8]> {
        self.at_rva(self.metadata_rva)
            .and_then(|tail| tail.get(..self.metadata_size as usize))
            .ok_or_else(|| Error::malformed("metadata lies outside every section"))
    }
}

/// The streams named in a metadata root
#[derive(Debug, Default)]
pub(crate) struct Streams<'a> {
    pub(crate) tables: &'a [u8],
    pub(crate) strings: &'a [u8],
    pub(crate) user_strings: &'a [u8],
    pub(crate) guids: &'a [u8],
    pub(crate) blobs: &'a [u8],
}

impl<'a> Streams<'a> {
    /// Parses the metadata root (ECMA-335 II.24.2.1)
    pub(crate) fn parse(metadata: &'a [u8]) -> Result<Self> {
        let short = || Error::malformed("metadata root is truncated");
        if u32_at(metadata, 0) != Some(0x424A_5342) {
            return Err(Error::malformed("missing metadata signature"));
        }
        let version_len = u32_at(metadata, 12).ok_or_else(short)? as usize;
        let mut at = 16 + version_len;
        let count = u16_at(metadata, at + 2).ok_or_else(short)?;
        at += 4;

        let mut streams = Self::default();
        let mut found_tables = false;
        for _ in 0..count {
            let offset = u32_at(metadata, at).ok_or_else(short)? as usize;
            let size = u32_at(metadata, at + 4).ok_or_else(short)? as usize;
            let name_bytes = metadata.get(at + 8..).ok_or_else(short)?;
            let name_len = name_bytes.iter().position(|&b| b == 0).ok_or_else(short)?;
            let name = &name_bytes[..name_len];
            at += 8 + (name_len + 4) / 4 * 4;

            let body = metadata
                .get(offset..offset + size)
                .ok_or_else(|| Error::malformed("metadata stream lies outside the root"))?;
            match name {
                b"#~" => {
                    streams.tables = body;
                    found_tables = true;
                }
                b"#-" => {
                    return Err(Error::malformed(
                        "uncompressed metadata tables are not supported",
                    ))
                }
                b"#Strings" => streams.strings = body,
                b"#US" => streams.user_strings = body,
                b"#GUID" => streams.guids = body,
                b"#Blob" => streams.blobs = body,
                _ => {}
            }
        }
        if !found_tables {
            return Err(Error::malformed("metadata has no table stream"));
        }
        Ok(streams)
    }
}

/// Lays out a metadata root over `streams`, given in stream header order
pub(crate) fn write_metadata_root(streams: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut version = METADATA_VERSION.as_bytes().to_vec();
    version.resize((version.len() + 4) / 4 * 4, 0);

    let mut header_len = 16 + version.len() + 4;
    for (name, _) in streams {
        header_len += 8 + (name.len() + 4) / 4 * 4;
    }

    let mut out = Vec::new();
    out.extend_from_slice(&0x424A_5342u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(version.len() as u32).to_le_bytes());
    out.extend_from_slice(&version);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(streams.len() as u16).to_le_bytes());

    let mut offset = header_len;
    for (name, body) in streams {
        let size = (body.len() + 3) / 4 * 4;
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        out.extend_from_slice(&(size as u32).to_le_bytes());
        let mut padded = name.as_bytes().to_vec();
        padded.resize((name.len() + 4) / 4 * 4, 0);
        out.extend_from_slice(&padded);
        offset += size;
    }
    for (_, body) in streams {
        out.extend_from_slice(body);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    out
}

fn align(value: u32, to: u32) -> u32 {
    (value + to - 1) / to * to
}

/// Builds an IL-only DLL around method bodies placed at [`BODY_RVA`] and a metadata root
pub(crate) fn write_image(bodies: &[u8], metadata: &[u8]) -> Vec<u8> {
    let metadata_rva = align(BODY_RVA + bodies.len() as u32, 4);
    let text_len = metadata_rva + metadata.len() as u32 - TEXT_RVA;
    let raw_size = align(text_len, FILE_ALIGNMENT);

    let mut out = vec![0u8; HEADERS_SIZE as usize];
    out[..2].copy_from_slice(b"MZ");
    out[0x3C..0x40].copy_from_slice(&(PE_OFFSET as u32).to_le_bytes());

    let mut headers = Vec::with_capacity(0x120);
    headers.extend_from_slice(b"PE\0\0");
    // COFF: i386, one section, optional header size, IL-only DLL
    for value in [0x14Cu16, 1] {
        headers.extend_from_slice(&value.to_le_bytes());
    }
    headers.extend_from_slice(&[0; 12]);
    for value in [0xE0u16, 0x2102] {
        headers.extend_from_slice(&value.to_le_bytes());
    }

    let mut optional = Vec::with_capacity(0xE0);
    optional.extend_from_slice(&0x10Bu16.to_le_bytes());
    optional.extend_from_slice(&[8, 0]);
    for value in [raw_size, 0, 0, 0, TEXT_RVA, 0, 0x1000_0000, SECTION_ALIGNMENT, FILE_ALIGNMENT] {
        optional.extend_from_slice(&value.to_le_bytes());
    }
    for value in [4u16, 0, 0, 0, 4, 0] {
        optional.extend_from_slice(&value.to_le_bytes());
    }
    optional.extend_from_slice(&0u32.to_le_bytes());
    optional.extend_from_slice(&align(TEXT_RVA + text_len, SECTION_ALIGNMENT).to_le_bytes());
    optional.extend_from_slice(&HEADERS_SIZE.to_le_bytes());
    optional.extend_from_slice(&0u32.to_le_bytes());
    for value in [3u16, 0x8540] {
        optional.extend_from_slice(&value.to_le_bytes());
    }
    for value in [0x10_0000u32, 0x1000, 0x10_0000, 0x1000, 0, 16] {
        optional.extend_from_slice(&value.to_le_bytes());
    }
    for directory in 0..16 {
        let (rva, size) = if directory == COM_DESCRIPTOR {
            (CLI_HEADER_RVA, CLI_HEADER_LEN)
        } else {
            (0, 0)
        };
        optional.extend_from_slice(&rva.to_le_bytes());
        optional.extend_from_slice(&size.to_le_bytes());
    }
    headers.extend_from_slice(&optional);

    headers.extend_from_slice(b".text\0\0\0");
    for value in [text_len, TEXT_RVA, raw_size, HEADERS_SIZE, 0, 0] {
        headers.extend_from_slice(&value.to_le_bytes());
    }
    headers.extend_from_slice(&[0; 4]);
    headers.extend_from_slice(&0x6000_0020u32.to_le_bytes());
    out[PE_OFFSET..PE_OFFSET + headers.len()].copy_from_slice(&headers);

    let mut text = vec![0u8; 8];
    text.extend_from_slice(&CLI_HEADER_LEN.to_le_bytes());
    text.extend_from_slice(&2u16.to_le_bytes());
    text.extend_from_slice(&5u16.to_le_bytes());
    text.extend_from_slice(&metadata_rva.to_le_bytes());
    text.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    // ILONLY, no entry point, every other directory empty
    text.extend_from_slice(&1u32.to_le_bytes());
    text.resize((CLI_HEADER_RVA + CLI_HEADER_LEN - TEXT_RVA) as usize, 0);
    text.extend_from_slice(bodies);
    text.resize((metadata_rva - TEXT_RVA) as usize, 0);
    text.extend_from_slice(metadata);
    text.resize(raw_size as usize, 0);

    out.extend_from_slice(&text);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Vec<u8> {
        write_metadata_root(&[
            ("#~", vec![0; 24]),
            ("#Strings", b"\0Lib\0".to_vec()),
            ("#US", vec![0]),
            ("#GUID", vec![7; 16]),
            ("#Blob", vec![0]),
        ])
    }

    #[test]
    fn test_written_image_maps_back() {
        let metadata = root();
        let bodies = [0x0A, 0x2A];
        let image = write_image(&bodies, &metadata);
        assert_eq!(image.len() % FILE_ALIGNMENT as usize, 0);

        let pe = PeImage::parse(&image).unwrap();
        assert_eq!(&pe.at_rva(BODY_RVA).unwrap()[..2], &bodies);
        assert_eq!(pe.metadata().unwrap(), metadata.as_slice());

        let streams = Streams::parse(pe.metadata().unwrap()).unwrap();
        assert_eq!(streams.strings, b"\0Lib\0\0\0\0");
        assert_eq!(streams.guids, &[7; 16]);
        assert_eq!(streams.tables.len(), 24);
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert!(PeImage::parse(b"plain text").is_err());
        let mut image = write_image(&[], &root());
        image[PE_OFFSET] = b'X';
        assert!(PeImage::parse(&image).is_err());

        let mut no_cli = write_image(&[], &root());
        let directory = PE_OFFSET + 24 + 96 + COM_DESCRIPTOR * 8;
        no_cli[directory..directory + 4].copy_from_slice(&[0; 4]);
        assert!(PeImage::parse(&no_cli).is_err());
    }

    #[test]
    fn test_streams_require_tables() {
        let metadata = write_metadata_root(&[("#Strings", vec![0])]);
        assert!(Streams::parse(&metadata).is_err());
        let uncompressed = write_metadata_root(&[("#-", vec![0; 24])]);
        assert!(Streams::parse(&uncompressed).is_err());
    }
}
