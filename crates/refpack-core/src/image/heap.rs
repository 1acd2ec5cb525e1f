//! Metadata heaps: readers over the `#Strings`, `#Blob`, `#GUID` and `#US`
//! streams, their builders, and the compressed integer encoding they share.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Reads an ECMA-335 compressed unsigned integer, returning the value and its width
pub(crate) fn read_compressed(data: &[u8]) -> Option<(u32, usize)> {
    let first = u32::from(*data.first()?);
    if first & 0x80 == 0 {
        return Some((first, 1));
    }
    if first & 0xC0 == 0x80 {
        let second = u32::from(*data.get(1)?);
        return Some((((first & 0x3F) << 8) | second, 2));
    }
    if first & 0xE0 == 0xC0 {
        let rest = data.get(1..4)?;
        let value = ((first & 0x1F) << 24)
            | (u32::from(rest[0]) << 16)
            | (u32::from(rest[1]) << 8)
            | u32::from(rest[2]);
        return Some((value, 4));
    }
    None
}

/// Reads a compressed signed integer (rotated sign bit)
pub(crate) fn read_compressed_signed(data: &[u8]) -> Option<(i32, usize)> {
    let (raw, width) = read_compressed(data)?;
    let magnitude = (raw >> 1) as i32;
    if raw & 1 == 0 {
        return Some((magnitude, width));
    }
    let sign_extension = match width {
        1 => -0x40,
        2 => -0x2000,
        _ => -0x1000_0000,
    };
    Some((magnitude | sign_extension, width))
}

/// Appends an ECMA-335 compressed unsigned integer
///
/// Values above `0x1FFF_FFFF` cannot be represented and are truncated.
pub(crate) fn write_compressed(out: &mut Vec<u8>, value: u32) {
    if value < 0x80 {
        out.push(value as u8);
    } else if value < 0x4000 {
        out.extend_from_slice(&(0x8000 | value as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&(0xC000_0000 | (value & 0x1FFF_FFFF)).to_be_bytes());
    }
}

/// Appends a compressed signed integer
///
/// The width follows the magnitude of the value, not of its rotated form.
pub(crate) fn write_compressed_signed(out: &mut Vec<u8>, value: i32) {
    let sign = u32::from(value < 0);
    if (-0x40..0x40).contains(&value) {
        out.push(((((value as u32) << 1) & 0x7F) | sign) as u8);
    } else if (-0x2000..0x2000).contains(&value) {
        let rotated = (((value as u32) << 1) & 0x3FFF) | sign;
        out.extend_from_slice(&(0x8000 | rotated as u16).to_be_bytes());
    } else {
        let rotated = (((value as u32) << 1) & 0x1FFF_FFFF) | sign;
        out.extend_from_slice(&(0xC000_0000 | rotated).to_be_bytes());
    }
}

/// Read access to the four metadata heaps of a module
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Heaps<'a> {
    pub(crate) strings: &'a [u8],
    pub(crate) blobs: &'a [u8],
    pub(crate) guids: &'a [u8],
    pub(crate) user_strings: &'a [u8],
}

impl<'a> Heaps<'a> {
    /// The null-terminated UTF-8 string at `index`
    pub(crate) fn string(&self, index: u32) -> Result<&'a str> {
        let start = index as usize;
        let tail = self
            .strings
            .get(start..)
            .ok_or_else(|| Error::malformed(format!("string index {index:#x} out of range")))?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end])
            .map_err(|_| Error::malformed(format!("string at {index:#x} is not UTF-8")))
    }

    /// The length-prefixed blob at `index`; index 0 is the empty blob
    pub(crate) fn blob(&self, index: u32) -> Result<&'a [u8]> {
        if index == 0 {
            return Ok(&[]);
        }
        entry(self.blobs, index).ok_or_else(|| Error::malformed(format!("blob {index:#x} out of range")))
    }

    /// The GUID at 1-based `index`; index 0 is the null GUID
    pub(crate) fn guid(&self, index: u32) -> Result<[u8; 16]> {
        let mut guid = [0u8; 16];
        if index == 0 {
            return Ok(guid);
        }
        let start = (index as usize - 1) * 16;
        let bytes = self
            .guids
            .get(start..start + 16)
            .ok_or_else(|| Error::malformed(format!("GUID {index} out of range")))?;
        guid.copy_from_slice(bytes);
        Ok(guid)
    }

    /// The UTF-16 user string at heap offset `offset`
    pub(crate) fn user_string(&self, offset: u32) -> Result<String> {
        let bytes = entry(self.user_strings, offset)
            .ok_or_else(|| Error::malformed(format!("user string {offset:#x} out of range")))?;
        // the trailing byte flags non-ASCII content
        let units: Vec<u16> = bytes[..bytes.len() & !1]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units)
            .map_err(|_| Error::malformed(format!("user string {offset:#x} is not UTF-16")))
    }
}

fn entry(heap: &[u8], offset: u32) -> Option<&[u8]> {
    let tail = heap.get(offset as usize..)?;
    let (len, used) = read_compressed(tail)?;
    tail.get(used..used + len as usize)
}

/// Builds the `#Strings` heap, sharing equal entries
#[derive(Debug)]
pub(crate) struct StringHeap {
    data: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringHeap {
    pub(crate) fn new() -> Self {
        Self {
            data: vec![0],
            offsets: HashMap::new(),
        }
    }

    /// Offset of `value`, appending it on first use; the empty string is 0
    pub(crate) fn add(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.offsets.get(value) {
            return offset;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.offsets.insert(value.to_string(), offset);
        offset
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Builds the `#Blob` heap, sharing equal entries
#[derive(Debug)]
pub(crate) struct BlobHeap {
    data: Vec<u8>,
    offsets: HashMap<Vec<u8>, u32>,
}

impl BlobHeap {
    pub(crate) fn new() -> Self {
        Self {
            data: vec![0],
            offsets: HashMap::new(),
        }
    }

    /// Offset of `value`, appending it on first use; the empty blob is 0
    pub(crate) fn add(&mut self, value: &[u8]) -> u32 {
        if value.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.offsets.get(value) {
            return offset;
        }
        let offset = self.data.len() as u32;
        write_compressed(&mut self.data, value.len() as u32);
        self.data.extend_from_slice(value);
        self.offsets.insert(value.to_vec(), offset);
        offset
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Builds the `#US` heap
#[derive(Debug)]
pub(crate) struct UserStringHeap {
    data: Vec<u8>,
}

impl UserStringHeap {
    pub(crate) fn new() -> Self {
        Self { data: vec![0] }
    }

    /// Appends `value` and returns its heap offset
    pub(crate) fn add(&mut self, value: &str) -> u32 {
        let offset = self.data.len() as u32;
        let units: Vec<u16> = value.encode_utf16().collect();
        let special = units.iter().any(|&unit| {
            unit > 0xFF || matches!(unit, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F)
        });
        write_compressed(&mut self.data, units.len() as u32 * 2 + 1);
        self.data.extend(units.iter().flat_map(|unit| unit.to_le_bytes()));
        self.data.push(u8::from(special));
        offset
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
