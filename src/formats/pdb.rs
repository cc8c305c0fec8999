// dedrm-core - E-book DRM Removal Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! PalmDB record container, shared by Mobipocket and eReader books
//!
//! # Format Details
//! ```text
//! 0x00  name            32 bytes, NUL padded
//! 0x3C  type + creator  8 bytes ("BOOKMOBI", "TEXtREAd", "PNRdPPrs", ...)
//! 0x4C  record count    u16 BE
//! 0x4E  record list     count x { offset u32 BE, attributes u8, unique id u24 }
//! ```
//! Record `i` runs from its offset to the next record's offset (or EOF).

use crate::error::{DecodeError, DecodeResult};

pub const HEADER_LEN: usize = 78;
const TYPE_OFFSET: usize = 0x3C;
const COUNT_OFFSET: usize = 76;

/// Parsed view over a PalmDB file
#[derive(Debug)]
pub struct PalmDb<'a> {
    data: &'a [u8],
    offsets: Vec<usize>,
}

impl<'a> PalmDb<'a> {
    /// # Errors
    /// - MalformedContainer if the header or record list is truncated or unordered
    pub fn parse(data: &'a [u8]) -> DecodeResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::malformed("PalmDB header truncated"));
        }
        let count = read_u16(data, COUNT_OFFSET)? as usize;
        let list_end = HEADER_LEN + count * 8;
        if data.len() < list_end {
            return Err(DecodeError::malformed("PalmDB record list truncated"));
        }

        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let offset = read_u32(data, HEADER_LEN + i * 8)? as usize;
            if offset > data.len() || offsets.last().is_some_and(|&prev| offset < prev) {
                return Err(DecodeError::malformed(format!(
                    "PalmDB record {} offset {:#x} out of order",
                    i, offset
                )));
            }
            offsets.push(offset);
        }
        Ok(Self { data, offsets })
    }

    /// Database name with NUL padding removed
    pub fn name(&self) -> String {
        let raw = &self.data[..32];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    /// Type and creator, e.g. `b"BOOKMOBI"`
    pub fn kind(&self) -> &'a [u8] {
        &self.data[TYPE_OFFSET..TYPE_OFFSET + 8]
    }

    pub fn num_sections(&self) -> usize {
        self.offsets.len()
    }

    /// Byte offset of a record within the file
    pub fn section_offset(&self, index: usize) -> DecodeResult<usize> {
        self.offsets
            .get(index)
            .copied()
            .ok_or_else(|| DecodeError::malformed(format!("no PalmDB record {}", index)))
    }

    /// Record contents
    pub fn section(&self, index: usize) -> DecodeResult<&'a [u8]> {
        let start = self.section_offset(index)?;
        let end = self
            .offsets
            .get(index + 1)
            .copied()
            .unwrap_or(self.data.len());
        Ok(&self.data[start..end])
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Whether `data` looks like a PalmDB file of the given type + creator
pub fn has_kind(data: &[u8], kinds: &[&[u8]]) -> bool {
    data.len() >= HEADER_LEN && kinds.iter().any(|k| &data[TYPE_OFFSET..TYPE_OFFSET + 8] == *k)
}

pub fn read_u16(data: &[u8], offset: usize) -> DecodeResult<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| DecodeError::malformed(format!("u16 at {:#x} out of range", offset)))
}

pub fn read_u32(data: &[u8], offset: usize) -> DecodeResult<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DecodeError::malformed(format!("u32 at {:#x} out of range", offset)))
}

/// Bounds-checked sub-slice
pub fn slice(data: &[u8], offset: usize, len: usize) -> DecodeResult<&[u8]> {
    data.get(offset..offset.saturating_add(len)).ok_or_else(|| {
        DecodeError::malformed(format!("{} bytes at {:#x} out of range", len, offset))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(kind: &[u8; 8], sections: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        out[..4].copy_from_slice(b"Book");
        out[TYPE_OFFSET..TYPE_OFFSET + 8].copy_from_slice(kind);
        out[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&(sections.len() as u16).to_be_bytes());
        let mut offset = HEADER_LEN + sections.len() * 8;
        for (i, section) in sections.iter().enumerate() {
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            out.extend_from_slice(&(i as u32 * 2).to_be_bytes());
            offset += section.len();
        }
        for section in sections {
            out.extend_from_slice(section);
        }
        out
    }

    #[test]
    fn test_parse_sections() {
        let data = build(b"BOOKMOBI", &[b"zero", b"one!", b"tail"]);
        let pdb = PalmDb::parse(&data).unwrap();
        assert_eq!(pdb.name(), "Book");
        assert_eq!(pdb.kind(), b"BOOKMOBI");
        assert_eq!(pdb.num_sections(), 3);
        assert_eq!(pdb.section(1).unwrap(), b"one!");
        assert_eq!(pdb.section(2).unwrap(), b"tail");
        assert!(pdb.section(3).is_err());
        assert!(has_kind(&data, &[b"TEXtREAd", b"BOOKMOBI"]));
    }

    #[test]
    fn test_truncated_record_list() {
        let mut data = build(b"BOOKMOBI", &[b"a", b"b"]);
        data.truncate(HEADER_LEN + 4);
        assert!(matches!(
            PalmDb::parse(&data),
            Err(DecodeError::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_out_of_order_offsets() {
        let mut data = build(b"BOOKMOBI", &[b"a", b"b"]);
        data[HEADER_LEN + 8..HEADER_LEN + 12].copy_from_slice(&0u32.to_be_bytes());
        assert!(PalmDb::parse(&data).is_err());
    }
}
