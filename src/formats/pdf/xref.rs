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


//! Cross-reference loading
//!
//! # Merge Rules
//! Sections are collected newest first by following `startxref`, then for
//! each section its `XRefStm` (hybrid files) and its `Prev`. The flat table
//! is built in that order with first writer wins, for entries and for trailer
//! keys alike. Free entries are not recorded, so an older in-use entry stays
//! visible.
//!
//! If the chain cannot be read at all, the file is scanned for `N G obj`
//! headers instead.

use super::filters::decode_stream;
use super::object::{Dictionary, Object};
use super::parser::{rfind, Parser};
use crate::error::{DecodeError, DecodeResult};
use regex::bytes::Regex;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefEntry {
    /// Object stored at a byte offset
    InUse { offset: usize, gen: u16 },
    /// Object number `index` inside object stream `stream`
    Compressed { stream: u32, index: u32 },
}

/// One cross-reference section as found in the file
#[derive(Debug, Clone)]
pub struct XrefSection {
    pub entries: BTreeMap<u32, XrefEntry>,
    pub trailer: Dictionary,
    pub is_stream: bool,
}

/// All sections merged into one flat mapping
#[derive(Debug, Clone, Default)]
pub struct XrefTable {
    pub entries: BTreeMap<u32, XrefEntry>,
    pub trailer: Dictionary,
    /// Whether any section was a cross-reference stream
    pub uses_stream: bool,
    /// Set when the table came from scanning instead of the xref chain
    pub recovered: bool,
}

impl XrefTable {
    /// Merge sections given newest first
    pub fn merge(sections: Vec<XrefSection>) -> Self {
        let mut table = XrefTable::default();
        for section in sections {
            for (id, entry) in section.entries {
                table.entries.entry(id).or_insert(entry);
            }
            table.trailer.merge_missing(&section.trailer);
            table.uses_stream |= section.is_stream;
        }
        table
    }

    pub fn get(&self, id: u32) -> Option<XrefEntry> {
        self.entries.get(&id).copied()
    }

    /// Read the xref chain, falling back to a full scan
    pub fn load(data: &[u8]) -> DecodeResult<Self> {
        match read_chain(data) {
            Ok(sections) if !sections.is_empty() => {
                let table = Self::merge(sections);
                if table.trailer.contains(b"Root") {
                    return Ok(table);
                }
                tracing::debug!("Cross-reference trailer has no /Root, scanning instead");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Cross-reference chain unreadable, scanning"),
        }
        scan(data)
    }
}

fn find_startxref(data: &[u8]) -> DecodeResult<usize> {
    let pos = rfind(data, b"startxref")
        .ok_or_else(|| DecodeError::malformed("PDF: no startxref"))?;
    let mut parser = Parser::new(data, pos + b"startxref".len());
    let offset = parser.read_uint()?;
    usize::try_from(offset).map_err(|_| DecodeError::malformed("PDF: startxref out of range"))
}

fn read_chain(data: &[u8]) -> DecodeResult<Vec<XrefSection>> {
    let mut sections = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = vec![find_startxref(data)?];

    while let Some(offset) = pending.pop() {
        if !seen.insert(offset) || offset >= data.len() {
            continue;
        }
        let section = match read_section(data, offset) {
            Ok(section) => section,
            // A broken older section still leaves the newer ones usable
            Err(e) if !sections.is_empty() => {
                tracing::debug!(offset, error = %e, "Ignoring unreadable xref section");
                continue;
            }
            Err(e) => return Err(e),
        };
        // Push Prev first so the XRefStm of this section is read before it
        if let Some(prev) = section.trailer.get_int(b"Prev") {
            pending.push(usize::try_from(prev).unwrap_or(usize::MAX));
        }
        if !section.is_stream {
            if let Some(stm) = section.trailer.get_int(b"XRefStm") {
                pending.push(usize::try_from(stm).unwrap_or(usize::MAX));
            }
        }
        sections.push(section);
    }
    Ok(sections)
}

pub fn read_section(data: &[u8], offset: usize) -> DecodeResult<XrefSection> {
    let mut parser = Parser::new(data, offset);
    if parser.accept_keyword(b"xref") {
        read_table(&mut parser)
    } else {
        read_stream_section(data, offset)
    }
}

fn read_table(parser: &mut Parser<'_>) -> DecodeResult<XrefSection> {
    let mut entries = BTreeMap::new();
    loop {
        if parser.accept_keyword(b"trailer") {
            break;
        }
        let start = parser.read_uint()?;
        let count = parser.read_uint()?;
        for i in 0..count {
            let offset = parser.read_uint()?;
            let gen = parser.read_uint()?;
            let kind = parser.read_keyword();
            if kind == b"n" {
                let id = start
                    .checked_add(i)
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| DecodeError::malformed("PDF: xref id out of range"))?;
                entries.insert(
                    id,
                    XrefEntry::InUse {
                        offset: offset as usize,
                        gen: u16::try_from(gen).unwrap_or(u16::MAX),
                    },
                );
            } else if kind != b"f" {
                return Err(DecodeError::malformed("PDF: bad xref entry type"));
            }
        }
    }
    let trailer = match parser.parse_object()? {
        Object::Dictionary(dict) => dict,
        _ => return Err(DecodeError::malformed("PDF: trailer is not a dictionary")),
    };
    Ok(XrefSection {
        entries,
        trailer,
        is_stream: false,
    })
}

fn read_stream_section(data: &[u8], offset: usize) -> DecodeResult<XrefSection> {
    let mut parser = Parser::new(data, offset);
    parser.read_indirect_header()?;
    let stream = match parser.parse_object_or_stream(|_| None)? {
        Object::Stream(stream) if stream.dict.has_type(b"XRef") => stream,
        _ => return Err(DecodeError::malformed("PDF: startxref does not point at an xref")),
    };

    let widths: Vec<usize> = stream
        .dict
        .get(b"W")
        .and_then(Object::as_array)
        .map(|w| w.iter().filter_map(Object::as_int).map(|n| n.max(0) as usize).collect())
        .unwrap_or_default();
    if widths.len() != 3 || widths.iter().any(|&w| w > 8) {
        return Err(DecodeError::malformed("PDF: bad /W in xref stream"));
    }
    let size = stream.dict.get_int(b"Size").unwrap_or(0).max(0) as u64;
    let index: Vec<u64> = match stream.dict.get(b"Index").and_then(Object::as_array) {
        Some(items) => items.iter().filter_map(Object::as_int).map(|n| n.max(0) as u64).collect(),
        None => vec![0, size],
    };

    let body = decode_stream(&stream)?;
    let row = widths.iter().sum::<usize>();
    if row == 0 {
        return Err(DecodeError::malformed("PDF: empty xref stream rows"));
    }
    let mut rows = body.chunks_exact(row);
    let mut entries = BTreeMap::new();

    for range in index.chunks_exact(2) {
        for id in range[0]..range[0] + range[1] {
            let Some(fields) = rows.next() else {
                break;
            };
            let kind = if widths[0] == 0 { 1 } else { be(&fields[..widths[0]]) };
            let f2 = be(&fields[widths[0]..widths[0] + widths[1]]);
            let f3 = be(&fields[widths[0] + widths[1]..]);
            let Ok(id) = u32::try_from(id) else {
                continue;
            };
            match kind {
                1 => {
                    entries.insert(
                        id,
                        XrefEntry::InUse {
                            offset: f2 as usize,
                            gen: u16::try_from(f3).unwrap_or(0),
                        },
                    );
                }
                2 => {
                    entries.insert(
                        id,
                        XrefEntry::Compressed {
                            stream: f2 as u32,
                            index: f3 as u32,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    Ok(XrefSection {
        entries,
        trailer: stream.dict,
        is_stream: true,
    })
}

fn be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Rebuild a table from `N G obj` headers; later definitions win
fn scan(data: &[u8]) -> DecodeResult<XrefTable> {
    let header = Regex::new(r"(?-u)(?:^|[\s\x00])(\d{1,10})\s+(\d{1,5})\s+obj\b")
        .map_err(|e| DecodeError::internal(e.to_string()))?;

    let mut table = XrefTable {
        recovered: true,
        ..XrefTable::default()
    };
    let mut xref_stream_trailer = None;
    for caps in header.captures_iter(data) {
        let (Some(id), Some(gen)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let parsed = (parse_ascii::<u32>(id.as_bytes()), parse_ascii::<u16>(gen.as_bytes()));
        let (Some(id_num), Some(gen)) = parsed else {
            continue;
        };
        table.entries.insert(
            id_num,
            XrefEntry::InUse {
                offset: id.start(),
                gen,
            },
        );

        let mut parser = Parser::new(data, id.start());
        if parser.read_indirect_header().is_ok() {
            if let Ok(Object::Dictionary(dict)) = parser.parse_object() {
                if dict.has_type(b"XRef") {
                    xref_stream_trailer = Some(dict);
                    table.uses_stream = true;
                }
            }
        }
    }

    let mut trailer = None;
    let mut search_end = data.len();
    while let Some(pos) = rfind(&data[..search_end], b"trailer") {
        let mut parser = Parser::new(data, pos + b"trailer".len());
        if let Ok(Object::Dictionary(dict)) = parser.parse_object() {
            trailer = Some(dict);
            break;
        }
        search_end = pos;
    }
    table.trailer = trailer
        .or(xref_stream_trailer)
        .ok_or_else(|| DecodeError::malformed("PDF: no trailer found"))?;

    if table.entries.is_empty() {
        return Err(DecodeError::malformed("PDF: no objects found"));
    }
    tracing::debug!(objects = table.entries.len(), "Recovered cross-reference by scanning");
    Ok(table)
}

fn parse_ascii<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a small classic file and return it with its object offsets
    fn classic_pdf() -> Vec<u8> {
        let mut pdf = b"%PDF-1.4\n".to_vec();
        let one = pdf.len();
        pdf.extend_from_slice(b"1 0 obj\n<< /Type /Catalog >>\nendobj\n");
        let two = pdf.len();
        pdf.extend_from_slice(b"2 0 obj\n(two)\nendobj\n");
        let xref = pdf.len();
        pdf.extend_from_slice(
            format!(
                "xref\n0 3\n0000000000 65535 f \n{:010} 00000 n \n{:010} 00000 n \n\
                 trailer\n<< /Size 3 /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
                one, two, xref
            )
            .as_bytes(),
        );
        pdf
    }

    #[test]
    fn test_classic_table() {
        let pdf = classic_pdf();
        let table = XrefTable::load(&pdf).unwrap();
        assert!(!table.uses_stream);
        assert!(!table.recovered);
        assert_eq!(table.entries.len(), 2);
        assert!(matches!(table.get(1), Some(XrefEntry::InUse { offset: 9, gen: 0 })));
        assert_eq!(table.trailer.get_int(b"Size"), Some(3));
    }

    #[test]
    fn test_newest_section_wins() {
        let newer = XrefSection {
            entries: [(1, XrefEntry::InUse { offset: 100, gen: 0 })].into_iter().collect(),
            trailer: vec![(b"Size".to_vec(), Object::Integer(4))].into_iter().collect(),
            is_stream: false,
        };
        let older = XrefSection {
            entries: [
                (1, XrefEntry::InUse { offset: 10, gen: 0 }),
                (2, XrefEntry::InUse { offset: 20, gen: 0 }),
            ]
            .into_iter()
            .collect(),
            trailer: vec![
                (b"Size".to_vec(), Object::Integer(3)),
                (b"Root".to_vec(), Object::Integer(0)),
            ]
            .into_iter()
            .collect(),
            is_stream: true,
        };
        let table = XrefTable::merge(vec![newer, older]);
        assert!(matches!(table.get(1), Some(XrefEntry::InUse { offset: 100, .. })));
        assert!(matches!(table.get(2), Some(XrefEntry::InUse { offset: 20, .. })));
        assert_eq!(table.trailer.get_int(b"Size"), Some(4));
        assert!(table.trailer.contains(b"Root"));
        assert!(table.uses_stream);
    }

    #[test]
    fn test_broken_startxref_falls_back_to_scan() {
        let mut pdf = classic_pdf();
        let pos = rfind(&pdf, b"startxref").unwrap();
        pdf.truncate(pos);
        pdf.extend_from_slice(b"startxref\n9999\n%%EOF\n");

        let table = XrefTable::load(&pdf).unwrap();
        assert!(table.recovered);
        assert!(matches!(table.get(2), Some(XrefEntry::InUse { .. })));
        assert!(table.trailer.contains(b"Root"));
    }

    #[test]
    fn test_subsection_start_near_overflow_is_malformed() {
        let table = format!(
            "xref\n{} 2\n0000000000 65535 f \n0000000009 00000 n \ntrailer\n<< /Size 2 >>\n",
            u64::MAX
        );
        assert!(matches!(
            read_section(table.as_bytes(), 0),
            Err(DecodeError::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_prev_cycle_terminates() {
        let mut pdf = b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog >>\nendobj\n".to_vec();
        let xref = pdf.len();
        pdf.extend_from_slice(
            format!(
                "xref\n0 2\n0000000000 65535 f \n0000000009 00000 n \n\
                 trailer\n<< /Size 2 /Root 1 0 R /Prev {} >>\nstartxref\n{}\n%%EOF\n",
                xref, xref
            )
            .as_bytes(),
        );
        let table = XrefTable::load(&pdf).unwrap();
        assert!(!table.recovered);
        assert_eq!(table.entries.len(), 1);
    }
}
