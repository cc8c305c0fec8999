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


//! Rewrites a loaded PDF without its encryption
//!
//! # Output Layout
//! ```text
//! %PDF-1.x
//! %âãÏÓ
//! 1 0 obj ... endobj          ascending ids, /Encrypt left out
//! xref / trailer              classic form, or
//! N 0 obj <</Type/XRef ...>>  cross-reference stream (id = max id + 1)
//! startxref
//! offset
//! %%EOF
//! ```
//! Every object is written with generation 0, and references are rewritten
//! to match.

use super::object::{Dictionary, Object, Stream};
use super::parser::{is_delimiter, is_regular};
use super::xref::XrefEntry;
use super::PdfFile;
use crate::error::{DecodeError, DecodeResult};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Write;

const BINARY_MARKER: &[u8] = b"\n%\xe2\xe3\xcf\xd3\n";

/// Trailer keys that never survive the rewrite
const STRIPPED_TRAILER_KEYS: &[&[u8]] = &[
    b"Encrypt",
    b"Prev",
    b"XRefStm",
    // Leftovers when the newest trailer was an xref stream dictionary
    b"Type",
    b"W",
    b"Index",
    b"Filter",
    b"DecodeParms",
    b"Length",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Offset(usize),
    InStream { stream: u32, index: u32 },
}

/// Byte sink that keeps adjacent tokens apart
#[derive(Default)]
pub struct PdfWriter {
    out: Vec<u8>,
}

impl PdfWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.out
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn separate(&mut self) {
        if self.out.last().map_or(false, |&b| is_regular(b)) {
            self.out.push(b' ');
        }
    }

    pub fn object(&mut self, object: &Object) {
        match object {
            Object::Null => {
                self.separate();
                self.raw(b"null");
            }
            Object::Bool(value) => {
                self.separate();
                self.raw(if *value { b"true" } else { b"false" });
            }
            Object::Integer(value) => {
                self.separate();
                self.raw(value.to_string().as_bytes());
            }
            Object::Real(text) => {
                self.separate();
                self.raw(text.as_bytes());
            }
            Object::Name(name) => self.name(name),
            Object::String(bytes) => {
                self.out.push(b'(');
                for &b in bytes {
                    match b {
                        b'(' | b')' | b'\\' => self.out.extend_from_slice(&[b'\\', b]),
                        b'\r' => self.raw(b"\\r"),
                        _ => self.out.push(b),
                    }
                }
                self.out.push(b')');
            }
            Object::Array(items) => {
                self.out.push(b'[');
                for item in items {
                    self.object(item);
                }
                self.out.push(b']');
            }
            Object::Dictionary(dict) => self.dictionary(dict),
            Object::Stream(stream) => {
                let mut dict = stream.dict.clone();
                dict.set("Length", Object::Integer(stream.data.len() as i64));
                self.dictionary(&dict);
                self.raw(b"stream\n");
                self.raw(&stream.data);
                self.raw(b"\nendstream");
            }
            Object::Reference(r) => {
                self.separate();
                self.raw(format!("{} 0 R", r.id).as_bytes());
            }
        }
    }

    fn name(&mut self, name: &[u8]) {
        self.out.push(b'/');
        for &b in name {
            if b <= b' ' || b > b'~' || b == b'#' || is_delimiter(b) {
                self.raw(format!("#{:02X}", b).as_bytes());
            } else {
                self.out.push(b);
            }
        }
    }

    fn dictionary(&mut self, dict: &Dictionary) {
        self.raw(b"<<");
        for (key, value) in dict.iter() {
            self.name(key);
            self.object(value);
        }
        self.raw(b">>");
    }

    pub fn indirect(&mut self, id: u32, object: &Object) {
        self.raw(format!("{} 0 obj", id).as_bytes());
        self.object(object);
        self.raw(b"\nendobj\n");
    }
}

/// Rewrite the whole file
///
/// # Arguments
/// * `use_stream` - Emit a cross-reference stream instead of a classic table;
///   object streams are then kept and their members referenced in place
pub fn serialize(file: &mut PdfFile<'_>, use_stream: bool) -> DecodeResult<Vec<u8>> {
    let mut writer = PdfWriter::new();
    writer.raw(file.version_header());
    writer.raw(BINARY_MARKER);

    let encrypt_id = file.encrypt_id();
    let ids: Vec<(u32, XrefEntry)> = file
        .xref()
        .entries
        .iter()
        .filter(|(id, _)| Some(**id) != encrypt_id && **id != 0)
        .map(|(id, entry)| (*id, *entry))
        .collect();

    let mut placements = BTreeMap::new();
    for (id, entry) in ids {
        if let (true, XrefEntry::Compressed { stream, index }) = (use_stream, entry) {
            placements.insert(id, Placement::InStream { stream, index });
            continue;
        }
        let object = match file.get(id) {
            Ok(Some(object)) => object,
            Ok(None) => continue,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(id, error = %e, "Skipping unreadable PDF object");
                continue;
            }
        };
        let object = match object {
            Object::Stream(ref s) if s.dict.has_type(b"XRef") => Object::Null,
            // Members were extracted, the container is not needed anymore
            Object::Stream(ref s) if s.dict.has_type(b"ObjStm") && !use_stream => Object::Null,
            other => other,
        };
        placements.insert(id, Placement::Offset(writer.len()));
        writer.indirect(id, &object);
    }

    let mut trailer = file.trailer().clone();
    for key in STRIPPED_TRAILER_KEYS {
        trailer.remove(key);
    }
    let max_id = placements.keys().next_back().copied().unwrap_or(0);

    if use_stream {
        // The stream takes the next free id, never the old /Encrypt id
        let xref_id = (max_id + 1).max(encrypt_id.map_or(0, |id| id + 1));
        write_xref_stream(&mut writer, placements, &trailer, xref_id)?;
    } else {
        write_xref_table(&mut writer, &placements, trailer, max_id);
    }
    Ok(writer.into_inner())
}

fn write_xref_table(
    writer: &mut PdfWriter,
    placements: &BTreeMap<u32, Placement>,
    mut trailer: Dictionary,
    max_id: u32,
) {
    let startxref = writer.len();
    writer.raw(b"xref\n");
    writer.raw(format!("0 {}\n", max_id + 1).as_bytes());
    for id in 0..=max_id {
        match placements.get(&id) {
            Some(Placement::Offset(offset)) => {
                writer.raw(format!("{:010} {:05} n \n", offset, 0).as_bytes())
            }
            _ => writer.raw(b"0000000000 65535 f \n"),
        }
    }
    trailer.set("Size", Object::Integer(i64::from(max_id) + 1));
    writer.raw(b"trailer\n");
    writer.dictionary(&trailer);
    writer.raw(format!("\nstartxref\n{}\n%%EOF", startxref).as_bytes());
}

/// Smallest width in bytes that holds `value`, at least `min`
fn field_width(value: u64, min: usize) -> usize {
    let mut width = min;
    while width < 8 && value >> (8 * width) != 0 {
        width += 1;
    }
    width
}

fn write_xref_stream(
    writer: &mut PdfWriter,
    mut placements: BTreeMap<u32, Placement>,
    trailer: &Dictionary,
    xref_id: u32,
) -> DecodeResult<()> {
    let startxref = writer.len();
    placements.insert(xref_id, Placement::Offset(startxref));

    let mut max_f2 = startxref as u64;
    let mut max_f3 = 0u64;
    for placement in placements.values() {
        match *placement {
            Placement::Offset(offset) => max_f2 = max_f2.max(offset as u64),
            Placement::InStream { stream, index } => {
                max_f2 = max_f2.max(u64::from(stream));
                max_f3 = max_f3.max(u64::from(index));
            }
        }
    }
    let fl2 = field_width(max_f2, 2);
    let fl3 = field_width(max_f3, 1);

    let mut rows = Vec::with_capacity(placements.len() * (1 + fl2 + fl3));
    let mut index = Vec::new();
    let mut run: Option<(u32, u32)> = None;
    for (&id, placement) in &placements {
        run = match run {
            Some((first, last)) if id == last + 1 => Some((first, id)),
            Some((first, last)) => {
                index.push(Object::Integer(i64::from(first)));
                index.push(Object::Integer(i64::from(last - first + 1)));
                Some((id, id))
            }
            None => Some((id, id)),
        };
        let (kind, f2, f3) = match *placement {
            Placement::Offset(offset) => (1u8, offset as u64, 0u64),
            Placement::InStream { stream, index } => (2u8, u64::from(stream), u64::from(index)),
        };
        rows.push(kind);
        rows.extend_from_slice(&f2.to_be_bytes()[8 - fl2..]);
        rows.extend_from_slice(&f3.to_be_bytes()[8 - fl3..]);
    }
    if let Some((first, last)) = run {
        index.push(Object::Integer(i64::from(first)));
        index.push(Object::Integer(i64::from(last - first + 1)));
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&rows)
        .map_err(|e| DecodeError::internal(format!("zlib: {}", e)))?;
    let data = encoder
        .finish()
        .map_err(|e| DecodeError::internal(format!("zlib: {}", e)))?;

    let mut dict = Dictionary::new();
    dict.set("Type", Object::name("XRef"));
    dict.set("Size", Object::Integer(i64::from(xref_id) + 1));
    dict.set("Index", Object::Array(index));
    dict.set(
        "W",
        Object::Array(vec![
            Object::Integer(1),
            Object::Integer(fl2 as i64),
            Object::Integer(fl3 as i64),
        ]),
    );
    dict.set("Filter", Object::name("FlateDecode"));
    for key in [&b"Root"[..], b"Info", b"ID"] {
        if let Some(value) = trailer.get(key) {
            dict.set(key, value.clone());
        }
    }

    writer.indirect(xref_id, &Object::Stream(Stream::new(dict, data)));
    writer.raw(format!("startxref\n{}\n%%EOF", startxref).as_bytes());
    Ok(())
}
