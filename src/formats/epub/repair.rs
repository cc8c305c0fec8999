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

//! Salvage for EPUBs with a damaged zip directory
//!
//! Some stores ship archives whose central directory is truncated or points
//! at the wrong offsets. The local file headers usually survive, so we walk
//! them in file order and write a fresh archive from what they describe.
//!
//! - Members whose data does not match the header CRC are dropped
//! - Sizes deferred to a data descriptor are taken from the descriptor
//! - The first readable copy of a name wins

use crate::error::{DecodeError, DecodeResult};
use flate2::read::DeflateDecoder;
use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const DATA_DESCRIPTOR: &[u8] = b"PK\x07\x08";
const LOCAL_HEADER_LEN: usize = 30;

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

struct LocalEntry<'a> {
    name: String,
    method: u16,
    crc: u32,
    data: &'a [u8],
    end: usize,
}

fn u16_at(bytes: &[u8], pos: usize) -> Option<u16> {
    let raw = bytes.get(pos..pos.checked_add(2)?)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

fn u32_at(bytes: &[u8], pos: usize) -> Option<u32> {
    let raw = bytes.get(pos..pos.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn find(bytes: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// CRC and size from the descriptor that closes the data starting at `data_start`
fn descriptor_after(bytes: &[u8], data_start: usize) -> Option<(u32, usize)> {
    let mut from = data_start;
    while let Some(pos) = find(bytes, DATA_DESCRIPTOR, from) {
        let size = u32_at(bytes, pos + 8)? as usize;
        if pos - data_start == size {
            return Some((u32_at(bytes, pos + 4)?, size));
        }
        from = pos + 1;
    }
    None
}

fn parse_entry(bytes: &[u8], at: usize) -> Option<LocalEntry<'_>> {
    let flags = u16_at(bytes, at + 6)?;
    let method = u16_at(bytes, at + 8)?;
    let mut crc = u32_at(bytes, at + 14)?;
    let mut size = u32_at(bytes, at + 18)? as usize;
    let name_len = u16_at(bytes, at + 26)? as usize;
    let extra_len = u16_at(bytes, at + 28)? as usize;
    if flags & FLAG_ENCRYPTED != 0 {
        return None;
    }

    let name_start = at + LOCAL_HEADER_LEN;
    let data_start = name_start + name_len + extra_len;
    let name = String::from_utf8_lossy(bytes.get(name_start..name_start + name_len)?).into_owned();
    if flags & FLAG_DATA_DESCRIPTOR != 0 && size == 0 {
        (crc, size) = descriptor_after(bytes, data_start)?;
    }
    let end = data_start.checked_add(size)?;
    Some(LocalEntry {
        name,
        method,
        crc,
        data: bytes.get(data_start..end)?,
        end,
    })
}

/// Uncompressed member contents, if they check out against the header CRC
fn contents(entry: &LocalEntry<'_>) -> Option<Vec<u8>> {
    let plain = match entry.method {
        METHOD_STORED => entry.data.to_vec(),
        METHOD_DEFLATED => {
            let mut out = Vec::with_capacity(entry.data.len() * 2);
            DeflateDecoder::new(entry.data).read_to_end(&mut out).ok()?;
            out
        }
        _ => return None,
    };
    (crc32fast::hash(&plain) == entry.crc).then_some(plain)
}

/// Write a fresh zip from the local headers of a damaged one
///
/// Members keep their names and their stored or deflated form.
///
/// # Errors
/// - MalformedContainer if no member could be recovered
pub fn salvage(bytes: &[u8]) -> DecodeResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut seen = HashSet::new();
    let mut dropped = 0usize;

    let mut pos = 0;
    while let Some(at) = find(bytes, LOCAL_HEADER, pos) {
        let Some(entry) = parse_entry(bytes, at) else {
            dropped += 1;
            pos = at + LOCAL_HEADER.len();
            continue;
        };
        pos = entry.end.max(at + LOCAL_HEADER.len());

        if entry.name.ends_with('/') || seen.contains(&entry.name) {
            continue;
        }
        let Some(data) = contents(&entry) else {
            tracing::warn!(member = %entry.name, "Dropping damaged archive member");
            dropped += 1;
            continue;
        };

        let method = if entry.method == METHOD_STORED {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        writer.start_file(
            entry.name.as_str(),
            SimpleFileOptions::default().compression_method(method),
        )?;
        writer.write_all(&data)?;
        seen.insert(entry.name);
    }

    if seen.is_empty() {
        return Err(DecodeError::malformed("zip archive: no readable members"));
    }
    tracing::info!(members = seen.len(), dropped, "Rebuilt archive from local headers");
    Ok(writer.finish()?.into_inner())
}
