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


//! Stream filters needed to read cross-reference and object streams
//!
//! Content streams are never decoded; their filtered bytes are copied as is.

use super::object::{Dictionary, Object, Stream};
use crate::error::{DecodeError, DecodeResult};
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Apply the stream's `/Filter` chain
pub fn decode_stream(stream: &Stream) -> DecodeResult<Vec<u8>> {
    let filters: Vec<&[u8]> = match stream.dict.get(b"Filter") {
        None => Vec::new(),
        Some(Object::Name(name)) => vec![name.as_slice()],
        Some(Object::Array(items)) => items.iter().filter_map(Object::as_name).collect(),
        Some(_) => return Err(DecodeError::malformed("PDF: bad /Filter")),
    };
    let params: Vec<Option<&Dictionary>> = match stream.dict.get(b"DecodeParms") {
        Some(Object::Array(items)) => items.iter().map(Object::as_dict).collect(),
        Some(other) => vec![other.as_dict()],
        None => Vec::new(),
    };

    let mut data = stream.data.clone();
    for (i, filter) in filters.iter().enumerate() {
        let parms = params.get(i).copied().flatten();
        data = match *filter {
            b"FlateDecode" | b"Fl" => predict(&inflate(&data)?, parms)?,
            b"ASCIIHexDecode" | b"AHx" => ascii_hex(&data)?,
            other => {
                return Err(DecodeError::malformed(format!(
                    "PDF: unsupported filter {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
    }
    Ok(data)
}

/// zlib inflate; a truncated tail keeps what was decoded so far
fn inflate(data: &[u8]) -> DecodeResult<Vec<u8>> {
    let mut out = Vec::new();
    match ZlibDecoder::new(data).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(_) if !out.is_empty() => Ok(out),
        Err(e) => Err(DecodeError::malformed(format!("PDF: FlateDecode failed: {}", e))),
    }
}

fn ascii_hex(data: &[u8]) -> DecodeResult<Vec<u8>> {
    let mut digits: Vec<u8> = data
        .iter()
        .copied()
        .take_while(|&b| b != b'>')
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 == 1 {
        digits.push(b'0');
    }
    hex::decode(digits).map_err(|e| DecodeError::malformed(format!("PDF: ASCIIHexDecode: {}", e)))
}

/// PNG row predictors (Predictor >= 10)
fn predict(data: &[u8], parms: Option<&Dictionary>) -> DecodeResult<Vec<u8>> {
    let Some(parms) = parms else {
        return Ok(data.to_vec());
    };
    let predictor = parms.get_int(b"Predictor").unwrap_or(1);
    if predictor < 10 {
        if predictor == 2 {
            return Err(DecodeError::malformed("PDF: TIFF predictor not supported"));
        }
        return Ok(data.to_vec());
    }

    let colors = parms.get_int(b"Colors").unwrap_or(1).max(1) as usize;
    let bits = parms.get_int(b"BitsPerComponent").unwrap_or(8).max(1) as usize;
    let columns = parms.get_int(b"Columns").unwrap_or(1).max(1) as usize;
    let bpp = (colors * bits).div_ceil(8);
    let row_len = (columns * colors * bits).div_ceil(8);

    let mut out = Vec::with_capacity(data.len());
    let mut prev = vec![0u8; row_len];
    for chunk in data.chunks(row_len + 1) {
        if chunk.len() < row_len + 1 {
            break;
        }
        let filter = chunk[0];
        let mut row = chunk[1..].to_vec();
        for i in 0..row_len {
            let left = if i >= bpp { row[i - bpp] } else { 0 };
            let up = prev[i];
            let up_left = if i >= bpp { prev[i - bpp] } else { 0 };
            row[i] = match filter {
                0 => row[i],
                1 => row[i].wrapping_add(left),
                2 => row[i].wrapping_add(up),
                3 => row[i].wrapping_add(((u16::from(left) + u16::from(up)) / 2) as u8),
                4 => row[i].wrapping_add(paeth(left, up, up_left)),
                other => {
                    return Err(DecodeError::malformed(format!(
                        "PDF: unknown PNG filter type {}",
                        other
                    )))
                }
            };
        }
        out.extend_from_slice(&row);
        prev = row;
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = i16::from(a) + i16::from(b) - i16::from(c);
    let pa = (p - i16::from(a)).abs();
    let pb = (p - i16::from(b)).abs();
    let pc = (p - i16::from(c)).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_flate_with_png_up_predictor() {
        // Two rows of 3 columns, "Up" filter on the second
        let raw = [0u8, 1, 2, 3, 2, 1, 1, 1];
        let mut dict = Dictionary::new();
        dict.set("Filter", Object::name("FlateDecode"));
        let mut parms = Dictionary::new();
        parms.set("Predictor", Object::Integer(12));
        parms.set("Columns", Object::Integer(3));
        dict.set("DecodeParms", Object::Dictionary(parms));

        let decoded = decode_stream(&Stream::new(dict, zlib(&raw))).unwrap();
        assert_eq!(decoded, vec![1, 2, 3, 2, 3, 4]);
    }

    #[test]
    fn test_filter_chain_and_unsupported() {
        let mut dict = Dictionary::new();
        dict.set(
            "Filter",
            Object::Array(vec![Object::name("AHx"), Object::name("FlateDecode")]),
        );
        let encoded = hex::encode(zlib(b"xref data")).into_bytes();
        assert_eq!(decode_stream(&Stream::new(dict, encoded)).unwrap(), b"xref data");

        let mut dict = Dictionary::new();
        dict.set("Filter", Object::name("LZWDecode"));
        assert!(decode_stream(&Stream::new(dict, vec![1, 2])).is_err());
    }
}
