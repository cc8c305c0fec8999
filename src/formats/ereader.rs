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


//! eReader (`.pdb`) decryption
//!
//! # Format Details
//! PalmDB of type `PNRdPPrs` (books) or `PDctPPrs` (dictionaries).
//! - Record 0: version (259, 260 or 272) in its first two bytes
//! - Record 1: first text page, followed by the DRM cookie. The cookie is
//!   DES-encrypted with the record's own first 8 bytes as key; its last block
//!   holds `(shuffle, size)` and the rest is a shuffled header
//! - The header carries page counts, the content key (DES-encrypted with the
//!   user key) and the SHA-1 of the content key
//!
//! Text, footnote and sidebar pages are DES-encrypted zlib streams. Footnote
//! and sidebar id lists are XORed with a table taken from raw record 1.
//!
//! # Output
//! A `.pmlz` zip holding `<name>.pml` and `<name>_img/<image>` files.

use crate::crypto::{fix_des_key, DesEcb};
use crate::error::{DecodeError, DecodeResult};
use crate::formats::pdb::{has_kind, slice, PalmDb};
use crate::formats::DecryptedArtifact;
use flate2::read::ZlibDecoder;
use sha1::{Digest, Sha1};
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const BOOK_KIND: &[u8] = b"PNRdPPrs";
const DICT_KIND: &[u8] = b"PDctPPrs";
const REQUIRED_FLAGS: u32 = (1 << 9) | (1 << 7) | (1 << 10);

/// Whether the bytes are an eReader database
pub fn is_ereader(bytes: &[u8]) -> bool {
    has_kind(bytes, &[BOOK_KIND, DICT_KIND])
}

fn be16(data: &[u8], offset: usize) -> DecodeResult<usize> {
    Ok(crate::formats::pdb::read_u16(data, offset)? as usize)
}

/// Page layout and keys recovered from the DRM cookie
#[derive(Debug)]
struct Layout {
    num_text_pages: usize,
    first_image_page: usize,
    num_image_pages: usize,
    first_footnote_page: usize,
    num_footnote_pages: usize,
    first_sidebar_page: usize,
    num_sidebar_pages: usize,
    xor_table: Vec<u8>,
    content_key: Vec<u8>,
}

/// Reverse the cookie shuffle
fn unshuffle(data: &[u8], shuffle: usize) -> Vec<u8> {
    let mut out = vec![0u8; data.len()];
    let mut j = 0;
    for &b in data {
        j = (j + shuffle) % data.len();
        out[j] = b;
    }
    out
}

fn de_xor(text: &[u8], table: &[u8]) -> DecodeResult<Vec<u8>> {
    if table.is_empty() {
        return Err(DecodeError::malformed("eReader XOR table is empty"));
    }
    Ok(text
        .iter()
        .zip(table.iter().cycle())
        .map(|(t, k)| t ^ k)
        .collect())
}

fn read_layout(db: &PalmDb<'_>, user_key: &[u8]) -> DecodeResult<Layout> {
    let version = be16(db.section(0)?, 0)?;
    tracing::debug!(version, "eReader file format version");
    if !matches!(version, 259 | 260 | 272) {
        return Err(DecodeError::malformed(format!("unsupported eReader version {}", version)));
    }

    let record = db.section(1)?;
    if record.len() < 8 {
        return Err(DecodeError::malformed("eReader DRM record truncated"));
    }
    let cookie_cipher = DesEcb::new(&fix_des_key(&record[..8]))?;
    let tail = cookie_cipher.decrypt(&record[record.len() - 8..]);
    let shuffle = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]) as usize;
    let size = u32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]) as usize;
    if !(3..=0x14).contains(&shuffle) || !(0xf0..=0x200).contains(&size) || size > record.len() {
        return Err(DecodeError::malformed("eReader DRM cookie is not recognised"));
    }
    let cookie = cookie_cipher.decrypt(&record[record.len() - size..]);
    let r = unshuffle(&cookie[..cookie.len() - 8], shuffle);

    let drm_sub_version = be16(&r, 0)?;
    let flags = crate::formats::pdb::read_u32(&r, 4)?;
    if flags & REQUIRED_FLAGS != REQUIRED_FLAGS {
        return Err(DecodeError::malformed(format!("incompatible eReader flags {:#x}", flags)));
    }

    let mut layout = Layout {
        num_text_pages: be16(&r, 2)?.saturating_sub(1),
        first_image_page: be16(&r, 24)?,
        num_image_pages: be16(&r, 26)?,
        first_footnote_page: 0,
        num_footnote_pages: 0,
        first_sidebar_page: 0,
        num_sidebar_pages: 0,
        xor_table: Vec::new(),
        content_key: Vec::new(),
    };
    if version == 272 {
        layout.first_footnote_page = be16(&r, 44)?;
        layout.num_footnote_pages = be16(&r, 46)?;
        if db.kind() == BOOK_KIND {
            layout.first_sidebar_page = be16(&r, 36)?;
            layout.num_sidebar_pages = be16(&r, 38)?;
        }
        let xor_offset = be16(&r, 40)?;
        let xor_size = be16(&r, 42)?;
        layout.xor_table = slice(record, xor_offset, xor_size)?.to_vec();
    }

    let (encrypted_key, key_sha) = match (version, drm_sub_version) {
        (259, 7) => (slice(&r, 64, 8)?, slice(&r, 44, 20)?),
        (260, 13) => (slice(&r, 44, 8)?, slice(&r, 52, 20)?),
        (260, 11) => (slice(&r, 64, 8)?, slice(&r, 44, 20)?),
        (272, _) => (slice(&r, 172, 8)?, slice(&r, 56, 20)?),
        (_, sub) => {
            return Err(DecodeError::malformed(format!(
                "unsupported eReader DRM sub-version {}",
                sub
            )))
        }
    };

    if user_key.len() != 8 {
        return Err(DecodeError::rejected("eReader key must be 8 bytes"));
    }
    let content_key = DesEcb::new(&fix_des_key(user_key))?.decrypt(encrypted_key);
    if Sha1::digest(&content_key).as_slice() != key_sha {
        return Err(DecodeError::rejected("incorrect name and/or credit card"));
    }
    layout.content_key = content_key;
    Ok(layout)
}

fn inflate(data: &[u8]) -> DecodeResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::malformed(format!("eReader page does not inflate: {}", e)))?;
    Ok(out)
}

/// Footnotes or sidebars: id list in the first record, one page per id after it
fn tagged_pages(
    db: &PalmDb<'_>,
    cipher: &DesEcb,
    layout: &Layout,
    first: usize,
    count: usize,
    tag: &str,
) -> DecodeResult<Vec<u8>> {
    let mut out = b"\n".to_vec();
    let ids = de_xor(db.section(first)?, &layout.xor_table)?;
    let mut rest = ids.as_slice();
    for i in 1..count {
        let id_len = *rest.get(2).ok_or_else(|| DecodeError::malformed("id list truncated"))? as usize;
        let id = slice(rest, 3, id_len)?;
        out.extend_from_slice(format!("<{} id=\"", tag).as_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(b"\">\n");
        out.extend(inflate(&cipher.decrypt(db.section(first + i)?))?);
        out.extend_from_slice(format!("\n</{}>\n", tag).as_bytes());
        rest = rest.get(id_len + 4..).unwrap_or(&[]);
    }
    Ok(out)
}

/// High bytes become `\aNNN` PML escapes
fn clean_pml(pml: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pml.len());
    for &b in pml {
        if b >= 0x80 {
            out.extend_from_slice(format!("\\a{:03}", b).as_bytes());
        } else {
            out.push(b);
        }
    }
    out
}

fn sanitize_file_name(name: &[u8]) -> String {
    let name: String = name
        .iter()
        .map(|&b| match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => b as char,
            _ => '_',
        })
        .collect();
    match name.trim_start_matches('.') {
        "" => "image".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Decrypt an eReader book into a `.pmlz` bundle
///
/// # Arguments
/// * `name` - Base name for the files inside the bundle
/// * `user_key` - 8-byte key derived from name and credit card number
pub fn decrypt(bytes: &[u8], name: &str, user_key: &[u8]) -> DecodeResult<DecryptedArtifact> {
    if !is_ereader(bytes) {
        return Err(DecodeError::wrong_scheme("not an eReader book"));
    }
    let db = PalmDb::parse(bytes)?;
    let layout = read_layout(&db, user_key)?;
    let cipher = DesEcb::new(&fix_des_key(&layout.content_key))?;

    let mut pml = Vec::new();
    for i in 0..layout.num_text_pages {
        pml.extend(inflate(&cipher.decrypt(db.section(1 + i)?))?);
    }
    if layout.num_footnote_pages > 0 {
        let first = layout.first_footnote_page;
        pml.extend(tagged_pages(&db, &cipher, &layout, first, layout.num_footnote_pages, "footnote")?);
    }
    if layout.num_sidebar_pages > 0 {
        let first = layout.first_sidebar_page;
        pml.extend(tagged_pages(&db, &cipher, &layout, first, layout.num_sidebar_pages, "sidebar")?);
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(format!("{}.pml", name), options)?;
    zip.write_all(&clean_pml(&pml))?;

    for i in 0..layout.num_image_pages {
        let record = db.section(layout.first_image_page + i)?;
        let image_name = slice(record, 4, 32)?;
        let end = image_name.iter().position(|&b| b == 0).unwrap_or(image_name.len());
        let data = record.get(62..).unwrap_or(&[]);
        zip.start_file(
            format!("{}_img/{}", name, sanitize_file_name(&image_name[..end])),
            options,
        )?;
        zip.write_all(data)?;
    }

    tracing::info!(
        pages = layout.num_text_pages,
        images = layout.num_image_pages,
        footnotes = layout.num_footnote_pages.saturating_sub(1),
        "eReader book decrypted"
    );
    let bundle = zip.finish()?.into_inner();
    Ok(DecryptedArtifact::new(bundle, "pmlz"))
}
