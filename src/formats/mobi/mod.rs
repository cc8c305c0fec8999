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


//! Mobipocket / Kindle decryption
//!
//! # Format Details
//! A PalmDB database of type `BOOKMOBI` (or `TEXtREAd` for PalmDoc). Record 0
//! holds the PalmDoc header, then the MOBI header and optional EXTH block:
//!
//! | Offset | Field                                   |
//! |--------|-----------------------------------------|
//! | 0x00   | compression (2 = PalmDoc, 17480 = HUFF) |
//! | 0x08   | text record count                       |
//! | 0x0C   | crypto type (0 none, 1 old, 2 PID)      |
//! | 0x14   | MOBI header length                      |
//! | 0x68   | MOBI version                            |
//! | 0x80   | EXTH flags (0x40 = EXTH present)        |
//! | 0xA8   | DRM offset, count, size, flags          |
//! | 0xF2   | extra data flags (trailing entries)     |
//!
//! # Key Recovery
//! - Type 1: the book key is PC1-encrypted with a fixed key
//! - Type 2: each PID unlocks a temporary key; a voucher whose checksum and
//!   verification match yields the book key. A default voucher needs no PID.
//!
//! Text records 1..=count are PC1-decrypted without their trailing entries.

pub mod pid;

use crate::crypto::Pc1;
use crate::error::{DecodeError, DecodeResult};
use crate::formats::pdb::{read_u16, read_u32, slice, PalmDb};
use crate::formats::DecryptedArtifact;
use pid::{checksum_pid, normalize_pids, pids_from_serial, DeviceKey};
use std::collections::BTreeMap;

const MOBI_KINDS: &[&[u8]] = &[b"BOOKMOBI", b"TEXtREAd"];

const VOUCHER_KEY: &[u8; 16] = b"\x72\x38\x33\xB0\xB4\xF2\xE3\xCA\xDF\x09\x01\xD6\xE2\xE0\x3F\x96";
const TYPE1_KEY: &[u8; 16] = b"QDCVEPMU675RUBSZ";
const DEFAULT_PID: &[u8] = b"00000000";
const HUFF_CDIC: u16 = 17480;
const VOUCHER_LEN: usize = 0x30;

/// A secret from which Kindle PIDs are derived
#[derive(Debug, Clone, Copy)]
pub enum KindleSecret<'a> {
    /// 8 or 10 character PID
    Pid(&'a [u8]),
    /// E-ink device serial number
    Serial(&'a [u8]),
    /// Kindle for PC/Mac device key JSON
    Device(&'a [u8]),
}

impl KindleSecret<'_> {
    fn pids(&self, rec209: &[u8], token: &[u8]) -> DecodeResult<Vec<String>> {
        Ok(match self {
            KindleSecret::Pid(pid) => vec![String::from_utf8_lossy(pid).trim().to_string()],
            KindleSecret::Serial(serial) => pids_from_serial(serial, rec209, token),
            KindleSecret::Device(json) => DeviceKey::from_json(json)?.pids(rec209, token),
        })
    }
}

/// Whether the bytes are a Mobipocket / PalmDoc database
pub fn is_mobi(bytes: &[u8]) -> bool {
    crate::formats::pdb::has_kind(bytes, MOBI_KINDS)
}

/// Topaz (`TPZ`) and KFX (`CONT` or zipped) books use protection we do not remove
pub fn is_topaz_or_kfx(bytes: &[u8]) -> bool {
    bytes.starts_with(b"TPZ") || bytes.starts_with(b"CONT") || bytes.starts_with(b"PK\x03\x04")
}

/// Parsed book with a private, patchable copy of the file
#[derive(Debug)]
pub struct MobiBook {
    data: Vec<u8>,
    offsets: Vec<usize>,
    is_palmdoc: bool,
    records: usize,
    compression: u16,
    mobi_length: usize,
    mobi_version: i64,
    extra_data_flags: u16,
    meta: BTreeMap<u32, Vec<u8>>,
}

impl MobiBook {
    pub fn parse(bytes: &[u8]) -> DecodeResult<Self> {
        let db = PalmDb::parse(bytes)?;
        let kind = db.kind();
        if !MOBI_KINDS.contains(&kind) {
            return Err(DecodeError::wrong_scheme("not a Mobipocket book"));
        }
        if db.num_sections() < 2 {
            return Err(DecodeError::malformed("Mobipocket book has no text records"));
        }
        let offsets = (0..db.num_sections())
            .map(|i| db.section_offset(i))
            .collect::<DecodeResult<Vec<_>>>()?;
        let sect = db.section(0)?;

        let mut book = Self {
            data: bytes.to_vec(),
            offsets,
            is_palmdoc: kind == b"TEXtREAd",
            records: read_u16(sect, 0x8)? as usize,
            compression: read_u16(sect, 0x0)?,
            mobi_length: 0,
            mobi_version: -1,
            extra_data_flags: 0,
            meta: BTreeMap::new(),
        };
        if book.records + 1 > book.offsets.len() {
            return Err(DecodeError::malformed(format!(
                "book claims {} text records but has {} sections",
                book.records,
                book.offsets.len()
            )));
        }
        if book.is_palmdoc {
            return Ok(book);
        }

        book.mobi_length = read_u32(sect, 0x14)? as usize;
        book.mobi_version = i64::from(read_u32(sect, 0x68)?);
        if book.mobi_length >= 0xE4 && book.mobi_version >= 5 {
            book.extra_data_flags = read_u16(sect, 0xF2)?;
        }
        if book.compression != HUFF_CDIC {
            // Multibyte bytes are inside the encrypted part for PalmDoc compression
            book.extra_data_flags &= 0xFFFE;
        }
        book.read_exth(sect);
        Ok(book)
    }

    /// Collect EXTH records; clipping limit goes to 100% and text-to-speech on
    fn read_exth(&mut self, sect: &[u8]) {
        let Ok(flags) = read_u32(sect, 0x80) else {
            return;
        };
        if flags & 0x40 == 0 {
            return;
        }
        let base = 16 + self.mobi_length;
        let Some(exth) = sect.get(base..) else {
            return;
        };
        if exth.len() < 12 || &exth[..4] != b"EXTH" {
            return;
        }
        let Ok(count) = read_u32(exth, 8) else {
            return;
        };

        let mut pos = 12;
        let mut patches = Vec::new();
        for _ in 0..count {
            let (Ok(kind), Ok(size)) = (read_u32(exth, pos), read_u32(exth, pos + 4)) else {
                break;
            };
            let size = size as usize;
            if size < 8 || pos + size > exth.len() {
                break;
            }
            self.meta.insert(kind, exth[pos + 8..pos + size].to_vec());
            match (kind, size) {
                (401, 9) => patches.push((base + pos + 8, 100u8)),
                (404, 9) => patches.push((base + pos + 8, 0u8)),
                _ => {}
            }
            pos += size;
        }
        for (offset, value) in patches {
            let _ = self.patch_section(0, &[value], offset);
        }
    }

    fn section(&self, index: usize) -> DecodeResult<&[u8]> {
        let start = *self
            .offsets
            .get(index)
            .ok_or_else(|| DecodeError::malformed(format!("no record {}", index)))?;
        let end = self.offsets.get(index + 1).copied().unwrap_or(self.data.len());
        Ok(&self.data[start..end])
    }

    fn patch_section(&mut self, index: usize, bytes: &[u8], at: usize) -> DecodeResult<()> {
        let start = self.offsets[index] + at;
        let end = self.offsets.get(index + 1).copied().unwrap_or(self.data.len());
        if start + bytes.len() > end {
            return Err(DecodeError::malformed("patch beyond record end"));
        }
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn crypto_type(&self) -> DecodeResult<u16> {
        read_u16(self.section(0)?, 0xC)
    }

    /// EXTH 406 is non-zero for library loans and rentals
    pub fn is_rental(&self) -> bool {
        self.meta
            .get(&406)
            .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
            .map_or(false, |v| u64::from_be_bytes(v) != 0)
    }

    /// EXTH 209 and the token built from the records it names
    pub fn pid_meta(&self) -> (Vec<u8>, Vec<u8>) {
        let Some(rec209) = self.meta.get(&209) else {
            return (Vec::new(), Vec::new());
        };
        let mut token = Vec::new();
        for group in rec209.chunks(5) {
            if group.len() == 5 {
                let id = u32::from_be_bytes([group[1], group[2], group[3], group[4]]);
                if let Some(value) = self.meta.get(&id) {
                    token.extend_from_slice(value);
                }
            }
        }
        (rec209.clone(), token)
    }

    pub fn book_type(&self, print_replica: bool) -> String {
        if print_replica {
            "Print Replica".to_string()
        } else if self.mobi_version >= 8 {
            "Kindle Format 8".to_string()
        } else if self.mobi_version >= 0 {
            format!("Mobipocket {}", self.mobi_version)
        } else {
            "PalmDoc".to_string()
        }
    }

    fn extension(&self, print_replica: bool) -> &'static str {
        if print_replica {
            "azw4"
        } else if self.mobi_version >= 8 {
            "azw3"
        } else {
            "mobi"
        }
    }

    /// Find the book key in the voucher table
    fn find_voucher_key(
        &self,
        table: &[u8],
        count: usize,
        pids: &[Vec<u8>],
    ) -> DecodeResult<Option<([u8; 16], Vec<u8>)>> {
        let vouchers: Vec<&[u8]> = table.chunks_exact(VOUCHER_LEN).take(count).collect();

        let try_key = |temp_key: &[u8], check_flags: bool| -> Option<[u8; 16]> {
            let sum = temp_key.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            let cipher = Pc1::new(temp_key)?;
            for voucher in &vouchers {
                let verification = &voucher[0..4];
                if voucher[12] != sum {
                    continue;
                }
                let cookie = cipher.decrypt(&voucher[16..48]);
                let flags = u32::from_be_bytes([cookie[4], cookie[5], cookie[6], cookie[7]]);
                if &cookie[0..4] == verification && (!check_flags || flags & 0x1F == 1) {
                    let mut key = [0u8; 16];
                    key.copy_from_slice(&cookie[8..24]);
                    return Some(key);
                }
            }
            None
        };

        let voucher_cipher = Pc1::new(VOUCHER_KEY)
            .ok_or_else(|| DecodeError::internal("voucher key has wrong length"))?;
        for pid in pids {
            let mut big = pid.clone();
            big.resize(16, 0);
            let temp_key = voucher_cipher.encrypt(&big);
            if let Some(key) = try_key(&temp_key, true) {
                return Ok(Some((key, pid.clone())));
            }
        }
        // Default voucher, no PID needed
        Ok(try_key(VOUCHER_KEY, false).map(|key| (key, DEFAULT_PID.to_vec())))
    }

    /// Decrypt with the given PIDs (already normalized to 8 characters)
    pub fn process(mut self, pids: &[Vec<u8>]) -> DecodeResult<DecryptedArtifact> {
        let crypto_type = self.crypto_type()?;
        tracing::debug!(crypto_type, "Mobipocket crypto type");

        if crypto_type == 0 {
            let print_replica = self.section(1)?.starts_with(b"%MOP");
            tracing::info!(book_type = %self.book_type(print_replica), "Book is not encrypted");
            let extension = self.extension(print_replica);
            return Ok(DecryptedArtifact::new(self.data, extension));
        }
        if crypto_type != 1 && crypto_type != 2 {
            return Err(DecodeError::malformed(format!(
                "unknown Mobipocket encryption type {}",
                crypto_type
            )));
        }

        let (found_key, pid) = if crypto_type == 1 {
            let sect = self.section(0)?;
            let key_data = if self.is_palmdoc {
                slice(sect, 0x0E, 16)?
            } else if self.mobi_version < 0 {
                slice(sect, 0x90, 16)?
            } else {
                slice(sect, self.mobi_length + 16, 16)?
            };
            let cipher = Pc1::new(TYPE1_KEY)
                .ok_or_else(|| DecodeError::internal("type 1 key has wrong length"))?;
            let mut key = [0u8; 16];
            key.copy_from_slice(&cipher.decrypt(key_data));
            (key, DEFAULT_PID.to_vec())
        } else {
            let sect = self.section(0)?;
            let drm_ptr = read_u32(sect, 0xA8)? as usize;
            let drm_count = read_u32(sect, 0xAC)? as usize;
            let drm_size = read_u32(sect, 0xB0)? as usize;
            if drm_count == 0 {
                return Err(DecodeError::malformed(
                    "encryption not initialised, open the book in Mobipocket Reader first",
                ));
            }
            let table = slice(sect, drm_ptr, drm_size)?;
            let (key, pid) = self
                .find_voucher_key(table, drm_count, pids)?
                .ok_or_else(|| {
                    DecodeError::rejected(format!("no voucher matches {} PIDs", pids.len()))
                })?;
            self.patch_section(0, &vec![0u8; drm_size], drm_ptr)?;
            let mut pointers = [0u8; 16];
            pointers[..4].copy_from_slice(&[0xff; 4]);
            self.patch_section(0, &pointers, 0xA8)?;
            (key, pid)
        };

        if pid == DEFAULT_PID {
            tracing::info!("Book has default encryption, no PID needed");
        } else {
            tracing::info!(pid = %checksum_pid(&pid), "Book is encoded with PID");
        }
        self.patch_section(0, &[0, 0], 0xC)?;

        let cipher = Pc1::new(&found_key).ok_or_else(|| DecodeError::internal("bad book key"))?;
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(&self.data[..self.offsets[1]]);
        let mut print_replica = false;
        for i in 1..=self.records {
            let record = self.section(i)?;
            let extra = trailing_entries_size(record, self.extra_data_flags)?;
            let decrypted = cipher.decrypt(&record[..record.len() - extra]);
            if i == 1 {
                print_replica = decrypted.starts_with(b"%MOP");
            }
            out.extend_from_slice(&decrypted);
            out.extend_from_slice(&record[record.len() - extra..]);
        }
        if let Some(&rest) = self.offsets.get(self.records + 1) {
            out.extend_from_slice(&self.data[rest..]);
        }

        tracing::info!(book_type = %self.book_type(print_replica), "Mobipocket book decrypted");
        Ok(DecryptedArtifact::new(out, self.extension(print_replica)))
    }
}

/// Size of the trailing entries at the end of a text record
pub fn trailing_entries_size(record: &[u8], flags: u16) -> DecodeResult<usize> {
    fn entry_size(record: &[u8], mut size: usize) -> usize {
        let mut bitpos = 0;
        let mut result = 0usize;
        while size > 0 {
            let v = record[size - 1];
            result |= usize::from(v & 0x7F) << bitpos;
            bitpos += 7;
            size -= 1;
            if v & 0x80 != 0 || bitpos >= 28 {
                break;
            }
        }
        result
    }

    let too_big = || DecodeError::malformed("trailing entries larger than record");
    let mut num = 0usize;
    let mut test = flags >> 1;
    while test != 0 {
        if test & 1 != 0 {
            let remaining = record.len().checked_sub(num).ok_or_else(too_big)?;
            num += entry_size(record, remaining);
        }
        test >>= 1;
    }
    if flags & 1 != 0 {
        let last = record
            .len()
            .checked_sub(num + 1)
            .and_then(|i| record.get(i))
            .ok_or_else(too_big)?;
        num += usize::from(last & 0x3) + 1;
    }
    if num > record.len() {
        return Err(too_big());
    }
    Ok(num)
}

/// Decrypt a Mobipocket book with every PID the given secrets produce
pub fn decrypt(bytes: &[u8], secrets: &[KindleSecret<'_>]) -> DecodeResult<DecryptedArtifact> {
    let book = MobiBook::parse(bytes)?;
    let (rec209, token) = book.pid_meta();
    let mut candidates = Vec::new();
    for secret in secrets {
        candidates.extend(secret.pids(&rec209, &token)?);
    }
    let pids = normalize_pids(candidates);
    book.process(&pids)
}
