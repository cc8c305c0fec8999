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


//! Kindle PID derivation
//!
//! A PID is 8 characters; the 10-character form adds two checksum letters.
//! Books are bound either to a device PID or to a book PID derived from a
//! device identity plus two EXTH values of the book itself:
//!
//! - `rec209`: raw contents of EXTH record 209
//! - `token`: concatenation of the EXTH records that `rec209` points to
//!
//! # Sources of PIDs
//! - **PID**: entered directly by the user
//! - **Serial**: e-ink Kindle serial number; `SHA1(serial + rec209 + token)`
//!   and the pre-2.5 firmware PID `pid_from_serial(serial, 7) + "*"`
//! - **Device key** (`.k4i`): Kindle for PC/Mac secrets; a DSN is read or
//!   rebuilt from them, then a device PID and three book PID variants are derived

use crate::error::{DecodeError, DecodeResult};
use md5::Md5;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

const LETTERS: &[u8; 34] = b"ABCDEFGHIJKLMNPQRSTUVWXYZ123456789";
const CHAR_MAP1: &[u8; 32] = b"n5Pr6St7Uv8Wx9YzAb0Cd1Ef2Gh3Jk4M";
const CHAR_MAP3: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// CRC-32 register without the final inversion, starting from zero
fn raw_crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(0xFFFF_FFFF);
    hasher.update(data);
    !hasher.finalize()
}

fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut crc = i as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
        *entry = crc;
    }
    table
}

/// Append the two checksum letters to an 8-character PID
pub fn checksum_pid(pid: &[u8]) -> String {
    let mut crc = raw_crc32(pid);
    crc ^= crc >> 16;
    let mut out = String::from_utf8_lossy(pid).into_owned();
    let l = LETTERS.len() as u32;
    for _ in 0..2 {
        let b = crc & 0xff;
        let pos = (b / l) ^ (b % l);
        out.push(LETTERS[(pos % l) as usize] as char);
        crc >>= 8;
    }
    out
}

/// Legacy PID from a device serial number
pub fn pid_from_serial(serial: &[u8], len: usize) -> Vec<u8> {
    let crc = raw_crc32(serial);
    let mut arr = vec![0u8; len];
    for (i, &c) in serial.iter().enumerate() {
        arr[i % len] ^= c;
    }
    let crc_bytes = crc.to_be_bytes();
    for (i, b) in arr.iter_mut().enumerate() {
        *b ^= crc_bytes[i & 3];
    }
    arr.iter()
        .map(|&b| LETTERS[((b >> 7) + ((b >> 5 & 3) ^ (b & 0x1f))) as usize])
        .collect()
}

/// 10-character PID printed for a Kindle serial (pre-2.5 firmware books)
pub fn kindle_pid_from_serial(serial: &str) -> String {
    let mut pid = pid_from_serial(serial.trim().as_bytes(), 7);
    pid.push(b'*');
    checksum_pid(&pid)
}

fn two_bits(field: &[u8], offset: usize) -> u8 {
    (field[offset / 4] >> (6 - 2 * (offset % 4))) & 3
}

fn six_bits(field: &[u8], index: usize) -> usize {
    let offset = index * 3;
    ((two_bits(field, offset) << 4) + (two_bits(field, offset + 1) << 2) + two_bits(field, offset + 2))
        as usize
}

/// 8-character PID from a 20-byte SHA-1 digest
pub fn encode_pid(hash: &[u8]) -> Vec<u8> {
    (0..8).map(|i| CHAR_MAP3[six_bits(hash, i)]).collect()
}

fn encode(data: &[u8], map: &[u8]) -> Vec<u8> {
    let len = map.len();
    let mut out = Vec::with_capacity(data.len() * 2);
    for &value in data {
        out.push(map[(value ^ 0x80) as usize / len]);
        out.push(map[value as usize % len]);
    }
    out
}

fn encode_hash(data: &[u8], map: &[u8]) -> Vec<u8> {
    encode(&Md5::digest(data), map)
}

fn sha1_of(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn book_pid(parts: &[&[u8]]) -> String {
    checksum_pid(&encode_pid(&sha1_of(parts)))
}

/// Book PIDs for an e-ink device serial
pub fn pids_from_serial(serial: &[u8], rec209: &[u8], token: &[u8]) -> Vec<String> {
    let mut legacy = pid_from_serial(serial, 7);
    legacy.push(b'*');
    vec![book_pid(&[serial, rec209, token]), checksum_pid(&legacy)]
}

fn generate_device_pid(dsn: &[u8], rolls: usize) -> Vec<u8> {
    let table = crc32_table();
    let mut seed: u32 = 0;
    for &c in dsn.iter().take(4) {
        let index = ((c as u32) ^ seed) & 0xff;
        seed = (seed >> 8) ^ table[index as usize];
    }

    let seed_bytes = seed.to_be_bytes();
    let mut pid = [0u8; 8];
    for (i, b) in pid.iter_mut().enumerate() {
        *b = seed_bytes[i % 4];
    }
    for (counter, &c) in dsn.iter().take(rolls).enumerate() {
        pid[counter % 8] ^= c;
    }
    pid.iter()
        .map(|&p| LETTERS[((((p >> 5) & 3) ^ p) & 0x1f) as usize + (p >> 7) as usize])
        .collect()
}

/// Kindle for PC/Mac secrets as found in a `.k4i` file (hex-encoded values)
#[derive(Debug, Default)]
pub struct DeviceKey {
    values: BTreeMap<String, Vec<u8>>,
}

impl DeviceKey {
    /// Parse the JSON object; values that are not hex strings are ignored
    pub fn from_json(material: &[u8]) -> DecodeResult<Self> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(material)
            .map_err(|e| DecodeError::rejected(format!("device key is not a JSON object: {}", e)))?;
        let values = map
            .into_iter()
            .filter_map(|(k, v)| {
                let text = v.as_str()?;
                hex::decode(text).ok().map(|bytes| (k, bytes))
            })
            .collect();
        Ok(Self { values })
    }

    fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Device serial number, stored or rebuilt from the Mazama secrets
    pub fn dsn(&self) -> Option<Vec<u8>> {
        if let Some(dsn) = self.get("DSN") {
            return Some(dsn.to_vec());
        }
        let mazama = self.get("MazamaRandomNumber")?;
        let id_string = self.get("SerialNumber").or_else(|| self.get("IDString"))?;
        let encoded_username = match self.get("UsernameHash") {
            Some(hash) => hash.to_vec(),
            None => encode_hash(self.get("UserName")?, CHAR_MAP1),
        };
        let encoded_id = encode_hash(id_string, CHAR_MAP1);
        Some(encode(&sha1_of(&[mazama, &encoded_id, &encoded_username]), CHAR_MAP1))
    }

    /// Device PID followed by the book PID variants
    pub fn pids(&self, rec209: &[u8], token: &[u8]) -> Vec<String> {
        let account = self.get("kindle.account.tokens").unwrap_or(&[]);
        let Some(dsn) = self.dsn() else {
            return Vec::new();
        };
        vec![
            checksum_pid(&generate_device_pid(&dsn, 4)),
            book_pid(&[&dsn, account, rec209, token]),
            book_pid(&[account, rec209, token]),
            book_pid(&[&dsn, rec209, token]),
        ]
    }
}

/// Validate user-supplied PIDs: 10-character PIDs lose their checksum (a bad
/// checksum only warns), 8-character PIDs pass, anything else is dropped
pub fn normalize_pids<I, S>(pids: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut out: Vec<Vec<u8>> = Vec::new();
    for pid in pids {
        let pid = pid.as_ref();
        let short = match pid.len() {
            10 => {
                if checksum_pid(&pid[..8]).as_bytes() != pid {
                    tracing::warn!("PID has incorrect checksum");
                }
                &pid[..8]
            }
            8 => pid,
            _ => {
                tracing::debug!(len = pid.len(), "Ignoring PID of unexpected length");
                continue;
            }
        };
        if !out.iter().any(|p| p == short) {
            out.push(short.to_vec());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_crc32() {
        assert_eq!(raw_crc32(b"B001A0B0C0D0E0F0"), 0x1150_a08a);
    }

    #[test]
    fn test_checksum_is_stable_and_uses_pid_alphabet() {
        let pid = checksum_pid(b"ABCDEFGH");
        assert_eq!(pid.len(), 10);
        assert!(pid.starts_with("ABCDEFGH"));
        assert!(pid[8..].bytes().all(|b| LETTERS.contains(&b)));
        assert_eq!(pid, "ABCDEFGHHA");
    }

    #[test]
    fn test_serial_pid() {
        let pid = kindle_pid_from_serial("B001A0B0C0D0E0F0");
        assert_eq!(pid, "EUC5DES*1I");
        assert_eq!(normalize_pids([pid.as_bytes()]), vec![pid.as_bytes()[..8].to_vec()]);
    }

    #[test]
    fn test_encode_pid_reads_six_bit_groups() {
        // 0b000000_000001_000010_000011 ... spread over the first bytes
        let mut hash = [0u8; 20];
        hash[0] = 0b0000_0000;
        hash[1] = 0b0001_0000;
        hash[2] = 0b1000_0011;
        assert_eq!(&encode_pid(&hash)[..4], b"ABCD");
    }

    #[test]
    fn test_normalize_pids() {
        let pids = normalize_pids(["ABCDEFGH", "ABCDEFGHXY", "short", "ABCDEFGH"]);
        assert_eq!(pids, vec![b"ABCDEFGH".to_vec()]);
    }

    #[test]
    fn test_device_key_prefers_stored_dsn() {
        let json = format!(r#"{{"DSN": "{}"}}"#, hex::encode("0123456789"));
        let key = DeviceKey::from_json(json.as_bytes()).unwrap();
        assert_eq!(key.dsn().unwrap(), b"0123456789".to_vec());
        let pids = key.pids(b"rec209", b"token");
        assert_eq!(pids.len(), 4);
        assert!(pids.iter().all(|p| p.len() == 10));
    }

    #[test]
    fn test_device_key_rebuilds_dsn() {
        let json = format!(
            r#"{{"MazamaRandomNumber": "{}", "IDString": "{}", "UserName": "{}"}}"#,
            hex::encode("mazama"),
            hex::encode("id"),
            hex::encode("user")
        );
        let key = DeviceKey::from_json(json.as_bytes()).unwrap();
        let dsn = key.dsn().unwrap();
        assert_eq!(dsn.len(), 40);
        assert!(dsn.iter().all(|b| CHAR_MAP1.contains(b)));
    }

    #[test]
    fn test_device_key_without_secrets_has_no_pids() {
        let key = DeviceKey::from_json(br#"{"unrelated": "00"}"#).unwrap();
        assert!(key.pids(b"", b"").is_empty());
        assert!(DeviceKey::from_json(b"[1,2]").is_err());
    }
}
