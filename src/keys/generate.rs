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


//! Key generators for schemes whose user key is derived from account details
//!
//! # Barnes & Noble
//! Older NOOK books are keyed to the account holder's name and credit card:
//! ```text
//! name, ccn  = lowercase, spaces removed, NUL terminated
//! crypt      = AES-128-CBC(key = SHA1(ccn)[..16], iv = SHA1(name)[..16],
//!                          SHA1(name + ccn) || 0x0C * 12)
//! user key   = SHA1(crypt)                      (20 bytes, shown as base64)
//! ```
//!
//! # eReader
//! ```text
//! user key = CRC32(name, only a-z 0-9) BE || CRC32(last 8 card digits) BE
//! ```

use super::{CandidateKey, KeyScheme};
use crate::crypto::aes128_cbc_encrypt;
use crate::error::{DeDrmError, Result};
use crate::formats::mobi::pid::kindle_pid_from_serial;
use sha1::{Digest, Sha1};

fn normalize_bn(text: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = text
        .to_lowercase()
        .chars()
        .filter(|&c| c != ' ')
        .collect::<String>()
        .into_bytes();
    bytes.push(0);
    bytes
}

/// Barnes & Noble user key from name and credit card number
///
/// # Returns
/// The 20-byte user key; its base64 form is what NOOK tooling displays
pub fn barnes_noble_key(name: &str, card_number: &str) -> Result<Vec<u8>> {
    if name.trim().is_empty() || card_number.trim().is_empty() {
        return Err(DeDrmError::invalid_input("name and card number are required"));
    }
    let name = normalize_bn(name);
    let ccn = normalize_bn(card_number);

    let name_sha = Sha1::digest(&name);
    let ccn_sha = Sha1::digest(&ccn);
    let mut both = Sha1::new();
    both.update(&name);
    both.update(&ccn);

    let mut plain = both.finalize().to_vec();
    plain.extend_from_slice(&[0x0c; 12]);
    let crypt = aes128_cbc_encrypt(&ccn_sha[..16], &name_sha[..16], &plain)
        .map_err(|e| DeDrmError::invalid_key(KeyScheme::BarnesNoble, e.to_string()))?;
    Ok(Sha1::digest(&crypt).to_vec())
}

/// eReader user key from name and credit card number
pub fn ereader_key(name: &str, card_number: &str) -> Result<Vec<u8>> {
    let name: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    let digits: String = card_number.chars().filter(|&c| c != ' ').collect();
    if name.is_empty() || digits.len() < 8 {
        return Err(DeDrmError::invalid_input(
            "a name and at least the last 8 card digits are required",
        ));
    }
    let tail = &digits[digits.len() - 8..];

    let mut key = Vec::with_capacity(8);
    key.extend_from_slice(&crc32fast::hash(name.as_bytes()).to_be_bytes());
    key.extend_from_slice(&crc32fast::hash(tail.as_bytes()).to_be_bytes());
    Ok(key)
}

/// Kindle PID (10 characters) for an e-ink device serial number
pub fn kindle_pid(serial: &str) -> Result<String> {
    let serial = serial.trim();
    if serial.len() < 8 || !serial.is_ascii() {
        return Err(DeDrmError::invalid_input("not a Kindle serial number"));
    }
    Ok(kindle_pid_from_serial(serial))
}

/// Name a generated key after the account name, the way key files are usually named
pub fn generated_key(scheme: KeyScheme, name: &str, material: Vec<u8>) -> CandidateKey {
    let key_name: String = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase();
    CandidateKey::new(scheme, key_name, material)
}
