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


//! Candidate keys, the persistent key store, and key discovery
//!
//! # Key Schemes
//! - **Adobe Adept**: RSA private key (DER) exported from Adobe Digital Editions
//! - **Barnes & Noble**: 20-byte user key (base64 in the wild), NOOK Study
//! - **eReader**: 8-byte key derived from name + credit card digits
//! - **Kindle device**: JSON blob of hex-encoded Kindle-for-PC/Mac secrets
//! - **Kindle PID**: 8 or 10 character book/device PID
//! - **Kindle serial**: e-ink device serial number
//!
//! # Storage
//! - Never log key material; log [`CandidateKey::masked_name`] instead
//! - Keys are unique by (scheme, name) and tried in insertion order

pub mod generate;
pub mod harvest;
pub mod store;

pub use harvest::{CommandHarvester, HarvesterSet, KeyHarvester, NoHarvester};
pub use store::{AddOutcome, KeyStore};

use crate::error::{DeDrmError, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Protection scheme a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScheme {
    Adept,
    BarnesNoble,
    EReader,
    KindleDevice,
    KindlePid,
    KindleSerial,
}

impl KeyScheme {
    pub const ALL: [KeyScheme; 6] = [
        KeyScheme::Adept,
        KeyScheme::BarnesNoble,
        KeyScheme::EReader,
        KeyScheme::KindleDevice,
        KeyScheme::KindlePid,
        KeyScheme::KindleSerial,
    ];

    /// Name used in the key store file and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScheme::Adept => "adept",
            KeyScheme::BarnesNoble => "barnes_noble",
            KeyScheme::EReader => "ereader",
            KeyScheme::KindleDevice => "kindle_device",
            KeyScheme::KindlePid => "kindle_pid",
            KeyScheme::KindleSerial => "kindle_serial",
        }
    }

    /// Human-readable name for messages
    pub fn display_name(&self) -> &'static str {
        match self {
            KeyScheme::Adept => "Adobe Adept",
            KeyScheme::BarnesNoble => "Barnes & Noble",
            KeyScheme::EReader => "eReader",
            KeyScheme::KindleDevice => "Kindle device",
            KeyScheme::KindlePid => "Kindle PID",
            KeyScheme::KindleSerial => "Kindle serial",
        }
    }

    /// File extension external harvesters use for this scheme's key files
    pub fn harvest_extension(&self) -> Option<&'static str> {
        match self {
            KeyScheme::Adept => Some("der"),
            KeyScheme::BarnesNoble => Some("b64"),
            KeyScheme::KindleDevice => Some("k4i"),
            _ => None,
        }
    }

    /// Base name for a key found by discovery rather than entered by the user
    pub fn discovered_key_name(&self) -> &'static str {
        match self {
            KeyScheme::BarnesNoble => "nook_Study_key",
            _ => "default_key",
        }
    }

    /// Whether key names for this scheme tend to embed personal data
    fn masks_names(&self) -> bool {
        matches!(self, KeyScheme::BarnesNoble | KeyScheme::EReader)
    }

    /// Convert textual key input (as typed or as stored by vendor tools) to raw material
    ///
    /// # Format Rules
    /// - Adept, eReader: hex
    /// - Barnes & Noble: base64
    /// - Kindle device: JSON object text
    /// - Kindle PID / serial: the identifier itself
    pub fn parse_material(&self, text: &str) -> Result<Vec<u8>> {
        let text = text.trim();
        match self {
            KeyScheme::Adept => {
                hex::decode(text).map_err(|e| DeDrmError::invalid_key(*self, e.to_string()))
            }
            KeyScheme::EReader => {
                let bytes =
                    hex::decode(text).map_err(|e| DeDrmError::invalid_key(*self, e.to_string()))?;
                if bytes.len() != 8 {
                    return Err(DeDrmError::invalid_key(
                        *self,
                        format!("expected 8 bytes, got {}", bytes.len()),
                    ));
                }
                Ok(bytes)
            }
            KeyScheme::BarnesNoble => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| DeDrmError::invalid_key(*self, e.to_string())),
            KeyScheme::KindleDevice => {
                serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(text)
                    .map_err(|e| DeDrmError::invalid_key(*self, e.to_string()))?;
                Ok(text.as_bytes().to_vec())
            }
            KeyScheme::KindlePid | KeyScheme::KindleSerial => {
                if text.is_empty() || !text.is_ascii() {
                    return Err(DeDrmError::invalid_key(*self, "expected ASCII identifier"));
                }
                Ok(text.as_bytes().to_vec())
            }
        }
    }

    /// Convert the contents of a harvested key file to raw material
    pub fn material_from_file(&self, contents: &[u8]) -> Result<Vec<u8>> {
        match self {
            KeyScheme::BarnesNoble => {
                let text = String::from_utf8_lossy(contents);
                self.parse_material(&text)
            }
            _ => Ok(contents.to_vec()),
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for KeyScheme {
    type Err = DeDrmError;

    fn from_str(s: &str) -> Result<Self> {
        KeyScheme::ALL
            .iter()
            .copied()
            .find(|scheme| scheme.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DeDrmError::UnknownScheme(s.to_string()))
    }
}

/// One named key to try against a protected book
///
/// Immutable once created. `Debug` never prints the material.
#[derive(Clone, PartialEq, Eq)]
pub struct CandidateKey {
    scheme: KeyScheme,
    name: String,
    material: Vec<u8>,
}

impl CandidateKey {
    pub fn new<S: Into<String>>(scheme: KeyScheme, name: S, material: Vec<u8>) -> Self {
        Self {
            scheme,
            name: name.into(),
            material,
        }
    }

    pub fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }

    /// Key name safe for logs: digits are replaced by `X` for schemes whose
    /// names usually carry card numbers or account details
    pub fn masked_name(&self) -> String {
        if self.scheme.masks_names() {
            mask_digits(&self.name)
        } else {
            self.name.clone()
        }
    }

    /// Short SHA-256 fingerprint of the material, for correlating log lines
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.material);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateKey")
            .field("scheme", &self.scheme)
            .field("name", &self.masked_name())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Replace every ASCII digit with `X`
pub fn mask_digits(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_digit() { 'X' } else { c })
        .collect()
}
