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


//! Persistent key store
//!
//! Keys are stored as JSON, grouped by scheme, each group an ordered list of
//! `{name, material}` pairs with hex-encoded material:
//!
//! ```json
//! {
//!   "version": 1,
//!   "updated_at": "2025-01-01T00:00:00Z",
//!   "schemes": {
//!     "adept": [ { "name": "default_key", "material": "3082025c..." } ]
//!   }
//! }
//! ```
//!
//! Groups are appended to and never reordered. Saving writes a sibling
//! temporary file, syncs it, then renames it over the store so a crash never
//! leaves a half-written store behind.

use super::{CandidateKey, KeyScheme};
use crate::error::{DeDrmError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    name: String,
    material: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreFile {
    version: u32,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    schemes: BTreeMap<String, Vec<StoredKey>>,
}

/// Result of adding a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Same material already stored under some name; nothing changed
    DuplicateMaterial,
    /// Another key already uses this name; nothing changed
    NameTaken,
}

/// Ordered, per-scheme collection of named candidate keys
#[derive(Debug, Default)]
pub struct KeyStore {
    path: Option<PathBuf>,
    updated_at: Option<DateTime<Utc>>,
    entries: BTreeMap<KeyScheme, Vec<CandidateKey>>,
}

impl KeyStore {
    /// Store that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`, or start an empty one if the file does not exist yet
    ///
    /// # Errors
    /// - CorruptKeyStore if the file is not a valid key store
    pub fn load(path: &Path) -> Result<Self> {
        let mut store = KeyStore {
            path: Some(path.to_path_buf()),
            ..Default::default()
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Key store does not exist yet");
            return Ok(store);
        }

        let corrupt = |message: String| DeDrmError::CorruptKeyStore {
            path: path.display().to_string(),
            message,
        };

        let contents = fs::read_to_string(path)?;
        let file: KeyStoreFile =
            serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
        if file.version > STORE_FORMAT_VERSION {
            return Err(corrupt(format!(
                "store format version {} is newer than supported version {}",
                file.version, STORE_FORMAT_VERSION
            )));
        }

        store.updated_at = file.updated_at;
        for (scheme_name, keys) in file.schemes {
            let scheme = match scheme_name.parse::<KeyScheme>() {
                Ok(scheme) => scheme,
                Err(_) => {
                    tracing::warn!(scheme = %scheme_name, "Skipping unknown scheme in key store");
                    continue;
                }
            };
            for stored in keys {
                let material = hex::decode(&stored.material).map_err(|e| {
                    corrupt(format!("key '{}' in {}: {}", stored.name, scheme_name, e))
                })?;
                let key = CandidateKey::new(scheme, stored.name, material);
                let name = key.masked_name();
                match store.add(key) {
                    AddOutcome::Added => {}
                    AddOutcome::DuplicateMaterial => tracing::warn!(
                        scheme = %scheme, name = %name,
                        "Skipping key with duplicate material in key store"
                    ),
                    AddOutcome::NameTaken => tracing::warn!(
                        scheme = %scheme, name = %name,
                        "Skipping key with duplicate name in key store"
                    ),
                }
            }
        }

        tracing::debug!(path = %path.display(), keys = store.len(), "Loaded key store");
        Ok(store)
    }

    /// Write the store back to its file
    ///
    /// Returns only after the data has been synced and renamed into place.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        self.updated_at = Some(Utc::now());
        let file = KeyStoreFile {
            version: STORE_FORMAT_VERSION,
            updated_at: self.updated_at,
            schemes: self
                .entries
                .iter()
                .map(|(scheme, keys)| {
                    let stored = keys
                        .iter()
                        .map(|key| StoredKey {
                            name: key.name().to_string(),
                            material: hex::encode(key.material()),
                        })
                        .collect();
                    (scheme.as_str().to_string(), stored)
                })
                .collect(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(&file)?;
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        tracing::debug!(path = %path.display(), keys = self.len(), "Saved key store");
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Keys of one scheme in insertion order
    pub fn keys(&self, scheme: KeyScheme) -> &[CandidateKey] {
        self.entries.get(&scheme).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of keys across all schemes
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schemes that currently hold at least one key
    pub fn schemes(&self) -> impl Iterator<Item = KeyScheme> + '_ {
        self.entries
            .iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(scheme, _)| *scheme)
    }

    /// Whether `material` is already stored for `scheme`, under any name
    pub fn contains_material(&self, scheme: KeyScheme, material: &[u8]) -> bool {
        self.keys(scheme).iter().any(|key| key.material() == material)
    }

    fn contains_name(&self, scheme: KeyScheme, name: &str) -> bool {
        self.keys(scheme).iter().any(|key| key.name() == name)
    }

    /// Append a key; duplicates by material or by name are refused
    pub fn add(&mut self, key: CandidateKey) -> AddOutcome {
        if self.contains_material(key.scheme(), key.material()) {
            return AddOutcome::DuplicateMaterial;
        }
        if self.contains_name(key.scheme(), key.name()) {
            return AddOutcome::NameTaken;
        }
        self.entries.entry(key.scheme()).or_default().push(key);
        AddOutcome::Added
    }

    /// Append a key found by discovery under a synthesized unique name
    ///
    /// Returns `None` if the same material is already stored.
    pub fn add_discovered(&mut self, scheme: KeyScheme, material: Vec<u8>) -> Option<CandidateKey> {
        if self.contains_material(scheme, &material) {
            return None;
        }

        let base = scheme.discovered_key_name();
        let mut name = base.to_string();
        let mut suffix = 2;
        while self.contains_name(scheme, &name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }

        let key = CandidateKey::new(scheme, name, material);
        self.entries.entry(scheme).or_default().push(key.clone());
        Some(key)
    }

    /// Remove a key by name; returns whether anything was removed
    pub fn remove(&mut self, scheme: KeyScheme, name: &str) -> bool {
        let Some(keys) = self.entries.get_mut(&scheme) else {
            return false;
        };
        let before = keys.len();
        keys.retain(|key| key.name() != name);
        before != keys.len()
    }
}
