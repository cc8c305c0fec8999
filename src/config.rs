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


//! Engine configuration
//!
//! # File Format
//! `dedrm.json` in the configuration directory. Every field is optional:
//!
//! ```json
//! {
//!   "key_store_file": "keys.json",
//!   "harvest_timeout_secs": 120,
//!   "prefer_xref_stream": null,
//!   "harvesters": {
//!     "kindle_device": { "program": "wine", "args": ["python.exe", "kindlekey.py", "{output_dir}"] }
//!   }
//! }
//! ```
//!
//! The directory itself comes from the caller, or from `DEDRM_CONFIG_DIR`.

use crate::error::{DeDrmError, Result};
use crate::keys::harvest::DEFAULT_HARVEST_TIMEOUT_SECS;
use crate::keys::{CommandHarvester, HarvesterSet, KeyScheme};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "dedrm.json";
pub const CONFIG_DIR_ENV: &str = "DEDRM_CONFIG_DIR";
pub const DEFAULT_KEY_STORE_FILE: &str = "keys.json";

/// External key helper for one scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvesterConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Key file extension, when the helper does not use the scheme's usual one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_extension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the file was loaded from; not stored in the file
    #[serde(skip)]
    pub config_dir: PathBuf,
    /// Key store path, relative to `config_dir` unless absolute
    pub key_store_file: PathBuf,
    pub harvest_timeout_secs: u64,
    /// Override of the PDF output cross-reference form
    pub prefer_xref_stream: Option<bool>,
    pub harvesters: BTreeMap<KeyScheme, HarvesterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("."),
            key_store_file: PathBuf::from(DEFAULT_KEY_STORE_FILE),
            harvest_timeout_secs: DEFAULT_HARVEST_TIMEOUT_SECS,
            prefer_xref_stream: None,
            harvesters: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load `dedrm.json` from `dir`, or defaults if it does not exist
    ///
    /// # Errors
    /// - `ConfigurationError` if the file is unreadable JSON or fails validation
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let raw = fs::read(&path)?;
            serde_json::from_slice::<Config>(&raw).map_err(|e| {
                DeDrmError::ConfigurationError(format!("{}: {}", path.display(), e))
            })?
        } else {
            tracing::debug!(path = %path.display(), "No configuration file, using defaults");
            Config::default()
        };
        config.config_dir = dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Load from `DEDRM_CONFIG_DIR`, falling back to `~/.config/dedrm`
    pub fn from_env() -> Result<Self> {
        Self::load(&default_config_dir())
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.config_dir)?;
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(self.config_dir.join(CONFIG_FILE_NAME), json)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.harvest_timeout_secs == 0 {
            return Err(DeDrmError::ConfigurationError(
                "harvest_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.key_store_file.as_os_str().is_empty() {
            return Err(DeDrmError::ConfigurationError(
                "key_store_file must not be empty".to_string(),
            ));
        }
        if let Some((scheme, _)) = self
            .harvesters
            .iter()
            .find(|(_, h)| h.program.as_os_str().is_empty())
        {
            return Err(DeDrmError::ConfigurationError(format!(
                "harvester for {} has no program",
                scheme
            )));
        }
        Ok(())
    }

    pub fn key_store_path(&self) -> PathBuf {
        self.config_dir.join(&self.key_store_file)
    }

    pub fn harvest_timeout(&self) -> Duration {
        Duration::from_secs(self.harvest_timeout_secs)
    }

    /// Command harvesters for every configured scheme
    pub fn harvester_set(&self) -> HarvesterSet {
        let mut set = HarvesterSet::new();
        for (scheme, entry) in &self.harvesters {
            let mut harvester = CommandHarvester::new(&entry.program, entry.args.clone())
                .with_timeout(self.harvest_timeout());
            if let Some(extension) = &entry.output_extension {
                harvester = harvester.with_output_extension(extension.clone());
            }
            set.insert(*scheme, harvester);
        }
        set
    }
}

/// `DEDRM_CONFIG_DIR`, else `$HOME/.config/dedrm`, else `./.dedrm`
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("dedrm"),
        None => PathBuf::from(".dedrm"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.harvest_timeout_secs, DEFAULT_HARVEST_TIMEOUT_SECS);
        assert_eq!(config.key_store_path(), dir.path().join("keys.json"));
        assert!(config.harvester_set().is_empty());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "prefer_xref_stream": false,
                 "harvesters": { "adept": { "program": "/usr/bin/adobekey" } } }"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.prefer_xref_stream, Some(false));
        assert_eq!(config.key_store_file, PathBuf::from(DEFAULT_KEY_STORE_FILE));
        assert_eq!(
            config.harvesters[&KeyScheme::Adept].program,
            PathBuf::from("/usr/bin/adobekey")
        );
        assert!(!config.harvester_set().is_empty());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "harvest_timeout_secs": 0 }"#,
        )
        .unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(DeDrmError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::load(dir.path()).unwrap();
        config.harvest_timeout_secs = 30;
        config.save().unwrap();
        assert_eq!(Config::load(dir.path()).unwrap().harvest_timeout_secs, 30);
    }
}
