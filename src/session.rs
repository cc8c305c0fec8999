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


//! Explicit engine setup
//!
//! # Directory Layout
//! ```text
//! <config_dir>/
//!   dedrm.json        configuration
//!   keys.json         key store
//!   helpers/          external key helper programs
//!   <version>/        marker: this version's setup has run
//! ```
//!
//! Setup for a new version runs once: it creates the helper directory and
//! rewrites the key store in the current file format. Everything the engine
//! needs afterwards hangs off the returned [`Session`].

use crate::config::Config;
use crate::decoder::DecodeOptions;
use crate::error::Result;
use crate::keys::{HarvesterSet, KeyStore};
use crate::orchestrator::{DecryptOutcome, Orchestrator};
use std::fs;
use std::path::{Path, PathBuf};

pub const HELPERS_DIR: &str = "helpers";

/// Loaded configuration, key store and harvesters
#[derive(Debug)]
pub struct Session {
    config: Config,
    store: KeyStore,
    harvesters: HarvesterSet,
}

impl Session {
    /// Prepare the configuration directory and load the key store
    ///
    /// # Errors
    /// - `IoError` if the directories cannot be created
    /// - `CorruptKeyStore` if the key store file cannot be read
    pub fn initialize(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.config_dir)?;

        let mut store = KeyStore::load(&config.key_store_path())?;

        let marker = version_marker(&config.config_dir);
        if !marker.exists() {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                dir = %config.config_dir.display(),
                "First run of this version, running setup"
            );
            fs::create_dir_all(config.config_dir.join(HELPERS_DIR))?;
            if !store.is_empty() {
                store.save()?;
            }
            fs::create_dir_all(&marker)?;
        }

        tracing::debug!(keys = store.len(), "Session ready");
        let harvesters = config.harvester_set();
        Ok(Self {
            config,
            store,
            harvesters,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.store
    }

    pub fn key_store_mut(&mut self) -> &mut KeyStore {
        &mut self.store
    }

    pub fn helpers_dir(&self) -> PathBuf {
        self.config.config_dir.join(HELPERS_DIR)
    }

    /// Orchestrator over this session's keys and configured harvesters
    pub fn orchestrator(&mut self) -> Orchestrator<'_> {
        let options = DecodeOptions {
            prefer_xref_stream: self.config.prefer_xref_stream,
        };
        Orchestrator::new(&mut self.store, &self.harvesters).with_options(options)
    }

    /// Decrypt one book file
    pub fn decrypt_file(&mut self, path: &Path) -> Result<DecryptOutcome> {
        self.orchestrator().decrypt_file(path)
    }
}

fn version_marker(config_dir: &Path) -> PathBuf {
    config_dir.join(env!("CARGO_PKG_VERSION"))
}
