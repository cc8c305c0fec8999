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


//! Key-trial orchestration
//!
//! # Policy
//! 1. Try every stored key of the decoder's schemes, in store order
//! 2. If none works, ask the harvester once per scheme for fresh keys
//! 3. Try only keys whose material is not stored yet
//! 4. Persist the first fresh key that works, then return
//!
//! Discovery runs at most once per book. A failed trial, whatever the reason,
//! only moves on to the next key. Internal decoder errors are logged at
//! error level but do not stop the remaining keys.

use crate::decoder::{DecodeOptions, Decoder};
use crate::error::{DecodeError, DecodeResult};
use crate::error::{DeDrmError, Result};
use crate::formats::{BookFormat, DecryptedArtifact, Document};
use crate::keys::{CandidateKey, KeyHarvester, KeyScheme, KeyStore};
use std::path::Path;
use std::time::Instant;

/// Result of one decryption attempt
#[derive(Debug)]
pub enum DecryptOutcome {
    /// DRM removed
    Decrypted(DecryptedArtifact),
    /// Nothing to do; the book is returned to the caller untouched
    PassThrough(String),
}

impl DecryptOutcome {
    pub fn artifact(&self) -> Option<&DecryptedArtifact> {
        match self {
            DecryptOutcome::Decrypted(artifact) => Some(artifact),
            DecryptOutcome::PassThrough(_) => None,
        }
    }
}

/// Drives decoders over the key store and one discovery round
pub struct Orchestrator<'a> {
    store: &'a mut KeyStore,
    harvester: &'a dyn KeyHarvester,
    options: DecodeOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a mut KeyStore, harvester: &'a dyn KeyHarvester) -> Self {
        Self {
            store,
            harvester,
            options: DecodeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Decrypt the book at `path`
    ///
    /// Files with an extension we do not handle pass through.
    ///
    /// # Errors
    /// - `FileNotFound` if the path does not exist
    /// - `TerminalExhaustion` if no known or discovered key works
    pub fn decrypt_file(&mut self, path: &Path) -> Result<DecryptOutcome> {
        if BookFormat::from_path(path).is_none() {
            tracing::info!(path = %path.display(), "Not an e-book format we handle");
            return Ok(DecryptOutcome::PassThrough(format!(
                "{} has an unhandled extension",
                path.display()
            )));
        }
        let document = Document::open(path)?;
        self.decrypt(&document)
    }

    /// Decrypt an already loaded book
    pub fn decrypt(&mut self, document: &Document) -> Result<DecryptOutcome> {
        let started = Instant::now();

        let decoder = match Decoder::detect(document) {
            Ok(decoder) => decoder,
            Err(DeDrmError::NotEncrypted(name)) => {
                tracing::info!(book = %name, "Book is not protected, passing through");
                return Ok(DecryptOutcome::PassThrough(format!(
                    "{} is not protected",
                    name
                )));
            }
            Err(e) => return Err(e),
        };

        tracing::info!(book = %document.name(), decoder = %decoder, "Decrypting");

        if let Some(result) = decoder.try_keyless(document) {
            if let Some(artifact) = settle(result, "keyless") {
                tracing::info!(book = %document.name(), "Decrypted without a key");
                return Ok(DecryptOutcome::Decrypted(artifact));
            }
        }

        let known: Vec<CandidateKey> = decoder
            .schemes()
            .iter()
            .flat_map(|scheme| self.store.keys(*scheme).iter().cloned())
            .collect();
        for key in &known {
            if let Some(artifact) = self.trial(&decoder, document, key) {
                tracing::info!(
                    key = %key.masked_name(),
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Decrypted with stored key"
                );
                return Ok(DecryptOutcome::Decrypted(artifact));
            }
        }

        tracing::info!(
            decoder = %decoder,
            tried = known.len(),
            "No stored key worked, looking for new keys"
        );
        for (scheme, material) in self.discover(&decoder) {
            let key = CandidateKey::new(scheme, scheme.discovered_key_name(), material);
            if let Some(artifact) = self.trial(&decoder, document, &key) {
                if let Some(stored) = self.store.add_discovered(scheme, key.material().to_vec()) {
                    self.store.save()?;
                    tracing::info!(
                        %scheme,
                        key = %stored.masked_name(),
                        "Saved newly discovered key"
                    );
                }
                tracing::info!(
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Decrypted with discovered key"
                );
                return Ok(DecryptOutcome::Decrypted(artifact));
            }
        }

        let elapsed = started.elapsed();
        tracing::warn!(
            decoder = %decoder,
            elapsed_secs = elapsed.as_secs_f64(),
            "Ultimately failed to decrypt"
        );
        Err(DeDrmError::TerminalExhaustion {
            scheme: decoder.primary_scheme(),
            elapsed,
        })
    }

    /// One discovery round: fresh material not already stored, in harvest order
    fn discover(&self, decoder: &Decoder) -> Vec<(KeyScheme, Vec<u8>)> {
        let mut fresh: Vec<(KeyScheme, Vec<u8>)> = Vec::new();
        for &scheme in decoder.schemes() {
            let found = match self.harvester.harvest(scheme) {
                Ok(found) => found,
                Err(e) => {
                    tracing::info!(%scheme, reason = %e, "No keys discovered");
                    continue;
                }
            };
            for material in found {
                let seen = fresh.iter().any(|(s, m)| *s == scheme && *m == material);
                if material.is_empty() || seen || self.store.contains_material(scheme, &material) {
                    continue;
                }
                fresh.push((scheme, material));
            }
        }
        tracing::debug!(count = fresh.len(), "Fresh keys to try");
        fresh
    }

    fn trial(
        &self,
        decoder: &Decoder,
        document: &Document,
        key: &CandidateKey,
    ) -> Option<DecryptedArtifact> {
        settle(
            decoder.try_decrypt(document, key, &self.options),
            &key.masked_name(),
        )
    }
}

/// Turn one attempt into an artifact or a logged miss
fn settle(
    result: DecodeResult<DecryptedArtifact>,
    key: &str,
) -> Option<DecryptedArtifact> {
    match result {
        Ok(artifact) => Some(artifact),
        Err(e) if e.is_fatal() => {
            tracing::error!(key, error = %e, "Decoder failed internally, trying next key");
            None
        }
        Err(e) => {
            tracing::debug!(key, error = %e, "Key did not work");
            None
        }
    }
}
