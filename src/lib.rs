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


//! E-book DRM removal engine
//!
//! Removes Adobe Adept (EPUB, PDF), Barnes & Noble (EPUB), Mobipocket/Kindle
//! and eReader protection when a valid key is known or can be discovered.
//!
//! ```no_run
//! use dedrm_core::{Config, Session, DecryptOutcome};
//! use std::path::Path;
//!
//! # fn main() -> dedrm_core::Result<()> {
//! let mut session = Session::initialize(Config::from_env()?)?;
//! let book = Path::new("book.epub");
//! if let DecryptOutcome::Decrypted(artifact) = session.decrypt_file(book)? {
//!     artifact.write(book, None)?;
//! }
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod config;
pub mod crypto;
pub mod decoder;
pub mod error;
pub mod formats;
pub mod keys;
pub mod logging;
pub mod orchestrator;
pub mod session;

// Re-export commonly used types for convenience
pub use config::Config;
pub use decoder::{DecodeOptions, Decoder};
pub use error::{DeDrmError, DecodeError, DecodeResult, Result};
pub use formats::{BookFormat, DecryptedArtifact, Document};
pub use keys::{CandidateKey, KeyHarvester, KeyScheme, KeyStore};
pub use orchestrator::{DecryptOutcome, Orchestrator};
pub use session::Session;
