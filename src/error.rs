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


//! Error types for dedrm-core
//!
//! Two layers of errors exist:
//!
//! - [`DecodeError`] is what a single decoder returns for a single key. It is a
//!   classification, not a crash: the key-trial loop inspects it to decide
//!   whether to try the next key, try another scheme, or give up.
//! - [`DeDrmError`] is the crate-wide error surfaced to callers. Only a handful
//!   of its variants ever escape a decryption attempt; the important one is
//!   [`DeDrmError::TerminalExhaustion`].
//!
//! ## Taxonomy
//!
//! | Situation                                   | Type                                   |
//! |---------------------------------------------|----------------------------------------|
//! | Manifest/header does not match the scheme   | `DecodeError::WrongScheme`             |
//! | Key did not unlock the content              | `DecodeError::KeyRejected`             |
//! | Archive/PDF/record stream structurally bad  | `DecodeError::MalformedContainer`      |
//! | Bug or impossible state inside a decoder    | `DecodeError::Internal`                |
//! | No harvester or no vendor application       | `DeDrmError::DiscoveryUnavailable`     |
//! | Every known and discovered key rejected     | `DeDrmError::TerminalExhaustion`       |

use crate::keys::KeyScheme;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our DeDrmError type
pub type Result<T> = std::result::Result<T, DeDrmError>;

/// Result type returned by per-format decoders
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Outcome classification of one decoder invocation with one key
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The container is not protected by the scheme this decoder handles
    #[error("Not protected by this scheme: {0}")]
    WrongScheme(String),

    /// The key did not unlock this content
    #[error("Key rejected: {0}")]
    KeyRejected(String),

    /// The archive, PDF or record stream is structurally invalid
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    /// Impossible state reached inside a decoder
    #[error("Internal decoder error: {0}")]
    Internal(String),
}

impl DecodeError {
    pub fn wrong_scheme<S: Into<String>>(message: S) -> Self {
        DecodeError::WrongScheme(message.into())
    }

    pub fn rejected<S: Into<String>>(message: S) -> Self {
        DecodeError::KeyRejected(message.into())
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        DecodeError::MalformedContainer(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        DecodeError::Internal(message.into())
    }

    /// The key did not work; the trial loop moves on to the next key.
    ///
    /// A malformed container counts as a key failure: garbage produced by a
    /// wrong key frequently looks like a broken archive, and one corrupt trial
    /// must never hide a key that would succeed.
    pub fn is_key_failure(&self) -> bool {
        matches!(
            self,
            DecodeError::KeyRejected(_) | DecodeError::MalformedContainer(_)
        )
    }

    /// Internal errors point at a decoder bug rather than a bad key or book
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Internal(_))
    }
}

impl From<zip::result::ZipError> for DecodeError {
    fn from(err: zip::result::ZipError) -> Self {
        DecodeError::MalformedContainer(format!("zip archive: {}", err))
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        DecodeError::MalformedContainer(format!("I/O: {}", err))
    }
}

/// Main error type for dedrm-core
#[derive(Error, Debug)]
pub enum DeDrmError {
    // ===== Key Store Errors =====

    /// Key material could not be parsed for its scheme
    #[error("Invalid key for scheme {scheme}: {message}")]
    InvalidKey { scheme: KeyScheme, message: String },

    /// Key store file exists but cannot be understood
    #[error("Corrupt key store {path}: {message}")]
    CorruptKeyStore { path: String, message: String },

    /// Unknown scheme name in a key store or on the command line
    #[error("Unknown key scheme: {0}")]
    UnknownScheme(String),

    // ===== Key Discovery Errors =====

    /// No key harvester applies on this platform, or the vendor application is missing
    #[error("Key discovery unavailable for {scheme}: {reason}")]
    DiscoveryUnavailable { scheme: KeyScheme, reason: String },

    /// External key harvester did not finish in time
    #[error("Key harvester timed out after {0} seconds")]
    HarvesterTimeout(u64),

    // ===== Decryption Errors =====

    /// All known and newly discovered keys were rejected
    #[error("Ultimately failed to decrypt {scheme} book after {:.1} seconds", elapsed.as_secs_f64())]
    TerminalExhaustion { scheme: KeyScheme, elapsed: Duration },

    /// The book carries no protection this crate recognises
    #[error("{0} is not protected by a supported DRM scheme (DRM free perhaps?)")]
    NotEncrypted(String),

    /// The book uses a protection scheme this crate does not remove
    #[error("Unsupported protection: {0}")]
    UnsupportedProtection(String),

    /// A decoder hit an internal error; this is a bug, not a bad key
    #[error("Decoder failure: {0}")]
    Decoder(DecodeError),

    // ===== File/Configuration Errors =====

    /// Input file does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Configuration file is invalid
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Invalid argument supplied by the caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ===== External Library Errors =====

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Zip archive error outside a key trial
    #[error("Zip archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),
}

impl From<DecodeError> for DeDrmError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::WrongScheme(message) => DeDrmError::NotEncrypted(message),
            other => DeDrmError::Decoder(other),
        }
    }
}

impl DeDrmError {
    /// Create an InvalidKey error
    pub fn invalid_key<S: Into<String>>(scheme: KeyScheme, message: S) -> Self {
        DeDrmError::InvalidKey {
            scheme,
            message: message.into(),
        }
    }

    /// Create a DiscoveryUnavailable error
    pub fn discovery_unavailable<S: Into<String>>(scheme: KeyScheme, reason: S) -> Self {
        DeDrmError::DiscoveryUnavailable {
            scheme,
            reason: reason.into(),
        }
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        DeDrmError::InvalidInput(message.into())
    }

    /// Check if error is related to DRM/crypto operations
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            DeDrmError::InvalidKey { .. }
                | DeDrmError::TerminalExhaustion { .. }
                | DeDrmError::UnsupportedProtection(_)
                | DeDrmError::Decoder(_)
        )
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            DeDrmError::FileNotFound(_)
                | DeDrmError::IoError(_)
                | DeDrmError::CorruptKeyStore { .. }
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            DeDrmError::TerminalExhaustion { .. } => format!(
                "{}. The book was left unmodified. Check that the key for this book is \
                 configured, and consult the troubleshooting FAQ for your e-book source.",
                self
            ),
            DeDrmError::NotEncrypted(name) => format!(
                "\"{}\" is neither Adobe Adept nor Barnes & Noble protected. It may already be DRM free.",
                name
            ),
            DeDrmError::DiscoveryUnavailable { scheme, .. } => format!(
                "No {} keys could be retrieved automatically on this system. Add a key manually.",
                scheme.display_name()
            ),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_failures_are_recoverable() {
        assert!(DecodeError::rejected("bad padding").is_key_failure());
        assert!(DecodeError::malformed("truncated").is_key_failure());
        assert!(!DecodeError::wrong_scheme("no rights.xml").is_key_failure());
        assert!(!DecodeError::internal("oops").is_key_failure());
    }

    #[test]
    fn test_only_internal_is_fatal() {
        assert!(DecodeError::internal("oops").is_fatal());
        assert!(!DecodeError::rejected("x").is_fatal());
        assert!(!DecodeError::malformed("x").is_fatal());
        assert!(!DecodeError::wrong_scheme("x").is_fatal());
    }

    #[test]
    fn test_terminal_exhaustion_message() {
        let err = DeDrmError::TerminalExhaustion {
            scheme: KeyScheme::Adept,
            elapsed: Duration::from_millis(2500),
        };
        let message = err.to_string();
        assert!(message.contains("Adobe Adept"));
        assert!(message.contains("2.5 seconds"));
        assert!(err.is_crypto_error());
        assert!(err.user_message().contains("left unmodified"));
    }

    #[test]
    fn test_wrong_scheme_converts_to_not_encrypted() {
        let err: DeDrmError = DecodeError::wrong_scheme("book.epub").into();
        assert!(matches!(err, DeDrmError::NotEncrypted(_)));
    }
}
