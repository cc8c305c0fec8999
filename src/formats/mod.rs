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


//! E-book container formats
//!
//! Each submodule owns one container family: detection of its protection
//! scheme and a decoder that turns one protected document plus one key into
//! a [`DecryptedArtifact`]. Decoders share no state; every call starts from
//! the read-only [`Document`].
//!
//! | Extension                                  | Family                     |
//! |--------------------------------------------|----------------------------|
//! | `epub`                                     | EPUB (Adept, B&N)          |
//! | `pdf`                                      | PDF (Adept `EBX_HANDLER`)  |
//! | `prc` `mobi` `pobi` `azw*` `tpz` `kfx*`    | Mobipocket / Kindle        |
//! | `pdb`                                      | eReader                    |

pub mod epub;
pub mod ereader;
pub mod mobi;
pub mod pdb;
pub mod pdf;

use crate::error::{DeDrmError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Container family, chosen from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookFormat {
    Epub,
    Pdf,
    Mobi,
    EReader,
}

impl BookFormat {
    /// Map a file extension (without dot, any case) to a family
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            "pdf" => Some(BookFormat::Pdf),
            "pdb" => Some(BookFormat::EReader),
            "prc" | "mobi" | "pobi" | "azw" | "azw1" | "azw3" | "azw4" | "azw8" | "tpz"
            | "kfx" | "kfx-zip" => Some(BookFormat::Mobi),
            _ => None,
        }
    }

    /// `None` means the file is passed through untouched
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        // "kfx-zip" is one extension for our purposes
        if name.ends_with(".kfx-zip") {
            return Some(BookFormat::Mobi);
        }
        Self::from_extension(path.extension()?.to_str()?)
    }
}

impl fmt::Display for BookFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookFormat::Epub => "EPUB",
            BookFormat::Pdf => "PDF",
            BookFormat::Mobi => "Mobipocket",
            BookFormat::EReader => "eReader",
        })
    }
}

/// A protected book, loaded once and shared read-only by every key trial
#[derive(Debug, Clone)]
pub struct Document {
    name: String,
    path: Option<PathBuf>,
    format: BookFormat,
    bytes: Vec<u8>,
}

impl Document {
    /// Read a book from disk
    ///
    /// # Errors
    /// - FileNotFound if the path does not exist
    /// - InvalidInput if the extension is not a supported e-book format
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DeDrmError::FileNotFound(path.display().to_string()));
        }
        let format = BookFormat::from_path(path).ok_or_else(|| {
            DeDrmError::invalid_input(format!("{} is not a known e-book type", path.display()))
        })?;
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            path: Some(path.to_path_buf()),
            format,
            bytes,
        })
    }

    /// Wrap bytes that are already in memory
    pub fn from_bytes<S: Into<String>>(name: S, format: BookFormat, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            path: None,
            format,
            bytes,
        }
    }

    /// File name, for messages
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format(&self) -> BookFormat {
        self.format
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// File name without its extension
    pub fn stem(&self) -> &str {
        match self.name.rfind('.') {
            Some(0) | None => &self.name,
            Some(pos) => &self.name[..pos],
        }
    }
}

/// DRM-free output of a successful decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedArtifact {
    bytes: Vec<u8>,
    extension: String,
}

impl DecryptedArtifact {
    /// # Arguments
    /// * `extension` - Output extension without the dot, e.g. `epub`, `azw3`, `pmlz`
    pub fn new<S: Into<String>>(bytes: Vec<u8>, extension: S) -> Self {
        Self {
            bytes,
            extension: extension.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Write the artifact next to `input` (or to `output` if given) and return the path
    pub fn write(&self, input: &Path, output: Option<&Path>) -> Result<PathBuf> {
        let target = match output {
            Some(path) => path.to_path_buf(),
            None => {
                let stem = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "book".to_string());
                input.with_file_name(format!("{}_nodrm.{}", stem, self.extension))
            }
        };
        std::fs::write(&target, &self.bytes)?;
        Ok(target)
    }
}
