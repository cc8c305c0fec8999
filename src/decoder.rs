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


//! Decoder selection
//!
//! A [`Decoder`] is chosen once per book by [`Decoder::detect`] and then asked
//! to decrypt the book with one key at a time. Every variant answers the same
//! three questions: which key schemes it accepts, whether it can succeed without
//! a key, and whether a given key unlocks the book.

use crate::error::{DeDrmError, DecodeError, DecodeResult, Result};
use crate::formats::epub::{self, EpubScheme};
use crate::formats::mobi::{self, KindleSecret, MobiBook};
use crate::formats::pdf::{self, PdfProtection};
use crate::formats::{ereader, BookFormat, DecryptedArtifact, Document};
use crate::keys::{CandidateKey, KeyScheme};
use std::fmt;

/// Per-call decoder settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Force the PDF output cross-reference form; `None` follows the source
    pub prefer_xref_stream: Option<bool>,
}

/// One decoder per protection scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    EpubAdept,
    EpubBarnesNoble,
    Pdf,
    Mobi,
    EReader,
}

impl Decoder {
    /// Inspect a book and pick its decoder
    ///
    /// # Errors
    /// - `NotEncrypted` if the book carries no protection we recognise
    /// - `UnsupportedProtection` for Topaz/KFX, Kindle rentals and foreign PDF handlers
    /// - `Decoder` if the container cannot be read at all
    pub fn detect(document: &Document) -> Result<Self> {
        let bytes = document.bytes();
        let decoder = match document.format() {
            BookFormat::Epub => match epub::detect(bytes) {
                Ok(EpubScheme::Adept) => Decoder::EpubAdept,
                Ok(EpubScheme::BarnesNoble) => Decoder::EpubBarnesNoble,
                Err(DecodeError::WrongScheme(_)) => {
                    return Err(DeDrmError::NotEncrypted(document.name().to_string()))
                }
                Err(e) => return Err(DeDrmError::Decoder(e)),
            },
            BookFormat::Pdf => match pdf::detect(bytes).map_err(DeDrmError::Decoder)? {
                PdfProtection::Adept => Decoder::Pdf,
                PdfProtection::Unencrypted => {
                    return Err(DeDrmError::NotEncrypted(document.name().to_string()))
                }
                PdfProtection::Other(filter) => {
                    return Err(DeDrmError::UnsupportedProtection(format!(
                        "PDF security handler {}",
                        filter
                    )))
                }
            },
            BookFormat::Mobi => {
                if mobi::is_topaz_or_kfx(bytes) {
                    return Err(DeDrmError::UnsupportedProtection(
                        "Topaz and KFX books".to_string(),
                    ));
                }
                let book = MobiBook::parse(bytes).map_err(DeDrmError::Decoder)?;
                if book.is_rental() {
                    return Err(DeDrmError::UnsupportedProtection(
                        "Kindle library loans and rentals".to_string(),
                    ));
                }
                Decoder::Mobi
            }
            BookFormat::EReader => {
                if !ereader::is_ereader(bytes) {
                    return Err(DeDrmError::Decoder(DecodeError::malformed(
                        "not an eReader PDB",
                    )));
                }
                Decoder::EReader
            }
        };

        tracing::debug!(book = %document.name(), decoder = %decoder, "Detected protection");
        Ok(decoder)
    }

    /// Key schemes this decoder accepts, in trial order
    pub fn schemes(&self) -> &'static [KeyScheme] {
        match self {
            Decoder::EpubAdept | Decoder::Pdf => &[KeyScheme::Adept],
            Decoder::EpubBarnesNoble => &[KeyScheme::BarnesNoble],
            Decoder::EReader => &[KeyScheme::EReader],
            Decoder::Mobi => &[
                KeyScheme::KindleDevice,
                KeyScheme::KindlePid,
                KeyScheme::KindleSerial,
            ],
        }
    }

    /// Scheme reported when every key fails
    pub fn primary_scheme(&self) -> KeyScheme {
        self.schemes()[0]
    }

    /// Attempt that needs no key at all
    ///
    /// Only Mobipocket books can succeed this way: unencrypted books and the
    /// fixed-key crypto type 1. Returns `None` for decoders that always need a key.
    pub fn try_keyless(&self, document: &Document) -> Option<DecodeResult<DecryptedArtifact>> {
        match self {
            Decoder::Mobi => Some(mobi::decrypt(document.bytes(), &[])),
            _ => None,
        }
    }

    /// Decrypt `document` with one key
    ///
    /// # Errors
    /// - `WrongScheme` if the key belongs to a scheme this decoder does not accept
    /// - `KeyRejected` / `MalformedContainer` if the key did not work
    pub fn try_decrypt(
        &self,
        document: &Document,
        key: &CandidateKey,
        options: &DecodeOptions,
    ) -> DecodeResult<DecryptedArtifact> {
        if !self.schemes().contains(&key.scheme()) {
            return Err(DecodeError::wrong_scheme(format!(
                "{} keys do not apply to {}",
                key.scheme(),
                self
            )));
        }

        let bytes = document.bytes();
        let material = key.material();
        match self {
            Decoder::EpubAdept => epub::decrypt_adept(bytes, material),
            Decoder::EpubBarnesNoble => epub::decrypt_barnes_noble(bytes, material),
            Decoder::Pdf => pdf::decrypt(bytes, material, options.prefer_xref_stream),
            Decoder::EReader => ereader::decrypt(bytes, document.stem(), material),
            Decoder::Mobi => {
                let secret = match key.scheme() {
                    KeyScheme::KindleDevice => KindleSecret::Device(material),
                    KeyScheme::KindleSerial => KindleSecret::Serial(material),
                    _ => KindleSecret::Pid(material),
                };
                mobi::decrypt(bytes, &[secret])
            }
        }
    }
}

impl fmt::Display for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Decoder::EpubAdept => "Adobe Adept EPUB",
            Decoder::EpubBarnesNoble => "Barnes & Noble EPUB",
            Decoder::Pdf => "Adobe Adept PDF",
            Decoder::Mobi => "Mobipocket",
            Decoder::EReader => "eReader PDB",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(format: BookFormat, bytes: &[u8]) -> Document {
        Document::from_bytes("book", format, bytes.to_vec())
    }

    #[test]
    fn test_schemes_per_decoder() {
        assert_eq!(Decoder::Pdf.schemes(), &[KeyScheme::Adept]);
        assert_eq!(Decoder::EpubBarnesNoble.primary_scheme(), KeyScheme::BarnesNoble);
        assert_eq!(Decoder::Mobi.schemes().len(), 3);
    }

    #[test]
    fn test_detect_topaz_is_unsupported() {
        let err = Decoder::detect(&doc(BookFormat::Mobi, b"TPZ0 rest of file")).unwrap_err();
        assert!(matches!(err, DeDrmError::UnsupportedProtection(_)));
    }

    #[test]
    fn test_detect_plain_pdf_is_not_encrypted() {
        let pdf = b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog >>\nendobj\ntrailer\n<< /Root 1 0 R >>\n%%EOF";
        let err = Decoder::detect(&doc(BookFormat::Pdf, pdf)).unwrap_err();
        assert!(matches!(err, DeDrmError::NotEncrypted(_)));
    }

    #[test]
    fn test_foreign_scheme_key_is_wrong_scheme() {
        let key = CandidateKey::new(KeyScheme::EReader, "k", vec![0; 8]);
        let err = Decoder::Pdf
            .try_decrypt(&doc(BookFormat::Pdf, b"%PDF-1.4"), &key, &DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(err, DecodeError::WrongScheme(_)));
    }

    #[test]
    fn test_only_mobi_has_keyless_attempt() {
        let book = doc(BookFormat::EReader, b"");
        assert!(Decoder::EReader.try_keyless(&book).is_none());
        assert!(Decoder::Mobi.try_keyless(&book).is_some());
    }
}
