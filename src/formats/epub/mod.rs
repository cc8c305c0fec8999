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


//! EPUB decryption (Adobe Adept and Barnes & Noble)
//!
//! # Format Details
//! Both schemes use the same container layout:
//! - `META-INF/rights.xml` carries the book key, base64 encoded in `encryptedKey`
//!   - 172 characters: 1024-bit RSA block (Adept)
//!   - 64 characters: AES-encrypted 48 bytes (Barnes & Noble)
//! - `META-INF/encryption.xml` lists the encrypted members
//! - Each encrypted member is `IV (16) || AES-128-CBC(deflate(content) || padding)`
//!
//! # Book Key
//! - **Adept**: RSA PKCS#1 v1.5 decrypt with the user's private key
//! - **B&N**: AES-128-CBC decrypt (zero IV) with the first 16 bytes of the user
//!   key, drop padding, keep the last 16 bytes
//!
//! # Output
//! `mimetype` first and stored, every member not listed in the manifest copied
//! raw (compressed bytes, timestamps and extra fields untouched), decrypted
//! members deflated again under their original names. `rights.xml` is dropped;
//! `encryption.xml` is dropped or reduced to the entries we did not decrypt.
//!
//! # Damaged Archives
//! An unreadable zip directory, or a member the directory points at wrongly,
//! sends us through [`repair::salvage`] once before giving up.

pub mod manifest;
pub mod repair;

use crate::crypto::{aes128_cbc_decrypt, load_adept_key, strip_padding, unwrap_book_key};
use crate::error::{DecodeError, DecodeResult};
use crate::formats::DecryptedArtifact;
use base64::Engine;
use flate2::read::DeflateDecoder;
use manifest::{rights_encrypted_key, strip_supported_entries, EncryptionManifest};
use std::borrow::Cow;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const RIGHTS_PATH: &str = "META-INF/rights.xml";
pub const ENCRYPTION_PATH: &str = "META-INF/encryption.xml";
const MIMETYPE_PATH: &str = "mimetype";

const ADEPT_KEY_LEN: usize = 172;
const BN_KEY_LEN: usize = 64;

/// Protection scheme found in an EPUB's rights file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpubScheme {
    Adept,
    BarnesNoble,
}

type Archive<'a> = ZipArchive<Cursor<Cow<'a, [u8]>>>;

fn repaired_archive<'a>(bytes: &[u8]) -> DecodeResult<Archive<'a>> {
    Ok(ZipArchive::new(Cursor::new(Cow::Owned(repair::salvage(bytes)?)))?)
}

/// Open the archive, rebuilding it from local headers if the directory is unreadable
///
/// The flag is true for a rebuilt archive.
fn open_archive(bytes: &[u8]) -> DecodeResult<(Archive<'_>, bool)> {
    match ZipArchive::new(Cursor::new(Cow::Borrowed(bytes))) {
        Ok(archive) => Ok((archive, false)),
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable zip directory, rebuilding from local headers");
            Ok((repaired_archive(bytes)?, true))
        }
    }
}

fn read_member(archive: &mut Archive<'_>, name: &str) -> DecodeResult<Option<Vec<u8>>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(Some(data))
}

/// Book key from rights.xml with whitespace removed
fn rights_key(archive: &mut Archive<'_>) -> DecodeResult<Option<String>> {
    if archive.index_for_name(ENCRYPTION_PATH).is_none() {
        return Ok(None);
    }
    let Some(rights) = read_member(archive, RIGHTS_PATH)? else {
        return Ok(None);
    };
    Ok(rights_encrypted_key(&rights)?
        .map(|key| key.chars().filter(|c| !c.is_whitespace()).collect()))
}

/// Classify the EPUB's protection
///
/// # Errors
/// - WrongScheme if neither scheme's rights file is present
pub fn detect(bytes: &[u8]) -> DecodeResult<EpubScheme> {
    let (mut archive, _) = open_archive(bytes)?;
    match rights_key(&mut archive) {
        Ok(Some(key)) if key.len() == BN_KEY_LEN => Ok(EpubScheme::BarnesNoble),
        Ok(Some(key)) if key.len() == ADEPT_KEY_LEN => Ok(EpubScheme::Adept),
        Ok(_) => Err(DecodeError::wrong_scheme("no Adept or Barnes & Noble rights")),
        // A rights file we cannot read is most likely Adept
        Err(_) => Ok(EpubScheme::Adept),
    }
}

fn rights_key_bytes(archive: &mut Archive<'_>, scheme: EpubScheme) -> DecodeResult<Vec<u8>> {
    let expected = match scheme {
        EpubScheme::Adept => ADEPT_KEY_LEN,
        EpubScheme::BarnesNoble => BN_KEY_LEN,
    };
    let key = rights_key(archive)?
        .filter(|key| key.len() == expected)
        .ok_or_else(|| DecodeError::wrong_scheme(format!("not a {:?} EPUB", scheme)))?;
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|e| DecodeError::malformed(format!("rights.xml encryptedKey: {}", e)))
}

/// Unlock the content key with `content_key`, then rebuild the book
///
/// A container error while copying members gets one retry on a salvaged archive.
fn decrypt_with<F>(bytes: &[u8], content_key: F) -> DecodeResult<DecryptedArtifact>
where
    F: Fn(&mut Archive<'_>) -> DecodeResult<Vec<u8>>,
{
    let (mut archive, repaired) = open_archive(bytes)?;
    let key = content_key(&mut archive)?;
    match rebuild(&mut archive, &key) {
        Err(DecodeError::MalformedContainer(reason)) if !repaired => {
            tracing::warn!(%reason, "Damaged EPUB member, rebuilding from local headers");
            rebuild(&mut repaired_archive(bytes)?, &key)
        }
        result => result,
    }
}

/// Decrypt an Adept EPUB with a DER-encoded RSA user key
pub fn decrypt_adept(bytes: &[u8], user_key: &[u8]) -> DecodeResult<DecryptedArtifact> {
    decrypt_with(bytes, |archive| {
        let wrapped = rights_key_bytes(archive, EpubScheme::Adept)?;

        let rsa = load_adept_key(user_key)?;
        let mut book_key = unwrap_book_key(&rsa, &wrapped)?;
        if book_key.len() > 16 {
            // Leading garbage before a zero separator, as some older wrappers produce
            if book_key[book_key.len() - 17] != 0 {
                return Err(DecodeError::rejected("unwrapped book key has unexpected length"));
            }
            book_key = book_key.split_off(book_key.len() - 16);
        }
        if book_key.len() != 16 {
            return Err(DecodeError::rejected("unwrapped book key has unexpected length"));
        }
        Ok(book_key)
    })
}

/// Decrypt a Barnes & Noble EPUB with a 20-byte user key
pub fn decrypt_barnes_noble(bytes: &[u8], user_key: &[u8]) -> DecodeResult<DecryptedArtifact> {
    decrypt_with(bytes, |archive| {
        let encrypted = rights_key_bytes(archive, EpubScheme::BarnesNoble)?;

        if user_key.len() < 16 {
            return Err(DecodeError::rejected("Barnes & Noble key shorter than 16 bytes"));
        }
        let mut book_key = aes128_cbc_decrypt(&user_key[..16], &[0u8; 16], &encrypted)?;
        strip_padding(&mut book_key)?;
        if book_key.len() < 16 {
            return Err(DecodeError::rejected("book key too short"));
        }
        Ok(book_key.split_off(book_key.len() - 16))
    })
}

/// Decrypt one member: IV prefix, AES-CBC, padding, optional raw inflate
pub fn decrypt_member(key: &[u8], data: &[u8], compressed: bool) -> DecodeResult<Vec<u8>> {
    if data.len() < 32 {
        return Err(DecodeError::malformed("encrypted member shorter than two blocks"));
    }
    let (iv, body) = data.split_at(16);
    let mut plain = aes128_cbc_decrypt(key, iv, body)?;
    strip_padding(&mut plain)?;
    if !compressed {
        return Ok(plain);
    }

    let mut inflated = Vec::with_capacity(plain.len() * 2);
    DeflateDecoder::new(plain.as_slice())
        .read_to_end(&mut inflated)
        .map_err(|e| DecodeError::rejected(format!("decrypted member does not inflate: {}", e)))?;
    Ok(inflated)
}

fn rebuild(archive: &mut Archive<'_>, content_key: &[u8]) -> DecodeResult<DecryptedArtifact> {
    let encryption = read_member(archive, ENCRYPTION_PATH)?
        .ok_or_else(|| DecodeError::wrong_scheme("no encryption.xml"))?;
    let manifest = EncryptionManifest::parse(&encryption)?;
    if !manifest.has_supported_entries() {
        return Err(DecodeError::wrong_scheme("encryption.xml lists no AES entries"));
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    // mimetype goes first and uncompressed
    if let Some(index) = archive.index_for_name(MIMETYPE_PATH) {
        let is_stored = archive.by_index_raw(index)?.compression() == CompressionMethod::Stored;
        if is_stored {
            writer.raw_copy_file(archive.by_index_raw(index)?)?;
        } else if let Some(data) = read_member(archive, MIMETYPE_PATH)? {
            writer.start_file(MIMETYPE_PATH, stored)?;
            writer.write_all(&data)?;
        }
    }

    let mut decrypted = 0usize;
    for index in 0..archive.len() {
        let name = archive.by_index_raw(index)?.name().to_string();
        if name == MIMETYPE_PATH || name == RIGHTS_PATH {
            continue;
        }

        if name == ENCRYPTION_PATH {
            if manifest.has_other_entries() {
                writer.start_file(ENCRYPTION_PATH, deflated)?;
                writer.write_all(&strip_supported_entries(&encryption)?)?;
            }
            continue;
        }

        match manifest.supported_entry(&name) {
            Some(entry) => {
                let data = read_member(archive, &name)?.unwrap_or_default();
                let plain = decrypt_member(content_key, &data, entry.compressed)?;
                writer.start_file(name.as_str(), deflated)?;
                writer.write_all(&plain)?;
                decrypted += 1;
            }
            None => writer.raw_copy_file(archive.by_index_raw(index)?)?,
        }
    }

    let listed = manifest
        .entries()
        .iter()
        .filter(|e| e.algorithm == manifest::AES128_CBC)
        .count();
    if decrypted < listed {
        tracing::debug!(listed, decrypted, "Manifest lists members missing from the archive");
    }

    let bytes = writer.finish()?.into_inner();
    Ok(DecryptedArtifact::new(bytes, "epub"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes128_cbc_encrypt;

    fn pad(mut data: Vec<u8>) -> Vec<u8> {
        let n = 16 - data.len() % 16;
        data.extend(std::iter::repeat(n as u8).take(n));
        data
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn encrypt_member(key: &[u8], plain: &[u8], compress: bool) -> Vec<u8> {
        let iv = [3u8; 16];
        let body = if compress { deflate(plain) } else { plain.to_vec() };
        let mut out = iv.to_vec();
        out.extend(aes128_cbc_encrypt(key, &iv, &pad(body)).unwrap());
        out
    }

    #[test]
    fn test_decrypt_member_round_trip() {
        let key = [0x11u8; 16];
        let plain = b"<html><body>Hello</body></html>";
        let data = encrypt_member(&key, plain, true);
        assert_eq!(decrypt_member(&key, &data, true).unwrap(), plain);

        let data = encrypt_member(&key, plain, false);
        assert_eq!(decrypt_member(&key, &data, false).unwrap(), plain);
    }

    #[test]
    fn test_decrypt_member_with_wrong_key_is_key_failure() {
        let data = encrypt_member(&[0x11; 16], b"some chapter text that deflates", true);
        let err = decrypt_member(&[0x22; 16], &data, true).unwrap_err();
        assert!(err.is_key_failure(), "{:?}", err);
    }

    #[test]
    fn test_detect_without_rights_is_wrong_scheme() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("mimetype", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"application/epub+zip").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert!(matches!(detect(&bytes), Err(DecodeError::WrongScheme(_))));
    }

    #[test]
    fn test_not_a_zip_is_malformed() {
        assert!(matches!(
            detect(b"definitely not a zip"),
            Err(DecodeError::MalformedContainer(_))
        ));
    }
}
