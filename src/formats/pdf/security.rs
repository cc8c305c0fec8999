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


//! Adobe Adept security handler (`/Filter /EBX_HANDLER`)
//!
//! # Key Derivation
//! ```text
//! license   = inflate_raw(base64(/ADEPT_LICENSE))      (XML)
//! book key  = RSA-PKCS1v15-decrypt(user key, base64(<encryptedKey>))
//! V2 key    = MD5(book key || id[0..3] LE || gen[0..2] LE)
//! V3 key    = MD5(book key || o0 g0 o1 g1 o2 || "sAlT")
//!             where o = (id ^ 0x3569AC) LE, g = (gen ^ 0xCA96) LE
//! AESV2 key = MD5(book key || id[0..3] || gen[0..2] || "sAlT")
//! object key is truncated to min(len(book key) + 5, 16) bytes
//! ```
//! A book key one byte longer than `/Length / 8` carries the revision in its
//! first byte.

use super::object::{Dictionary, Object};
use crate::crypto::{aes128_cbc_decrypt, load_adept_key, unwrap_book_key, Rc4};
use crate::error::{DecodeError, DecodeResult};
use crate::formats::epub::manifest::rights_encrypted_key;
use base64::Engine;
use flate2::read::DeflateDecoder;
use md5::{Digest, Md5};
use std::io::Read;

pub const ADEPT_FILTER: &[u8] = b"EBX_HANDLER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRevision {
    V2,
    V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectCipher {
    Rc4,
    Aes,
}

#[derive(Clone)]
pub struct Security {
    book_key: Vec<u8>,
    revision: KeyRevision,
    cipher: ObjectCipher,
    encrypt_metadata: bool,
}

impl std::fmt::Debug for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Security")
            .field("revision", &self.revision)
            .field("cipher", &self.cipher)
            .field("encrypt_metadata", &self.encrypt_metadata)
            .finish_non_exhaustive()
    }
}

fn b64(text: &[u8]) -> DecodeResult<Vec<u8>> {
    let cleaned: Vec<u8> = text.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .map_err(|e| DecodeError::malformed(format!("PDF: bad base64 in license: {}", e)))
}

/// Crypt filter method named by `/CF /StdCF /CFM`, if any
fn crypt_filter_method(encrypt: &Dictionary) -> Option<&[u8]> {
    let filter_name = encrypt.get_name(b"StmF").unwrap_or(b"StdCF");
    encrypt
        .get(b"CF")
        .and_then(Object::as_dict)
        .and_then(|cf| cf.get(filter_name))
        .and_then(Object::as_dict)
        .and_then(|f| f.get_name(b"CFM"))
}

impl Security {
    /// Unlock the document key from the encryption dictionary
    ///
    /// # Arguments
    /// * `encrypt` - The trailer's `/Encrypt` dictionary
    /// * `user_key` - DER-encoded RSA private key
    ///
    /// # Errors
    /// - WrongScheme if the handler is not Adept
    /// - KeyRejected if the RSA key does not unwrap the book key
    pub fn adept(encrypt: &Dictionary, user_key: &[u8]) -> DecodeResult<Self> {
        if encrypt.get_name(b"Filter") != Some(ADEPT_FILTER) {
            return Err(DecodeError::wrong_scheme("PDF is not Adept protected"));
        }
        let license = encrypt
            .get(b"ADEPT_LICENSE")
            .and_then(Object::as_string)
            .ok_or_else(|| DecodeError::malformed("PDF: no ADEPT_LICENSE"))?;

        let mut xml = Vec::new();
        DeflateDecoder::new(b64(license)?.as_slice())
            .read_to_end(&mut xml)
            .map_err(|e| DecodeError::malformed(format!("PDF: license does not inflate: {}", e)))?;
        let wrapped = rights_encrypted_key(&xml)?
            .ok_or_else(|| DecodeError::malformed("PDF: license has no encryptedKey"))?;

        let rsa = load_adept_key(user_key)?;
        let mut book_key = unwrap_book_key(&rsa, &b64(wrapped.as_bytes())?)?;

        let length = encrypt.get_int(b"Length").unwrap_or(0).max(0) as usize / 8;
        let ebx_v = encrypt.get_int(b"V").unwrap_or(4);
        let mut revision = if ebx_v == 3 { KeyRevision::V3 } else { KeyRevision::V2 };
        if length > 0 {
            if book_key.len() == length + 1 {
                revision = if book_key[0] == 3 { KeyRevision::V3 } else { KeyRevision::V2 };
                book_key.remove(0);
            } else if book_key.len() != length {
                return Err(DecodeError::rejected(format!(
                    "book key is {} bytes, expected {}",
                    book_key.len(),
                    length
                )));
            }
        }
        if book_key.is_empty() {
            return Err(DecodeError::rejected("empty book key"));
        }

        let cipher = match crypt_filter_method(encrypt) {
            Some(b"AESV2") => ObjectCipher::Aes,
            _ => ObjectCipher::Rc4,
        };
        let encrypt_metadata = !matches!(encrypt.get(b"EncryptMetadata"), Some(Object::Bool(false)));

        tracing::debug!(?revision, ?cipher, key_len = book_key.len(), "Adept PDF key unlocked");
        Ok(Self {
            book_key,
            revision,
            cipher,
            encrypt_metadata,
        })
    }

    pub fn encrypts_metadata(&self) -> bool {
        self.encrypt_metadata
    }

    /// Per-object key
    pub fn object_key(&self, id: u32, gen: u16) -> Vec<u8> {
        let mut hasher = Md5::new();
        hasher.update(&self.book_key);
        match (self.revision, self.cipher) {
            (KeyRevision::V3, _) => {
                let o = (id ^ 0x3569ac).to_le_bytes();
                let g = (u32::from(gen) ^ 0xca96).to_le_bytes();
                hasher.update([o[0], g[0], o[1], g[1], o[2]]);
                hasher.update(b"sAlT");
            }
            (KeyRevision::V2, cipher) => {
                hasher.update(&id.to_le_bytes()[..3]);
                hasher.update(gen.to_le_bytes());
                if cipher == ObjectCipher::Aes {
                    hasher.update(b"sAlT");
                }
            }
        }
        let digest = hasher.finalize();
        let len = (self.book_key.len() + 5).min(16);
        digest[..len].to_vec()
    }

    /// Decrypt one string or stream body of object `id gen`
    pub fn decrypt(&self, id: u32, gen: u16, data: &[u8]) -> DecodeResult<Vec<u8>> {
        let key = self.object_key(id, gen);
        match self.cipher {
            ObjectCipher::Rc4 => Ok(Rc4::process(&key, data)),
            ObjectCipher::Aes => {
                if data.len() < 16 {
                    return Ok(Vec::new());
                }
                let (iv, body) = data.split_at(16);
                if body.is_empty() {
                    return Ok(Vec::new());
                }
                let mut plain = aes128_cbc_decrypt(&key, iv, body)?;
                // Lenient about padding, as readers are
                if let Some(&pad) = plain.last() {
                    if (1..=16).contains(&pad) && usize::from(pad) <= plain.len() {
                        plain.truncate(plain.len() - usize::from(pad));
                    }
                }
                Ok(plain)
            }
        }
    }
}
