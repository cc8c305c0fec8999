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


//! Adobe Adept book key unwrapping
//!
//! The user key exported from Adobe Digital Editions is an RSA private key in
//! DER form (PKCS#1 `RSAPrivateKey`; PKCS#8 is accepted as well). Book keys in
//! `rights.xml` and in PDF `ADEPT_LICENSE` blobs are wrapped with the matching
//! public key using PKCS#1 v1.5 padding.

use crate::error::{DecodeError, DecodeResult};
use pkcs8::DecodePrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

/// Parse Adept key material into an RSA private key
///
/// # Errors
/// - KeyRejected if the material is not an RSA private key in DER form
pub fn load_adept_key(der: &[u8]) -> DecodeResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_der(der)
        .or_else(|_| RsaPrivateKey::from_pkcs8_der(der))
        .map_err(|e| DecodeError::rejected(format!("not an RSA private key: {}", e)))
}

/// Decrypt a wrapped book key
///
/// # Errors
/// - KeyRejected if the padding does not check out (wrong user key)
pub fn unwrap_book_key(key: &RsaPrivateKey, wrapped: &[u8]) -> DecodeResult<Vec<u8>> {
    key.decrypt(Pkcs1v15Encrypt, wrapped)
        .map_err(|_| DecodeError::rejected("book key does not unwrap with this RSA key"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPublicKey;

    const TEST_KEY: &[u8] = include_bytes!("../../tests/fixtures/adept_key.der");
    const OTHER_KEY: &[u8] = include_bytes!("../../tests/fixtures/other_key.der");

    #[test]
    fn test_unwrap_with_matching_key() {
        let private = load_adept_key(TEST_KEY).unwrap();
        let public = RsaPublicKey::from(&private);
        let wrapped = public
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &[0x42; 16])
            .unwrap();
        assert_eq!(unwrap_book_key(&private, &wrapped).unwrap(), vec![0x42; 16]);
    }

    #[test]
    fn test_unwrap_with_other_key_is_rejected() {
        let private = load_adept_key(TEST_KEY).unwrap();
        let wrapped = RsaPublicKey::from(&private)
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &[0x42; 16])
            .unwrap();
        let other = load_adept_key(OTHER_KEY).unwrap();
        assert!(matches!(
            unwrap_book_key(&other, &wrapped),
            Err(DecodeError::KeyRejected(_))
        ));
    }

    #[test]
    fn test_garbage_key_material_is_rejected() {
        assert!(matches!(
            load_adept_key(b"not a key"),
            Err(DecodeError::KeyRejected(_))
        ));
    }
}
