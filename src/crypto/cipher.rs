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


//! Block cipher helpers (AES-128-CBC, DES-ECB)
//!
//! Padding is never removed by the cipher itself: every format strips it
//! by hand from the final plaintext byte, and a bad pad byte is one of the
//! signals that the key was wrong.

use crate::error::{DecodeError, DecodeResult};
use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// AES block size in bytes
pub const AES_BLOCK: usize = 16;

/// Decrypt whole AES-128-CBC blocks, leaving padding in place
///
/// # Errors
/// - MalformedContainer if the data is not a whole number of blocks
/// - KeyRejected if the key or IV has the wrong length
pub fn aes128_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> DecodeResult<Vec<u8>> {
    if data.len() % AES_BLOCK != 0 {
        return Err(DecodeError::malformed(format!(
            "ciphertext length {} is not a multiple of {}",
            data.len(),
            AES_BLOCK
        )));
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| DecodeError::rejected("AES key must be 16 bytes"))?;
    let mut buf = data.to_vec();
    cipher
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| DecodeError::malformed("AES-CBC unpad failed"))?;
    Ok(buf)
}

/// Encrypt whole AES-128-CBC blocks without adding padding
pub fn aes128_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> DecodeResult<Vec<u8>> {
    if data.len() % AES_BLOCK != 0 {
        return Err(DecodeError::internal("plaintext is not block aligned"));
    }
    let cipher = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|_| DecodeError::rejected("AES key must be 16 bytes"))?;
    let mut buf = data.to_vec();
    let len = buf.len();
    cipher
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|_| DecodeError::internal("AES-CBC encryption failed"))?;
    Ok(buf)
}

/// Drop the padding announced by the final byte
///
/// # Errors
/// - KeyRejected if the pad length is 0, over one block, or longer than the data
pub fn strip_padding(data: &mut Vec<u8>) -> DecodeResult<()> {
    let pad = match data.last() {
        Some(&pad) => pad as usize,
        None => return Err(DecodeError::rejected("empty plaintext")),
    };
    if pad == 0 || pad > AES_BLOCK || pad > data.len() {
        return Err(DecodeError::rejected(format!("invalid padding byte {}", pad)));
    }
    data.truncate(data.len() - pad);
    Ok(())
}

/// Force the parity bit of each DES key byte the way Palm's eReader does
pub fn fix_des_key(key: &[u8]) -> [u8; 8] {
    let mut fixed = [0u8; 8];
    for (out, &b) in fixed.iter_mut().zip(key.iter()) {
        let v = b as u32;
        let parity = (v
            ^ (v << 1)
            ^ (v << 2)
            ^ (v << 3)
            ^ (v << 4)
            ^ (v << 5)
            ^ (v << 6)
            ^ (v << 7)
            ^ 0x80)
            & 0x80;
        *out = (v ^ parity) as u8;
    }
    fixed
}

/// Single-key DES in ECB mode
pub struct DesEcb {
    cipher: des::Des,
}

impl DesEcb {
    /// # Arguments
    /// * `key` - 8 raw key bytes, parity already fixed if the format needs it
    pub fn new(key: &[u8]) -> DecodeResult<Self> {
        let cipher = des::Des::new_from_slice(key)
            .map_err(|_| DecodeError::rejected("DES key must be 8 bytes"))?;
        Ok(Self { cipher })
    }

    /// Decrypt whole 8-byte blocks; a trailing partial block is dropped
    pub fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data[..data.len() - data.len() % 8].to_vec();
        for chunk in out.chunks_exact_mut(8) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        out
    }

    /// Encrypt whole 8-byte blocks; a trailing partial block is dropped
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data[..data.len() - data.len() % 8].to_vec();
        for chunk in out.chunks_exact_mut(8) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_cbc_round_trip_without_padding() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let plain = b"exactly thirty-two bytes of text".to_vec();
        let encrypted = aes128_cbc_encrypt(&key, &iv, &plain).unwrap();
        assert_ne!(encrypted, plain);
        assert_eq!(aes128_cbc_decrypt(&key, &iv, &encrypted).unwrap(), plain);
    }

    #[test]
    fn test_aes_cbc_rejects_partial_block() {
        assert!(matches!(
            aes128_cbc_decrypt(&[0; 16], &[0; 16], &[0; 15]),
            Err(DecodeError::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_strip_padding() {
        let mut data = vec![1, 2, 3, 3, 3, 3];
        strip_padding(&mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        let mut data = vec![1, 2, 0];
        assert!(strip_padding(&mut data).is_err());
        let mut data = vec![1, 17];
        assert!(strip_padding(&mut data).is_err());
        let mut data = vec![5, 5];
        assert!(strip_padding(&mut data).is_err());
    }

    #[test]
    fn test_fix_des_key_sets_odd_parity() {
        for b in 0..=255u8 {
            let fixed = fix_des_key(&[b; 8])[0];
            assert_eq!(fixed & 0x7f, b & 0x7f);
            assert_eq!(fixed.count_ones() % 2, 1, "byte {:#04x}", b);
        }
    }

    #[test]
    fn test_des_known_answer() {
        // FIPS 81 style vector: key 133457799BBCDFF1, plaintext 0123456789ABCDEF
        let des = DesEcb::new(&hex::decode("133457799BBCDFF1").unwrap()).unwrap();
        let cipher = des.encrypt(&hex::decode("0123456789ABCDEF").unwrap());
        assert_eq!(hex::encode_upper(&cipher), "85E813540F0AB405");
        assert_eq!(hex::encode_upper(des.decrypt(&cipher)), "0123456789ABCDEF");
    }
}
