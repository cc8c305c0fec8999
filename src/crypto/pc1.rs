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


//! PC1 (Pukall Cipher 1), the 128-bit stream cipher used by Mobipocket
//!
//! # Algorithm
//! - The 16-byte key is loaded as eight big-endian 16-bit words
//! - For every byte, an eight-round mix of the key words produces a 16-bit
//!   xor value; the plaintext byte is folded back into all key words, so the
//!   cipher is self-synchronizing on plaintext
//! - Running sums carry over from byte to byte

/// PC1 cipher with a 16-byte key
#[derive(Clone)]
pub struct Pc1 {
    key: [u16; 8],
}

impl Pc1 {
    /// Returns None unless the key is exactly 16 bytes
    pub fn new(key: &[u8]) -> Option<Self> {
        if key.len() != 16 {
            return None;
        }
        let mut words = [0u16; 8];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u16::from_be_bytes([key[i * 2], key[i * 2 + 1]]);
        }
        Some(Self { key: words })
    }

    pub fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        self.run(data, true)
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        self.run(data, false)
    }

    fn run(&self, data: &[u8], decrypting: bool) -> Vec<u8> {
        let mut wkey = self.key.map(u32::from);
        let mut sum1: u32 = 0;
        let mut sum2: u32 = 0;
        let mut out = Vec::with_capacity(data.len());

        for &byte in data {
            let mut temp1: u32 = 0;
            let mut byte_xor: u32 = 0;
            for (j, word) in wkey.iter().enumerate() {
                temp1 ^= word;
                sum2 = sum2
                    .wrapping_add(j as u32)
                    .wrapping_mul(20021)
                    .wrapping_add(sum1);
                sum1 = temp1.wrapping_mul(346) & 0xFFFF;
                sum2 = sum2.wrapping_add(sum1) & 0xFFFF;
                temp1 = temp1.wrapping_mul(20021).wrapping_add(1) & 0xFFFF;
                byte_xor ^= temp1 ^ sum2;
            }

            let mut cur = byte as u32;
            let mut key_xor = cur * 257;
            cur = (cur ^ (byte_xor >> 8) ^ byte_xor) & 0xFF;
            if decrypting {
                key_xor = cur * 257;
            }
            for word in wkey.iter_mut() {
                *word ^= key_xor;
            }
            out.push(cur as u8);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_short_key() {
        assert!(Pc1::new(b"short").is_none());
    }

    #[test]
    fn test_round_trip() {
        let pc1 = Pc1::new(b"QDCVEPMU675RUBSZ").unwrap();
        let text = b"<html><body>Chapter 1</body></html>".to_vec();
        let encrypted = pc1.encrypt(&text);
        assert_ne!(encrypted, text);
        assert_eq!(pc1.decrypt(&encrypted), text);
    }

    #[test]
    fn test_wrong_key_garbles() {
        let text = b"abcdefghijklmnop".to_vec();
        let encrypted = Pc1::new(&[1u8; 16]).unwrap().encrypt(&text);
        assert_ne!(Pc1::new(&[2u8; 16]).unwrap().decrypt(&encrypted), text);
    }
}
