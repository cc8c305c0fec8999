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


//! Cipher primitives shared by the format decoders
//!
//! # Ciphers
//! - **AES-128-CBC**: EPUB members (Adept, B&N), B&N book key, PDF `AESV2`
//! - **RC4**: PDF Adept V2/V3 objects
//! - **PC1** (Pukall Cipher 1): Mobipocket text records and vouchers
//! - **DES-ECB**: eReader record 1 cookie, content key and text pages
//! - **RSA PKCS#1 v1.5**: Adept book key unwrapping
//!
//! Everything here works on in-memory buffers and returns [`DecodeResult`] so
//! a failure is classified for the key-trial loop.
//!
//! [`DecodeResult`]: crate::error::DecodeResult

pub mod cipher;
pub mod keywrap;
pub mod pc1;
pub mod rc4;

pub use cipher::{aes128_cbc_decrypt, aes128_cbc_encrypt, fix_des_key, strip_padding, DesEcb};
pub use keywrap::{load_adept_key, unwrap_book_key};
pub use pc1::Pc1;
pub use rc4::Rc4;
