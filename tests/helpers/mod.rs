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


//! Builders for synthetic protected books

#![allow(dead_code)]

use base64::Engine;
use dedrm_core::crypto::{aes128_cbc_encrypt, fix_des_key, load_adept_key, DesEcb, Pc1, Rc4};
use md5::Md5;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const ADEPT_KEY: &[u8] = include_bytes!("../fixtures/adept_key.der");
pub const OTHER_ADEPT_KEY: &[u8] = include_bytes!("../fixtures/other_key.der");

pub fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn deflate_raw(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn pkcs7(mut data: Vec<u8>) -> Vec<u8> {
    let n = 16 - data.len() % 16;
    data.extend(std::iter::repeat(n as u8).take(n));
    data
}

/// RSA-wrap a book key for the fixture Adept key
pub fn wrap_book_key(book_key: &[u8]) -> Vec<u8> {
    let private = load_adept_key(ADEPT_KEY).unwrap();
    RsaPublicKey::from(&private)
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, book_key)
        .unwrap()
}

// ===== EPUB =====

pub struct EpubMember {
    pub name: &'static str,
    pub data: Vec<u8>,
    pub encrypted: bool,
}

impl EpubMember {
    pub fn plain(name: &'static str, data: &[u8]) -> Self {
        Self { name, data: data.to_vec(), encrypted: false }
    }

    pub fn encrypted(name: &'static str, data: &[u8]) -> Self {
        Self { name, data: data.to_vec(), encrypted: true }
    }
}

fn encryption_xml(members: &[EpubMember]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\"?>\n<encryption xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n",
    );
    for member in members.iter().filter(|m| m.encrypted) {
        xml.push_str(&format!(
            "  <EncryptedData xmlns=\"http://www.w3.org/2001/04/xmlenc#\">\n\
             \x20   <EncryptionMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#aes128-cbc\"/>\n\
             \x20   <KeyInfo xmlns=\"http://www.w3.org/2000/09/xmldsig#\">\n\
             \x20     <resource xmlns=\"http://ns.adobe.com/adept\">urn:uuid:9b1c6e0a-3f5d-4c1e-8d7a-2e4f6a8b0c1d</resource>\n\
             \x20   </KeyInfo>\n\
             \x20   <CipherData><CipherReference URI=\"{}\"/></CipherData>\n\
             \x20 </EncryptedData>\n",
            member.name
        ));
    }
    xml.push_str("</encryption>\n");
    xml
}

fn rights_xml(encrypted_key: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<adept:rights xmlns:adept=\"http://ns.adobe.com/adept\">\n\
         <adept:licenseToken><adept:encryptedKey>{}</adept:encryptedKey></adept:licenseToken>\n\
         </adept:rights>\n",
        encrypted_key
    )
}

/// Zip with mimetype first, the DRM files, then `members` in order
///
/// Encrypted members are deflated, AES-128-CBC encrypted with `content_key`
/// and a fixed IV, and stored.
pub fn build_epub(content_key: &[u8], encrypted_key: &str, members: &[EpubMember]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file("mimetype", stored).unwrap();
    writer.write_all(b"application/epub+zip").unwrap();
    writer.start_file("META-INF/rights.xml", deflated).unwrap();
    writer.write_all(rights_xml(encrypted_key).as_bytes()).unwrap();
    writer.start_file("META-INF/encryption.xml", deflated).unwrap();
    writer.write_all(encryption_xml(members).as_bytes()).unwrap();

    for member in members {
        if member.encrypted {
            let iv = [0x24u8; 16];
            let mut body = iv.to_vec();
            body.extend(aes128_cbc_encrypt(content_key, &iv, &pkcs7(deflate_raw(&member.data))).unwrap());
            writer.start_file(member.name, stored).unwrap();
            writer.write_all(&body).unwrap();
        } else {
            writer.start_file(member.name, deflated).unwrap();
            writer.write_all(&member.data).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Adept EPUB whose book key is wrapped for the fixture RSA key
pub fn build_adept_epub(content_key: &[u8], members: &[EpubMember]) -> Vec<u8> {
    build_epub(content_key, &b64(&wrap_book_key(content_key)), members)
}

/// Barnes & Noble EPUB unlocked by `user_key`
pub fn build_bn_epub(user_key: &[u8], content_key: &[u8], members: &[EpubMember]) -> Vec<u8> {
    let mut plain = vec![0x61u8; 16];
    plain.extend_from_slice(content_key);
    let encrypted = aes128_cbc_encrypt(&user_key[..16], &[0u8; 16], &pkcs7(plain)).unwrap();
    build_epub(content_key, &b64(&encrypted), members)
}

/// Standard chapter set: two encrypted members, two plain ones besides mimetype
pub fn sample_members() -> Vec<EpubMember> {
    vec![
        EpubMember::plain(
            "META-INF/container.xml",
            b"<?xml version=\"1.0\"?><container><rootfiles><rootfile full-path=\"OEBPS/content.opf\"/></rootfiles></container>",
        ),
        EpubMember::plain("OEBPS/content.opf", b"<package><manifest/></package>"),
        EpubMember::encrypted("OEBPS/chapter1.xhtml", b"<html><body><p>It was a dark and stormy night.</p></body></html>"),
        EpubMember::encrypted("OEBPS/chapter2.xhtml", b"<html><body><p>The end.</p></body></html>"),
    ]
}

// ===== PDF =====

/// Object key for Adept V2 with RC4
pub fn pdf_object_key(book_key: &[u8], id: u32, gen: u16) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(book_key);
    hasher.update(&id.to_le_bytes()[..3]);
    hasher.update(gen.to_le_bytes());
    let digest = hasher.finalize();
    digest[..(book_key.len() + 5).min(16)].to_vec()
}

pub fn pdf_encrypt(book_key: &[u8], id: u32, data: &[u8]) -> Vec<u8> {
    Rc4::process(&pdf_object_key(book_key, id, 0), data)
}

/// `/Encrypt` dictionary body for the Adept handler
pub fn adept_encrypt_dict(book_key: &[u8]) -> Vec<u8> {
    let license = format!(
        "<?xml version=\"1.0\"?><rights xmlns=\"http://ns.adobe.com/adept\"><licenseToken>\
         <encryptedKey>{}</encryptedKey></licenseToken></rights>",
        b64(&wrap_book_key(book_key))
    );
    format!(
        "<< /Filter /EBX_HANDLER /V 2 /Length {} /ADEPT_LICENSE ({}) >>",
        book_key.len() * 8,
        b64(&deflate_raw(license.as_bytes()))
    )
    .into_bytes()
}

/// Classic-xref PDF from `(id, body)` pairs; ids not listed are free
pub fn build_pdf(objects: &[(u32, Vec<u8>)], trailer: &str) -> Vec<u8> {
    let mut out = b"%PDF-1.6\n%\xe2\xe3\xcf\xd3\n".to_vec();
    let max = objects.iter().map(|(id, _)| *id).max().unwrap_or(0);
    let mut offsets = vec![None; max as usize + 1];
    for (id, body) in objects {
        offsets[*id as usize] = Some(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", id).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }
    let xref_at = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", max + 1).as_bytes());
    for offset in &offsets {
        match offset {
            Some(offset) => out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes()),
            None => out.extend_from_slice(b"0000000000 65535 f \n"),
        }
    }
    out.extend_from_slice(format!("trailer\n{}\nstartxref\n{}\n%%EOF\n", trailer, xref_at).as_bytes());
    out
}

pub fn stream_body(dict_extra: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!("<< /Length {}{} >>\nstream\n", data.len(), dict_extra).into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(b"\nendstream");
    body
}

pub const PDF_BOOK_KEY: [u8; 16] = *b"pdf-book-key-16b";
pub const PDF_PAGE_CONTENT: &[u8] = b"BT /F1 12 Tf 72 712 Td (Hello, reader) Tj ET";

/// Adept PDF with objects {1, 2, 5} in use and the `/Encrypt` dictionary at 6
pub fn build_adept_pdf() -> Vec<u8> {
    let lang = hex::encode(pdf_encrypt(&PDF_BOOK_KEY, 1, b"en-US"));
    let objects = vec![
        (
            1,
            format!("<< /Type /Catalog /Pages 2 0 R /Lang <{}> >>", lang).into_bytes(),
        ),
        (2, b"<< /Type /Pages /Kids [] /Count 0 >>".to_vec()),
        (5, stream_body("", &pdf_encrypt(&PDF_BOOK_KEY, 5, PDF_PAGE_CONTENT))),
        (6, adept_encrypt_dict(&PDF_BOOK_KEY)),
    ];
    build_pdf(
        &objects,
        "<< /Size 7 /Root 1 0 R /Encrypt 6 0 R /ID [<0011> <0011>] >>",
    )
}

pub const PDF_PACKED_STRING: &[u8] = b"secret words";

/// Object stream body and its `/First` offset
fn object_stream(members: &[(u32, &[u8])]) -> (Vec<u8>, usize) {
    let mut header = String::new();
    let mut objects = Vec::new();
    for (id, member) in members {
        header.push_str(&format!("{} {} ", id, objects.len()));
        objects.extend_from_slice(member);
        objects.push(b' ');
    }
    let first = header.len();
    let mut data = header.into_bytes();
    data.extend_from_slice(&objects);
    (data, first)
}

/// Cross-reference stream rows with `/W [1 4 2]`
fn xref_rows(rows: &[(u8, u32, u16)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rows.len() * 7);
    for (kind, f2, f3) in rows {
        out.push(*kind);
        out.extend_from_slice(&f2.to_be_bytes());
        out.extend_from_slice(&f3.to_be_bytes());
    }
    out
}

/// Adept PDF whose objects 2 and 3 live in encrypted object stream 4
///
/// Without `hybrid` the only cross-reference is stream object 7. With it, a
/// classic table lists the plain objects and its `/XRefStm` points at object 7,
/// which holds just the compressed entries.
pub fn build_adept_pdf_with_object_streams(hybrid: bool) -> Vec<u8> {
    let lang = hex::encode(pdf_encrypt(&PDF_BOOK_KEY, 1, b"en-US"));
    let packed = format!("({})", String::from_utf8_lossy(PDF_PACKED_STRING));
    let (objstm, first) = object_stream(&[
        (2, &b"<< /Type /Pages /Kids [] /Count 0 >>"[..]),
        (3, packed.as_bytes()),
    ]);
    let objects = vec![
        (
            1u32,
            format!("<< /Type /Catalog /Pages 2 0 R /Lang <{}> >>", lang).into_bytes(),
        ),
        (
            4,
            stream_body(
                &format!(" /Type /ObjStm /N 2 /First {} /Filter /FlateDecode", first),
                &pdf_encrypt(&PDF_BOOK_KEY, 4, &zlib(&objstm)),
            ),
        ),
        (5, stream_body("", &pdf_encrypt(&PDF_BOOK_KEY, 5, PDF_PAGE_CONTENT))),
        (6, adept_encrypt_dict(&PDF_BOOK_KEY)),
    ];

    let mut out = b"%PDF-1.6\n%\xe2\xe3\xcf\xd3\n".to_vec();
    let mut offsets = [0u32; 8];
    for (id, body) in &objects {
        offsets[*id as usize] = out.len() as u32;
        out.extend_from_slice(format!("{} 0 obj\n", id).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }

    let ids = "/Root 1 0 R /Encrypt 6 0 R /ID [<0011> <0011>]";
    let xref_at = out.len();
    let compressed = [(2u8, 4u32, 0u16), (2, 4, 1)];
    let xref_stream = if hybrid {
        stream_body(
            " /Type /XRef /Size 8 /W [1 4 2] /Index [2 2] /Filter /FlateDecode",
            &zlib(&xref_rows(&compressed)),
        )
    } else {
        let mut rows = vec![(0u8, 0u32, 65535u16), (1, offsets[1], 0)];
        rows.extend_from_slice(&compressed);
        for id in 4..=6 {
            rows.push((1, offsets[id], 0));
        }
        rows.push((1, xref_at as u32, 0));
        stream_body(
            &format!(" /Type /XRef /Size 8 /W [1 4 2] /Filter /FlateDecode {}", ids),
            &zlib(&xref_rows(&rows)),
        )
    };
    out.extend_from_slice(b"7 0 obj\n");
    out.extend_from_slice(&xref_stream);
    out.extend_from_slice(b"\nendobj\n");

    if !hybrid {
        out.extend_from_slice(format!("startxref\n{}\n%%EOF\n", xref_at).as_bytes());
        return out;
    }

    let table_at = out.len();
    out.extend_from_slice(b"xref\n0 7\n");
    for id in 0..7 {
        match offsets[id] {
            0 => out.extend_from_slice(b"0000000000 65535 f \n"),
            offset => out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes()),
        }
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size 8 {} /XRefStm {} >>\nstartxref\n{}\n%%EOF\n",
            ids, xref_at, table_at
        )
        .as_bytes(),
    );
    out
}

// ===== Mobipocket =====

pub const MOBI_VOUCHER_KEY: &[u8; 16] =
    b"\x72\x38\x33\xB0\xB4\xF2\xE3\xCA\xDF\x09\x01\xD6\xE2\xE0\x3F\x96";

/// Type 2 Mobipocket book with one text record, keyed to an 8-character PID
pub fn build_mobi(pid: &[u8], text: &[u8]) -> Vec<u8> {
    let content_key = *b"mobi-content-key";
    let mut padded = pid.to_vec();
    padded.resize(16, 0);
    let temp_key = Pc1::new(MOBI_VOUCHER_KEY).unwrap().encrypt(&padded);
    let sum = temp_key.iter().fold(0u8, |a, &b| a.wrapping_add(b));

    let mut cookie = Vec::new();
    cookie.extend_from_slice(&0x0bad_f00du32.to_be_bytes());
    cookie.extend_from_slice(&1u32.to_be_bytes());
    cookie.extend_from_slice(&content_key);
    cookie.extend_from_slice(&[0u8; 8]);
    let mut voucher = 0x0bad_f00du32.to_be_bytes().to_vec();
    voucher.extend_from_slice(&[0u8; 8]);
    voucher.extend_from_slice(&[sum, 0, 0, 0]);
    voucher.extend_from_slice(&Pc1::new(&temp_key).unwrap().encrypt(&cookie));

    let mobi_len = 0xE8usize;
    let mut rec0 = vec![0u8; 16 + mobi_len];
    rec0[0..2].copy_from_slice(&2u16.to_be_bytes());
    rec0[8..10].copy_from_slice(&1u16.to_be_bytes());
    rec0[0xC..0xE].copy_from_slice(&2u16.to_be_bytes());
    rec0[0x10..0x14].copy_from_slice(b"MOBI");
    rec0[0x14..0x18].copy_from_slice(&(mobi_len as u32).to_be_bytes());
    rec0[0x68..0x6C].copy_from_slice(&6u32.to_be_bytes());
    let ptr = rec0.len() as u32;
    rec0[0xA8..0xAC].copy_from_slice(&ptr.to_be_bytes());
    rec0[0xAC..0xB0].copy_from_slice(&1u32.to_be_bytes());
    rec0[0xB0..0xB4].copy_from_slice(&(voucher.len() as u32).to_be_bytes());
    rec0.extend_from_slice(&voucher);

    let record1 = Pc1::new(&content_key).unwrap().encrypt(text);
    palm_db(b"BOOKMOBI", &[rec0, record1])
}

// ===== PalmDB / eReader =====

pub fn palm_db(kind: &[u8; 8], records: &[Vec<u8>]) -> Vec<u8> {
    let mut db = vec![0u8; 78];
    db[..8].copy_from_slice(b"TestBook");
    db[0x3C..0x44].copy_from_slice(kind);
    db[76..78].copy_from_slice(&(records.len() as u16).to_be_bytes());
    let mut offset = 78 + records.len() * 8 + 2;
    for (i, record) in records.iter().enumerate() {
        db.extend_from_slice(&(offset as u32).to_be_bytes());
        db.extend_from_slice(&[0, 0, 0, i as u8]);
        offset += record.len();
    }
    db.extend_from_slice(&[0, 0]);
    for record in records {
        db.extend_from_slice(record);
    }
    db
}

fn des_page(cipher: &DesEcb, text: &[u8]) -> Vec<u8> {
    let mut data = zlib(text);
    data.resize(data.len().div_ceil(8) * 8, 0);
    cipher.encrypt(&data)
}

fn shuffle(plain: &[u8], shuffle: usize) -> Vec<u8> {
    let mut out = vec![0u8; plain.len()];
    let mut j = 0;
    for slot in out.iter_mut() {
        j = (j + shuffle) % plain.len();
        *slot = plain[j];
    }
    out
}

pub const EREADER_TEXT: &[u8] = b"\\pThe quick brown fox \\Sd=\"fn1\"jumps\\Sd over the lazy dog.\n";
pub const EREADER_FOOTNOTE: &[u8] = b"A footnote about foxes.";
pub const EREADER_IMAGE: &[u8] = b"\x89PNG\r\n\x1a\nnot really a picture";

/// Version 272 eReader book with one text page, one footnote and one image
pub fn build_ereader(user_key: &[u8]) -> Vec<u8> {
    let content_key = *b"erdrcont";
    let page_cipher = DesEcb::new(&fix_des_key(&content_key)).unwrap();

    // Record 1: first text page followed by the DRM cookie
    let mut record1 = des_page(&page_cipher, EREADER_TEXT);
    let cookie_key = fix_des_key(&record1[..8]);
    let xor_table = record1[..8].to_vec();

    let size = 0x100usize;
    let mut header = vec![0u8; size - 8];
    header[0..2].copy_from_slice(&5u16.to_be_bytes());
    header[2..4].copy_from_slice(&2u16.to_be_bytes()); // one text page
    header[4..8].copy_from_slice(&((1u32 << 9) | (1 << 7) | (1 << 10)).to_be_bytes());
    header[24..26].copy_from_slice(&4u16.to_be_bytes()); // first image
    header[26..28].copy_from_slice(&1u16.to_be_bytes());
    header[40..42].copy_from_slice(&0u16.to_be_bytes()); // xor table offset
    header[42..44].copy_from_slice(&8u16.to_be_bytes());
    header[44..46].copy_from_slice(&2u16.to_be_bytes()); // first footnote
    header[46..48].copy_from_slice(&2u16.to_be_bytes());
    header[56..76].copy_from_slice(&Sha1::digest(content_key));
    let user_cipher = DesEcb::new(&fix_des_key(user_key)).unwrap();
    header[172..180].copy_from_slice(&user_cipher.encrypt(&content_key));

    let shuffle_by = 7usize;
    let mut cookie = shuffle(&header, shuffle_by);
    cookie.extend_from_slice(&(shuffle_by as u32).to_be_bytes());
    cookie.extend_from_slice(&(size as u32).to_be_bytes());
    record1.extend(DesEcb::new(&cookie_key).unwrap().encrypt(&cookie));

    let mut record0 = 272u16.to_be_bytes().to_vec();
    record0.resize(16, 0);

    // Footnote ids: [?, ?, len, id..., ?] per footnote, XORed with the table
    let ids: Vec<u8> = [0u8, 0, 3, b'f', b'n', b'1', 0]
        .iter()
        .zip(xor_table.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect();

    let mut image = b"PNG ".to_vec();
    let mut name = b"cover.png".to_vec();
    name.resize(32, 0);
    image.extend_from_slice(&name);
    image.resize(62, 0);
    image.extend_from_slice(EREADER_IMAGE);

    palm_db(
        b"PNRdPPrs",
        &[record0, record1, ids, des_page(&page_cipher, EREADER_FOOTNOTE), image],
    )
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}
