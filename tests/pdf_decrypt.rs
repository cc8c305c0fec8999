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


mod helpers;

use dedrm_core::formats::pdf::object::Object;
use dedrm_core::formats::pdf::xref::XrefEntry;
use dedrm_core::formats::pdf::{self, PdfFile, PdfProtection};
use dedrm_core::DecodeError;
use helpers::*;

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn xref_table(out: &[u8]) -> Vec<String> {
    let start = out
        .windows(7)
        .position(|w| w == b"\nxref\n0")
        .expect("classic xref table")
        + 1;
    let text = String::from_utf8_lossy(&out[start..]);
    text.lines()
        .skip(2)
        .take_while(|line| !line.starts_with("trailer"))
        .map(str::to_string)
        .collect()
}

#[test]
fn test_adept_pdf_rewrite_has_free_entries_for_gaps() {
    let source = build_adept_pdf();
    assert_eq!(pdf::detect(&source).unwrap(), PdfProtection::Adept);

    let artifact = pdf::decrypt(&source, ADEPT_KEY, None).unwrap();
    assert_eq!(artifact.extension(), "pdf");
    let out = artifact.bytes();
    assert!(out.starts_with(b"%PDF-1.6"));

    let entries = xref_table(out);
    assert_eq!(entries.len(), 6, "{:?}", entries);
    for free in [0, 3, 4] {
        assert_eq!(entries[free], "0000000000 65535 f ");
    }
    for used in [1, 2, 5] {
        assert!(entries[used].ends_with(" 00000 n "), "{}", entries[used]);
    }

    // Encrypt dictionary and its object are gone
    assert!(!contains(out, b"6 0 obj"));
    assert!(!contains(out, b"EBX_HANDLER"));

    let mut file = PdfFile::open(out).unwrap();
    let trailer = file.trailer().clone();
    assert_eq!(trailer.get_int(b"Size"), Some(6));
    for key in [&b"Encrypt"[..], b"Prev", b"XRefStm"] {
        assert!(!trailer.contains(key));
    }
    assert_eq!(pdf::detect(out).unwrap(), PdfProtection::Unencrypted);

    match file.get(5).unwrap() {
        Some(Object::Stream(stream)) => assert_eq!(stream.data, PDF_PAGE_CONTENT),
        other => panic!("object 5 is {:?}", other),
    }
    let catalog = file.get(1).unwrap().unwrap();
    let lang = catalog.as_dict().and_then(|d| d.get(b"Lang")).and_then(Object::as_string);
    assert_eq!(lang, Some(&b"en-US"[..]));
}

#[test]
fn test_adept_pdf_stream_output_is_readable() {
    let source = build_adept_pdf();
    let artifact = pdf::decrypt(&source, ADEPT_KEY, Some(true)).unwrap();
    let out = artifact.bytes();
    assert!(contains(out, b"/XRef"));
    assert!(!contains(out, b"\nxref\n"));
    // The cross-reference stream does not reuse the /Encrypt id
    assert!(!contains(out, b"\n6 0 obj"));
    assert!(contains(out, b"7 0 obj"));

    let mut file = PdfFile::open(out).unwrap();
    assert!(file.xref().uses_stream);
    assert!(!file.xref().recovered);
    assert!(!file.trailer().contains(b"Encrypt"));
    match file.get(5).unwrap() {
        Some(Object::Stream(stream)) => assert_eq!(stream.data, PDF_PAGE_CONTENT),
        other => panic!("object 5 is {:?}", other),
    }
}

#[test]
fn test_adept_pdf_with_other_key_is_rejected() {
    let source = build_adept_pdf();
    let err = pdf::decrypt(&source, OTHER_ADEPT_KEY, None).unwrap_err();
    assert!(matches!(err, DecodeError::KeyRejected(_)), "{:?}", err);
}

#[test]
fn test_other_security_handler_is_reported() {
    let objects = vec![
        (1, b"<< /Type /Catalog >>".to_vec()),
        (2, b"<< /Filter /Standard /V 2 /R 3 >>".to_vec()),
    ];
    let source = build_pdf(&objects, "<< /Size 3 /Root 1 0 R /Encrypt 2 0 R >>");
    assert_eq!(
        pdf::detect(&source).unwrap(),
        PdfProtection::Other("Standard".to_string())
    );
}

fn assert_packed_objects_readable(out: &[u8]) -> PdfFile<'_> {
    let mut file = PdfFile::open(out).unwrap();
    assert!(!file.xref().recovered);
    assert!(!file.trailer().contains(b"Encrypt"));
    assert_eq!(
        file.get(3).unwrap(),
        Some(Object::String(PDF_PACKED_STRING.to_vec()))
    );
    let pages = file.get(2).unwrap().unwrap();
    assert!(pages.as_dict().unwrap().has_type(b"Pages"));
    match file.get(5).unwrap() {
        Some(Object::Stream(stream)) => assert_eq!(stream.data, PDF_PAGE_CONTENT),
        other => panic!("object 5 is {:?}", other),
    }
    file
}

#[test]
fn test_object_streams_are_unpacked_into_classic_table() {
    let source = build_adept_pdf_with_object_streams(false);
    let artifact = pdf::decrypt(&source, ADEPT_KEY, Some(false)).unwrap();
    let out = artifact.bytes();

    let entries = xref_table(out);
    assert_eq!(entries.len(), 8, "{:?}", entries);
    assert_eq!(entries[6], "0000000000 65535 f ");
    for used in [1, 2, 3, 4, 5] {
        assert!(entries[used].ends_with(" 00000 n "), "{}", entries[used]);
    }
    assert!(!contains(out, b"/ObjStm"));
    assert!(!contains(out, b"/XRef"));

    let mut file = assert_packed_objects_readable(out);
    assert!(!file.xref().uses_stream);
    assert_eq!(file.trailer().get_int(b"Size"), Some(8));
    // The emptied object stream and old xref stream stay as null objects
    assert_eq!(file.get(4).unwrap(), Some(Object::Null));
    assert_eq!(file.get(7).unwrap(), Some(Object::Null));
}

#[test]
fn test_object_streams_keep_compressed_entries_in_xref_stream() {
    let source = build_adept_pdf_with_object_streams(false);
    let artifact = pdf::decrypt(&source, ADEPT_KEY, None).unwrap();
    let out = artifact.bytes();
    assert!(!contains(out, b"\nxref\n"));
    assert!(!contains(out, b"\n6 0 obj"));

    let file = assert_packed_objects_readable(out);
    assert!(file.xref().uses_stream);
    assert_eq!(
        file.xref().get(2),
        Some(XrefEntry::Compressed { stream: 4, index: 0 })
    );
    assert_eq!(
        file.xref().get(3),
        Some(XrefEntry::Compressed { stream: 4, index: 1 })
    );
}

#[test]
fn test_hybrid_xref_stm_sections_are_merged() {
    let source = build_adept_pdf_with_object_streams(true);
    assert_eq!(pdf::detect(&source).unwrap(), PdfProtection::Adept);

    let classic = pdf::decrypt(&source, ADEPT_KEY, Some(false)).unwrap();
    let entries = xref_table(classic.bytes());
    assert_eq!(entries.len(), 6, "{:?}", entries);
    assert!(entries[3].ends_with(" 00000 n "), "{}", entries[3]);
    let file = assert_packed_objects_readable(classic.bytes());
    assert!(!file.trailer().contains(b"XRefStm"));

    // A hybrid source counts as a stream source
    let streamed = pdf::decrypt(&source, ADEPT_KEY, None).unwrap();
    let file = assert_packed_objects_readable(streamed.bytes());
    assert!(file.xref().uses_stream);
}
