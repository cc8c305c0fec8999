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


//! PDF decryption (Adobe Adept `EBX_HANDLER`)
//!
//! # Pipeline
//! 1. [`xref`]: merge every cross-reference section into one table
//! 2. [`security`]: unlock the document key from `/Encrypt` and the user key
//! 3. [`PdfFile`]: load objects by id, deciphering strings and streams
//! 4. [`serializer`]: write every object again, without `/Encrypt`, and
//!    append a fresh classic table or cross-reference stream

pub mod filters;
pub mod object;
pub mod parser;
pub mod security;
pub mod serializer;
pub mod xref;

use crate::error::{DecodeError, DecodeResult};
use crate::formats::DecryptedArtifact;
use object::{Dictionary, ObjRef, Object};
use parser::Parser;
use security::Security;
use std::collections::HashMap;
use xref::{XrefEntry, XrefTable};

/// What the trailer says about protection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdfProtection {
    Unencrypted,
    Adept,
    /// Any other security handler, by its `/Filter` name
    Other(String),
}

/// Classify a PDF by its `/Encrypt` dictionary
pub fn detect(bytes: &[u8]) -> DecodeResult<PdfProtection> {
    let file = PdfFile::open(bytes)?;
    let Some(encrypt) = file.encrypt_dict()? else {
        return Ok(PdfProtection::Unencrypted);
    };
    Ok(match encrypt.get_name(b"Filter") {
        Some(security::ADEPT_FILTER) => PdfProtection::Adept,
        Some(other) => PdfProtection::Other(String::from_utf8_lossy(other).into_owned()),
        None => PdfProtection::Other("unknown".to_string()),
    })
}

/// Decrypt an Adept PDF with a DER-encoded RSA user key
///
/// # Arguments
/// * `prefer_xref_stream` - Force the output cross-reference form; `None`
///   keeps the form the source used
pub fn decrypt(
    bytes: &[u8],
    user_key: &[u8],
    prefer_xref_stream: Option<bool>,
) -> DecodeResult<DecryptedArtifact> {
    let mut file = PdfFile::open(bytes)?;
    let encrypt = file
        .encrypt_dict()?
        .ok_or_else(|| DecodeError::wrong_scheme("PDF is not encrypted"))?;
    file.security = Some(Security::adept(&encrypt, user_key)?);

    let use_stream = prefer_xref_stream.unwrap_or(file.xref.uses_stream);
    let output = serializer::serialize(&mut file, use_stream)?;
    Ok(DecryptedArtifact::new(output, "pdf"))
}

/// A parsed PDF with lazy object loading
pub struct PdfFile<'a> {
    data: &'a [u8],
    xref: XrefTable,
    security: Option<Security>,
    /// Decoded object streams, by stream id
    object_streams: HashMap<u32, Vec<Object>>,
}

impl<'a> PdfFile<'a> {
    pub fn open(data: &'a [u8]) -> DecodeResult<Self> {
        if parser::find(&data[..data.len().min(1024)], b"%PDF-").is_none() {
            return Err(DecodeError::malformed("not a PDF file"));
        }
        Ok(Self {
            data,
            xref: XrefTable::load(data)?,
            security: None,
            object_streams: HashMap::new(),
        })
    }

    pub fn xref(&self) -> &XrefTable {
        &self.xref
    }

    pub fn trailer(&self) -> &Dictionary {
        &self.xref.trailer
    }

    /// Header line, e.g. `%PDF-1.6`
    pub fn version_header(&self) -> &'a [u8] {
        let start = parser::find(self.data, b"%PDF-").unwrap_or(0);
        let end = (start + 8).min(self.data.len());
        &self.data[start..end]
    }

    /// Id of the `/Encrypt` dictionary when it is an indirect object
    pub fn encrypt_id(&self) -> Option<u32> {
        self.trailer().get(b"Encrypt").and_then(Object::as_reference).map(|r| r.id)
    }

    /// The `/Encrypt` dictionary, never deciphered
    pub fn encrypt_dict(&self) -> DecodeResult<Option<Dictionary>> {
        match self.trailer().get(b"Encrypt") {
            None | Some(Object::Null) => Ok(None),
            Some(Object::Dictionary(dict)) => Ok(Some(dict.clone())),
            Some(Object::Reference(r)) => match self.load_plain(r.id)? {
                Some((_, Object::Dictionary(dict))) => Ok(Some(dict)),
                _ => Err(DecodeError::malformed("PDF: /Encrypt is not a dictionary")),
            },
            Some(_) => Err(DecodeError::malformed("PDF: bad /Encrypt entry")),
        }
    }

    /// Load an object stored at a byte offset, without deciphering
    fn load_plain(&self, id: u32) -> DecodeResult<Option<(ObjRef, Object)>> {
        let Some(XrefEntry::InUse { offset, .. }) = self.xref.get(id) else {
            return Ok(None);
        };
        if offset >= self.data.len() {
            return Err(DecodeError::malformed(format!("PDF: object {} beyond end of file", id)));
        }
        let mut parser = Parser::new(self.data, offset);
        let header = parser.read_indirect_header()?;
        if header.id != id {
            return Err(DecodeError::malformed(format!(
                "PDF: xref for object {} points at object {}",
                id, header.id
            )));
        }
        let object = parser.parse_object_or_stream(|r| self.resolve_length(r))?;
        Ok(Some((header, object)))
    }

    /// Indirect `/Length` values are plain integers
    fn resolve_length(&self, r: ObjRef) -> Option<usize> {
        let XrefEntry::InUse { offset, .. } = self.xref.get(r.id)? else {
            return None;
        };
        let mut parser = Parser::new(self.data, offset);
        parser.read_indirect_header().ok()?;
        parser.parse_object().ok()?.as_int().and_then(|n| usize::try_from(n).ok())
    }

    /// Whether a loaded object keeps its bytes as stored
    fn is_exempt(&self, id: u32, object: &Object) -> bool {
        if Some(id) == self.encrypt_id() {
            return true;
        }
        match object {
            Object::Stream(s) if s.dict.has_type(b"XRef") => true,
            Object::Stream(s) if s.dict.has_type(b"Metadata") => self
                .security
                .as_ref()
                .map_or(false, |sec| !sec.encrypts_metadata()),
            _ => false,
        }
    }

    /// Fetch an object by id, deciphered
    ///
    /// # Returns
    /// `None` for ids that are not in use
    pub fn get(&mut self, id: u32) -> DecodeResult<Option<Object>> {
        match self.xref.get(id) {
            None => Ok(None),
            Some(XrefEntry::InUse { .. }) => {
                let Some((header, mut object)) = self.load_plain(id)? else {
                    return Ok(None);
                };
                if let Some(sec) = self.security.clone() {
                    if !self.is_exempt(id, &object) {
                        decipher(&sec, header, &mut object)?;
                    }
                }
                Ok(Some(object))
            }
            Some(XrefEntry::Compressed { stream, index }) => {
                if !self.object_streams.contains_key(&stream) {
                    let members = self.read_object_stream(stream)?;
                    self.object_streams.insert(stream, members);
                }
                Ok(self
                    .object_streams
                    .get(&stream)
                    .and_then(|members| members.get(index as usize))
                    .cloned())
            }
        }
    }

    /// Decode an object stream into its members, in index order
    fn read_object_stream(&mut self, id: u32) -> DecodeResult<Vec<Object>> {
        let stream = match self.get(id)? {
            Some(Object::Stream(s)) if s.dict.has_type(b"ObjStm") => s,
            _ => {
                return Err(DecodeError::malformed(format!(
                    "PDF: object {} is not an object stream",
                    id
                )))
            }
        };
        let count = stream.dict.get_int(b"N").unwrap_or(0).max(0) as usize;
        let first = stream.dict.get_int(b"First").unwrap_or(0).max(0) as usize;
        let body = filters::decode_stream(&stream)?;

        let mut header = Parser::new(&body, 0);
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            let _number = header.read_uint()?;
            offsets.push(header.read_uint()? as usize);
        }
        offsets
            .into_iter()
            .map(|offset| Parser::new(&body, first + offset).parse_object())
            .collect()
    }
}

/// Decipher every string and the stream body of one indirect object
fn decipher(sec: &Security, at: ObjRef, object: &mut Object) -> DecodeResult<()> {
    match object {
        Object::String(s) => *s = sec.decrypt(at.id, at.gen, s)?,
        Object::Array(items) => {
            for item in items {
                decipher(sec, at, item)?;
            }
        }
        Object::Dictionary(dict) => decipher_dict(sec, at, dict)?,
        Object::Stream(stream) => {
            decipher_dict(sec, at, &mut stream.dict)?;
            stream.data = sec.decrypt(at.id, at.gen, &stream.data)?;
        }
        _ => {}
    }
    Ok(())
}

fn decipher_dict(sec: &Security, at: ObjRef, dict: &mut Dictionary) -> DecodeResult<()> {
    for value in dict.values_mut() {
        decipher(sec, at, value)?;
    }
    Ok(())
}
