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


//! `META-INF/encryption.xml` and `META-INF/rights.xml`
//!
//! # Encryption Manifest
//! ```xml
//! <encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
//!   <EncryptedData xmlns="http://www.w3.org/2001/04/xmlenc#">
//!     <EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes128-cbc"/>
//!     <KeyInfo xmlns="http://www.w3.org/2000/09/xmldsig#">
//!       <resource xmlns="http://ns.adobe.com/adept">urn:uuid:...</resource>
//!     </KeyInfo>
//!     <CipherData><CipherReference URI="OEBPS/chapter1.xhtml"/></CipherData>
//!   </EncryptedData>
//! </encryption>
//! ```
//! An optional `<Compression Method="0"/>` inside `EncryptionProperties` marks a
//! member that was stored rather than deflated before encryption.
//!
//! Entries using other algorithms (font obfuscation, for instance) are kept
//! so the manifest can be rewritten with only those entries.

use crate::error::{DecodeError, DecodeResult};
use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use uuid::Uuid;

/// Cipher used by Adept and Barnes & Noble EPUBs
pub const AES128_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";

/// One `EncryptedData` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEntry {
    /// Zip member path, compared byte for byte with archive names
    pub path: String,
    pub algorithm: String,
    pub resource: Option<Uuid>,
    /// Deflated before encryption (the default)
    pub compressed: bool,
}

/// Ordered entries of an encryption manifest
#[derive(Debug, Clone, Default)]
pub struct EncryptionManifest {
    entries: Vec<EncryptedEntry>,
}

fn xml_error(e: quick_xml::Error) -> DecodeError {
    DecodeError::malformed(format!("encryption.xml: {}", e))
}

impl EncryptionManifest {
    /// # Errors
    /// - MalformedContainer if the XML does not parse
    pub fn parse(xml: &[u8]) -> DecodeResult<Self> {
        let mut reader = Reader::from_reader(xml);
        reader.trim_text(true);

        let mut entries = Vec::new();
        let mut current: Option<EncryptedEntry> = None;
        let mut in_resource = false;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                    b"EncryptedData" => {
                        current = Some(EncryptedEntry {
                            path: String::new(),
                            algorithm: String::new(),
                            resource: None,
                            compressed: true,
                        })
                    }
                    b"EncryptionMethod" => {
                        if let (Some(entry), Some(value)) =
                            (current.as_mut(), attribute(&e, "Algorithm")?)
                        {
                            entry.algorithm = value;
                        }
                    }
                    b"CipherReference" => {
                        if let (Some(entry), Some(value)) = (current.as_mut(), attribute(&e, "URI")?)
                        {
                            entry.path = value;
                        }
                    }
                    b"Compression" => {
                        if let (Some(entry), Some(value)) =
                            (current.as_mut(), attribute(&e, "Method")?)
                        {
                            entry.compressed = value.trim() != "0";
                        }
                    }
                    b"resource" => in_resource = true,
                    _ => {}
                },
                Event::Text(t) if in_resource => {
                    let text = t.unescape().map_err(xml_error)?;
                    if let Some(entry) = current.as_mut() {
                        let id = text.trim();
                        entry.resource = Uuid::parse_str(id.trim_start_matches("urn:uuid:")).ok();
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"resource" => in_resource = false,
                    b"EncryptedData" => {
                        if let Some(entry) = current.take() {
                            if !entry.path.is_empty() {
                                entries.push(entry);
                            }
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[EncryptedEntry] {
        &self.entries
    }

    /// Entry for a member encrypted with the supported cipher
    pub fn supported_entry(&self, path: &str) -> Option<&EncryptedEntry> {
        self.entries
            .iter()
            .find(|entry| entry.algorithm == AES128_CBC && entry.path == path)
    }

    pub fn has_supported_entries(&self) -> bool {
        self.entries.iter().any(|entry| entry.algorithm == AES128_CBC)
    }

    /// Whether entries with other algorithms must survive decryption
    pub fn has_other_entries(&self) -> bool {
        self.entries.iter().any(|entry| entry.algorithm != AES128_CBC)
    }
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &str) -> DecodeResult<Option<String>> {
    let attr = e
        .try_get_attribute(name)
        .map_err(|err| DecodeError::malformed(format!("encryption.xml attribute: {}", err)))?;
    match attr {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(xml_error)?.into_owned())),
        None => Ok(None),
    }
}

/// Copy of `xml` without the `EncryptedData` elements that use the supported cipher
pub fn strip_supported_entries(xml: &[u8]) -> DecodeResult<Vec<u8>> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut pending: Option<Vec<Event<'static>>> = None;
    let mut drop_pending = false;

    loop {
        let event = reader.read_event().map_err(xml_error)?.into_owned();
        match &event {
            Event::Eof => break,
            Event::Start(e) if e.local_name().as_ref() == b"EncryptedData" => {
                pending = Some(Vec::new());
                drop_pending = false;
            }
            Event::Start(e) | Event::Empty(e)
                if pending.is_some() && e.local_name().as_ref() == b"EncryptionMethod" =>
            {
                drop_pending = attribute(e, "Algorithm")?.as_deref() == Some(AES128_CBC);
            }
            _ => {}
        }

        let closes_entry =
            matches!(&event, Event::End(e) if e.local_name().as_ref() == b"EncryptedData");
        match pending.as_mut() {
            Some(buffer) => buffer.push(event),
            None => writer
                .write_event(event)
                .map_err(|e| DecodeError::internal(format!("XML write: {}", e)))?,
        }

        if closes_entry {
            if let Some(buffer) = pending.take() {
                if !drop_pending {
                    for event in buffer {
                        writer
                            .write_event(event)
                            .map_err(|e| DecodeError::internal(format!("XML write: {}", e)))?;
                    }
                }
            }
        }
    }

    Ok(writer.into_inner().into_inner())
}

/// Text of the first `encryptedKey` element in `rights.xml`
///
/// Returns `Ok(None)` when there is no such element.
pub fn rights_encrypted_key(xml: &[u8]) -> DecodeResult<Option<String>> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut key = String::new();
    loop {
        match reader
            .read_event()
            .map_err(|e| DecodeError::malformed(format!("rights.xml: {}", e)))?
        {
            Event::Start(e) if e.local_name().as_ref() == b"encryptedKey" => inside = true,
            Event::Text(t) if inside => {
                let text = t
                    .unescape()
                    .map_err(|e| DecodeError::malformed(format!("rights.xml: {}", e)))?;
                key.push_str(&text);
            }
            Event::End(e) if inside && e.local_name().as_ref() == b"encryptedKey" => {
                return Ok(Some(key));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}
