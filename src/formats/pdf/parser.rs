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


//! PDF tokenizer and object parser
//!
//! Works on a byte slice with an explicit cursor so the same parser serves
//! indirect objects at xref offsets, classic xref tables and the contents of
//! object streams.

use super::object::{Dictionary, ObjRef, Object, Stream};
use crate::error::{DecodeError, DecodeResult};

pub fn is_whitespace(b: u8) -> bool {
    matches!(b, b'\0' | b'\t' | b'\n' | 0x0c | b'\r' | b' ')
}

pub fn is_delimiter(b: u8) -> bool {
    matches!(b, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

pub fn is_regular(b: u8) -> bool {
    !is_whitespace(b) && !is_delimiter(b)
}

pub struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn error(&self, what: &str) -> DecodeError {
        DecodeError::malformed(format!("PDF: {} at offset {}", what, self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Skip whitespace and comments
    pub fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if is_whitespace(b) {
                self.pos += 1;
            } else if b == b'%' {
                while let Some(c) = self.peek() {
                    if c == b'\r' || c == b'\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    /// Next run of regular characters (may be empty)
    pub fn read_keyword(&mut self) -> &'a [u8] {
        self.skip_whitespace();
        let start = self.pos;
        while self.peek().map_or(false, is_regular) {
            self.pos += 1;
        }
        &self.data[start..self.pos]
    }

    /// Consume `keyword` if it is next, otherwise leave the cursor alone
    pub fn accept_keyword(&mut self, keyword: &[u8]) -> bool {
        let saved = self.pos;
        if self.read_keyword() == keyword {
            true
        } else {
            self.pos = saved;
            false
        }
    }

    pub fn read_uint(&mut self) -> DecodeResult<u64> {
        let token = self.read_keyword();
        if token.is_empty() || !token.iter().all(u8::is_ascii_digit) {
            return Err(self.error("expected an unsigned integer"));
        }
        std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("integer out of range"))
    }

    /// `id gen obj`
    pub fn read_indirect_header(&mut self) -> DecodeResult<ObjRef> {
        let id = self.read_uint()?;
        let gen = self.read_uint()?;
        if !self.accept_keyword(b"obj") {
            return Err(self.error("expected 'obj'"));
        }
        Ok(ObjRef::new(
            u32::try_from(id).map_err(|_| self.error("object id out of range"))?,
            u16::try_from(gen).map_err(|_| self.error("generation out of range"))?,
        ))
    }

    pub fn parse_object(&mut self) -> DecodeResult<Object> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(self.error("unexpected end of data")),
            Some(b'/') => {
                self.pos += 1;
                Ok(Object::Name(self.read_name_body()))
            }
            Some(b'(') => {
                self.pos += 1;
                self.read_literal_string().map(Object::String)
            }
            Some(b'<') if self.data.get(self.pos + 1) == Some(&b'<') => {
                self.pos += 2;
                self.read_dictionary_body().map(Object::Dictionary)
            }
            Some(b'<') => {
                self.pos += 1;
                self.read_hex_string().map(Object::String)
            }
            Some(b'[') => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_whitespace();
                    match self.peek() {
                        Some(b']') => {
                            self.pos += 1;
                            return Ok(Object::Array(items));
                        }
                        None => return Err(self.error("unterminated array")),
                        _ => items.push(self.parse_object()?),
                    }
                }
            }
            Some(b) if b.is_ascii_digit() || b == b'+' || b == b'-' || b == b'.' => {
                self.read_number()
            }
            Some(_) => {
                let keyword = self.read_keyword();
                match keyword {
                    b"true" => Ok(Object::Bool(true)),
                    b"false" => Ok(Object::Bool(false)),
                    b"null" => Ok(Object::Null),
                    [] => {
                        self.pos += 1;
                        Err(self.error("unexpected delimiter"))
                    }
                    _ => Err(self.error("unexpected keyword")),
                }
            }
        }
    }

    fn read_number(&mut self) -> DecodeResult<Object> {
        let start = self.pos;
        let token = self.read_keyword();
        let text = std::str::from_utf8(token).map_err(|_| self.error("bad number"))?;

        if let Ok(value) = text.parse::<i64>() {
            // Possibly the start of `id gen R`
            if value >= 0 && !text.starts_with('+') {
                let saved = self.pos;
                if let Ok(gen) = self.read_uint() {
                    if self.accept_keyword(b"R") {
                        if let (Ok(id), Ok(gen)) = (u32::try_from(value), u16::try_from(gen)) {
                            return Ok(Object::Reference(ObjRef::new(id, gen)));
                        }
                    }
                }
                self.pos = saved;
            }
            return Ok(Object::Integer(value));
        }

        if text.parse::<f64>().is_ok() {
            return Ok(Object::Real(text.to_string()));
        }
        self.pos = start;
        Err(self.error("bad number"))
    }

    fn read_name_body(&mut self) -> Vec<u8> {
        let mut name = Vec::new();
        while let Some(b) = self.peek() {
            if !is_regular(b) {
                break;
            }
            if b == b'#' {
                let hex = self.data.get(self.pos + 1..self.pos + 3);
                if let Some(value) = hex
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    name.push(value);
                    self.pos += 3;
                    continue;
                }
            }
            name.push(b);
            self.pos += 1;
        }
        name
    }

    fn read_literal_string(&mut self) -> DecodeResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut depth = 1usize;
        loop {
            let b = self.peek().ok_or_else(|| self.error("unterminated string"))?;
            self.pos += 1;
            match b {
                b'(' => {
                    depth += 1;
                    out.push(b);
                }
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                    out.push(b);
                }
                b'\\' => {
                    let c = self.peek().ok_or_else(|| self.error("unterminated string"))?;
                    self.pos += 1;
                    match c {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'0'..=b'7' => {
                            let mut value = u32::from(c - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        value = value * 8 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((value & 0xff) as u8);
                        }
                        b'\r' => {
                            if self.peek() == Some(b'\n') {
                                self.pos += 1;
                            }
                        }
                        b'\n' => {}
                        other => out.push(other),
                    }
                }
                b'\r' => {
                    if self.peek() == Some(b'\n') {
                        self.pos += 1;
                    }
                    out.push(b'\n');
                }
                other => out.push(other),
            }
        }
    }

    fn read_hex_string(&mut self) -> DecodeResult<Vec<u8>> {
        let mut digits = Vec::new();
        loop {
            let b = self.peek().ok_or_else(|| self.error("unterminated hex string"))?;
            self.pos += 1;
            match b {
                b'>' => break,
                b if is_whitespace(b) => {}
                b if b.is_ascii_hexdigit() => digits.push(b),
                _ => return Err(self.error("bad hex string")),
            }
        }
        if digits.len() % 2 == 1 {
            digits.push(b'0');
        }
        hex::decode(&digits).map_err(|_| self.error("bad hex string"))
    }

    fn read_dictionary_body(&mut self) -> DecodeResult<Dictionary> {
        let mut dict = Dictionary::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'>') if self.data.get(self.pos + 1) == Some(&b'>') => {
                    self.pos += 2;
                    return Ok(dict);
                }
                Some(b'/') => {
                    self.pos += 1;
                    let key = self.read_name_body();
                    let value = self.parse_object()?;
                    dict.set(key, value);
                }
                None => return Err(self.error("unterminated dictionary")),
                _ => return Err(self.error("dictionary key is not a name")),
            }
        }
    }

    /// Consume the `stream` keyword and its end-of-line if they come next
    pub fn accept_stream_keyword(&mut self) -> bool {
        if !self.accept_keyword(b"stream") {
            return false;
        }
        match self.peek() {
            Some(b'\r') => {
                self.pos += 1;
                if self.peek() == Some(b'\n') {
                    self.pos += 1;
                }
            }
            Some(b'\n') => self.pos += 1,
            _ => {}
        }
        true
    }

    /// Stream body after `stream`; uses `length` when it lands on `endstream`,
    /// otherwise searches for the keyword
    pub fn read_stream_data(&mut self, length: Option<usize>) -> DecodeResult<Vec<u8>> {
        let start = self.pos;
        if let Some(len) = length {
            if let Some(end) = start.checked_add(len).filter(|&e| e <= self.data.len()) {
                let mut lookahead = Parser::new(self.data, end);
                if lookahead.accept_keyword(b"endstream") {
                    self.pos = lookahead.pos;
                    return Ok(self.data[start..end].to_vec());
                }
            }
        }

        let end = find(&self.data[start..], b"endstream")
            .map(|i| start + i)
            .ok_or_else(|| self.error("stream without endstream"))?;
        let mut body_end = end;
        if body_end > start && self.data[body_end - 1] == b'\n' {
            body_end -= 1;
        }
        if body_end > start && self.data[body_end - 1] == b'\r' {
            body_end -= 1;
        }
        self.pos = end + b"endstream".len();
        Ok(self.data[start..body_end].to_vec())
    }

    /// Parse a direct object that may be followed by a stream body
    pub fn parse_object_or_stream<F>(&mut self, resolve_length: F) -> DecodeResult<Object>
    where
        F: FnOnce(ObjRef) -> Option<usize>,
    {
        let object = self.parse_object()?;
        let Object::Dictionary(dict) = object else {
            return Ok(object);
        };
        if !self.accept_stream_keyword() {
            return Ok(Object::Dictionary(dict));
        }
        let length = match dict.get(b"Length") {
            Some(Object::Integer(n)) => usize::try_from(*n).ok(),
            Some(Object::Reference(r)) => resolve_length(*r),
            _ => None,
        };
        let data = self.read_stream_data(length)?;
        Ok(Object::Stream(Stream::new(dict, data)))
    }
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
