// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Text blobs: byte lists carrying a NUL terminator that is stored on the
//! wire but never part of the view. The bytes are conventionally UTF-8,
//! validated only at the `to_str` edge.

use crate::{Error, ErrorKind, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn from_bytes(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes }
    }

    /// Length in bytes, excluding the NUL terminator.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn to_str(&self) -> Result<&'a str> {
        core::str::from_utf8(self.bytes)
            .map_err(|e| Error::from_kind(ErrorKind::TextContainsNonUtf8Data(e)))
    }

    #[cfg(feature = "alloc")]
    pub fn to_string(&self) -> Result<alloc::string::String> {
        Ok(alloc::string::String::from(self.to_str()?))
    }
}

impl<'a> From<&'a str> for Reader<'a> {
    fn from(text: &'a str) -> Reader<'a> {
        Reader {
            bytes: text.as_bytes(),
        }
    }
}

impl<'a> From<&'a [u8]> for Reader<'a> {
    fn from(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes }
    }
}

impl core::fmt::Debug for Reader<'_> {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match core::str::from_utf8(self.bytes) {
            Ok(s) => write!(fmt, "{s:?}"),
            Err(_) => write!(fmt, "{:?}", self.bytes),
        }
    }
}

/// In-place mutation of a text blob's storage. The storage size is fixed at
/// allocation; `push_str` fills it incrementally.
pub struct Builder<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(bytes: &'a mut [u8]) -> Builder<'a> {
        Builder { bytes, pos: 0 }
    }

    pub(crate) fn with_content(bytes: &'a mut [u8]) -> Builder<'a> {
        let pos = bytes.len();
        Builder { bytes, pos }
    }

    pub(crate) fn fill(&mut self, content: &[u8]) {
        self.bytes[..content.len()].copy_from_slice(content);
        self.pos = content.len();
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Total storage, excluding the NUL terminator.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.pos]
    }

    pub fn push_ascii(&mut self, ascii: u8) {
        assert!(ascii < 128, "not ASCII");
        assert!(self.pos < self.bytes.len(), "text storage exhausted");
        self.bytes[self.pos] = ascii;
        self.pos += 1;
    }

    pub fn push_str(&mut self, string: &str) {
        let bytes = string.as_bytes();
        assert!(
            self.pos + bytes.len() <= self.bytes.len(),
            "text storage exhausted"
        );
        self.bytes[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Zeroes the storage and rewinds.
    pub fn clear(&mut self) {
        for b in self.bytes[..self.pos].iter_mut() {
            *b = 0;
        }
        self.pos = 0;
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            bytes: &mut self.bytes[..],
            pos: self.pos,
        }
    }

    pub fn into_reader(self) -> Reader<'a> {
        Reader {
            bytes: &self.bytes[..self.pos],
        }
    }
}

impl core::fmt::Debug for Builder<'_> {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(fmt, "{s:?}"),
            Err(_) => write!(fmt, "{:?}", self.as_bytes()),
        }
    }
}
