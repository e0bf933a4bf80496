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

//! # flatwire
//!
//! Runtime layout engine for a zero-copy, schema-driven wire encoding.
//! Messages are word-aligned segment buffers traversed in place through
//! one-word wire pointers; nothing is decoded and nothing is copied on the
//! read path. Generated code and dynamic wrappers consume the accessor
//! surface in [`private::layout`] through the typed entry points in
//! [`message`].

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod any_pointer;
pub mod data;
pub mod message;
pub mod primitive_list;
pub mod private;
pub mod text;
pub mod traits;

use core::fmt;

#[cfg(feature = "alloc")]
use alloc::string::String;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use crate::private::units::BYTES_PER_WORD;

/// Eight bytes, the unit in which all layout arithmetic is done.
///
/// The in-memory representation is exactly the wire representation.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Word {
    raw_content: u64,
}

/// Constructs a `Word` from its bytes in wire (little-endian) order.
pub const fn word(b0: u8, b1: u8, b2: u8, b3: u8, b4: u8, b5: u8, b6: u8, b7: u8) -> Word {
    Word {
        raw_content: u64::from_le_bytes([b0, b1, b2, b3, b4, b5, b6, b7]),
    }
}

impl Word {
    #[cfg(feature = "alloc")]
    pub fn allocate_zeroed_vec(length: usize) -> Vec<Word> {
        alloc::vec![Word { raw_content: 0 }; length]
    }

    pub fn words_to_bytes(words: &[Word]) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * BYTES_PER_WORD)
        }
    }

    pub fn words_to_bytes_mut(words: &mut [Word]) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                words.as_mut_ptr() as *mut u8,
                words.len() * BYTES_PER_WORD,
            )
        }
    }
}

/// The word footprint of an object tree, as counted by the read limiter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageSize {
    pub word_count: u64,
}

impl MessageSize {
    pub fn plus_eq(&mut self, other: MessageSize) {
        self.word_count += other.word_count;
    }
}

/// Things that can go wrong on the builder path.
///
/// The reader path never produces these: readers degrade to default values
/// instead. Builders fail fast when already-encoded content contradicts the
/// schema of the access.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Failed,
    ExistingPointerIsNotAStruct,
    ExistingPointerIsNotAList,
    ExistingPointerIsNotABlob,
    ExistingListElementsAreTooNarrow,
    BitListsAreNotUpgradable,
    CompositeTagIsNotAStruct,
    TextBlobMissingNulTerminator,
    TextContainsNonUtf8Data(core::str::Utf8Error),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(fmt, "failed"),
            Self::ExistingPointerIsNotAStruct => {
                write!(fmt, "existing pointer is not a struct pointer")
            }
            Self::ExistingPointerIsNotAList => {
                write!(fmt, "existing pointer is not a list pointer")
            }
            Self::ExistingPointerIsNotABlob => {
                write!(fmt, "existing pointer is not a byte-list blob")
            }
            Self::ExistingListElementsAreTooNarrow => {
                write!(fmt, "existing list's elements are narrower than expected")
            }
            Self::BitListsAreNotUpgradable => {
                write!(fmt, "bit lists cannot be reinterpreted at another width")
            }
            Self::CompositeTagIsNotAStruct => {
                write!(fmt, "inline-composite list tag does not describe a struct")
            }
            Self::TextBlobMissingNulTerminator => {
                write!(fmt, "text blob is missing its NUL terminator")
            }
            Self::TextContainsNonUtf8Data(e) => {
                write!(fmt, "text blob contains non-UTF-8 data: {e}")
            }
        }
    }
}

pub struct Error {
    pub kind: ErrorKind,
    #[cfg(feature = "alloc")]
    pub extra: String,
}

impl Error {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "alloc")]
            extra: String::new(),
        }
    }

    #[cfg(feature = "alloc")]
    pub fn failed(extra: String) -> Self {
        Self {
            kind: ErrorKind::Failed,
            extra,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "alloc")]
        if !self.extra.is_empty() {
            return write!(fmt, "{}: {}", self.kind, self.extra);
        }
        write!(fmt, "{}", self.kind)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, fmt)
    }
}

// Lets callers append detail with `write!(error, ...)`.
#[cfg(feature = "alloc")]
impl fmt::Write for Error {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.extra.push_str(s);
        Ok(())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// The segments of a finished message, borrowed from its builder arena.
/// Single-segment messages, the common case, avoid a heap allocation.
#[cfg(feature = "alloc")]
pub enum OutputSegments<'a> {
    SingleSegment([&'a [u8]; 1]),
    MultiSegment(Vec<&'a [u8]>),
}

#[cfg(feature = "alloc")]
impl<'a> core::ops::Deref for OutputSegments<'a> {
    type Target = [&'a [u8]];

    fn deref(&self) -> &[&'a [u8]] {
        match self {
            OutputSegments::SingleSegment(s) => s,
            OutputSegments::MultiSegment(v) => v,
        }
    }
}

#[cfg(feature = "alloc")]
impl message::ReaderSegments for OutputSegments<'_> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        let segments: &[&[u8]] = self;
        segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        let segments: &[&[u8]] = self;
        segments.len()
    }
}
