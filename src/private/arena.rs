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

//! Arenas: the set of segments that make up one message.
//!
//! A reader arena is immutable and answers bounds queries, charging the
//! read limiter as it does so. A builder arena additionally hands out
//! fresh words from segment tails, growing the message through its
//! `Allocator` when the existing segments are full.

use crate::message::ReaderOptions;
use crate::message::ReaderSegments;
use crate::private::read_limiter::ReadLimiter;
use crate::private::units::BYTES_PER_WORD;

#[cfg(feature = "alloc")]
use crate::message::Allocator;
#[cfg(feature = "alloc")]
use crate::OutputSegments;
#[cfg(feature = "alloc")]
use crate::Result;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;
#[cfg(feature = "alloc")]
use core::cell::RefCell;
#[cfg(feature = "alloc")]
use core::slice;
#[cfg(feature = "alloc")]
use smallvec::SmallVec;

pub type SegmentId = u32;

/// Read-only view of a message's segments.
///
/// All methods degrade rather than fail: a `None`/`false` answer means the
/// caller should substitute the default value for whatever it was reading.
pub trait ReaderArena {
    /// The segment's start pointer and length in words, or `None` if the id
    /// is unknown or the segment is not word-aligned.
    fn get_segment(&self, id: SegmentId) -> Option<(*const u8, u32)>;

    /// Resolves a self-relative word offset from `start`, verifying the
    /// result stays inside the segment.
    fn check_offset(
        &self,
        segment_id: SegmentId,
        start: *const u8,
        offset_in_words: i32,
    ) -> Option<*const u8>;

    /// Verifies that `size_in_words` words starting at `start` lie within
    /// the segment, and charges the read limiter for them.
    fn contains_interval(&self, segment_id: SegmentId, start: *const u8, size_in_words: usize)
        -> bool;

    /// Charges the read limiter for words that are reachable without being
    /// physically present, e.g. the elements of a void list.
    fn amplified_read(&self, virtual_amount: u64) -> bool;
}

pub struct ReaderArenaImpl<S> {
    segments: S,
    read_limiter: ReadLimiter,
    nesting_limit: i32,
}

impl<S: ReaderSegments> ReaderArenaImpl<S> {
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            segments,
            read_limiter: ReadLimiter::new(options.traversal_limit_in_words),
            nesting_limit: options.nesting_limit,
        }
    }

    pub fn nesting_limit(&self) -> i32 {
        self.nesting_limit
    }

    pub fn into_segments(self) -> S {
        self.segments
    }
}

impl<S: ReaderSegments> ReaderArena for ReaderArenaImpl<S> {
    fn get_segment(&self, id: SegmentId) -> Option<(*const u8, u32)> {
        let seg = self.segments.get_segment(id)?;
        #[cfg(not(feature = "unaligned"))]
        if seg.as_ptr() as usize % BYTES_PER_WORD != 0 {
            return None;
        }
        Some((seg.as_ptr(), (seg.len() / BYTES_PER_WORD) as u32))
    }

    fn check_offset(
        &self,
        segment_id: SegmentId,
        start: *const u8,
        offset_in_words: i32,
    ) -> Option<*const u8> {
        let (segment_start, segment_len) = self.get_segment(segment_id)?;
        let segment_start = segment_start as usize;
        let segment_size = segment_len as usize * BYTES_PER_WORD;
        let start = start as usize;
        if start < segment_start {
            return None;
        }
        let target = (start - segment_start) as i64
            + i64::from(offset_in_words) * BYTES_PER_WORD as i64;
        if target < 0 || target as usize > segment_size {
            return None;
        }
        Some((segment_start + target as usize) as *const u8)
    }

    fn contains_interval(
        &self,
        segment_id: SegmentId,
        start: *const u8,
        size_in_words: usize,
    ) -> bool {
        let Some((segment_start, segment_len)) = self.get_segment(segment_id) else {
            return false;
        };
        let segment_start = segment_start as usize;
        let segment_size = segment_len as usize * BYTES_PER_WORD;
        let start = start as usize;
        let size = size_in_words * BYTES_PER_WORD;
        start >= segment_start
            && start - segment_start <= segment_size
            && segment_size - (start - segment_start) >= size
            && self.read_limiter.can_read(size_in_words)
    }

    fn amplified_read(&self, virtual_amount: u64) -> bool {
        let words = usize::try_from(virtual_amount).unwrap_or(usize::MAX);
        self.read_limiter.can_read(words)
    }
}

/// The arena behind trusted, compiled-in messages such as field defaults.
///
/// Bounds and limits are not checked; the word stream is vouched for by the
/// code that embedded it. Far pointers cannot appear in such messages, so
/// `get_segment` has nothing to resolve.
pub struct NullArena;

pub static NULL_ARENA: NullArena = NullArena;

impl ReaderArena for NullArena {
    fn get_segment(&self, _id: SegmentId) -> Option<(*const u8, u32)> {
        None
    }

    fn check_offset(
        &self,
        _segment_id: SegmentId,
        start: *const u8,
        offset_in_words: i32,
    ) -> Option<*const u8> {
        Some(unsafe { start.offset(offset_in_words as isize * BYTES_PER_WORD as isize) })
    }

    fn contains_interval(
        &self,
        _segment_id: SegmentId,
        _start: *const u8,
        _size_in_words: usize,
    ) -> bool {
        true
    }

    fn amplified_read(&self, _virtual_amount: u64) -> bool {
        true
    }
}

/// Mutable view of a message under construction.
pub trait BuilderArena: ReaderArena {
    /// Takes `amount` words from the tail of the given segment, returning
    /// their word offset within it, or `None` if the segment is full.
    fn allocate(&self, segment_id: SegmentId, amount: u32) -> Option<u32>;

    /// Takes `amount` words from whichever segment has room, growing the
    /// message if none does. Never fails; the allocator aborts on exhaustion.
    fn allocate_anywhere(&self, amount: u32) -> (SegmentId, u32);

    fn get_segment_mut(&self, id: SegmentId) -> (*mut u8, u32);

    fn as_reader(&self) -> &dyn ReaderArena;
}

#[cfg(feature = "alloc")]
pub(crate) struct BuilderSegment {
    ptr: *mut u8,
    capacity: u32,
    allocated: u32,
}

#[cfg(feature = "alloc")]
impl BuilderSegment {
    fn take(&mut self, amount: u32) -> Option<u32> {
        if amount <= self.capacity - self.allocated {
            let offset = self.allocated;
            self.allocated += amount;
            Some(offset)
        } else {
            None
        }
    }
}

#[cfg(feature = "alloc")]
struct BuilderArenaInner<A: Allocator> {
    // `None` only while `into_allocator()` tears the arena down.
    allocator: Option<A>,
    segments: SmallVec<[BuilderSegment; 1]>,
}

#[cfg(feature = "alloc")]
impl<A: Allocator> Drop for BuilderArenaInner<A> {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.as_mut() {
            for seg in &self.segments {
                allocator.deallocate_segment(seg.ptr, seg.capacity, seg.allocated);
            }
        }
    }
}

#[cfg(feature = "alloc")]
pub struct BuilderArenaImpl<A: Allocator> {
    inner: RefCell<BuilderArenaInner<A>>,
}

#[cfg(feature = "alloc")]
impl<A: Allocator> BuilderArenaImpl<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            inner: RefCell::new(BuilderArenaInner {
                allocator: Some(allocator),
                segments: SmallVec::new(),
            }),
        }
    }

    /// Asks the allocator for a new segment of at least `minimum_size` words
    /// and appends it to the message.
    pub fn allocate_segment(&self, minimum_size: u32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let (ptr, capacity) = inner
            .allocator
            .as_mut()
            .expect("arena has an allocator")
            .allocate_segment(minimum_size);
        inner.segments.push(BuilderSegment {
            ptr,
            capacity,
            allocated: 0,
        });
        Ok(())
    }

    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        let inner = self.inner.borrow();
        if inner.segments.len() <= 1 {
            let slice = match inner.segments.first() {
                None => &[][..],
                Some(seg) => unsafe {
                    slice::from_raw_parts(
                        seg.ptr as *const u8,
                        seg.allocated as usize * BYTES_PER_WORD,
                    )
                },
            };
            OutputSegments::SingleSegment([slice])
        } else {
            let mut segments = Vec::with_capacity(inner.segments.len());
            for seg in &inner.segments {
                segments.push(unsafe {
                    slice::from_raw_parts(
                        seg.ptr as *const u8,
                        seg.allocated as usize * BYTES_PER_WORD,
                    )
                });
            }
            OutputSegments::MultiSegment(segments)
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns all segment memory to the allocator and hands the allocator
    /// back, so its buffers can be reused for another message.
    pub fn into_allocator(self) -> A {
        let mut inner = self.inner.into_inner();
        let segments = core::mem::take(&mut inner.segments);
        let mut allocator = inner.allocator.take().expect("arena has an allocator");
        for seg in &segments {
            allocator.deallocate_segment(seg.ptr, seg.capacity, seg.allocated);
        }
        allocator
    }
}

#[cfg(feature = "alloc")]
impl<A: Allocator> ReaderArena for BuilderArenaImpl<A> {
    fn get_segment(&self, id: SegmentId) -> Option<(*const u8, u32)> {
        let inner = self.inner.borrow();
        let seg = inner.segments.get(id as usize)?;
        Some((seg.ptr as *const u8, seg.allocated))
    }

    fn check_offset(
        &self,
        segment_id: SegmentId,
        start: *const u8,
        offset_in_words: i32,
    ) -> Option<*const u8> {
        let (segment_start, segment_len) = self.get_segment(segment_id)?;
        let segment_start = segment_start as usize;
        let segment_size = segment_len as usize * BYTES_PER_WORD;
        let start = start as usize;
        if start < segment_start {
            return None;
        }
        let target = (start - segment_start) as i64
            + i64::from(offset_in_words) * BYTES_PER_WORD as i64;
        if target < 0 || target as usize > segment_size {
            return None;
        }
        Some((segment_start + target as usize) as *const u8)
    }

    fn contains_interval(
        &self,
        segment_id: SegmentId,
        start: *const u8,
        size_in_words: usize,
    ) -> bool {
        // The builder wrote this data itself; there is no read budget.
        let Some((segment_start, segment_len)) = self.get_segment(segment_id) else {
            return false;
        };
        let segment_start = segment_start as usize;
        let segment_size = segment_len as usize * BYTES_PER_WORD;
        let start = start as usize;
        let size = size_in_words * BYTES_PER_WORD;
        start >= segment_start
            && start - segment_start <= segment_size
            && segment_size - (start - segment_start) >= size
    }

    fn amplified_read(&self, _virtual_amount: u64) -> bool {
        true
    }
}

#[cfg(feature = "alloc")]
impl<A: Allocator> BuilderArena for BuilderArenaImpl<A> {
    fn allocate(&self, segment_id: SegmentId, amount: u32) -> Option<u32> {
        self.inner.borrow_mut().segments[segment_id as usize].take(amount)
    }

    fn allocate_anywhere(&self, amount: u32) -> (SegmentId, u32) {
        {
            let mut inner = self.inner.borrow_mut();
            for (id, seg) in inner.segments.iter_mut().enumerate() {
                if let Some(offset) = seg.take(amount) {
                    return (id as SegmentId, offset);
                }
            }
        }
        self.allocate_segment(amount)
            .expect("allocate new segment");
        let mut inner = self.inner.borrow_mut();
        let id = inner.segments.len() - 1;
        let offset = inner.segments[id]
            .take(amount)
            .expect("fresh segment has capacity");
        (id as SegmentId, offset)
    }

    fn get_segment_mut(&self, id: SegmentId) -> (*mut u8, u32) {
        let inner = self.inner.borrow();
        let seg = &inner.segments[id as usize];
        (seg.ptr, seg.capacity)
    }

    fn as_reader(&self) -> &dyn ReaderArena {
        self
    }
}
