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

//! Untyped root containers for messages.
//!
//! A [`Reader`] wraps borrowed segment buffers and hands out the checked
//! root pointer; a [`Builder`] owns an arena fed by an [`Allocator`] and
//! hands out the writable root. Everything below the root is reached
//! through the accessors in [`crate::private::layout`].

use crate::any_pointer;
use crate::private::arena::{ReaderArena, ReaderArenaImpl};
use crate::private::layout;
use crate::traits::FromPointerReader;

#[cfg(feature = "alloc")]
use crate::private::arena::{BuilderArena, BuilderArenaImpl};
#[cfg(feature = "alloc")]
use crate::private::units::BYTES_PER_WORD;
#[cfg(feature = "alloc")]
use crate::traits::{FromPointerBuilder, SetPointerBuilder};
#[cfg(feature = "alloc")]
use crate::{OutputSegments, Result, Word};

/// Options controlling how much work a reader is willing to do on behalf of
/// a message before it stops trusting it.
#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Bounds the total number of words dereferenced during traversal,
    /// landing pads included. Re-reading the same sub-object counts again.
    /// Protects against amplification attacks: a small message whose
    /// pointers all target the same bytes would otherwise traverse as
    /// something enormous. `None` disables the limit. When the budget runs
    /// out, accessors quietly return defaults.
    pub traversal_limit_in_words: Option<usize>,

    /// Bounds how deeply nested a message may be. Traversal is usually
    /// recursive, so without this a cyclic or very deep message could
    /// overflow the stack. Past the limit, accessors return defaults.
    pub nesting_limit: i32,
}

pub const DEFAULT_READER_OPTIONS: ReaderOptions = ReaderOptions {
    traversal_limit_in_words: Some(8 * 1024 * 1024),
    nesting_limit: 64,
};

impl Default for ReaderOptions {
    fn default() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

impl ReaderOptions {
    pub fn new() -> Self {
        DEFAULT_READER_OPTIONS
    }

    pub fn nesting_limit(&mut self, value: i32) -> &mut Self {
        self.nesting_limit = value;
        self
    }

    pub fn traversal_limit_in_words(&mut self, value: Option<usize>) -> &mut Self {
        self.traversal_limit_in_words = value;
        self
    }
}

/// The source of a reader's segment buffers.
pub trait ReaderSegments {
    /// Gets the segment with index `idx`, or `None` if out of range.
    ///
    /// Segments must be 8-byte aligned unless the `unaligned` feature is
    /// enabled; a misaligned segment reads as absent.
    fn get_segment(&self, idx: u32) -> Option<&[u8]>;

    fn len(&self) -> usize {
        for i in 0.. {
            if self.get_segment(i as u32).is_none() {
                return i;
            }
        }
        unreachable!()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> ReaderSegments for &S
where
    S: ReaderSegments,
{
    fn get_segment(&self, idx: u32) -> Option<&[u8]> {
        (**self).get_segment(idx)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// An array of segments.
pub struct SegmentArray<'a> {
    segments: &'a [&'a [u8]],
}

impl<'a> SegmentArray<'a> {
    pub fn new(segments: &'a [&'a [u8]]) -> SegmentArray<'a> {
        SegmentArray { segments }
    }
}

impl ReaderSegments for SegmentArray<'_> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

impl<'b> ReaderSegments for [&'b [u8]] {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.len()
    }
}

/// A container used to read a message.
pub struct Reader<S>
where
    S: ReaderSegments,
{
    arena: ReaderArenaImpl<S>,
}

impl<S> Reader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            arena: ReaderArenaImpl::new(segments, options),
        }
    }

    fn get_root_internal(&self) -> any_pointer::Reader<'_> {
        match self.arena.get_segment(0) {
            None => any_pointer::Reader::new(layout::PointerReader::new_default()),
            Some((segment_start, _seg_len)) => any_pointer::Reader::new(
                layout::PointerReader::get_root(
                    &self.arena,
                    0,
                    segment_start,
                    self.arena.nesting_limit(),
                ),
            ),
        }
    }

    /// Gets the root of the message, interpreting it as the given type.
    /// An empty or malformed message reads as the type's default value.
    pub fn get_root<'a, T: FromPointerReader<'a>>(&'a self) -> T {
        self.get_root_internal().get_as()
    }

    pub fn into_segments(self) -> S {
        self.arena.into_segments()
    }

    /// Whether the message is in canonical form: one segment, preorder
    /// layout, no gaps, all truncatable zeros truncated.
    pub fn is_canonical(&self) -> bool {
        let Some((segment_start, seg_len)) = self.arena.get_segment(0) else {
            return false;
        };
        if self.arena.get_segment(1).is_some() {
            return false;
        }
        let pointer_reader = layout::PointerReader::get_root(
            &self.arena,
            0,
            segment_start,
            self.arena.nesting_limit(),
        );
        let read_head =
            ::core::cell::Cell::new(unsafe { segment_start.add(crate::private::units::BYTES_PER_WORD) });
        let root_is_canonical = pointer_reader.is_canonical(&read_head);
        let all_words_consumed = (read_head.get() as usize - segment_start as usize)
            / crate::private::units::BYTES_PER_WORD
            == seg_len as usize;
        root_is_canonical && all_words_consumed
    }

    /// Produces the canonical form of this message as a fresh word vector.
    /// Works by copying the message; for a single-copy canonicalization see
    /// [`Builder::set_root_canonical`].
    #[cfg(feature = "alloc")]
    pub fn canonicalize(&self) -> Vec<Word> {
        let root = self.get_root_internal();
        let size = root.target_size().word_count + 1;
        let mut message = Builder::new(HeapAllocator::new().first_segment_words(size as u32));
        message
            .set_root_canonical(root)
            .expect("canonical copy of a readable message");
        let output_segments = message.get_segments_for_output();
        assert_eq!(1, output_segments.len());
        let output = output_segments[0];
        assert!((output.len() / BYTES_PER_WORD) as u64 <= size);
        let mut result = Word::allocate_zeroed_vec(output.len() / BYTES_PER_WORD);
        Word::words_to_bytes_mut(&mut result[..]).copy_from_slice(output);
        result
    }
}

/// An object that allocates memory for a message as it is being built.
/// Implementations are wrapped by the builder arena, which calls
/// `deallocate_segment()` for every allocated segment on drop.
///
/// # Safety
/// Implementations must ensure all of the following:
///   1. The memory returned by `allocate_segment` is initialized to zero.
///   2. The memory remains valid until `deallocate_segment()` is called
///      on it.
///   3. Allocations do not overlap.
///   4. Allocations are 8-byte aligned (or the `unaligned` feature is
///      enabled).
#[cfg(feature = "alloc")]
pub unsafe trait Allocator {
    /// Allocates zeroed memory for a new segment: a pointer to its start
    /// and its length in words, at least `minimum_size`. Allocating more
    /// than the minimum reduces the total number of segments needed; a
    /// reasonable strategy is the maximum of `minimum_size` and twice the
    /// previous segment's size.
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32);

    /// Called once per allocated segment when the arena is torn down.
    /// `words_used` words from the start of the segment may hold non-zero
    /// values; the rest is still zero.
    ///
    /// # Safety
    /// Must only be called with a pointer previously returned from
    /// `allocate_segment`, once, with the matching `word_size`.
    fn deallocate_segment(&mut self, ptr: *mut u8, word_size: u32, words_used: u32);
}

/// A container used to build a message.
#[cfg(feature = "alloc")]
pub struct Builder<A>
where
    A: Allocator,
{
    arena: BuilderArenaImpl<A>,
}

#[cfg(feature = "alloc")]
unsafe impl<A> Send for Builder<A> where A: Send + Allocator {}

#[cfg(feature = "alloc")]
fn _assert_kinds() {
    fn _assert_send<T: Send>() {}
    fn _assert_builder<A: Allocator + Send>() {
        _assert_send::<Builder<A>>();
    }
}

#[cfg(feature = "alloc")]
impl<A> Builder<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            arena: BuilderArenaImpl::new(allocator),
        }
    }

    fn get_root_internal(&mut self) -> any_pointer::Builder<'_> {
        if self.arena.is_empty() {
            self.arena
                .allocate_segment(1)
                .expect("allocate root pointer");
            self.arena.allocate(0, 1).expect("allocate root pointer");
        }
        let (seg_start, _seg_len) = self.arena.get_segment_mut(0);
        any_pointer::Builder::new(layout::PointerBuilder::get_root(&self.arena, 0, seg_start))
    }

    /// Initializes the root as a fresh value of the given type, overwriting
    /// any previous root.
    pub fn init_root<'a, T: FromPointerBuilder<'a>>(&'a mut self) -> T {
        let root = self.get_root_internal();
        root.init_as()
    }

    /// Gets the root, interpreting it as the given type. The existing root
    /// is upgraded in place if it is smaller than the type requires.
    pub fn get_root<'a, T: FromPointerBuilder<'a>>(&'a mut self) -> Result<T> {
        let root = self.get_root_internal();
        root.get_as()
    }

    pub fn get_root_as_reader<'a, T: FromPointerReader<'a>>(&'a self) -> T {
        if self.arena.is_empty() {
            T::get_from_pointer(&layout::PointerReader::new_default(), None)
        } else {
            let root = match self.arena.get_segment(0) {
                None => layout::PointerReader::new_default(),
                Some((segment_start, _len)) => layout::PointerReader::get_root(
                    self.arena.as_reader(),
                    0,
                    segment_start,
                    0x7fff_ffff,
                ),
            };
            T::get_from_pointer(&root, None)
        }
    }

    /// Sets the root to a deep copy of the given value.
    pub fn set_root<From: SetPointerBuilder>(&mut self, value: From) -> Result<()> {
        let root = self.get_root_internal();
        root.set_as(value)
    }

    /// Sets the root to a canonicalized copy of `value`. If this is the
    /// first action taken on this builder, a subsequent
    /// `get_segments_for_output()` returns a single segment holding the
    /// full canonical message.
    pub fn set_root_canonical<From: SetPointerBuilder>(&mut self, value: From) -> Result<()> {
        if self.arena.is_empty() {
            self.arena
                .allocate_segment(1)
                .expect("allocate root pointer");
            self.arena.allocate(0, 1).expect("allocate root pointer");
        }
        let (seg_start, _seg_len) = self.arena.get_segment_mut(0);
        let pointer = layout::PointerBuilder::get_root(&self.arena, 0, seg_start);
        SetPointerBuilder::set_pointer_builder(pointer, value, true)?;
        assert_eq!(self.get_segments_for_output().len(), 1);
        Ok(())
    }

    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        self.arena.get_segments_for_output()
    }

    pub fn into_reader(self) -> Reader<Self> {
        Reader::new(
            self,
            ReaderOptions {
                traversal_limit_in_words: None,
                nesting_limit: i32::MAX,
            },
        )
    }

    /// Retrieves the underlying allocator, returning all currently
    /// allocated segments to it first.
    pub fn into_allocator(self) -> A {
        self.arena.into_allocator()
    }
}

#[cfg(feature = "alloc")]
impl<A> ReaderSegments for Builder<A>
where
    A: Allocator,
{
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get_segments_for_output().get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.get_segments_for_output().len()
    }
}

/// Standard segment allocator, backed by `alloc::alloc::alloc_zeroed()`.
#[cfg(feature = "alloc")]
#[derive(Debug)]
pub struct HeapAllocator {
    // Minimum number of words in the next allocation.
    next_size: u32,

    // How to update next_size after an allocation.
    allocation_strategy: AllocationStrategy,

    // Maximum number of words to allocate.
    max_segment_words: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum AllocationStrategy {
    /// Allocates the same number of words for each segment, to the extent
    /// possible. Primarily useful for exercising cross-segment pointers.
    FixedSize,

    /// Grows each subsequent segment, so that total message size doubles.
    GrowHeuristically,
}

pub const SUGGESTED_FIRST_SEGMENT_WORDS: u32 = 1024;
pub const SUGGESTED_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::GrowHeuristically;

#[cfg(feature = "alloc")]
impl Default for HeapAllocator {
    fn default() -> Self {
        Self {
            next_size: SUGGESTED_FIRST_SEGMENT_WORDS,
            allocation_strategy: SUGGESTED_ALLOCATION_STRATEGY,
            max_segment_words: 1 << 29,
        }
    }
}

#[cfg(feature = "alloc")]
impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size of the initial segment in words, where 1 word = 8 bytes.
    pub fn first_segment_words(mut self, value: u32) -> Self {
        assert!(value <= self.max_segment_words);
        self.next_size = value;
        self
    }

    /// Sets the allocation strategy for segments after the first one.
    pub fn allocation_strategy(mut self, value: AllocationStrategy) -> Self {
        self.allocation_strategy = value;
        self
    }

    /// Sets the maximum number of words allowed in a single allocation.
    pub fn max_segment_words(mut self, value: u32) -> Self {
        assert!(self.next_size <= value);
        self.max_segment_words = value;
        self
    }
}

#[cfg(feature = "alloc")]
unsafe impl Allocator for HeapAllocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32) {
        let size = core::cmp::max(minimum_size, self.next_size);
        let layout =
            alloc::alloc::Layout::from_size_align(size as usize * BYTES_PER_WORD, 8).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        match self.allocation_strategy {
            AllocationStrategy::GrowHeuristically => {
                if size < self.max_segment_words - self.next_size {
                    self.next_size += size;
                } else {
                    self.next_size = self.max_segment_words;
                }
            }
            AllocationStrategy::FixedSize => {}
        }
        (ptr, size)
    }

    fn deallocate_segment(&mut self, ptr: *mut u8, word_size: u32, _words_used: u32) {
        unsafe {
            alloc::alloc::dealloc(
                ptr,
                alloc::alloc::Layout::from_size_align(word_size as usize * BYTES_PER_WORD, 8)
                    .unwrap(),
            );
        }
        self.next_size = SUGGESTED_FIRST_SEGMENT_WORDS;
    }
}

#[cfg(feature = "alloc")]
impl Builder<HeapAllocator> {
    /// A builder whose first segment has length
    /// `SUGGESTED_FIRST_SEGMENT_WORDS`.
    pub fn new_default() -> Self {
        Self::new(HeapAllocator::new())
    }
}

/// An allocator whose first segment is backed by a caller-provided buffer.
///
/// An `Allocator` must hand out zeroed memory, so the buffer is zeroed on
/// construction and any potentially-written prefix is re-zeroed on
/// `deallocate_segment()`. Reusing one `ScratchSpaceHeapAllocator` across
/// messages (via [`Builder::into_allocator`]) avoids paying the full
/// zeroing cost each time.
#[cfg(feature = "alloc")]
pub struct ScratchSpaceHeapAllocator<'a> {
    scratch_space: &'a mut [u8],
    scratch_space_allocated: bool,
    allocator: HeapAllocator,
}

#[cfg(feature = "alloc")]
impl<'a> ScratchSpaceHeapAllocator<'a> {
    /// Writes zeroes into the entire buffer and constructs a new allocator
    /// from it.
    pub fn new(scratch_space: &'a mut [u8]) -> ScratchSpaceHeapAllocator<'a> {
        #[cfg(not(feature = "unaligned"))]
        {
            if scratch_space.as_ptr() as usize % BYTES_PER_WORD != 0 {
                panic!(
                    "Scratch space must be 8-byte aligned, or the \"unaligned\" \
                     feature must be enabled"
                );
            }
        }
        for b in &mut scratch_space[..] {
            *b = 0;
        }
        ScratchSpaceHeapAllocator {
            scratch_space,
            scratch_space_allocated: false,
            allocator: HeapAllocator::new(),
        }
    }

    /// Sets the size of the second segment in words. (The first segment is
    /// the scratch space itself.)
    pub fn second_segment_words(self, value: u32) -> ScratchSpaceHeapAllocator<'a> {
        ScratchSpaceHeapAllocator {
            allocator: self.allocator.first_segment_words(value),
            ..self
        }
    }

    /// Sets the allocation strategy for segments after the second one.
    pub fn allocation_strategy(self, value: AllocationStrategy) -> ScratchSpaceHeapAllocator<'a> {
        ScratchSpaceHeapAllocator {
            allocator: self.allocator.allocation_strategy(value),
            ..self
        }
    }
}

#[cfg(feature = "alloc")]
unsafe impl<'a> Allocator for ScratchSpaceHeapAllocator<'a> {
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32) {
        if (minimum_size as usize) <= (self.scratch_space.len() / BYTES_PER_WORD)
            && !self.scratch_space_allocated
        {
            self.scratch_space_allocated = true;
            (
                self.scratch_space.as_mut_ptr(),
                (self.scratch_space.len() / BYTES_PER_WORD) as u32,
            )
        } else {
            self.allocator.allocate_segment(minimum_size)
        }
    }

    fn deallocate_segment(&mut self, ptr: *mut u8, word_size: u32, words_used: u32) {
        if ptr == self.scratch_space.as_mut_ptr() {
            // Re-zero only the words that may hold non-zero values, so the
            // allocator can be reused.
            unsafe {
                core::ptr::write_bytes(ptr, 0u8, (words_used as usize) * BYTES_PER_WORD);
            }
            self.scratch_space_allocated = false;
        } else {
            self.allocator
                .deallocate_segment(ptr, word_size, words_used);
        }
    }
}

#[cfg(feature = "alloc")]
unsafe impl<'a, A> Allocator for &'a mut A
where
    A: Allocator,
{
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32) {
        (*self).allocate_segment(minimum_size)
    }

    fn deallocate_segment(&mut self, ptr: *mut u8, word_size: u32, words_used: u32) {
        (*self).deallocate_segment(ptr, word_size, words_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_tops_out_at_max_segment_words() {
        let allocation_size = 1 << 24;
        let mut allocator = HeapAllocator::new()
            .max_segment_words((1 << 25) - 1)
            .first_segment_words(allocation_size);

        let (a1, s1) = allocator.allocate_segment(allocation_size);
        let (a2, s2) = allocator.allocate_segment(allocation_size);
        let (a3, s3) = allocator.allocate_segment(allocation_size);

        assert_eq!(s1, allocation_size);
        assert_eq!(s2, allocator.max_segment_words);
        assert_eq!(s3, allocator.max_segment_words);

        allocator.deallocate_segment(a1, s1, 0);
        allocator.deallocate_segment(a2, s2, 0);
        allocator.deallocate_segment(a3, s3, 0);
    }

    #[test]
    fn empty_message_reads_as_defaults() {
        let segments: &[&[u8]] = &[];
        let reader = Reader::new(SegmentArray::new(segments), ReaderOptions::new());
        let root: crate::any_pointer::Reader = reader.get_root();
        assert!(root.is_null());
        let st = root.get_as_struct();
        assert_eq!(st.get_data_field::<u64>(0), 0);
    }

    #[test]
    fn scratch_space_is_reused() {
        let mut buffer = crate::Word::allocate_zeroed_vec(256);
        let buffer_bytes = crate::Word::words_to_bytes_mut(&mut buffer);
        let allocator = ScratchSpaceHeapAllocator::new(buffer_bytes);
        let mut message = Builder::new(allocator);
        message
            .init_root::<crate::any_pointer::Builder>()
            .init_struct(crate::private::layout::StructSize { data: 1, pointers: 0 })
            .set_data_field::<u64>(0, 0xdead_beef);

        let allocator = message.into_allocator();
        let mut message = Builder::new(allocator);
        let root = message
            .init_root::<crate::any_pointer::Builder>()
            .init_struct(crate::private::layout::StructSize { data: 1, pointers: 0 });
        // The slate is clean again.
        assert_eq!(root.get_data_field::<u64>(0), 0);
    }
}
