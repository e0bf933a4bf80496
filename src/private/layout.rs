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

//! Traversal of the memory layout, which is also the wire format.
//!
//! Everything here operates directly on segment memory through one-word wire
//! pointers. Readers never trust their input: a malformed pointer, an
//! out-of-bounds target, or an exhausted traversal budget makes the accessor
//! return the caller-supplied default (or an empty view), never an error.
//! Builders own the memory they point into and fail fast on schema
//! mismatches in already-encoded content.

use core::cell::Cell;
use core::ptr;

use crate::private::arena::{BuilderArena, ReaderArena, SegmentId, NULL_ARENA};
use crate::private::mask::Mask;
use crate::private::primitive::{Primitive, WireValue, Zero};
use crate::private::units::*;
use crate::{MessageSize, Result, Word};

use self::ElementSize::*;
use self::WirePointerKind::{Far, List, Other, Struct};

/// The physical encoding of a list's elements.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElementSize {
    fn from_raw(val: u8) -> ElementSize {
        match val {
            0 => Void,
            1 => Bit,
            2 => Byte,
            3 => TwoBytes,
            4 => FourBytes,
            5 => EightBytes,
            6 => Pointer,
            7 => InlineComposite,
            _ => unreachable!("element size is a three-bit field"),
        }
    }
}

pub fn data_bits_per_element(size: ElementSize) -> u32 {
    match size {
        Void => 0,
        Bit => 1,
        Byte => 8,
        TwoBytes => 16,
        FourBytes => 32,
        EightBytes => 64,
        Pointer => 0,
        InlineComposite => 0,
    }
}

pub fn pointer_count_per_element(size: ElementSize) -> u32 {
    match size {
        Pointer => 1,
        _ => 0,
    }
}

/// The shape of a struct: data section words and pointer section size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructSize {
    pub data: u16,
    pub pointers: u16,
}

impl StructSize {
    pub fn total(&self) -> u32 {
        u32::from(self.data) + u32::from(self.pointers) * WORDS_PER_POINTER
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WirePointerKind {
    Struct = 0,
    List = 1,
    Far = 2,
    Other = 3,
}

impl WirePointerKind {
    fn from_raw(val: u8) -> WirePointerKind {
        match val {
            0 => Struct,
            1 => List,
            2 => Far,
            3 => Other,
            _ => unreachable!("pointer kind is a two-bit field"),
        }
    }
}

/// The tag seen through an object view when the pointer kind is not known
/// statically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerType {
    Null,
    Struct,
    List,
}

/// One word describing a struct, a list, or a far-indirected target.
///
/// Offsets are self-relative: an offset of zero points at the word
/// immediately following the pointer. The all-zero word is null.
#[repr(C)]
pub struct WirePointer {
    offset_and_kind: WireValue<u32>,
    upper32bits: WireValue<u32>,
}

impl WirePointer {
    #[inline]
    pub fn kind(&self) -> WirePointerKind {
        WirePointerKind::from_raw((self.offset_and_kind.get() & 3) as u8)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset_and_kind.get() == 0 && self.upper32bits.get() == 0
    }

    /// Resolves the target of a struct or list pointer, verifying that it
    /// stays inside the pointer's own segment.
    #[inline]
    fn target_from_segment(
        &self,
        arena: &dyn ReaderArena,
        segment_id: SegmentId,
    ) -> Option<*const u8> {
        let this_addr: *const u8 = self as *const WirePointer as *const u8;
        let offset = 1 + ((self.offset_and_kind.get() as i32) >> 2);
        arena.check_offset(segment_id, this_addr, offset)
    }

    /// Like `target_from_segment`, but for memory the builder itself wrote.
    #[inline]
    fn mut_target(ptr: *mut WirePointer) -> *mut u8 {
        unsafe {
            let offset = 1 + (((*ptr).offset_and_kind.get() as i32) >> 2);
            (ptr as *mut u8).offset(offset as isize * BYTES_PER_WORD as isize)
        }
    }

    #[inline]
    fn set_kind_and_target(&mut self, kind: WirePointerKind, target: *mut u8) {
        let this_addr: isize = self as *const WirePointer as isize;
        let target_addr: isize = target as isize;
        let offset = ((target_addr - this_addr) / BYTES_PER_WORD as isize) as i32 - 1;
        self.offset_and_kind
            .set(((offset << 2) as u32) | kind as u32);
    }

    #[inline]
    fn set_kind_with_zero_offset(&mut self, kind: WirePointerKind) {
        self.offset_and_kind.set(kind as u32);
    }

    /// An empty struct points one word *behind* its own pointer: offset -1,
    /// both sections zero-sized. This keeps the target in bounds without
    /// allocating anything.
    #[inline]
    fn set_kind_and_target_for_empty_struct(&mut self) {
        self.offset_and_kind.set(0xffff_fffc);
    }

    #[inline]
    fn inline_composite_list_element_count(&self) -> u32 {
        self.offset_and_kind.get() >> 2
    }

    #[inline]
    fn set_kind_and_inline_composite_list_element_count(
        &mut self,
        kind: WirePointerKind,
        element_count: u32,
    ) {
        self.offset_and_kind
            .set((element_count << 2) | kind as u32);
    }

    #[inline]
    fn is_double_far(&self) -> bool {
        (self.offset_and_kind.get() & 4) != 0
    }

    #[inline]
    fn far_position_in_segment(&self) -> u32 {
        self.offset_and_kind.get() >> 3
    }

    #[inline]
    fn set_far(&mut self, is_double_far: bool, position: u32) {
        self.offset_and_kind
            .set((position << 3) | (u32::from(is_double_far) << 2) | Far as u32);
    }

    #[inline]
    fn far_segment_id(&self) -> SegmentId {
        self.upper32bits.get()
    }

    #[inline]
    fn set_far_segment_id(&mut self, segment_id: SegmentId) {
        self.upper32bits.set(segment_id);
    }

    #[inline]
    fn struct_data_size(&self) -> u16 {
        (self.upper32bits.get() & 0xffff) as u16
    }

    #[inline]
    fn struct_pointer_count(&self) -> u16 {
        (self.upper32bits.get() >> 16) as u16
    }

    #[inline]
    fn struct_word_size(&self) -> u32 {
        u32::from(self.struct_data_size())
            + u32::from(self.struct_pointer_count()) * WORDS_PER_POINTER
    }

    #[inline]
    fn set_struct_size(&mut self, size: StructSize) {
        self.upper32bits
            .set(u32::from(size.data) | (u32::from(size.pointers) << 16));
    }

    #[inline]
    fn list_element_size(&self) -> ElementSize {
        ElementSize::from_raw((self.upper32bits.get() & 7) as u8)
    }

    #[inline]
    fn list_element_count(&self) -> u32 {
        self.upper32bits.get() >> 3
    }

    /// For inline-composite lists the count field holds the word count of
    /// the body, excluding the tag word.
    #[inline]
    fn list_inline_composite_word_count(&self) -> u32 {
        self.list_element_count()
    }

    #[inline]
    fn set_list_size_and_count(&mut self, size: ElementSize, count: u32) {
        self.upper32bits.set((count << 3) | size as u32);
    }

    #[inline]
    fn upper32(&self) -> u32 {
        self.upper32bits.get()
    }

    #[inline]
    fn set_upper32(&mut self, value: u32) {
        self.upper32bits.set(value);
    }
}

pub(crate) mod wire_helpers {
    use core::ptr;

    use super::ElementSize::*;
    use super::WirePointerKind::{Far, List, Other, Struct};
    use super::*;
    use crate::private::arena::{BuilderArena, ReaderArena, SegmentId, NULL_ARENA};
    use crate::private::units::*;
    use crate::{Error, ErrorKind, MessageSize, Result, Word};

    #[inline]
    pub fn round_bytes_up_to_words(bytes: u32) -> u32 {
        (bytes + 7) / 8
    }

    #[inline]
    pub fn round_bits_up_to_words(bits: u64) -> u32 {
        ((bits + 63) / 64) as u32
    }

    #[inline]
    pub fn round_bits_up_to_bytes(bits: u64) -> u32 {
        ((bits + 7) / 8) as u32
    }

    /// Bounds-check plus read-limiter charge for `size_in_words` words.
    #[inline]
    pub unsafe fn bounds_check(
        arena: &dyn ReaderArena,
        segment_id: SegmentId,
        start: *const u8,
        size_in_words: usize,
    ) -> bool {
        arena.contains_interval(segment_id, start, size_in_words)
    }

    /// Allocates `amount` words for a new object and points `reff` at them.
    ///
    /// Prefers the segment holding `reff`; if the object must land in a
    /// different segment, `reff` becomes a far pointer and the object is
    /// prefixed with a landing-pad word in its new segment. Any previous
    /// content of the slot is abandoned (zeroed). Returns the pointer word
    /// describing the object (either `reff` or the landing pad), the start
    /// of the object, and the segment it landed in.
    pub unsafe fn allocate(
        arena: &dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        amount: u32,
        kind: WirePointerKind,
    ) -> (*mut WirePointer, *mut u8, SegmentId) {
        if !(*reff).is_null() {
            zero_object(arena, reff, segment_id);
        }

        if amount == 0 && kind == Struct {
            (*reff).set_kind_and_target_for_empty_struct();
            return (reff, reff as *mut u8, segment_id);
        }

        match arena.allocate(segment_id, amount) {
            Some(word_idx) => {
                let (seg_start, _) = arena.get_segment_mut(segment_id);
                let ptr = seg_start.add(word_idx as usize * BYTES_PER_WORD);
                (*reff).set_kind_and_target(kind, ptr);
                (reff, ptr, segment_id)
            }
            None => {
                // The object and its landing pad stay together, so a single
                // far pointer always suffices on this path.
                let amount_plus_ref = amount + WORDS_PER_POINTER;
                let (far_segment_id, word_idx) = arena.allocate_anywhere(amount_plus_ref);
                let (seg_start, _) = arena.get_segment_mut(far_segment_id);
                let pad: *mut WirePointer =
                    seg_start.add(word_idx as usize * BYTES_PER_WORD) as *mut _;
                (*reff).set_far(false, word_idx);
                (*reff).set_far_segment_id(far_segment_id);
                (*pad).set_kind_with_zero_offset(kind);
                (pad, pad.offset(1) as *mut u8, far_segment_id)
            }
        }
    }

    /// Builder-side far resolution. The builder wrote these pointers itself,
    /// so a bad segment id here is a corrupted message and panics.
    pub unsafe fn follow_builder_fars(
        arena: &dyn BuilderArena,
        reff: *mut WirePointer,
        ref_target: *mut u8,
        segment_id: SegmentId,
    ) -> (*mut WirePointer, *mut u8, SegmentId) {
        if (*reff).kind() != Far {
            return (reff, ref_target, segment_id);
        }
        let far_segment_id = (*reff).far_segment_id();
        let (seg_start, _) = arena.get_segment_mut(far_segment_id);
        let pad: *mut WirePointer =
            seg_start.add((*reff).far_position_in_segment() as usize * BYTES_PER_WORD) as *mut _;
        if !(*reff).is_double_far() {
            (pad, WirePointer::mut_target(pad), far_segment_id)
        } else {
            let tag = pad.offset(1);
            let content_segment_id = (*pad).far_segment_id();
            let (content_start, _) = arena.get_segment_mut(content_segment_id);
            let content =
                content_start.add((*pad).far_position_in_segment() as usize * BYTES_PER_WORD);
            (tag, content, content_segment_id)
        }
    }

    /// Reader-side far resolution. Returns the word describing the object,
    /// the object's location, and its segment; `None` degrades to default.
    /// The landing pad words themselves are charged against the read limiter.
    pub unsafe fn follow_fars(
        arena: &dyn ReaderArena,
        reff: *const WirePointer,
        segment_id: SegmentId,
    ) -> Option<(*const WirePointer, *const u8, SegmentId)> {
        if (*reff).kind() != Far {
            let content = (*reff).target_from_segment(arena, segment_id)?;
            return Some((reff, content, segment_id));
        }
        let far_segment_id = (*reff).far_segment_id();
        let (seg_start, _) = arena.get_segment(far_segment_id)?;
        let ptr = seg_start.add((*reff).far_position_in_segment() as usize * BYTES_PER_WORD);
        let pad_words: usize = if (*reff).is_double_far() { 2 } else { 1 };
        if !bounds_check(arena, far_segment_id, ptr, pad_words) {
            return None;
        }
        let pad: *const WirePointer = ptr as *const _;
        if !(*reff).is_double_far() {
            let content = (*pad).target_from_segment(arena, far_segment_id)?;
            Some((pad, content, far_segment_id))
        } else {
            // First pad word is a far pointer to the object; second is the
            // tag describing it.
            let tag = pad.offset(1);
            let content_segment_id = (*pad).far_segment_id();
            let (content_start, _) = arena.get_segment(content_segment_id)?;
            let content =
                content_start.add((*pad).far_position_in_segment() as usize * BYTES_PER_WORD);
            Some((tag, content, content_segment_id))
        }
    }

    /// Zeroes an abandoned object so that the message stays canonicalizable.
    /// Sub-objects are zeroed recursively before the object itself.
    pub unsafe fn zero_object(
        arena: &dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
    ) {
        match (*reff).kind() {
            Struct | List | Other => {
                zero_object_helper(arena, reff, WirePointer::mut_target(reff), segment_id)
            }
            Far => {
                let far_segment_id = (*reff).far_segment_id();
                let (seg_start, _) = arena.get_segment_mut(far_segment_id);
                let pad: *mut WirePointer = seg_start
                    .add((*reff).far_position_in_segment() as usize * BYTES_PER_WORD)
                    as *mut _;
                if (*reff).is_double_far() {
                    let tag = pad.offset(1);
                    let content_segment_id = (*pad).far_segment_id();
                    let (content_start, _) = arena.get_segment_mut(content_segment_id);
                    let content = content_start
                        .add((*pad).far_position_in_segment() as usize * BYTES_PER_WORD);
                    zero_object_helper(arena, tag, content, content_segment_id);
                    ptr::write_bytes(pad as *mut u8, 0u8, 2 * BYTES_PER_WORD);
                } else {
                    zero_object_helper(arena, pad, WirePointer::mut_target(pad), far_segment_id);
                    ptr::write_bytes(pad as *mut u8, 0u8, BYTES_PER_WORD);
                }
            }
        }
    }

    unsafe fn zero_object_helper(
        arena: &dyn BuilderArena,
        tag: *mut WirePointer,
        ptr: *mut u8,
        segment_id: SegmentId,
    ) {
        match (*tag).kind() {
            Other | Far => {}
            Struct => {
                let pointer_section: *mut WirePointer =
                    ptr.add((*tag).struct_data_size() as usize * BYTES_PER_WORD) as *mut _;
                for i in 0..(*tag).struct_pointer_count() as usize {
                    zero_object(arena, pointer_section.add(i), segment_id);
                }
                ptr::write_bytes(ptr, 0u8, (*tag).struct_word_size() as usize * BYTES_PER_WORD);
            }
            List => match (*tag).list_element_size() {
                Void => {}
                Bit | Byte | TwoBytes | FourBytes | EightBytes => {
                    let bits = u64::from((*tag).list_element_count())
                        * u64::from(data_bits_per_element((*tag).list_element_size()));
                    let words = round_bits_up_to_words(bits);
                    ptr::write_bytes(ptr, 0u8, words as usize * BYTES_PER_WORD);
                }
                Pointer => {
                    let count = (*tag).list_element_count() as usize;
                    let pointers = ptr as *mut WirePointer;
                    for i in 0..count {
                        zero_object(arena, pointers.add(i), segment_id);
                    }
                    ptr::write_bytes(ptr, 0u8, count * BYTES_PER_WORD);
                }
                InlineComposite => {
                    let element_tag = ptr as *mut WirePointer;
                    debug_assert!(
                        (*element_tag).kind() == Struct,
                        "composite list tag must describe a struct"
                    );
                    let data_size = (*element_tag).struct_data_size();
                    let pointer_count = (*element_tag).struct_pointer_count();
                    let words_per_element = (*element_tag).struct_word_size();
                    let count = (*element_tag).inline_composite_list_element_count();
                    let mut element = ptr.add(BYTES_PER_WORD);
                    for _ in 0..count {
                        let pointer_section: *mut WirePointer =
                            element.add(data_size as usize * BYTES_PER_WORD) as *mut _;
                        for i in 0..pointer_count as usize {
                            zero_object(arena, pointer_section.add(i), segment_id);
                        }
                        element = element.add(words_per_element as usize * BYTES_PER_WORD);
                    }
                    ptr::write_bytes(
                        ptr,
                        0u8,
                        ((*tag).list_inline_composite_word_count() as usize + 1) * BYTES_PER_WORD,
                    );
                }
            },
        }
    }

    /// Zeroes a pointer word and its landing pad(s), without touching the
    /// object they lead to. Used before re-pointing a parent during upgrades.
    pub unsafe fn zero_pointer_and_fars(
        arena: &dyn BuilderArena,
        reff: *mut WirePointer,
        _segment_id: SegmentId,
    ) {
        if (*reff).kind() == Far {
            let far_segment_id = (*reff).far_segment_id();
            let (seg_start, _) = arena.get_segment_mut(far_segment_id);
            let pad =
                seg_start.add((*reff).far_position_in_segment() as usize * BYTES_PER_WORD);
            let pad_words: usize = if (*reff).is_double_far() { 2 } else { 1 };
            ptr::write_bytes(pad, 0u8, pad_words * BYTES_PER_WORD);
        }
        ptr::write_bytes(reff as *mut u8, 0u8, BYTES_PER_WORD);
    }

    /// Re-points `dst` at the object currently reachable from `src`, without
    /// moving the object. Emits a far pointer (allocating a landing pad in
    /// the object's segment, or a double-far pad anywhere) when the object
    /// lives in a different segment than `dst`.
    pub unsafe fn transfer_pointer(
        arena: &dyn BuilderArena,
        dst_segment_id: SegmentId,
        dst: *mut WirePointer,
        src_segment_id: SegmentId,
        src: *mut WirePointer,
    ) {
        if (*src).is_null() {
            ptr::write_bytes(dst as *mut u8, 0u8, BYTES_PER_WORD);
        } else if (*src).kind() == Far {
            // Far pointers are position independent.
            ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, BYTES_PER_WORD);
        } else {
            transfer_pointer_split(
                arena,
                dst_segment_id,
                dst,
                src_segment_id,
                src,
                WirePointer::mut_target(src),
            );
        }
    }

    unsafe fn transfer_pointer_split(
        arena: &dyn BuilderArena,
        dst_segment_id: SegmentId,
        dst: *mut WirePointer,
        src_segment_id: SegmentId,
        src_tag: *mut WirePointer,
        src_ptr: *mut u8,
    ) {
        if dst_segment_id == src_segment_id {
            (*dst).set_kind_and_target((*src_tag).kind(), src_ptr);
            (*dst).set_upper32((*src_tag).upper32());
            return;
        }
        match arena.allocate(src_segment_id, WORDS_PER_POINTER) {
            Some(landing_pad_word) => {
                let (seg_start, _) = arena.get_segment_mut(src_segment_id);
                let pad: *mut WirePointer =
                    seg_start.add(landing_pad_word as usize * BYTES_PER_WORD) as *mut _;
                (*pad).set_kind_and_target((*src_tag).kind(), src_ptr);
                (*pad).set_upper32((*src_tag).upper32());
                (*dst).set_far(false, landing_pad_word);
                (*dst).set_far_segment_id(src_segment_id);
            }
            None => {
                // The object's segment is full, so the pad cannot sit next
                // to it: fall back to a two-word double-far pad elsewhere.
                let (pad_segment_id, pad_word) = arena.allocate_anywhere(2 * WORDS_PER_POINTER);
                let (pad_seg_start, _) = arena.get_segment_mut(pad_segment_id);
                let pad: *mut WirePointer =
                    pad_seg_start.add(pad_word as usize * BYTES_PER_WORD) as *mut _;
                let (src_seg_start, _) = arena.get_segment_mut(src_segment_id);
                let src_offset_words =
                    (src_ptr as usize - src_seg_start as usize) / BYTES_PER_WORD;
                (*pad).set_far(false, src_offset_words as u32);
                (*pad).set_far_segment_id(src_segment_id);
                let tag = pad.offset(1);
                (*tag).set_kind_with_zero_offset((*src_tag).kind());
                (*tag).set_upper32((*src_tag).upper32());
                (*dst).set_far(true, pad_word);
                (*dst).set_far_segment_id(pad_segment_id);
            }
        }
    }

    pub unsafe fn init_struct_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        size: StructSize,
    ) -> StructBuilder<'a> {
        let (reff, ptr, segment_id) = allocate(arena, reff, segment_id, size.total(), Struct);
        (*reff).set_struct_size(size);
        StructBuilder {
            arena,
            segment_id,
            data: ptr,
            pointers: ptr.add(size.data as usize * BYTES_PER_WORD) as *mut _,
            data_size: u32::from(size.data) * BITS_PER_WORD,
            pointer_count: size.pointers,
        }
    }

    /// Deep-copies a trusted default message into an uninitialized slot.
    unsafe fn copy_message(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: *mut WirePointer,
        default: *const WirePointer,
    ) {
        copy_pointer(
            arena,
            segment_id,
            reff,
            &NULL_ARENA,
            0,
            default,
            i32::MAX,
            false,
        );
    }

    pub unsafe fn get_writable_struct_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<StructBuilder<'a>> {
        if (*reff).is_null() {
            match default {
                None => return Ok(init_struct_pointer(arena, reff, segment_id, size)),
                Some(d) => {
                    let default_ref = d.as_ptr() as *const WirePointer;
                    if (*default_ref).is_null() {
                        return Ok(init_struct_pointer(arena, reff, segment_id, size));
                    }
                    copy_message(arena, segment_id, reff, default_ref);
                }
            }
        }

        let ref_target = WirePointer::mut_target(reff);
        let (old_ref, old_ptr, old_segment_id) =
            follow_builder_fars(arena, reff, ref_target, segment_id);
        if (*old_ref).kind() != Struct {
            return Err(Error::from_kind(ErrorKind::ExistingPointerIsNotAStruct));
        }
        let old_data_size = (*old_ref).struct_data_size();
        let old_pointer_count = (*old_ref).struct_pointer_count();
        let old_pointer_section: *mut WirePointer =
            old_ptr.add(old_data_size as usize * BYTES_PER_WORD) as *mut _;

        if old_data_size >= size.data && old_pointer_count >= size.pointers {
            return Ok(StructBuilder {
                arena,
                segment_id: old_segment_id,
                data: old_ptr,
                pointers: old_pointer_section,
                data_size: u32::from(old_data_size) * BITS_PER_WORD,
                pointer_count: old_pointer_count,
            });
        }

        // The existing struct is too small; move it to a larger allocation.
        // Writes must always land in real storage, so unlike the reader we
        // cannot just project zeros.
        let new_data_size = old_data_size.max(size.data);
        let new_pointer_count = old_pointer_count.max(size.pointers);
        let total_size =
            u32::from(new_data_size) + u32::from(new_pointer_count) * WORDS_PER_POINTER;

        // Clear the slot by hand so allocate() does not zero the object
        // we are about to copy out of.
        zero_pointer_and_fars(arena, reff, segment_id);
        let (new_ref, new_ptr, new_segment_id) =
            allocate(arena, reff, segment_id, total_size, Struct);
        (*new_ref).set_struct_size(StructSize {
            data: new_data_size,
            pointers: new_pointer_count,
        });

        ptr::copy_nonoverlapping(
            old_ptr as *const u8,
            new_ptr,
            old_data_size as usize * BYTES_PER_WORD,
        );
        let new_pointer_section: *mut WirePointer =
            new_ptr.add(new_data_size as usize * BYTES_PER_WORD) as *mut _;
        for i in 0..old_pointer_count as usize {
            transfer_pointer(
                arena,
                new_segment_id,
                new_pointer_section.add(i),
                old_segment_id,
                old_pointer_section.add(i),
            );
        }
        ptr::write_bytes(
            old_ptr,
            0u8,
            (old_data_size as usize + old_pointer_count as usize) * BYTES_PER_WORD,
        );

        Ok(StructBuilder {
            arena,
            segment_id: new_segment_id,
            data: new_ptr,
            pointers: new_pointer_section,
            data_size: u32::from(new_data_size) * BITS_PER_WORD,
            pointer_count: new_pointer_count,
        })
    }

    pub unsafe fn init_list_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        element_count: u32,
        element_size: ElementSize,
    ) -> ListBuilder<'a> {
        assert!(
            element_size != InlineComposite,
            "composite lists are initialized with init_struct_list"
        );
        let data_bits = data_bits_per_element(element_size);
        let pointer_count = pointer_count_per_element(element_size);
        let step = data_bits + pointer_count * BITS_PER_POINTER;
        let word_count = round_bits_up_to_words(u64::from(element_count) * u64::from(step));
        let (reff, ptr, segment_id) = allocate(arena, reff, segment_id, word_count, List);
        (*reff).set_list_size_and_count(element_size, element_count);
        ListBuilder {
            arena,
            segment_id,
            ptr,
            element_count,
            step,
            struct_data_size: data_bits,
            struct_pointer_count: pointer_count as u16,
            element_size,
        }
    }

    pub unsafe fn init_struct_list_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        element_count: u32,
        element_size: StructSize,
    ) -> ListBuilder<'a> {
        let words_per_element = element_size.total();
        let word_count = element_count * words_per_element;
        let (reff, ptr, segment_id) = allocate(
            arena,
            reff,
            segment_id,
            word_count + POINTER_SIZE_IN_WORDS as u32,
            List,
        );
        (*reff).set_list_size_and_count(InlineComposite, word_count);
        let tag: *mut WirePointer = ptr as *mut _;
        (*tag).set_kind_and_inline_composite_list_element_count(Struct, element_count);
        (*tag).set_struct_size(element_size);
        ListBuilder {
            arena,
            segment_id,
            ptr: ptr.add(BYTES_PER_WORD),
            element_count,
            step: words_per_element * BITS_PER_WORD,
            struct_data_size: u32::from(element_size.data) * BITS_PER_WORD,
            struct_pointer_count: element_size.pointers,
            element_size: InlineComposite,
        }
    }

    pub unsafe fn get_writable_list_pointer<'a>(
        arena: &'a dyn BuilderArena,
        orig_ref: *mut WirePointer,
        orig_segment_id: SegmentId,
        element_size: ElementSize,
        default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        assert!(
            element_size != InlineComposite,
            "struct lists are accessed with get_struct_list"
        );
        if (*orig_ref).is_null() {
            match default {
                None => return Ok(ListBuilder::new_default(arena)),
                Some(d) => {
                    let default_ref = d.as_ptr() as *const WirePointer;
                    if (*default_ref).is_null() {
                        return Ok(ListBuilder::new_default(arena));
                    }
                    copy_message(arena, orig_segment_id, orig_ref, default_ref);
                }
            }
        }

        let orig_target = WirePointer::mut_target(orig_ref);
        let (reff, ptr, segment_id) =
            follow_builder_fars(arena, orig_ref, orig_target, orig_segment_id);
        if (*reff).kind() != List {
            return Err(Error::from_kind(ErrorKind::ExistingPointerIsNotAList));
        }
        let old_size = (*reff).list_element_size();
        if (element_size == Bit) != (old_size == Bit) {
            return Err(Error::from_kind(ErrorKind::BitListsAreNotUpgradable));
        }

        if old_size == InlineComposite {
            // A struct list can satisfy a primitive request if the struct's
            // first field is wide enough.
            let tag: *mut WirePointer = ptr as *mut _;
            if (*tag).kind() != Struct {
                return Err(Error::from_kind(ErrorKind::CompositeTagIsNotAStruct));
            }
            let data_size = (*tag).struct_data_size();
            let pointer_count = (*tag).struct_pointer_count();
            match element_size {
                Void => {}
                Byte | TwoBytes | FourBytes | EightBytes => {
                    if data_size < 1 {
                        return Err(Error::from_kind(
                            ErrorKind::ExistingListElementsAreTooNarrow,
                        ));
                    }
                }
                Pointer => {
                    if pointer_count < 1 {
                        return Err(Error::from_kind(
                            ErrorKind::ExistingListElementsAreTooNarrow,
                        ));
                    }
                }
                Bit | InlineComposite => unreachable!(),
            }
            Ok(ListBuilder {
                arena,
                segment_id,
                ptr: ptr.add(BYTES_PER_WORD),
                element_count: (*tag).inline_composite_list_element_count(),
                step: (*tag).struct_word_size() * BITS_PER_WORD,
                struct_data_size: u32::from(data_size) * BITS_PER_WORD,
                struct_pointer_count: pointer_count,
                element_size: InlineComposite,
            })
        } else {
            let old_data_bits = data_bits_per_element(old_size);
            let old_pointer_count = pointer_count_per_element(old_size);
            if old_data_bits < data_bits_per_element(element_size)
                || old_pointer_count < pointer_count_per_element(element_size)
            {
                return Err(Error::from_kind(
                    ErrorKind::ExistingListElementsAreTooNarrow,
                ));
            }
            Ok(ListBuilder {
                arena,
                segment_id,
                ptr,
                element_count: (*reff).list_element_count(),
                step: old_data_bits + old_pointer_count * BITS_PER_POINTER,
                struct_data_size: old_data_bits,
                struct_pointer_count: old_pointer_count as u16,
                element_size: old_size,
            })
        }
    }

    pub unsafe fn get_writable_struct_list_pointer<'a>(
        arena: &'a dyn BuilderArena,
        orig_ref: *mut WirePointer,
        orig_segment_id: SegmentId,
        element_size: StructSize,
        default: Option<&[Word]>,
    ) -> Result<ListBuilder<'a>> {
        if (*orig_ref).is_null() {
            match default {
                None => return Ok(ListBuilder::new_default(arena)),
                Some(d) => {
                    let default_ref = d.as_ptr() as *const WirePointer;
                    if (*default_ref).is_null() {
                        return Ok(ListBuilder::new_default(arena));
                    }
                    copy_message(arena, orig_segment_id, orig_ref, default_ref);
                }
            }
        }

        let orig_target = WirePointer::mut_target(orig_ref);
        let (old_ref, old_ptr, old_segment_id) =
            follow_builder_fars(arena, orig_ref, orig_target, orig_segment_id);
        if (*old_ref).kind() != List {
            return Err(Error::from_kind(ErrorKind::ExistingPointerIsNotAList));
        }
        let old_size = (*old_ref).list_element_size();

        if old_size == InlineComposite {
            let old_tag: *mut WirePointer = old_ptr as *mut _;
            if (*old_tag).kind() != Struct {
                return Err(Error::from_kind(ErrorKind::CompositeTagIsNotAStruct));
            }
            let old_data_size = (*old_tag).struct_data_size();
            let old_pointer_count = (*old_tag).struct_pointer_count();
            let old_words_per_element = (*old_tag).struct_word_size();
            let element_count = (*old_tag).inline_composite_list_element_count();

            if old_data_size >= element_size.data && old_pointer_count >= element_size.pointers {
                return Ok(ListBuilder {
                    arena,
                    segment_id: old_segment_id,
                    ptr: old_ptr.add(BYTES_PER_WORD),
                    element_count,
                    step: old_words_per_element * BITS_PER_WORD,
                    struct_data_size: u32::from(old_data_size) * BITS_PER_WORD,
                    struct_pointer_count: old_pointer_count,
                    element_size: InlineComposite,
                });
            }

            // The elements are too small for the requested struct size.
            // Re-allocate the whole list with grown elements.
            let new_data_size = old_data_size.max(element_size.data);
            let new_pointer_count = old_pointer_count.max(element_size.pointers);
            let words_per_element =
                u32::from(new_data_size) + u32::from(new_pointer_count) * WORDS_PER_POINTER;
            let total_words = element_count * words_per_element;

            zero_pointer_and_fars(arena, orig_ref, orig_segment_id);
            let (new_ref, new_ptr, new_segment_id) = allocate(
                arena,
                orig_ref,
                orig_segment_id,
                total_words + POINTER_SIZE_IN_WORDS as u32,
                List,
            );
            (*new_ref).set_list_size_and_count(InlineComposite, total_words);
            let new_tag: *mut WirePointer = new_ptr as *mut _;
            (*new_tag).set_kind_and_inline_composite_list_element_count(Struct, element_count);
            (*new_tag).set_struct_size(StructSize {
                data: new_data_size,
                pointers: new_pointer_count,
            });

            let mut src = old_ptr.add(BYTES_PER_WORD);
            let mut dst = new_ptr.add(BYTES_PER_WORD);
            for _ in 0..element_count {
                ptr::copy_nonoverlapping(
                    src as *const u8,
                    dst,
                    old_data_size as usize * BYTES_PER_WORD,
                );
                let dst_pointers: *mut WirePointer =
                    dst.add(new_data_size as usize * BYTES_PER_WORD) as *mut _;
                let src_pointers: *mut WirePointer =
                    src.add(old_data_size as usize * BYTES_PER_WORD) as *mut _;
                for i in 0..old_pointer_count as usize {
                    transfer_pointer(
                        arena,
                        new_segment_id,
                        dst_pointers.add(i),
                        old_segment_id,
                        src_pointers.add(i),
                    );
                }
                src = src.add(old_words_per_element as usize * BYTES_PER_WORD);
                dst = dst.add(words_per_element as usize * BYTES_PER_WORD);
            }
            ptr::write_bytes(
                old_ptr,
                0u8,
                (element_count as usize * old_words_per_element as usize + 1) * BYTES_PER_WORD,
            );

            Ok(ListBuilder {
                arena,
                segment_id: new_segment_id,
                ptr: new_ptr.add(BYTES_PER_WORD),
                element_count,
                step: words_per_element * BITS_PER_WORD,
                struct_data_size: u32::from(new_data_size) * BITS_PER_WORD,
                struct_pointer_count: new_pointer_count,
                element_size: InlineComposite,
            })
        } else {
            // A primitive or pointer list was found where a struct list was
            // expected. Upgrade it: each old element becomes field zero of a
            // new struct element.
            if old_size == Bit {
                return Err(Error::from_kind(ErrorKind::BitListsAreNotUpgradable));
            }
            let old_data_bits = data_bits_per_element(old_size);
            let old_pointer_count = pointer_count_per_element(old_size) as u16;
            let old_step = old_data_bits + u32::from(old_pointer_count) * BITS_PER_POINTER;
            let element_count = (*old_ref).list_element_count();

            let new_data_size = element_size
                .data
                .max(round_bits_up_to_words(u64::from(old_data_bits)) as u16);
            let new_pointer_count = element_size.pointers.max(old_pointer_count);
            let words_per_element =
                u32::from(new_data_size) + u32::from(new_pointer_count) * WORDS_PER_POINTER;
            let total_words = element_count * words_per_element;

            zero_pointer_and_fars(arena, orig_ref, orig_segment_id);
            let (new_ref, new_ptr, new_segment_id) = allocate(
                arena,
                orig_ref,
                orig_segment_id,
                total_words + POINTER_SIZE_IN_WORDS as u32,
                List,
            );
            (*new_ref).set_list_size_and_count(InlineComposite, total_words);
            let new_tag: *mut WirePointer = new_ptr as *mut _;
            (*new_tag).set_kind_and_inline_composite_list_element_count(Struct, element_count);
            (*new_tag).set_struct_size(StructSize {
                data: new_data_size,
                pointers: new_pointer_count,
            });

            let mut src = old_ptr;
            let mut dst = new_ptr.add(BYTES_PER_WORD);
            if old_size == Pointer {
                for _ in 0..element_count {
                    let dst_pointer: *mut WirePointer =
                        dst.add(new_data_size as usize * BYTES_PER_WORD) as *mut _;
                    transfer_pointer(
                        arena,
                        new_segment_id,
                        dst_pointer,
                        old_segment_id,
                        src as *mut WirePointer,
                    );
                    src = src.add(BYTES_PER_WORD);
                    dst = dst.add(words_per_element as usize * BYTES_PER_WORD);
                }
            } else if old_size != Void {
                let old_bytes = old_data_bits as usize / 8;
                for _ in 0..element_count {
                    ptr::copy_nonoverlapping(src as *const u8, dst, old_bytes);
                    src = src.add(old_bytes);
                    dst = dst.add(words_per_element as usize * BYTES_PER_WORD);
                }
            }
            ptr::write_bytes(
                old_ptr,
                0u8,
                round_bits_up_to_words(u64::from(element_count) * u64::from(old_step)) as usize
                    * BYTES_PER_WORD,
            );

            Ok(ListBuilder {
                arena,
                segment_id: new_segment_id,
                ptr: new_ptr.add(BYTES_PER_WORD),
                element_count,
                step: words_per_element * BITS_PER_WORD,
                struct_data_size: u32::from(new_data_size) * BITS_PER_WORD,
                struct_pointer_count: new_pointer_count,
                element_size: InlineComposite,
            })
        }
    }

    /// Allocates text storage: `size` content bytes plus a NUL terminator
    /// that is stored but never reported.
    pub unsafe fn init_text_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        size: u32,
    ) -> crate::text::Builder<'a> {
        let byte_size = size + 1;
        let word_count = round_bytes_up_to_words(byte_size);
        let (reff, ptr, _segment_id) = allocate(arena, reff, segment_id, word_count, List);
        (*reff).set_list_size_and_count(Byte, byte_size);
        crate::text::Builder::new(core::slice::from_raw_parts_mut(ptr, size as usize))
    }

    pub unsafe fn set_text_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        value: &[u8],
    ) -> crate::text::Builder<'a> {
        let mut builder = init_text_pointer(arena, reff, segment_id, value.len() as u32);
        builder.fill(value);
        builder
    }

    pub unsafe fn get_writable_text_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        default: Option<&[u8]>,
    ) -> Result<crate::text::Builder<'a>> {
        if (*reff).is_null() {
            match default {
                None => return Ok(crate::text::Builder::new(&mut [])),
                Some(d) => {
                    let mut builder = init_text_pointer(arena, reff, segment_id, d.len() as u32);
                    builder.fill(d);
                    return Ok(builder);
                }
            }
        }
        let ref_target = WirePointer::mut_target(reff);
        let (reff, ptr, _segment_id) = follow_builder_fars(arena, reff, ref_target, segment_id);
        if (*reff).kind() != List || (*reff).list_element_size() != Byte {
            return Err(Error::from_kind(ErrorKind::ExistingPointerIsNotABlob));
        }
        let count = (*reff).list_element_count();
        if count == 0 || *ptr.add(count as usize - 1) != 0 {
            return Err(Error::from_kind(ErrorKind::TextBlobMissingNulTerminator));
        }
        Ok(crate::text::Builder::with_content(
            core::slice::from_raw_parts_mut(ptr, count as usize - 1),
        ))
    }

    pub unsafe fn init_data_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        size: u32,
    ) -> crate::data::Builder<'a> {
        let word_count = round_bytes_up_to_words(size);
        let (reff, ptr, _segment_id) = allocate(arena, reff, segment_id, word_count, List);
        (*reff).set_list_size_and_count(Byte, size);
        core::slice::from_raw_parts_mut(ptr, size as usize)
    }

    pub unsafe fn set_data_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        value: &[u8],
    ) -> crate::data::Builder<'a> {
        let builder = init_data_pointer(arena, reff, segment_id, value.len() as u32);
        builder.copy_from_slice(value);
        builder
    }

    pub unsafe fn get_writable_data_pointer<'a>(
        arena: &'a dyn BuilderArena,
        reff: *mut WirePointer,
        segment_id: SegmentId,
        default: Option<&[u8]>,
    ) -> Result<crate::data::Builder<'a>> {
        if (*reff).is_null() {
            match default {
                None => return Ok(&mut []),
                Some(d) => {
                    let builder = init_data_pointer(arena, reff, segment_id, d.len() as u32);
                    builder.copy_from_slice(d);
                    return Ok(builder);
                }
            }
        }
        let ref_target = WirePointer::mut_target(reff);
        let (reff, ptr, _segment_id) = follow_builder_fars(arena, reff, ref_target, segment_id);
        if (*reff).kind() != List || (*reff).list_element_size() != Byte {
            return Err(Error::from_kind(ErrorKind::ExistingPointerIsNotABlob));
        }
        Ok(core::slice::from_raw_parts_mut(
            ptr,
            (*reff).list_element_count() as usize,
        ))
    }

    /// Deep-copies a struct value into a pointer slot, allocating storage
    /// sized to the value. With `canonicalize`, trailing zero data words and
    /// trailing null pointers are dropped first.
    pub unsafe fn set_struct_pointer(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: *mut WirePointer,
        value: &StructReader,
        canonicalize: bool,
    ) -> *mut u8 {
        let mut data_bytes: u32 = round_bits_up_to_bytes(u64::from(value.data_size));
        let mut pointer_count = value.pointer_count;

        if canonicalize {
            if value.data_size == 1 {
                if !value.get_bool_field(0) {
                    data_bytes = 0;
                }
            } else {
                let mut data_words = value.data_size / BITS_PER_WORD;
                while data_words != 0
                    && value.get_data_field::<u64>(data_words as usize - 1) == 0
                {
                    data_words -= 1;
                }
                data_bytes = data_words * BYTES_PER_WORD as u32;
            }
            while pointer_count != 0
                && value
                    .get_pointer_field(pointer_count as usize - 1)
                    .is_null()
            {
                pointer_count -= 1;
            }
        }

        let data_words = round_bytes_up_to_words(data_bytes);
        let total_size = data_words + u32::from(pointer_count) * WORDS_PER_POINTER;
        let (reff, ptr, segment_id) = allocate(arena, reff, segment_id, total_size, Struct);
        (*reff).set_struct_size(StructSize {
            data: data_words as u16,
            pointers: pointer_count,
        });

        if value.data_size == 1 {
            if data_bytes != 0 {
                *ptr = value.get_bool_field(0) as u8;
            }
        } else if data_bytes != 0 {
            ptr::copy_nonoverlapping(value.data, ptr, data_bytes as usize);
        }

        let pointer_section: *mut WirePointer =
            ptr.add(data_words as usize * BYTES_PER_WORD) as *mut _;
        for i in 0..pointer_count as usize {
            copy_pointer(
                arena,
                segment_id,
                pointer_section.add(i),
                value.arena,
                value.segment_id,
                value.pointers.add(i),
                value.nesting_limit,
                canonicalize,
            );
        }
        ptr
    }

    /// Deep-copies a list value into a pointer slot.
    pub unsafe fn set_list_pointer(
        arena: &dyn BuilderArena,
        segment_id: SegmentId,
        reff: *mut WirePointer,
        value: &ListReader,
        canonicalize: bool,
    ) -> *mut u8 {
        let total_bits = u64::from(value.element_count) * u64::from(value.step);
        let total_words = round_bits_up_to_words(total_bits);

        if value.element_size != InlineComposite {
            let (reff, ptr, segment_id) = allocate(arena, reff, segment_id, total_words, List);
            (*reff).set_list_size_and_count(value.element_size, value.element_count);
            if value.element_size == Pointer {
                let dst_pointers = ptr as *mut WirePointer;
                let src_pointers = value.ptr as *const WirePointer;
                for i in 0..value.element_count as usize {
                    copy_pointer(
                        arena,
                        segment_id,
                        dst_pointers.add(i),
                        value.arena,
                        value.segment_id,
                        src_pointers.add(i),
                        value.nesting_limit,
                        canonicalize,
                    );
                }
            } else {
                let bytes = round_bits_up_to_bytes(total_bits) as usize;
                if bytes != 0 {
                    ptr::copy_nonoverlapping(value.ptr, ptr, bytes);
                }
            }
            return ptr;
        }

        // Struct list. All elements share one size; canonicalization trims
        // it to the widest element actually in use.
        let mut data_words = value.struct_data_size / BITS_PER_WORD;
        let mut pointer_count = value.struct_pointer_count;
        if canonicalize {
            let mut max_data: u32 = 0;
            let mut max_pointers: u16 = 0;
            for i in 0..value.element_count {
                let element = value.get_struct_element(i);
                let mut dw = data_words;
                while dw != 0 && element.get_data_field::<u64>(dw as usize - 1) == 0 {
                    dw -= 1;
                }
                max_data = max_data.max(dw);
                let mut pc = pointer_count;
                while pc != 0 && element.get_pointer_field(pc as usize - 1).is_null() {
                    pc -= 1;
                }
                max_pointers = max_pointers.max(pc);
            }
            data_words = max_data;
            pointer_count = max_pointers;
        }
        let words_per_element = data_words + u32::from(pointer_count) * WORDS_PER_POINTER;
        let body_words = value.element_count * words_per_element;

        let (reff, ptr, segment_id) = allocate(
            arena,
            reff,
            segment_id,
            body_words + POINTER_SIZE_IN_WORDS as u32,
            List,
        );
        (*reff).set_list_size_and_count(InlineComposite, body_words);
        let tag: *mut WirePointer = ptr as *mut _;
        (*tag).set_kind_and_inline_composite_list_element_count(Struct, value.element_count);
        (*tag).set_struct_size(StructSize {
            data: data_words as u16,
            pointers: pointer_count,
        });

        let mut dst = ptr.add(BYTES_PER_WORD);
        for i in 0..value.element_count {
            let element = value.get_struct_element(i);
            if data_words != 0 {
                ptr::copy_nonoverlapping(
                    element.data,
                    dst,
                    data_words as usize * BYTES_PER_WORD,
                );
            }
            let dst_pointers: *mut WirePointer =
                dst.add(data_words as usize * BYTES_PER_WORD) as *mut _;
            for j in 0..pointer_count as usize {
                copy_pointer(
                    arena,
                    segment_id,
                    dst_pointers.add(j),
                    value.arena,
                    value.segment_id,
                    element.pointers.add(j),
                    value.nesting_limit,
                    canonicalize,
                );
            }
            dst = dst.add(words_per_element as usize * BYTES_PER_WORD);
        }
        ptr
    }

    unsafe fn write_null(arena: &dyn BuilderArena, segment_id: SegmentId, dst: *mut WirePointer) {
        if !(*dst).is_null() {
            zero_object(arena, dst, segment_id);
        }
        ptr::write_bytes(dst as *mut u8, 0u8, BYTES_PER_WORD);
    }

    /// Deep-copies whatever `src` points at into `dst`. A null, malformed,
    /// or over-limit source copies as null.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn copy_pointer(
        dst_arena: &dyn BuilderArena,
        dst_segment_id: SegmentId,
        dst: *mut WirePointer,
        src_arena: &dyn ReaderArena,
        src_segment_id: SegmentId,
        src: *const WirePointer,
        nesting_limit: i32,
        canonicalize: bool,
    ) {
        if src.is_null() || (*src).is_null() {
            write_null(dst_arena, dst_segment_id, dst);
            return;
        }
        // The kind is only visible after far resolution.
        let Some((src_tag, _, _)) = follow_fars(src_arena, src, src_segment_id) else {
            write_null(dst_arena, dst_segment_id, dst);
            return;
        };
        match (*src_tag).kind() {
            Struct => {
                let reader =
                    read_struct_pointer(src_arena, src_segment_id, src, None, nesting_limit);
                if reader.data.is_null() && reader.data_size == 0 && reader.pointer_count == 0 {
                    write_null(dst_arena, dst_segment_id, dst);
                } else {
                    set_struct_pointer(dst_arena, dst_segment_id, dst, &reader, canonicalize);
                }
            }
            List => {
                let reader =
                    read_list_pointer(src_arena, src_segment_id, src, None, None, nesting_limit);
                if reader.ptr.is_null() && reader.element_count == 0 {
                    write_null(dst_arena, dst_segment_id, dst);
                } else {
                    set_list_pointer(dst_arena, dst_segment_id, dst, &reader, canonicalize);
                }
            }
            Far | Other => {
                write_null(dst_arena, dst_segment_id, dst);
            }
        }
    }

    /// The word footprint of the object reachable from `reff`, counted the
    /// same way the read limiter counts it.
    pub unsafe fn total_size(
        arena: &dyn ReaderArena,
        segment_id: SegmentId,
        reff: *const WirePointer,
        nesting_limit: i32,
    ) -> MessageSize {
        let mut result = MessageSize { word_count: 0 };
        if reff.is_null() || (*reff).is_null() || nesting_limit <= 0 {
            return result;
        }
        let nesting_limit = nesting_limit - 1;
        let Some((reff, ptr, segment_id)) = follow_fars(arena, reff, segment_id) else {
            return result;
        };
        match (*reff).kind() {
            Struct => {
                let size = (*reff).struct_word_size() as usize;
                if !bounds_check(arena, segment_id, ptr, size) {
                    return result;
                }
                result.word_count += size as u64;
                let pointer_section: *const WirePointer =
                    ptr.add((*reff).struct_data_size() as usize * BYTES_PER_WORD) as *const _;
                for i in 0..(*reff).struct_pointer_count() as usize {
                    result.plus_eq(total_size(
                        arena,
                        segment_id,
                        pointer_section.add(i),
                        nesting_limit,
                    ));
                }
            }
            List => match (*reff).list_element_size() {
                Void => {
                    if !arena.amplified_read(u64::from((*reff).list_element_count())) {
                        return result;
                    }
                }
                Bit | Byte | TwoBytes | FourBytes | EightBytes => {
                    let bits = u64::from((*reff).list_element_count())
                        * u64::from(data_bits_per_element((*reff).list_element_size()));
                    let words = round_bits_up_to_words(bits) as usize;
                    if !bounds_check(arena, segment_id, ptr, words) {
                        return result;
                    }
                    result.word_count += words as u64;
                }
                Pointer => {
                    let count = (*reff).list_element_count() as usize;
                    if !bounds_check(arena, segment_id, ptr, count) {
                        return result;
                    }
                    result.word_count += count as u64;
                    let pointers = ptr as *const WirePointer;
                    for i in 0..count {
                        result.plus_eq(total_size(
                            arena,
                            segment_id,
                            pointers.add(i),
                            nesting_limit,
                        ));
                    }
                }
                InlineComposite => {
                    let word_count = (*reff).list_inline_composite_word_count() as usize;
                    if !bounds_check(arena, segment_id, ptr, word_count + 1) {
                        return result;
                    }
                    result.word_count += word_count as u64 + 1;
                    let tag: *const WirePointer = ptr as *const _;
                    if (*tag).kind() != Struct {
                        return result;
                    }
                    let data_size = (*tag).struct_data_size();
                    let pointer_count = (*tag).struct_pointer_count();
                    let words_per_element = (*tag).struct_word_size();
                    let count = (*tag).inline_composite_list_element_count();
                    if u64::from(words_per_element) * u64::from(count) > word_count as u64 {
                        return result;
                    }
                    if pointer_count > 0 {
                        let mut element = ptr.add(BYTES_PER_WORD);
                        for _ in 0..count {
                            let pointers: *const WirePointer =
                                element.add(data_size as usize * BYTES_PER_WORD) as *const _;
                            for i in 0..pointer_count as usize {
                                result.plus_eq(total_size(
                                    arena,
                                    segment_id,
                                    pointers.add(i),
                                    nesting_limit,
                                ));
                            }
                            element = element.add(words_per_element as usize * BYTES_PER_WORD);
                        }
                    }
                }
            },
            Far | Other => {}
        }
        result
    }

    /// Reads a struct pointer, substituting `default` (a trusted word
    /// stream) or the empty struct when anything is wrong with it.
    pub unsafe fn read_struct_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        reff: *const WirePointer,
        default: Option<&'a [Word]>,
        nesting_limit: i32,
    ) -> StructReader<'a> {
        if !reff.is_null() && !(*reff).is_null() {
            if let Some(reader) = try_read_struct_pointer(arena, segment_id, reff, nesting_limit)
            {
                return reader;
            }
        }
        match default {
            None => StructReader::new_default(),
            Some(d) => {
                let default_ref = d.as_ptr() as *const WirePointer;
                if (*default_ref).is_null() {
                    StructReader::new_default()
                } else {
                    try_read_struct_pointer(&NULL_ARENA, 0, default_ref, i32::MAX)
                        .unwrap_or_else(StructReader::new_default)
                }
            }
        }
    }

    unsafe fn try_read_struct_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        reff: *const WirePointer,
        nesting_limit: i32,
    ) -> Option<StructReader<'a>> {
        // A far pointer is an extra follow: its landing pad counts against
        // the nesting limit just like the object pointer does.
        let cost: i32 = if (*reff).kind() == Far { 2 } else { 1 };
        if nesting_limit < cost {
            return None;
        }
        let (reff, ptr, segment_id) = follow_fars(arena, reff, segment_id)?;
        if (*reff).kind() != Struct {
            return None;
        }
        let data_size_words = (*reff).struct_data_size();
        let pointer_count = (*reff).struct_pointer_count();
        if !bounds_check(arena, segment_id, ptr, (*reff).struct_word_size() as usize) {
            return None;
        }
        Some(StructReader {
            arena,
            segment_id,
            data: ptr,
            pointers: ptr.add(data_size_words as usize * BYTES_PER_WORD) as *const _,
            data_size: u32::from(data_size_words) * BITS_PER_WORD,
            pointer_count,
            nesting_limit: nesting_limit - cost,
        })
    }

    /// Reads a list pointer. `expected_element_size` of `None` accepts any
    /// encoding (used by dynamic traversal and deep copy).
    pub unsafe fn read_list_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        reff: *const WirePointer,
        default: Option<&'a [Word]>,
        expected_element_size: Option<ElementSize>,
        nesting_limit: i32,
    ) -> ListReader<'a> {
        if !reff.is_null() && !(*reff).is_null() {
            if let Some(reader) = try_read_list_pointer(
                arena,
                segment_id,
                reff,
                expected_element_size,
                nesting_limit,
            ) {
                return reader;
            }
        }
        match default {
            None => ListReader::new_default(),
            Some(d) => {
                let default_ref = d.as_ptr() as *const WirePointer;
                if (*default_ref).is_null() {
                    ListReader::new_default()
                } else {
                    try_read_list_pointer(
                        &NULL_ARENA,
                        0,
                        default_ref,
                        expected_element_size,
                        i32::MAX,
                    )
                    .unwrap_or_else(ListReader::new_default)
                }
            }
        }
    }

    unsafe fn try_read_list_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        reff: *const WirePointer,
        expected_element_size: Option<ElementSize>,
        nesting_limit: i32,
    ) -> Option<ListReader<'a>> {
        let cost: i32 = if (*reff).kind() == Far { 2 } else { 1 };
        if nesting_limit < cost {
            return None;
        }
        let (reff, ptr, segment_id) = follow_fars(arena, reff, segment_id)?;
        if (*reff).kind() != List {
            return None;
        }
        let element_size = (*reff).list_element_size();

        // Bit lists are never reinterpretable; everything else projects.
        if let Some(expected) = expected_element_size {
            if (expected == Bit) != (element_size == Bit) {
                return None;
            }
        }

        if element_size == InlineComposite {
            let word_count = (*reff).list_inline_composite_word_count() as usize;
            // The tag word is part of the list and counts against the limit.
            if !bounds_check(arena, segment_id, ptr, word_count + 1) {
                return None;
            }
            let tag: *const WirePointer = ptr as *const _;
            if (*tag).kind() != Struct {
                return None;
            }
            let element_count = (*tag).inline_composite_list_element_count();
            let data_size_words = (*tag).struct_data_size();
            let pointer_count = (*tag).struct_pointer_count();
            let words_per_element = (*tag).struct_word_size();
            if u64::from(words_per_element) * u64::from(element_count) > word_count as u64 {
                return None;
            }
            if words_per_element == 0 && !arena.amplified_read(u64::from(element_count)) {
                return None;
            }
            Some(ListReader {
                arena,
                segment_id,
                ptr: ptr.add(BYTES_PER_WORD),
                element_count,
                step: words_per_element * BITS_PER_WORD,
                struct_data_size: u32::from(data_size_words) * BITS_PER_WORD,
                struct_pointer_count: pointer_count,
                element_size,
                nesting_limit: nesting_limit - cost,
            })
        } else {
            let data_bits = data_bits_per_element(element_size);
            let pointer_count = pointer_count_per_element(element_size);
            let step = data_bits + pointer_count * BITS_PER_POINTER;
            let element_count = (*reff).list_element_count();
            let word_count =
                round_bits_up_to_words(u64::from(element_count) * u64::from(step)) as usize;
            if element_size == Void && !arena.amplified_read(u64::from(element_count)) {
                return None;
            }
            if !bounds_check(arena, segment_id, ptr, word_count) {
                return None;
            }
            Some(ListReader {
                arena,
                segment_id,
                ptr,
                element_count,
                step,
                struct_data_size: data_bits,
                struct_pointer_count: pointer_count as u16,
                element_size,
                nesting_limit: nesting_limit - cost,
            })
        }
    }

    /// Reads a text blob: a byte list whose last byte is NUL. The NUL is
    /// excluded from the view. Malformed blobs degrade to the default.
    pub unsafe fn read_text_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        reff: *const WirePointer,
        default: Option<&'a [u8]>,
    ) -> crate::text::Reader<'a> {
        let fallback = move || crate::text::Reader::from_bytes(default.unwrap_or(&[]));
        if reff.is_null() || (*reff).is_null() {
            return fallback();
        }
        let Some((reff, ptr, segment_id)) = follow_fars(arena, reff, segment_id) else {
            return fallback();
        };
        if (*reff).kind() != List || (*reff).list_element_size() != Byte {
            return fallback();
        }
        let count = (*reff).list_element_count();
        if count == 0
            || !bounds_check(arena, segment_id, ptr, round_bytes_up_to_words(count) as usize)
        {
            return fallback();
        }
        if *ptr.add(count as usize - 1) != 0 {
            return fallback();
        }
        crate::text::Reader::from_bytes(core::slice::from_raw_parts(ptr, count as usize - 1))
    }

    pub unsafe fn read_data_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        reff: *const WirePointer,
        default: Option<&'a [u8]>,
    ) -> crate::data::Reader<'a> {
        let fallback = move || default.unwrap_or(&[]);
        if reff.is_null() || (*reff).is_null() {
            return fallback();
        }
        let Some((reff, ptr, segment_id)) = follow_fars(arena, reff, segment_id) else {
            return fallback();
        };
        if (*reff).kind() != List || (*reff).list_element_size() != Byte {
            return fallback();
        }
        let count = (*reff).list_element_count();
        if !bounds_check(arena, segment_id, ptr, round_bytes_up_to_words(count) as usize) {
            return fallback();
        }
        core::slice::from_raw_parts(ptr, count as usize)
    }
}

/// An untyped reference to a pointer slot in a message being read.
#[derive(Clone, Copy)]
pub struct PointerReader<'a> {
    arena: &'a dyn ReaderArena,
    pointer: *const WirePointer,
    segment_id: SegmentId,
    nesting_limit: i32,
}

impl<'a> PointerReader<'a> {
    pub fn new_default() -> PointerReader<'a> {
        PointerReader {
            arena: &NULL_ARENA,
            pointer: ptr::null(),
            segment_id: 0,
            nesting_limit: 0x7fff_ffff,
        }
    }

    /// The checked entry point: validates that the root word lies within
    /// segment bounds (charging the limiter for it) before exposing it.
    pub fn get_root(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        location: *const u8,
        nesting_limit: i32,
    ) -> PointerReader<'a> {
        if arena.contains_interval(segment_id, location, POINTER_SIZE_IN_WORDS) {
            PointerReader {
                arena,
                pointer: location as *const WirePointer,
                segment_id,
                nesting_limit,
            }
        } else {
            PointerReader::new_default()
        }
    }

    /// The trusted entry point: no bounds checks, no limits. Only for
    /// buffers the caller vouches for, such as compiled-in defaults.
    ///
    /// # Safety
    /// `location` must point at a well-formed, single-segment word stream
    /// that outlives the returned reader.
    pub unsafe fn get_root_unchecked(location: *const u8) -> PointerReader<'static> {
        PointerReader {
            arena: &NULL_ARENA,
            pointer: location as *const WirePointer,
            segment_id: 0,
            nesting_limit: 0x7fff_ffff,
        }
    }

    pub fn is_null(&self) -> bool {
        self.pointer.is_null() || unsafe { (*self.pointer).is_null() }
    }

    pub fn get_pointer_type(&self) -> PointerType {
        if self.is_null() {
            return PointerType::Null;
        }
        unsafe {
            match wire_helpers::follow_fars(self.arena, self.pointer, self.segment_id) {
                None => PointerType::Null,
                Some((reff, _, _)) => match (*reff).kind() {
                    Struct => PointerType::Struct,
                    List => PointerType::List,
                    Far | Other => PointerType::Null,
                },
            }
        }
    }

    pub fn total_size(&self) -> MessageSize {
        unsafe {
            wire_helpers::total_size(self.arena, self.segment_id, self.pointer, self.nesting_limit)
        }
    }

    pub fn get_struct(&self, default: Option<&'a [Word]>) -> StructReader<'a> {
        unsafe {
            wire_helpers::read_struct_pointer(
                self.arena,
                self.segment_id,
                self.pointer,
                default,
                self.nesting_limit,
            )
        }
    }

    pub fn get_list(
        &self,
        expected_element_size: ElementSize,
        default: Option<&'a [Word]>,
    ) -> ListReader<'a> {
        unsafe {
            wire_helpers::read_list_pointer(
                self.arena,
                self.segment_id,
                self.pointer,
                default,
                Some(expected_element_size),
                self.nesting_limit,
            )
        }
    }

    pub fn get_list_any_size(&self, default: Option<&'a [Word]>) -> ListReader<'a> {
        unsafe {
            wire_helpers::read_list_pointer(
                self.arena,
                self.segment_id,
                self.pointer,
                default,
                None,
                self.nesting_limit,
            )
        }
    }

    pub fn get_text(&self, default: Option<&'a [u8]>) -> crate::text::Reader<'a> {
        unsafe {
            wire_helpers::read_text_pointer(self.arena, self.segment_id, self.pointer, default)
        }
    }

    pub fn get_data(&self, default: Option<&'a [u8]>) -> crate::data::Reader<'a> {
        unsafe {
            wire_helpers::read_data_pointer(self.arena, self.segment_id, self.pointer, default)
        }
    }

    /// True if this subtree is laid out in canonical preorder starting at
    /// `read_head`, with all truncatable content truncated.
    pub fn is_canonical(&self, read_head: &Cell<*const u8>) -> bool {
        if self.pointer.is_null() || unsafe { (*self.pointer).is_null() } {
            return true;
        }
        unsafe {
            match (*self.pointer).kind() {
                // Canonical messages are single-segment.
                Far | Other => false,
                Struct => {
                    let st = self.get_struct(None);
                    let mut data_trunc = false;
                    let mut ptr_trunc = false;
                    st.is_canonical(read_head, read_head, &mut data_trunc, &mut ptr_trunc)
                        && data_trunc
                        && ptr_trunc
                }
                List => {
                    let list = self.get_list_any_size(None);
                    list.is_canonical(read_head, self.pointer)
                }
            }
        }
    }
}

/// An untyped reference to a pointer slot in a message being built.
pub struct PointerBuilder<'a> {
    arena: &'a dyn BuilderArena,
    pointer: *mut WirePointer,
    segment_id: SegmentId,
}

impl<'a> PointerBuilder<'a> {
    pub fn get_root(
        arena: &'a dyn BuilderArena,
        segment_id: SegmentId,
        location: *mut u8,
    ) -> PointerBuilder<'a> {
        PointerBuilder {
            arena,
            segment_id,
            pointer: location as *mut WirePointer,
        }
    }

    pub fn reborrow(&mut self) -> PointerBuilder<'_> {
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: self.pointer,
        }
    }

    pub fn is_null(&self) -> bool {
        unsafe { (*self.pointer).is_null() }
    }

    pub fn get_struct(
        self,
        size: StructSize,
        default: Option<&'a [Word]>,
    ) -> Result<StructBuilder<'a>> {
        unsafe {
            wire_helpers::get_writable_struct_pointer(
                self.arena,
                self.pointer,
                self.segment_id,
                size,
                default,
            )
        }
    }

    pub fn get_list(
        self,
        expected_element_size: ElementSize,
        default: Option<&'a [Word]>,
    ) -> Result<ListBuilder<'a>> {
        unsafe {
            wire_helpers::get_writable_list_pointer(
                self.arena,
                self.pointer,
                self.segment_id,
                expected_element_size,
                default,
            )
        }
    }

    pub fn get_struct_list(
        self,
        element_size: StructSize,
        default: Option<&'a [Word]>,
    ) -> Result<ListBuilder<'a>> {
        unsafe {
            wire_helpers::get_writable_struct_list_pointer(
                self.arena,
                self.pointer,
                self.segment_id,
                element_size,
                default,
            )
        }
    }

    pub fn get_text(self, default: Option<&[u8]>) -> Result<crate::text::Builder<'a>> {
        unsafe {
            wire_helpers::get_writable_text_pointer(
                self.arena,
                self.pointer,
                self.segment_id,
                default,
            )
        }
    }

    pub fn get_data(self, default: Option<&[u8]>) -> Result<crate::data::Builder<'a>> {
        unsafe {
            wire_helpers::get_writable_data_pointer(
                self.arena,
                self.pointer,
                self.segment_id,
                default,
            )
        }
    }

    pub fn init_struct(self, size: StructSize) -> StructBuilder<'a> {
        unsafe {
            wire_helpers::init_struct_pointer(self.arena, self.pointer, self.segment_id, size)
        }
    }

    pub fn init_list(self, element_size: ElementSize, element_count: u32) -> ListBuilder<'a> {
        unsafe {
            wire_helpers::init_list_pointer(
                self.arena,
                self.pointer,
                self.segment_id,
                element_count,
                element_size,
            )
        }
    }

    pub fn init_struct_list(
        self,
        element_count: u32,
        element_size: StructSize,
    ) -> ListBuilder<'a> {
        unsafe {
            wire_helpers::init_struct_list_pointer(
                self.arena,
                self.pointer,
                self.segment_id,
                element_count,
                element_size,
            )
        }
    }

    pub fn init_text(self, size: u32) -> crate::text::Builder<'a> {
        unsafe { wire_helpers::init_text_pointer(self.arena, self.pointer, self.segment_id, size) }
    }

    pub fn init_data(self, size: u32) -> crate::data::Builder<'a> {
        unsafe { wire_helpers::init_data_pointer(self.arena, self.pointer, self.segment_id, size) }
    }

    pub fn set_struct(&mut self, value: &StructReader, canonicalize: bool) -> Result<()> {
        unsafe {
            wire_helpers::set_struct_pointer(
                self.arena,
                self.segment_id,
                self.pointer,
                value,
                canonicalize,
            );
        }
        Ok(())
    }

    pub fn set_list(&mut self, value: &ListReader, canonicalize: bool) -> Result<()> {
        unsafe {
            wire_helpers::set_list_pointer(
                self.arena,
                self.segment_id,
                self.pointer,
                value,
                canonicalize,
            );
        }
        Ok(())
    }

    pub fn set_text(&mut self, value: crate::text::Reader<'_>) {
        unsafe {
            wire_helpers::set_text_pointer(
                self.arena,
                self.pointer,
                self.segment_id,
                value.as_bytes(),
            );
        }
    }

    pub fn set_data(&mut self, value: &[u8]) {
        unsafe {
            wire_helpers::set_data_pointer(self.arena, self.pointer, self.segment_id, value);
        }
    }

    /// Deep-copies the subtree behind `other` into this slot.
    pub fn copy_from(&mut self, other: PointerReader<'_>, canonicalize: bool) -> Result<()> {
        unsafe {
            wire_helpers::copy_pointer(
                self.arena,
                self.segment_id,
                self.pointer,
                other.arena,
                other.segment_id,
                other.pointer,
                other.nesting_limit,
                canonicalize,
            );
        }
        Ok(())
    }

    /// Overwrites the slot with null. The previous subtree is zeroed and
    /// becomes unreachable; its words are not reclaimed.
    pub fn clear(&mut self) {
        unsafe {
            wire_helpers::zero_object(self.arena, self.pointer, self.segment_id);
            ptr::write_bytes(self.pointer as *mut u8, 0u8, BYTES_PER_WORD);
        }
    }

    pub fn as_reader(&self) -> PointerReader<'a> {
        PointerReader {
            arena: self.arena.as_reader(),
            pointer: self.pointer as *const WirePointer,
            segment_id: self.segment_id,
            nesting_limit: 0x7fff_ffff,
        }
    }
}

/// A typed view over a struct's data and pointer sections.
///
/// Data reads past the declared size return zero rather than failing; this
/// is what lets an old payload satisfy a newer schema.
#[derive(Clone, Copy)]
pub struct StructReader<'a> {
    arena: &'a dyn ReaderArena,
    data: *const u8,
    pointers: *const WirePointer,
    segment_id: SegmentId,
    data_size: u32,
    pointer_count: u16,
    nesting_limit: i32,
}

impl<'a> StructReader<'a> {
    pub fn new_default() -> StructReader<'a> {
        StructReader {
            arena: &NULL_ARENA,
            data: ptr::null(),
            pointers: ptr::null(),
            segment_id: 0,
            data_size: 0,
            pointer_count: 0,
            nesting_limit: 0x7fff_ffff,
        }
    }

    pub fn get_data_section_size(&self) -> u32 {
        self.data_size
    }

    pub fn get_pointer_section_size(&self) -> u16 {
        self.pointer_count
    }

    /// Reads the field at `offset` (counted in multiples of the field's own
    /// width). Out-of-range reads return zero.
    #[inline]
    pub fn get_data_field<T: Primitive + Zero>(&self, offset: usize) -> T {
        let bits = core::mem::size_of::<T>() * 8;
        if (offset + 1) * bits <= self.data_size as usize {
            unsafe { (*(self.data as *const WireValue<T>).add(offset)).get() }
        } else {
            T::zero()
        }
    }

    /// As `get_data_field`, then XORs with `mask` so that an all-zero slot
    /// reads back as the schema default.
    #[inline]
    pub fn get_data_field_mask<T: Primitive + Zero + Mask>(
        &self,
        offset: usize,
        mask: <T as Mask>::T,
    ) -> T {
        Mask::mask(self.get_data_field(offset), mask)
    }

    #[inline]
    pub fn get_bool_field(&self, offset: usize) -> bool {
        if (offset as u32) < self.data_size {
            unsafe { (*self.data.add(offset / 8) & (1u8 << (offset % 8))) != 0 }
        } else {
            false
        }
    }

    #[inline]
    pub fn get_bool_field_mask(&self, offset: usize, mask: bool) -> bool {
        self.get_bool_field(offset) ^ mask
    }

    pub fn get_pointer_field(&self, index: usize) -> PointerReader<'a> {
        if index < self.pointer_count as usize {
            PointerReader {
                arena: self.arena,
                pointer: unsafe { self.pointers.add(index) },
                segment_id: self.segment_id,
                nesting_limit: self.nesting_limit,
            }
        } else {
            PointerReader::new_default()
        }
    }

    pub fn total_size(&self) -> MessageSize {
        let mut result = MessageSize {
            word_count: u64::from(self.data_size / BITS_PER_WORD)
                + u64::from(self.pointer_count) * u64::from(WORDS_PER_POINTER),
        };
        for i in 0..self.pointer_count as usize {
            result.plus_eq(self.get_pointer_field(i).total_size());
        }
        result
    }

    pub(crate) fn is_canonical(
        &self,
        read_head: &Cell<*const u8>,
        ptr_head: &Cell<*const u8>,
        data_trunc: &mut bool,
        ptr_trunc: &mut bool,
    ) -> bool {
        if self.data_size % BITS_PER_WORD != 0 {
            // Only whole-word structs appear in canonical messages.
            return false;
        }
        if self.data != read_head.get() {
            return false;
        }
        let data_words = self.data_size / BITS_PER_WORD;
        *data_trunc =
            data_words == 0 || self.get_data_field::<u64>(data_words as usize - 1) != 0;
        *ptr_trunc = self.pointer_count == 0
            || !self
                .get_pointer_field(self.pointer_count as usize - 1)
                .is_null();
        read_head.set(unsafe {
            read_head
                .get()
                .add((data_words as usize + self.pointer_count as usize) * BYTES_PER_WORD)
        });
        for i in 0..self.pointer_count as usize {
            if !self.get_pointer_field(i).is_canonical(ptr_head) {
                return false;
            }
        }
        true
    }
}

/// The mutable counterpart of `StructReader`. A builder view is always at
/// least as large as the schema that requested it, so data writes are
/// unconditional.
pub struct StructBuilder<'a> {
    arena: &'a dyn BuilderArena,
    data: *mut u8,
    pointers: *mut WirePointer,
    segment_id: SegmentId,
    data_size: u32,
    pointer_count: u16,
}

impl<'a> StructBuilder<'a> {
    pub fn reborrow(&mut self) -> StructBuilder<'_> {
        StructBuilder {
            arena: self.arena,
            data: self.data,
            pointers: self.pointers,
            segment_id: self.segment_id,
            data_size: self.data_size,
            pointer_count: self.pointer_count,
        }
    }

    pub fn as_reader(&self) -> StructReader<'a> {
        StructReader {
            arena: self.arena.as_reader(),
            data: self.data,
            pointers: self.pointers,
            segment_id: self.segment_id,
            data_size: self.data_size,
            pointer_count: self.pointer_count,
            nesting_limit: 0x7fff_ffff,
        }
    }

    #[inline]
    pub fn set_data_field<T: Primitive>(&self, offset: usize, value: T) {
        debug_assert!((offset + 1) * core::mem::size_of::<T>() * 8 <= self.data_size as usize);
        unsafe { (*(self.data as *mut WireValue<T>).add(offset)).set(value) }
    }

    #[inline]
    pub fn set_data_field_mask<T: Primitive + Mask>(
        &self,
        offset: usize,
        value: T,
        mask: <T as Mask>::T,
    ) {
        self.set_data_field(offset, Mask::mask(value, mask));
    }

    #[inline]
    pub fn get_data_field<T: Primitive + Zero>(&self, offset: usize) -> T {
        let bits = core::mem::size_of::<T>() * 8;
        if (offset + 1) * bits <= self.data_size as usize {
            unsafe { (*(self.data as *const WireValue<T>).add(offset)).get() }
        } else {
            T::zero()
        }
    }

    #[inline]
    pub fn get_data_field_mask<T: Primitive + Zero + Mask>(
        &self,
        offset: usize,
        mask: <T as Mask>::T,
    ) -> T {
        Mask::mask(self.get_data_field(offset), mask)
    }

    #[inline]
    pub fn set_bool_field(&self, offset: usize, value: bool) {
        debug_assert!((offset as u32) < self.data_size);
        unsafe {
            let byte = self.data.add(offset / 8);
            let bit = offset % 8;
            *byte = (*byte & !(1u8 << bit)) | (u8::from(value) << bit);
        }
    }

    #[inline]
    pub fn set_bool_field_mask(&self, offset: usize, value: bool, mask: bool) {
        self.set_bool_field(offset, value ^ mask);
    }

    #[inline]
    pub fn get_bool_field(&self, offset: usize) -> bool {
        if (offset as u32) < self.data_size {
            unsafe { (*self.data.add(offset / 8) & (1u8 << (offset % 8))) != 0 }
        } else {
            false
        }
    }

    #[inline]
    pub fn get_bool_field_mask(&self, offset: usize, mask: bool) -> bool {
        self.get_bool_field(offset) ^ mask
    }

    pub fn get_pointer_field(&self, index: usize) -> PointerBuilder<'a> {
        assert!(index < self.pointer_count as usize, "pointer index out of range");
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: unsafe { self.pointers.add(index) },
        }
    }
}

/// A typed view over a list's elements. Carries a struct projection
/// (`struct_data_size`, `struct_pointer_count`) so that any list can be
/// read as a list of structs.
#[derive(Clone, Copy)]
pub struct ListReader<'a> {
    arena: &'a dyn ReaderArena,
    ptr: *const u8,
    segment_id: SegmentId,
    element_count: u32,
    step: u32,
    struct_data_size: u32,
    struct_pointer_count: u16,
    element_size: ElementSize,
    nesting_limit: i32,
}

impl<'a> ListReader<'a> {
    pub fn new_default() -> ListReader<'a> {
        ListReader {
            arena: &NULL_ARENA,
            ptr: ptr::null(),
            segment_id: 0,
            element_count: 0,
            step: 0,
            struct_data_size: 0,
            struct_pointer_count: 0,
            element_size: Void,
            nesting_limit: 0x7fff_ffff,
        }
    }

    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn get_element_size(&self) -> ElementSize {
        self.element_size
    }

    /// Projects element `index` as a struct view. For primitive lists the
    /// resulting struct has the element as its entire data section.
    pub fn get_struct_element(&self, index: u32) -> StructReader<'a> {
        let offset_bytes = (u64::from(index) * u64::from(self.step) / 8) as usize;
        let data = unsafe { self.ptr.add(offset_bytes) };
        StructReader {
            arena: self.arena,
            segment_id: self.segment_id,
            data,
            pointers: unsafe {
                data.add(self.struct_data_size as usize / 8) as *const WirePointer
            },
            data_size: self.struct_data_size,
            pointer_count: self.struct_pointer_count,
            nesting_limit: self.nesting_limit,
        }
    }

    pub fn get_pointer_element(&self, index: u32) -> PointerReader<'a> {
        if self.struct_pointer_count == 0 || index >= self.element_count {
            return PointerReader::new_default();
        }
        let offset_bytes = (u64::from(index) * u64::from(self.step) / 8) as usize
            + self.struct_data_size as usize / 8;
        PointerReader {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: unsafe { self.ptr.add(offset_bytes) as *const WirePointer },
            nesting_limit: self.nesting_limit,
        }
    }

    /// The raw bytes of the list body. Only meaningful for lists whose
    /// elements are contiguous primitives.
    pub fn into_raw_bytes(self) -> &'a [u8] {
        if self.element_count == 0 {
            return &[];
        }
        let bytes = wire_helpers::round_bits_up_to_bytes(
            u64::from(self.element_count) * u64::from(self.step),
        ) as usize;
        unsafe { core::slice::from_raw_parts(self.ptr, bytes) }
    }

    pub(crate) fn is_canonical(
        &self,
        read_head: &Cell<*const u8>,
        reff: *const WirePointer,
    ) -> bool {
        match self.element_size {
            InlineComposite => {
                // The tag word sits at the read head, elements follow it.
                let tag_loc = read_head.get();
                read_head.set(unsafe { tag_loc.add(BYTES_PER_WORD) });
                if self.ptr != read_head.get() {
                    return false;
                }
                if self.struct_data_size % BITS_PER_WORD != 0 {
                    return false;
                }
                let struct_size = self.struct_data_size / BITS_PER_WORD
                    + u32::from(self.struct_pointer_count);
                let word_count = unsafe { (*reff).list_inline_composite_word_count() };
                if u64::from(struct_size) * u64::from(self.element_count) != u64::from(word_count)
                {
                    return false;
                }
                if struct_size == 0 {
                    return true;
                }
                let list_end = unsafe {
                    read_head
                        .get()
                        .add((self.element_count * struct_size) as usize * BYTES_PER_WORD)
                };
                let pointer_head = Cell::new(list_end);
                let mut list_data_trunc = false;
                let mut list_ptr_trunc = false;
                for index in 0..self.element_count {
                    let mut data_trunc = false;
                    let mut ptr_trunc = false;
                    if !self.get_struct_element(index).is_canonical(
                        read_head,
                        &pointer_head,
                        &mut data_trunc,
                        &mut ptr_trunc,
                    ) {
                        return false;
                    }
                    list_data_trunc |= data_trunc;
                    list_ptr_trunc |= ptr_trunc;
                }
                read_head.set(pointer_head.get());
                list_data_trunc && list_ptr_trunc
            }
            Pointer => {
                if self.ptr != read_head.get() {
                    return false;
                }
                read_head.set(unsafe {
                    read_head
                        .get()
                        .add(self.element_count as usize * BYTES_PER_WORD)
                });
                for index in 0..self.element_count {
                    if !self.get_pointer_element(index).is_canonical(read_head) {
                        return false;
                    }
                }
                true
            }
            _ => {
                if self.ptr != read_head.get() {
                    return false;
                }
                let bit_size = u64::from(self.element_count) * u64::from(self.step);
                let word_size = wire_helpers::round_bits_up_to_words(bit_size);
                let leftover_bits = bit_size % u64::from(BITS_PER_WORD);
                if leftover_bits > 0 {
                    // Padding must be zero.
                    let last_word = unsafe {
                        (*(self
                            .ptr
                            .add((word_size as usize - 1) * BYTES_PER_WORD)
                            as *const WireValue<u64>))
                            .get()
                    };
                    if last_word >> leftover_bits != 0 {
                        return false;
                    }
                }
                read_head.set(unsafe {
                    read_head.get().add(word_size as usize * BYTES_PER_WORD)
                });
                true
            }
        }
    }
}

/// The mutable counterpart of `ListReader`.
pub struct ListBuilder<'a> {
    arena: &'a dyn BuilderArena,
    ptr: *mut u8,
    segment_id: SegmentId,
    element_count: u32,
    step: u32,
    struct_data_size: u32,
    struct_pointer_count: u16,
    element_size: ElementSize,
}

impl<'a> core::fmt::Debug for ListBuilder<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListBuilder")
            .field("ptr", &self.ptr)
            .field("segment_id", &self.segment_id)
            .field("element_count", &self.element_count)
            .field("step", &self.step)
            .field("struct_data_size", &self.struct_data_size)
            .field("struct_pointer_count", &self.struct_pointer_count)
            .field("element_size", &self.element_size)
            .finish()
    }
}

impl<'a> ListBuilder<'a> {
    pub(crate) fn new_default(arena: &'a dyn BuilderArena) -> ListBuilder<'a> {
        ListBuilder {
            arena,
            ptr: ptr::null_mut(),
            segment_id: 0,
            element_count: 0,
            step: 0,
            struct_data_size: 0,
            struct_pointer_count: 0,
            element_size: Void,
        }
    }

    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn get_element_size(&self) -> ElementSize {
        self.element_size
    }

    pub fn reborrow(&mut self) -> ListBuilder<'_> {
        ListBuilder {
            arena: self.arena,
            ptr: self.ptr,
            segment_id: self.segment_id,
            element_count: self.element_count,
            step: self.step,
            struct_data_size: self.struct_data_size,
            struct_pointer_count: self.struct_pointer_count,
            element_size: self.element_size,
        }
    }

    pub fn into_reader(self) -> ListReader<'a> {
        ListReader {
            arena: self.arena.as_reader(),
            ptr: self.ptr,
            segment_id: self.segment_id,
            element_count: self.element_count,
            step: self.step,
            struct_data_size: self.struct_data_size,
            struct_pointer_count: self.struct_pointer_count,
            element_size: self.element_size,
            nesting_limit: 0x7fff_ffff,
        }
    }

    pub fn get_struct_element(&self, index: u32) -> StructBuilder<'a> {
        assert!(index < self.element_count, "element index out of range");
        let offset_bytes = (u64::from(index) * u64::from(self.step) / 8) as usize;
        let data = unsafe { self.ptr.add(offset_bytes) };
        StructBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            data,
            pointers: unsafe { data.add(self.struct_data_size as usize / 8) as *mut WirePointer },
            data_size: self.struct_data_size,
            pointer_count: self.struct_pointer_count,
        }
    }

    pub fn get_pointer_element(&self, index: u32) -> PointerBuilder<'a> {
        assert!(index < self.element_count, "element index out of range");
        assert!(self.struct_pointer_count > 0, "list elements have no pointers");
        let offset_bytes = (u64::from(index) * u64::from(self.step) / 8) as usize
            + self.struct_data_size as usize / 8;
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: unsafe { self.ptr.add(offset_bytes) as *mut WirePointer },
        }
    }

    pub fn as_raw_bytes(&mut self) -> &mut [u8] {
        if self.element_count == 0 {
            return &mut [];
        }
        let bytes = wire_helpers::round_bits_up_to_bytes(
            u64::from(self.element_count) * u64::from(self.step),
        ) as usize;
        unsafe { core::slice::from_raw_parts_mut(self.ptr, bytes) }
    }
}

/// Element access for primitive list encodings. The width check against the
/// list's struct projection is what makes reading an old (narrower or
/// differently-encoded) list yield zeros instead of garbage.
pub trait PrimitiveElement: Sized {
    fn get(list_reader: &ListReader, index: u32) -> Self;
    fn get_from_builder(list_builder: &ListBuilder, index: u32) -> Self;
    fn set(list_builder: &ListBuilder, index: u32, value: Self);
    fn element_size() -> ElementSize;
}

macro_rules! primitive_element_impl(
    ($typ:ty, $size:ident) => (
        impl PrimitiveElement for $typ {
            #[inline]
            fn get(list_reader: &ListReader, index: u32) -> Self {
                let bits = (core::mem::size_of::<$typ>() * 8) as u32;
                if bits > list_reader.struct_data_size {
                    return Zero::zero();
                }
                let offset = (u64::from(index) * u64::from(list_reader.step) / 8) as usize;
                unsafe { (*(list_reader.ptr.add(offset) as *const WireValue<$typ>)).get() }
            }

            #[inline]
            fn get_from_builder(list_builder: &ListBuilder, index: u32) -> Self {
                let bits = (core::mem::size_of::<$typ>() * 8) as u32;
                if bits > list_builder.struct_data_size {
                    return Zero::zero();
                }
                let offset = (u64::from(index) * u64::from(list_builder.step) / 8) as usize;
                unsafe { (*(list_builder.ptr.add(offset) as *const WireValue<$typ>)).get() }
            }

            #[inline]
            fn set(list_builder: &ListBuilder, index: u32, value: Self) {
                debug_assert!(
                    (core::mem::size_of::<$typ>() * 8) as u32 <= list_builder.struct_data_size
                );
                let offset = (u64::from(index) * u64::from(list_builder.step) / 8) as usize;
                unsafe { (*(list_builder.ptr.add(offset) as *mut WireValue<$typ>)).set(value) }
            }

            fn element_size() -> ElementSize {
                ElementSize::$size
            }
        }
    );
);

primitive_element_impl!(u8, Byte);
primitive_element_impl!(i8, Byte);
primitive_element_impl!(u16, TwoBytes);
primitive_element_impl!(i16, TwoBytes);
primitive_element_impl!(u32, FourBytes);
primitive_element_impl!(i32, FourBytes);
primitive_element_impl!(u64, EightBytes);
primitive_element_impl!(i64, EightBytes);
primitive_element_impl!(f32, FourBytes);
primitive_element_impl!(f64, EightBytes);

impl PrimitiveElement for bool {
    #[inline]
    fn get(list_reader: &ListReader, index: u32) -> bool {
        if list_reader.struct_data_size == 0 {
            return false;
        }
        let bit = u64::from(index) * u64::from(list_reader.step);
        unsafe { (*list_reader.ptr.add((bit / 8) as usize) & (1u8 << (bit % 8))) != 0 }
    }

    #[inline]
    fn get_from_builder(list_builder: &ListBuilder, index: u32) -> bool {
        if list_builder.struct_data_size == 0 {
            return false;
        }
        let bit = u64::from(index) * u64::from(list_builder.step);
        unsafe { (*list_builder.ptr.add((bit / 8) as usize) & (1u8 << (bit % 8))) != 0 }
    }

    #[inline]
    fn set(list_builder: &ListBuilder, index: u32, value: bool) {
        debug_assert!(list_builder.struct_data_size >= 1);
        let bit = u64::from(index) * u64::from(list_builder.step);
        unsafe {
            let byte = list_builder.ptr.add((bit / 8) as usize);
            let bit = bit % 8;
            *byte = (*byte & !(1u8 << bit)) | (u8::from(value) << bit);
        }
    }

    fn element_size() -> ElementSize {
        Bit
    }
}

#[cfg(test)]
mod tests {
    use super::wire_helpers;
    use super::ElementSize::*;
    use super::WirePointerKind::*;
    use super::*;
    use crate::message::{ReaderOptions, SegmentArray};
    use crate::private::arena::ReaderArenaImpl;
    use crate::private::units::BYTES_PER_WORD;
    use crate::{word, Word};

    fn arena_for<'a>(
        segments: &'a [&'a [u8]],
        options: ReaderOptions,
    ) -> ReaderArenaImpl<SegmentArray<'a>> {
        ReaderArenaImpl::new(SegmentArray::new(segments), options)
    }

    #[test]
    fn struct_pointer_encoding() {
        let mut words = [Word::default(); 2];
        let bytes = Word::words_to_bytes_mut(&mut words);
        let target = unsafe { bytes.as_mut_ptr().add(BYTES_PER_WORD) };
        let reff = bytes.as_mut_ptr() as *mut WirePointer;
        unsafe {
            (*reff).set_kind_and_target(Struct, target);
            (*reff).set_struct_size(StructSize {
                data: 2,
                pointers: 3,
            });
            assert_eq!((*reff).kind(), Struct);
            assert!(!(*reff).is_null());
            assert_eq!((*reff).struct_data_size(), 2);
            assert_eq!((*reff).struct_pointer_count(), 3);
            assert_eq!((*reff).struct_word_size(), 5);
        }
        // Offset 0 (target immediately follows), kind 0, data 2, pointers 3.
        assert_eq!(words[0], word(0, 0, 0, 0, 2, 0, 3, 0));
    }

    #[test]
    fn list_pointer_encoding() {
        let mut words = [Word::default(); 2];
        let bytes = Word::words_to_bytes_mut(&mut words);
        let target = unsafe { bytes.as_mut_ptr().add(BYTES_PER_WORD) };
        let reff = bytes.as_mut_ptr() as *mut WirePointer;
        unsafe {
            (*reff).set_kind_and_target(List, target);
            (*reff).set_list_size_and_count(TwoBytes, 3);
            assert_eq!((*reff).kind(), List);
            assert_eq!((*reff).list_element_size(), TwoBytes);
            assert_eq!((*reff).list_element_count(), 3);
        }
        assert_eq!(words[0], word(1, 0, 0, 0, 0x1b, 0, 0, 0));
    }

    #[test]
    fn far_pointer_encoding() {
        let mut words = [Word::default(); 1];
        let reff = Word::words_to_bytes_mut(&mut words).as_mut_ptr() as *mut WirePointer;
        unsafe {
            (*reff).set_far(true, 0x123);
            (*reff).set_far_segment_id(7);
            assert_eq!((*reff).kind(), Far);
            assert!((*reff).is_double_far());
            assert_eq!((*reff).far_position_in_segment(), 0x123);
            assert_eq!((*reff).far_segment_id(), 7);
            (*reff).set_far(false, 1);
            assert!(!(*reff).is_double_far());
            assert_eq!((*reff).far_position_in_segment(), 1);
        }
    }

    #[test]
    fn empty_struct_pointer_targets_itself() {
        let mut words = [Word::default(); 1];
        let reff = Word::words_to_bytes_mut(&mut words).as_mut_ptr() as *mut WirePointer;
        unsafe {
            (*reff).set_kind_and_target_for_empty_struct();
            assert_eq!((*reff).kind(), Struct);
            assert!(!(*reff).is_null());
        }
        assert_eq!(words[0], word(0xfc, 0xff, 0xff, 0xff, 0, 0, 0, 0));
    }

    #[test]
    fn raw_data_struct_fields() {
        let segment: &[Word] = &[
            // Root: struct at offset 0, one data word, no pointers.
            word(0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00),
            word(0x78, 0x56, 0x34, 0x12, 0xef, 0xcd, 0xab, 0x89),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let reader =
            PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64).get_struct(None);

        assert_eq!(reader.get_data_field::<u32>(0), 0x1234_5678);
        assert_eq!(reader.get_data_field::<u32>(1), 0x89ab_cdef);
        assert_eq!(reader.get_data_field::<u64>(0), 0x89ab_cdef_1234_5678);
        assert_eq!(reader.get_data_field::<u16>(0), 0x5678);
        assert_eq!(reader.get_data_field::<u8>(0), 0x78);
        // Past the declared data section: zero, never an error.
        assert_eq!(reader.get_data_field::<u32>(2), 0);
        assert_eq!(reader.get_data_field::<u64>(1), 0);
        // Masked reads XOR the stored bits.
        assert_eq!(
            reader.get_data_field_mask::<u32>(0, 0xffff_ffff),
            !0x1234_5678u32
        );
        assert_eq!(reader.get_data_field_mask::<u32>(2, 0xff), 0xff);
        // 0x78 = 0b0111_1000.
        assert!(!reader.get_bool_field(0));
        assert!(reader.get_bool_field(3));
        assert!(!reader.get_bool_field(100));
        // No pointer section at all.
        assert!(reader.get_pointer_field(0).is_null());
        assert!(reader.get_pointer_field(0).get_struct(None).get_pointer_field(0).is_null());
    }

    #[test]
    fn null_root_reads_as_defaults() {
        let segment: &[Word] = &[word(0, 0, 0, 0, 0, 0, 0, 0)];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64);
        assert!(root.is_null());
        assert_eq!(root.get_pointer_type(), PointerType::Null);
        let st = root.get_struct(None);
        assert_eq!(st.get_data_field::<u64>(0), 0);
        assert_eq!(st.get_data_field_mask::<u16>(3, 42), 42);
        assert!(!st.get_bool_field(0));
        assert_eq!(root.get_list(TwoBytes, None).len(), 0);
        assert_eq!(root.get_text(None).len(), 0);
        assert_eq!(root.get_text(Some(b"fallback")).as_bytes(), b"fallback");
        assert_eq!(root.total_size().word_count, 0);
    }

    #[test]
    fn null_pointer_substitutes_trusted_default() {
        let default: &[Word] = &[
            word(0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00),
            word(0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];
        let segment: &[Word] = &[word(0, 0, 0, 0, 0, 0, 0, 0)];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64);
        let st = root.get_struct(Some(default));
        assert_eq!(st.get_data_field::<u32>(0), 42);
    }

    #[test]
    fn out_of_bounds_struct_degrades() {
        // Root claims two data words but the segment only holds one.
        let segment: &[Word] = &[
            word(0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00),
            word(0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let st = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64).get_struct(None);
        assert_eq!(st.get_data_field::<u64>(0), 0);
    }

    #[test]
    fn two_byte_list() {
        let segment: &[Word] = &[
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00),
            word(0x01, 0x00, 0x00, 0x00, 0x1b, 0x00, 0x00, 0x00),
            word(0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let st = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64).get_struct(None);
        let list = st.get_pointer_field(0).get_list(TwoBytes, None);
        assert_eq!(list.len(), 3);
        for (index, expected) in [1u16, 2, 3].iter().enumerate() {
            assert_eq!(
                <u16 as PrimitiveElement>::get(&list, index as u32),
                *expected
            );
        }
        // The slot after the last element is word padding, which is zero.
        assert_eq!(<u16 as PrimitiveElement>::get(&list, 3), 0);
        // Any list projects as a list of structs.
        let second = list.get_struct_element(1);
        assert_eq!(second.get_data_field::<u16>(0), 2);
        assert_eq!(second.get_data_field::<u32>(0), 0);
        assert!(second.get_pointer_field(0).is_null());
    }

    #[test]
    fn wider_expectation_projects_zeros() {
        // A byte list read with four-byte expectations: present bytes are
        // not reinterpreted, missing width reads as zero.
        let segment: &[Word] = &[
            word(0x01, 0x00, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00),
            word(0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let list =
            PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64).get_list(FourBytes, None);
        assert_eq!(list.len(), 4);
        assert_eq!(<u32 as PrimitiveElement>::get(&list, 0), 0);
        assert_eq!(<u8 as PrimitiveElement>::get(&list, 1), 2);
    }

    #[test]
    fn narrower_expectation_reads_low_bits() {
        let segment: &[Word] = &[
            word(0x01, 0x00, 0x00, 0x00, 0x0d, 0x00, 0x00, 0x00),
            word(0x78, 0x56, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let list =
            PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64).get_list(Byte, None);
        assert_eq!(list.len(), 1);
        assert_eq!(<u8 as PrimitiveElement>::get(&list, 0), 0x78);
        assert_eq!(<u64 as PrimitiveElement>::get(&list, 0), 0x1234_5678);
    }

    #[test]
    fn bit_lists_do_not_project() {
        // Bit list where a struct list is expected: empty, not garbage.
        let segment: &[Word] = &[
            word(0x01, 0x00, 0x00, 0x00, 0x19, 0x00, 0x00, 0x00),
            word(0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64);
        assert_eq!(root.get_list(InlineComposite, None).len(), 0);
        assert_eq!(root.get_list(Byte, None).len(), 0);
        // Read with the right expectation, the bits are there.
        let list = root.get_list(Bit, None);
        assert_eq!(list.len(), 3);
        assert!(<bool as PrimitiveElement>::get(&list, 0));
        assert!(!<bool as PrimitiveElement>::get(&list, 1));
        assert!(<bool as PrimitiveElement>::get(&list, 2));
    }

    #[test]
    fn inline_composite_list() {
        let segment: &[Word] = &[
            // List pointer: offset 0, inline composite, four words of body.
            word(0x01, 0x00, 0x00, 0x00, 0x27, 0x00, 0x00, 0x00),
            // Tag: two elements of (data 1, pointers 1).
            word(0x08, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00),
            word(0x0a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
            word(0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let list = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64)
            .get_list(InlineComposite, None);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get_struct_element(0).get_data_field::<u32>(0), 10);
        assert_eq!(list.get_struct_element(1).get_data_field::<u32>(0), 20);
        assert!(list.get_struct_element(0).get_pointer_field(0).is_null());
        // The same list satisfies a primitive expectation on field zero.
        let as_u32 = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64)
            .get_list(FourBytes, None);
        assert_eq!(as_u32.len(), 2);
        assert_eq!(<u32 as PrimitiveElement>::get(&as_u32, 0), 10);
        assert_eq!(<u32 as PrimitiveElement>::get(&as_u32, 1), 20);
    }

    #[test]
    fn depth_bomb_terminates() {
        // A struct whose only pointer is itself.
        let segment: &[Word] = &[
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00),
            word(0xfc, 0xff, 0xff, 0xff, 0x00, 0x00, 0x01, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(
            segments,
            *ReaderOptions::new().traversal_limit_in_words(None),
        );
        let mut reader =
            PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64).get_struct(None);
        let mut follows = 0u32;
        loop {
            let inner = reader.get_pointer_field(0).get_struct(None);
            if inner.get_pointer_section_size() == 0 {
                break;
            }
            follows += 1;
            reader = inner;
            assert!(follows < 1000, "traversal did not terminate");
        }
        // The root follow spent one level of the 64.
        assert_eq!(follows, 63);
    }

    #[test]
    fn read_limiter_degrades_to_defaults() {
        let segment: &[Word] = &[
            word(0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00),
            word(0x78, 0x56, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(
            segments,
            *ReaderOptions::new().traversal_limit_in_words(Some(3)),
        );
        // The root word itself costs one.
        let root = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64);
        // Each re-read of the struct costs its one word again.
        assert_eq!(root.get_struct(None).get_data_field::<u32>(0), 0x1234_5678);
        assert_eq!(root.get_struct(None).get_data_field::<u32>(0), 0x1234_5678);
        // Budget exhausted: same accessor now reads as default.
        assert_eq!(root.get_struct(None).get_data_field::<u32>(0), 0);
        assert_eq!(root.get_struct(None).get_data_field_mask::<u32>(0, 7), 7);
    }

    #[test]
    fn text_blob_requires_nul() {
        let segment: &[Word] = &[
            word(0x01, 0x00, 0x00, 0x00, 0x32, 0x00, 0x00, 0x00),
            word(b'h', b'e', b'l', b'l', b'o', 0x00, 0x00, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64);
        let text = root.get_text(None);
        assert_eq!(text.len(), 5);
        assert_eq!(text.to_str().unwrap(), "hello");

        // Same bytes without the terminator: degrade to default.
        let bad: &[Word] = &[
            word(0x01, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00),
            word(b'h', b'e', b'l', b'l', b'!', 0x00, 0x00, 0x00),
        ];
        let bad_segments: &[&[u8]] = &[Word::words_to_bytes(bad)];
        let arena = arena_for(bad_segments, ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, bad_segments[0].as_ptr(), 64);
        assert_eq!(root.get_text(Some(b"default")).as_bytes(), b"default");
        // A data read of the same pointer is fine; there is no terminator
        // convention for raw bytes.
        assert_eq!(root.get_data(None), b"hell!");
    }

    #[test]
    fn trusted_root_skips_checks() {
        static SEGMENT: [Word; 2] = [
            word(0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00),
            word(0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];
        let root = unsafe {
            PointerReader::get_root_unchecked(SEGMENT.as_ptr() as *const u8)
        };
        assert_eq!(root.get_struct(None).get_data_field::<u32>(0), 42);
    }

    #[test]
    fn total_size_counts_subtree_words() {
        let segment: &[Word] = &[
            word(0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00),
            word(0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
            word(0x01, 0x00, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00),
            word(0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00),
        ];
        let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
        let arena = arena_for(segments, ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, segments[0].as_ptr(), 64);
        // Struct (1 data + 1 pointer) + byte list (1 word).
        assert_eq!(root.total_size().word_count, 3);
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(wire_helpers::round_bytes_up_to_words(0), 0);
        assert_eq!(wire_helpers::round_bytes_up_to_words(1), 1);
        assert_eq!(wire_helpers::round_bytes_up_to_words(8), 1);
        assert_eq!(wire_helpers::round_bytes_up_to_words(9), 2);
        assert_eq!(wire_helpers::round_bits_up_to_words(0), 0);
        assert_eq!(wire_helpers::round_bits_up_to_words(64), 1);
        assert_eq!(wire_helpers::round_bits_up_to_words(65), 2);
        assert_eq!(wire_helpers::round_bits_up_to_bytes(9), 2);
    }
}
