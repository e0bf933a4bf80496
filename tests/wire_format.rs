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

//! End-to-end exercises of the wire format through the public surface:
//! building, upgrading, cross-segment pointers, blobs, canonical form.

use flatwire::any_pointer;
use flatwire::message::{self, AllocationStrategy, HeapAllocator, ReaderOptions, SegmentArray};
use flatwire::primitive_list;
use flatwire::private::layout::{ElementSize, PointerType, StructSize};
use flatwire::{word, ErrorKind, Word};

#[test]
fn empty_root_struct_reads_defaults() {
    // A single null word: every accessor yields its default.
    let segment: &[Word] = &[word(0, 0, 0, 0, 0, 0, 0, 0)];
    let segments: &[&[u8]] = &[Word::words_to_bytes(segment)];
    let reader = message::Reader::new(SegmentArray::new(segments), ReaderOptions::new());
    let root: any_pointer::Reader = reader.get_root();
    assert!(root.is_null());
    assert_eq!(root.which(), PointerType::Null);
    let st = root.get_as_struct();
    assert_eq!(st.get_data_field::<i64>(0), 0);
    assert_eq!(st.get_data_field_mask::<u16>(0, 1234), 1234);
    assert!(st.get_pointer_field(7).is_null());
}

#[test]
fn int32_field_round_trip_against_literal_bytes() {
    let mut message = message::Builder::new_default();
    message
        .init_root::<any_pointer::Builder>()
        .init_struct(StructSize {
            data: 1,
            pointers: 0,
        })
        .set_data_field::<i32>(0, 0x1234_5678);

    let segments = message.get_segments_for_output();
    assert_eq!(segments.len(), 1);
    let expected: &[Word] = &[
        word(0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00),
        word(0x78, 0x56, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00),
    ];
    assert_eq!(segments[0], Word::words_to_bytes(expected));

    let reader = message.get_root_as_reader::<any_pointer::Reader>();
    let st = reader.get_as_struct();
    assert_eq!(st.get_data_field::<i32>(0), 0x1234_5678);
    // Beyond the one data word: zero.
    assert_eq!(st.get_data_field::<i32>(2), 0);
}

#[test]
fn bool_default_true_stored_as_zero_bit_flip() {
    let mut message = message::Builder::new_default();
    {
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize {
                data: 1,
                pointers: 0,
            });
        // Schema default is true, so the mask is 1: storing `false` sets
        // the wire bit.
        root.set_bool_field_mask(0, false, true);
        assert!(!root.get_bool_field_mask(0, true));
    }
    let segments = message.get_segments_for_output();
    assert_eq!(segments[0][8], 0x01);

    let reader = message.get_root_as_reader::<any_pointer::Reader>();
    assert!(!reader.get_as_struct().get_bool_field_mask(0, true));
    // An untouched bool field with the same mask reads as the default.
    assert!(reader.get_as_struct().get_bool_field_mask(1, true));
}

#[test]
fn list_of_three_u16() {
    let mut message = message::Builder::new_default();
    {
        let mut list = message
            .init_root::<any_pointer::Builder>()
            .init_as_sized::<primitive_list::Builder<u16>>(3);
        list.set(0, 1);
        list.set(1, 2);
        list.set(2, 3);
    }
    let segments = message.get_segments_for_output();
    let expected: &[Word] = &[
        word(0x01, 0x00, 0x00, 0x00, 0x1b, 0x00, 0x00, 0x00),
        word(0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00),
    ];
    assert_eq!(segments[0], Word::words_to_bytes(expected));

    let reader = message.get_root_as_reader::<primitive_list::Reader<u16>>();
    assert_eq!(reader.len(), 3);
    let collected: Vec<u16> = reader.iter().collect();
    assert_eq!(collected, vec![1, 2, 3]);
    assert_eq!(reader.try_get(3), None);
    assert_eq!(reader.as_slice(), Some(&[1u16, 2, 3][..]));
}

#[test]
fn struct_upgrade_preserves_content() {
    let mut message = message::Builder::new_default();
    {
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize {
                data: 1,
                pointers: 1,
            });
        root.set_data_field::<u32>(0, 0xdead_beef);
        root.get_pointer_field(0).set_text("hi".into());
    }
    {
        // Request a bigger shape: the struct moves, content survives.
        let root = message
            .get_root::<any_pointer::Builder>()
            .unwrap()
            .get_struct(
                StructSize {
                    data: 3,
                    pointers: 2,
                },
                None,
            )
            .unwrap();
        assert_eq!(root.get_data_field::<u32>(0), 0xdead_beef);
        let text = root.get_pointer_field(0).get_text(None).unwrap();
        assert_eq!(text.as_bytes(), b"hi");
        // The grown region is zero.
        assert_eq!(root.get_data_field::<u64>(1), 0);
        assert_eq!(root.get_data_field::<u64>(2), 0);
        assert!(root.get_pointer_field(1).is_null());
        root.set_data_field::<u64>(2, 99);
    }
    let reader = message.get_root_as_reader::<any_pointer::Reader>();
    let st = reader.get_as_struct();
    assert_eq!(st.get_data_field::<u32>(0), 0xdead_beef);
    assert_eq!(st.get_data_field::<u64>(2), 99);
    assert_eq!(st.get_pointer_field(0).get_text(None).as_bytes(), b"hi");
}

#[test]
fn primitive_list_upgrades_to_struct_list() {
    let mut message = message::Builder::new_default();
    {
        let mut list = message
            .init_root::<any_pointer::Builder>()
            .init_as_sized::<primitive_list::Builder<u32>>(2);
        list.set(0, 10);
        list.set(1, 20);
    }
    {
        // A caller now expects structs whose first field is that u32.
        let list = message
            .get_root::<any_pointer::Builder>()
            .unwrap()
            .get_struct_list(
                StructSize {
                    data: 1,
                    pointers: 1,
                },
                None,
            )
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get_struct_element(0).get_data_field::<u32>(0), 10);
        assert_eq!(list.get_struct_element(1).get_data_field::<u32>(0), 20);
        // Everything else in the new elements is zero.
        assert_eq!(list.get_struct_element(0).get_data_field::<u32>(1), 0);
        assert!(list.get_struct_element(0).get_pointer_field(0).is_null());
        list.get_struct_element(1).set_data_field::<u32>(1, 7);
    }
    // The composite list still satisfies the original primitive view.
    let reader = message.get_root_as_reader::<primitive_list::Reader<u32>>();
    assert_eq!(reader.len(), 2);
    assert_eq!(reader.get(0), 10);
    assert_eq!(reader.get(1), 20);
}

#[test]
fn bit_lists_are_not_upgradable() {
    let mut message = message::Builder::new_default();
    {
        let mut list = message
            .init_root::<any_pointer::Builder>()
            .init_as_sized::<primitive_list::Builder<bool>>(3);
        list.set(0, true);
        list.set(2, true);
    }
    let err = message
        .get_root::<any_pointer::Builder>()
        .unwrap()
        .get_struct_list(
            StructSize {
                data: 1,
                pointers: 0,
            },
            None,
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::BitListsAreNotUpgradable);

    let err = message
        .get_root::<any_pointer::Builder>()
        .unwrap()
        .get_list(ElementSize::Byte, None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::BitListsAreNotUpgradable);

    // The list is still intact afterwards.
    let reader = message.get_root_as_reader::<primitive_list::Reader<bool>>();
    assert_eq!(reader.len(), 3);
    assert!(reader.get(0));
    assert!(!reader.get(1));
    assert!(reader.get(2));
}

#[test]
fn kind_mismatch_fails_fast_on_builder() {
    let mut message = message::Builder::new_default();
    message
        .init_root::<any_pointer::Builder>()
        .init_struct(StructSize {
            data: 1,
            pointers: 0,
        });
    let err = message
        .get_root::<any_pointer::Builder>()
        .unwrap()
        .get_list(ElementSize::Byte, None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ExistingPointerIsNotAList);
}

#[test]
fn cross_segment_objects_use_far_pointers() {
    // Tiny fixed-size segments force every allocation into a new segment.
    let allocator = HeapAllocator::new()
        .first_segment_words(2)
        .allocation_strategy(AllocationStrategy::FixedSize);
    let mut message = message::Builder::new(allocator);
    {
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize {
                data: 1,
                pointers: 1,
            });
        root.set_data_field::<u64>(0, 0x0123_4567_89ab_cdef);
        root.get_pointer_field(0).set_text("far far away".into());
    }
    assert!(message.get_segments_for_output().len() > 1);

    let reader = message.into_reader();
    let root: any_pointer::Reader = reader.get_root();
    let st = root.get_as_struct();
    assert_eq!(st.get_data_field::<u64>(0), 0x0123_4567_89ab_cdef);
    assert_eq!(
        st.get_pointer_field(0).get_text(None).to_str().unwrap(),
        "far far away"
    );
}

#[test]
fn upgrade_across_full_segments_uses_double_far() {
    // Segment 0 is filled exactly: root word, a (0 data, 1 pointer)
    // struct, and a two-word text. Upgrading the struct then forces it
    // into a new segment while the text stays behind in the full one, so
    // the transferred text pointer needs a double-far landing pad.
    let allocator = HeapAllocator::new()
        .first_segment_words(4)
        .allocation_strategy(AllocationStrategy::FixedSize);
    let mut message = message::Builder::new(allocator);
    {
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize {
                data: 0,
                pointers: 1,
            });
        root.get_pointer_field(0).set_text("012345678".into());
    }
    {
        let root = message
            .get_root::<any_pointer::Builder>()
            .unwrap()
            .get_struct(
                StructSize {
                    data: 1,
                    pointers: 1,
                },
                None,
            )
            .unwrap();
        root.set_data_field::<u16>(0, 777);
        assert_eq!(
            root.get_pointer_field(0)
                .get_text(None)
                .unwrap()
                .as_bytes(),
            b"012345678"
        );
    }
    assert!(message.get_segments_for_output().len() >= 3);

    let reader = message.into_reader();
    let st = reader.get_root::<any_pointer::Reader>().get_as_struct();
    assert_eq!(st.get_data_field::<u16>(0), 777);
    assert_eq!(
        st.get_pointer_field(0).get_text(None).to_str().unwrap(),
        "012345678"
    );
}

#[test]
fn overwriting_a_pointer_abandons_only_that_subtree() {
    let mut message = message::Builder::new_default();
    {
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize {
                data: 0,
                pointers: 2,
            });
        root.get_pointer_field(0).set_text("doomed".into());
        root.get_pointer_field(1).set_text("survivor".into());
        let mut first = root.get_pointer_field(0);
        first.clear();
        assert!(first.is_null());
    }
    let st = message
        .get_root_as_reader::<any_pointer::Reader>()
        .get_as_struct();
    assert!(st.get_pointer_field(0).is_null());
    assert_eq!(st.get_pointer_field(0).get_text(None).len(), 0);
    assert_eq!(
        st.get_pointer_field(1).get_text(None).to_str().unwrap(),
        "survivor"
    );
}

#[test]
fn text_storage_reserves_nul_terminator() {
    let mut message = message::Builder::new_default();
    {
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize {
                data: 0,
                pointers: 1,
            });
        root.get_pointer_field(0).set_text("hello".into());
    }
    let segments = message.get_segments_for_output();
    let seg = segments[0];
    // Word 1 is the text pointer: byte list of six elements (five content
    // bytes plus the terminator).
    assert_eq!(&seg[8..16], &[0x01, 0x00, 0x00, 0x00, 0x32, 0x00, 0x00, 0x00]);
    assert_eq!(&seg[16..22], b"hello\0");

    // The reported length excludes the terminator.
    let st = message
        .get_root_as_reader::<any_pointer::Reader>()
        .get_as_struct();
    assert_eq!(st.get_pointer_field(0).get_text(None).len(), 5);
    // The same bytes viewed as Data include it.
    assert_eq!(st.get_pointer_field(0).get_data(None).len(), 6);
}

#[test]
fn canonicalization_truncates_trailing_zeros() {
    let mut message = message::Builder::new_default();
    {
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize {
                data: 2,
                pointers: 2,
            });
        root.set_data_field::<u32>(0, 7);
        root.get_pointer_field(0).set_text("hey".into());
        // Data word 1 and pointer 1 stay zero.
    }
    let reader = message.into_reader();
    assert!(!reader.is_canonical());

    let canonical_words = reader.canonicalize();
    let canonical_bytes = Word::words_to_bytes(&canonical_words);
    let segments: &[&[u8]] = &[canonical_bytes];
    let canonical = message::Reader::new(SegmentArray::new(segments), ReaderOptions::new());
    assert!(canonical.is_canonical());

    let st = canonical.get_root::<any_pointer::Reader>().get_as_struct();
    assert_eq!(st.get_data_section_size(), 64);
    assert_eq!(st.get_pointer_section_size(), 1);
    assert_eq!(st.get_data_field::<u32>(0), 7);
    assert_eq!(st.get_pointer_field(0).get_text(None).to_str().unwrap(), "hey");
    // Canonicalizing the canonical form is a fixed point.
    assert_eq!(canonical.canonicalize(), canonical_words);
}

#[test]
fn set_root_deep_copies_between_messages() {
    let mut source = message::Builder::new_default();
    {
        let root = source
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize {
                data: 1,
                pointers: 1,
            });
        root.set_data_field::<u64>(0, 41);
        root.get_pointer_field(0).set_text("copied".into());
    }
    let mut dest = message::Builder::new_default();
    dest.set_root(source.get_root_as_reader::<any_pointer::Reader>())
        .unwrap();
    let st = dest
        .get_root_as_reader::<any_pointer::Reader>()
        .get_as_struct();
    assert_eq!(st.get_data_field::<u64>(0), 41);
    assert_eq!(
        st.get_pointer_field(0).get_text(None).to_str().unwrap(),
        "copied"
    );
}
