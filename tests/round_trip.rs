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

//! Property tests: whatever is written must read back identically, and
//! masked defaults must store as zero.

use flatwire::any_pointer;
use flatwire::message;
use flatwire::primitive_list;
use flatwire::private::layout::{PrimitiveElement, StructSize};
use quickcheck::quickcheck;

fn list_round_trip<T>(values: &[T]) -> bool
where
    T: PrimitiveElement + Copy + PartialEq,
{
    let mut message = message::Builder::new_default();
    {
        let mut list = message
            .init_root::<any_pointer::Builder>()
            .init_as_sized::<primitive_list::Builder<T>>(values.len() as u32);
        for (i, v) in values.iter().enumerate() {
            list.set(i as u32, *v);
        }
    }
    let reader: primitive_list::Reader<T> = message.get_root_as_reader();
    reader.len() as usize == values.len()
        && values
            .iter()
            .enumerate()
            .all(|(i, v)| reader.get(i as u32) == *v)
}

quickcheck! {
    fn round_trip_u8(values: Vec<u8>) -> bool {
        list_round_trip(&values)
    }

    fn round_trip_u16(values: Vec<u16>) -> bool {
        list_round_trip(&values)
    }

    fn round_trip_u32(values: Vec<u32>) -> bool {
        list_round_trip(&values)
    }

    fn round_trip_u64(values: Vec<u64>) -> bool {
        list_round_trip(&values)
    }

    fn round_trip_i32(values: Vec<i32>) -> bool {
        list_round_trip(&values)
    }

    fn round_trip_bool(values: Vec<bool>) -> bool {
        list_round_trip(&values)
    }

    fn round_trip_f64_bits(values: Vec<f64>) -> bool {
        // Compare representations so NaN payloads count as preserved.
        let mut message = message::Builder::new_default();
        {
            let mut list = message
                .init_root::<any_pointer::Builder>()
                .init_as_sized::<primitive_list::Builder<f64>>(values.len() as u32);
            for (i, v) in values.iter().enumerate() {
                list.set(i as u32, *v);
            }
        }
        let reader: primitive_list::Reader<f64> = message.get_root_as_reader();
        values
            .iter()
            .enumerate()
            .all(|(i, v)| reader.get(i as u32).to_bits() == v.to_bits())
    }

    fn masked_field_round_trips(value: u64, mask: u64) -> bool {
        let mut message = message::Builder::new_default();
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize { data: 1, pointers: 0 });
        root.set_data_field_mask::<u64>(0, value, mask);
        root.get_data_field_mask::<u64>(0, mask) == value
    }

    fn default_valued_field_stores_as_zero(mask: u64) -> bool {
        let mut message = message::Builder::new_default();
        let root = message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize { data: 1, pointers: 0 });
        // Writing the schema default (the mask itself) must zero the wire.
        root.set_data_field_mask::<u64>(0, mask, mask);
        root.get_data_field::<u64>(0) == 0
    }

    fn wider_reader_sees_zeros(value: u32) -> bool {
        let mut message = message::Builder::new_default();
        message
            .init_root::<any_pointer::Builder>()
            .init_struct(StructSize { data: 1, pointers: 0 })
            .set_data_field::<u32>(0, value);
        let st = message
            .get_root_as_reader::<any_pointer::Reader>()
            .get_as_struct();
        // A reader compiled against a larger schema sees the value plus
        // zeros and nulls, never an error.
        st.get_data_field::<u32>(0) == value
            && st.get_data_field::<u64>(1) == 0
            && st.get_data_field::<u64>(3) == 0
            && st.get_pointer_field(0).is_null()
            && st.get_pointer_field(5).get_struct(None).get_data_field::<u8>(0) == 0
    }

    fn deep_copy_preserves_lists(values: Vec<u32>) -> bool {
        let mut source = message::Builder::new_default();
        {
            let mut list = source
                .init_root::<any_pointer::Builder>()
                .init_as_sized::<primitive_list::Builder<u32>>(values.len() as u32);
            for (i, v) in values.iter().enumerate() {
                list.set(i as u32, *v);
            }
        }
        let mut dest = message::Builder::new_default();
        dest.set_root(source.get_root_as_reader::<any_pointer::Reader>())
            .unwrap();
        let reader: primitive_list::Reader<u32> = dest.get_root_as_reader();
        reader.len() as usize == values.len()
            && values
                .iter()
                .enumerate()
                .all(|(i, v)| reader.get(i as u32) == *v)
    }
}
