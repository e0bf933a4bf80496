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

//! Fixed-width values as they appear on the wire: little-endian, unaligned.

/// A value that can be stored in a message's data section.
///
/// `Raw` is the wire representation, always a little-endian byte array, so
/// reads and writes through a `WireValue` are byte-order invariant and free
/// of alignment requirements.
pub trait Primitive: Copy {
    type Raw: Copy;

    fn raw_to_value(raw: &Self::Raw) -> Self;
    fn value_to_raw(value: Self) -> Self::Raw;
}

macro_rules! primitive_impl(
    ($typ:ty, $bytes:expr) => (
        impl Primitive for $typ {
            type Raw = [u8; $bytes];

            #[inline]
            fn raw_to_value(raw: &Self::Raw) -> Self {
                <$typ>::from_le_bytes(*raw)
            }

            #[inline]
            fn value_to_raw(value: Self) -> Self::Raw {
                value.to_le_bytes()
            }
        }
    );
);

primitive_impl!(u8, 1);
primitive_impl!(i8, 1);
primitive_impl!(u16, 2);
primitive_impl!(i16, 2);
primitive_impl!(u32, 4);
primitive_impl!(i32, 4);
primitive_impl!(u64, 8);
primitive_impl!(i64, 8);
primitive_impl!(f32, 4);
primitive_impl!(f64, 8);

/// An in-place view of a wire value. Used by the layout engine to read and
/// write the data sections of structs and lists.
#[repr(transparent)]
pub struct WireValue<T>
where
    T: Primitive,
{
    value: T::Raw,
}

impl<T: Primitive> WireValue<T> {
    #[inline]
    pub fn get(&self) -> T {
        T::raw_to_value(&self.value)
    }

    #[inline]
    pub fn set(&mut self, value: T) {
        self.value = T::value_to_raw(value)
    }
}

/// Types with an all-zero value, the uniform default for unset data fields.
pub trait Zero {
    fn zero() -> Self;
}

macro_rules! zero_impl(
    ($typ:ty, $zero:expr) => (
        impl Zero for $typ {
            #[inline]
            fn zero() -> Self { $zero }
        }
    );
);

zero_impl!(u8, 0);
zero_impl!(i8, 0);
zero_impl!(u16, 0);
zero_impl!(i16, 0);
zero_impl!(u32, 0);
zero_impl!(i32, 0);
zero_impl!(u64, 0);
zero_impl!(i64, 0);
zero_impl!(f32, 0.0);
zero_impl!(f64, 0.0);

#[cfg(test)]
mod tests {
    use super::{Primitive, WireValue};

    #[test]
    fn wire_values_are_little_endian() {
        let mut buf = [0u8; 8];
        let value: &mut WireValue<u32> =
            unsafe { &mut *(buf.as_mut_ptr() as *mut WireValue<u32>) };
        value.set(0x12345678);
        assert_eq!(&buf[..4], &[0x78, 0x56, 0x34, 0x12]);

        let value: &WireValue<u32> = unsafe { &*(buf.as_ptr() as *const WireValue<u32>) };
        assert_eq!(value.get(), 0x12345678);
    }

    #[test]
    fn floats_round_trip_through_raw() {
        let raw = f64::value_to_raw(271.828);
        assert_eq!(f64::raw_to_value(&raw), 271.828);
    }
}
