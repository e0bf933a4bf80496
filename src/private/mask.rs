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

//! XOR masking of data fields.
//!
//! A field whose schema default is non-zero is stored XOR'd with that default,
//! so an untouched (all-zero) slot reads back as the default. `Mask::T` is the
//! unsigned integer of the same width as the field; floats are bit-cast before
//! the XOR so that masking is exact.

pub trait Mask: Copy {
    type T;

    fn mask(value: Self, mask: Self::T) -> Self;
}

macro_rules! int_mask_impl(
    ($typ:ty, $mask_typ:ty) => (
        impl Mask for $typ {
            type T = $mask_typ;

            #[inline]
            fn mask(value: Self, mask: Self::T) -> Self {
                value ^ (mask as $typ)
            }
        }
    );
);

int_mask_impl!(u8, u8);
int_mask_impl!(i8, u8);
int_mask_impl!(u16, u16);
int_mask_impl!(i16, u16);
int_mask_impl!(u32, u32);
int_mask_impl!(i32, u32);
int_mask_impl!(u64, u64);
int_mask_impl!(i64, u64);

impl Mask for f32 {
    type T = u32;

    #[inline]
    fn mask(value: Self, mask: u32) -> f32 {
        // A mask of zero is the common case and must not disturb NaN payloads.
        if mask == 0 {
            value
        } else {
            f32::from_bits(value.to_bits() ^ mask)
        }
    }
}

impl Mask for f64 {
    type T = u64;

    #[inline]
    fn mask(value: Self, mask: u64) -> f64 {
        if mask == 0 {
            value
        } else {
            f64::from_bits(value.to_bits() ^ mask)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Mask;

    #[test]
    fn masking_is_self_inverse() {
        assert_eq!(Mask::mask(Mask::mask(0x1234u16, 0xabcd), 0xabcd), 0x1234);
        assert_eq!(Mask::mask(Mask::mask(-7i32, 99), 99), -7);
    }

    #[test]
    fn default_stored_as_zero() {
        // A schema default of 42 compiles to mask 42; writing 42 stores 0.
        assert_eq!(Mask::mask(42u32, 42), 0);
        // And reading an unset (zero) slot yields the default back.
        assert_eq!(Mask::mask(0u32, 42), 42);
    }

    #[test]
    fn float_masking_bit_casts() {
        let mask = 2.5f64.to_bits();
        assert_eq!(Mask::mask(2.5f64, mask), 0.0);
        assert_eq!(Mask::mask(0.0f64, mask), 2.5);
    }
}
