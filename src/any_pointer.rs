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

//! The untyped object view: a tagged window onto a pointer slot whose kind
//! is not known statically. Dynamic traversal discriminates with
//! [`Reader::which`] and converts with the `get_as*` family.

use crate::private::layout::{
    ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader, PointerType,
    StructBuilder, StructReader, StructSize,
};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::{MessageSize, Result, Word};

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    reader: PointerReader<'a>,
}

impl<'a> Reader<'a> {
    pub fn new(reader: PointerReader<'a>) -> Reader<'a> {
        Reader { reader }
    }

    pub fn is_null(&self) -> bool {
        self.reader.is_null()
    }

    /// Discriminates the pointer without traversing past it. Malformed
    /// pointers read as null.
    pub fn which(&self) -> PointerType {
        self.reader.get_pointer_type()
    }

    /// The word footprint of the target subtree, as the read limiter would
    /// count it.
    pub fn target_size(&self) -> MessageSize {
        self.reader.total_size()
    }

    pub fn get_as<T: FromPointerReader<'a>>(&self) -> T {
        T::get_from_pointer(&self.reader, None)
    }

    /// Views the target as a struct; returns the empty struct if the
    /// pointer is not one.
    pub fn get_as_struct(&self) -> StructReader<'a> {
        self.reader.get_struct(None)
    }

    /// Views the target as a list of the given encoding; returns the empty
    /// list if the pointer is not one.
    pub fn get_as_list(&self, expected_element_size: ElementSize) -> ListReader<'a> {
        self.reader.get_list(expected_element_size, None)
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>, _default: Option<&'a [Word]>) -> Reader<'a> {
        Reader { reader: *reader }
    }
}

pub struct Builder<'a> {
    builder: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn new(builder: PointerBuilder<'a>) -> Builder<'a> {
        Builder { builder }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.builder.is_null()
    }

    pub fn which(&self) -> PointerType {
        self.builder.as_reader().get_pointer_type()
    }

    pub fn target_size(&self) -> MessageSize {
        self.builder.as_reader().total_size()
    }

    pub fn get_as<T: FromPointerBuilder<'a>>(self) -> Result<T> {
        T::get_from_pointer(self.builder, None)
    }

    pub fn init_as<T: FromPointerBuilder<'a>>(self) -> T {
        T::init_pointer(self.builder, 0)
    }

    pub fn init_as_sized<T: FromPointerBuilder<'a>>(self, size: u32) -> T {
        T::init_pointer(self.builder, size)
    }

    pub fn set_as<T: SetPointerBuilder>(self, value: T) -> Result<()> {
        SetPointerBuilder::set_pointer_builder(self.builder, value, false)
    }

    pub fn init_struct(self, size: StructSize) -> StructBuilder<'a> {
        self.builder.init_struct(size)
    }

    pub fn get_struct(
        self,
        size: StructSize,
        default: Option<&'a [Word]>,
    ) -> Result<StructBuilder<'a>> {
        self.builder.get_struct(size, default)
    }

    pub fn init_list(self, element_size: ElementSize, element_count: u32) -> ListBuilder<'a> {
        self.builder.init_list(element_size, element_count)
    }

    pub fn init_struct_list(self, element_count: u32, element_size: StructSize) -> ListBuilder<'a> {
        self.builder.init_struct_list(element_count, element_size)
    }

    pub fn get_list(
        self,
        expected_element_size: ElementSize,
        default: Option<&'a [Word]>,
    ) -> Result<ListBuilder<'a>> {
        self.builder.get_list(expected_element_size, default)
    }

    pub fn get_struct_list(
        self,
        element_size: StructSize,
        default: Option<&'a [Word]>,
    ) -> Result<ListBuilder<'a>> {
        self.builder.get_struct_list(element_size, default)
    }

    /// Writes null into the slot, abandoning the previous subtree.
    pub fn clear(&mut self) {
        self.builder.clear()
    }

    pub fn as_reader(&self) -> Reader<'a> {
        Reader {
            reader: self.builder.as_reader(),
        }
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(mut builder: PointerBuilder<'a>, _len: u32) -> Builder<'a> {
        builder.clear();
        Builder { builder }
    }

    fn get_from_pointer(
        builder: PointerBuilder<'a>,
        _default: Option<&'a [Word]>,
    ) -> Result<Builder<'a>> {
        Ok(Builder { builder })
    }
}

impl<'a> SetPointerBuilder for Reader<'a> {
    fn set_pointer_builder(
        mut builder: PointerBuilder<'_>,
        value: Reader<'a>,
        canonicalize: bool,
    ) -> Result<()> {
        builder.copy_from(value.reader, canonicalize)
    }
}
