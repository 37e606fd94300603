//! Ethereum ABI encoder written as a [serde::Serializer].
//!
//! ABI encoding splits every value into a head (static data and offsets) and
//! a tail (the content of dynamic values). Offsets in the head depend on the
//! size of everything written before the tail, so a value is visited several
//! times: to measure its head, to measure its tail and once for each part
//! that is actually written.

use super::error::{Error, Result};
use serde::{
    ser::{self, Impossible, SerializeSeq, SerializeStruct, SerializeTuple, SerializeTupleStruct},
    Serialize,
};

/// Type name used for marking a value as dynamic but encoded in place.
///
/// The characters have no meaning, they only make sure no Rust type ends up
/// with the same name.
const MARK_DYNAMIC_NAME: &str = ":$&_DYNAMIC";

pub(super) const SLOT_SIZE: usize = 32; // bytes

/// Marks the tuple it is part of as dynamic without adding an indirection.
///
/// [serde::Serializer::serialize_bytes] is needed to write fixed-size
/// `bytesN` values slot by slot, which leaves no method for Solidity
/// `bytes`. Those are therefore written as a tuple of this marker, the
/// length and the padded data (see [as_bytes][super::as_bytes]). The marker
/// makes the parent store an offset to the tuple while the tuple itself is
/// written without a further offset.
///
/// Using it anywhere else produces output that does not decode in Solidity.
pub struct DynamicMarker;

impl Serialize for DynamicMarker {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_unit_struct(MARK_DYNAMIC_NAME)
    }
}

/// Sink receiving the encoding in 32 byte slots.
pub trait Writer {
    fn write(&mut self, slot: &[u8]);
}

/// Collects the encoding in memory.
#[derive(Debug, Default)]
pub struct VecWriter(pub Vec<u8>);

impl Writer for VecWriter {
    fn write(&mut self, slot: &[u8]) {
        self.0.extend_from_slice(slot);
    }
}

/// Writer used by the measuring passes, which never emit anything.
struct Discard;

impl Writer for Discard {
    fn write(&mut self, _: &[u8]) {
        unreachable!("measuring passes must not write")
    }
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    /// Sum up the head size and find out whether the value is dynamic.
    MeasureHead(usize),
    /// Write the head. `offset` is where the next dynamic tail will start.
    Head { offset: usize },
    /// Sum up the tail size.
    MeasureTail(usize),
    /// Write the tail.
    Tail,
}

/// Outcome of [Pass::MeasureHead] for one value.
#[derive(Debug, Clone, Copy)]
struct Layout {
    head: usize,
    dynamic: bool,
    /// Set by [DynamicMarker]: dynamic, but written in place.
    inline: bool,
}

impl Layout {
    /// Whether a parent stores an offset instead of the value itself.
    fn indirect(&self) -> bool {
        self.dynamic && !self.inline
    }
}

pub struct Serializer<'a, W>
where
    W: Writer,
{
    writer: &'a mut W,
    pass: Pass,
    dynamic: bool,
    inline: bool,
}

/// Encode `value` like `abi.encode(value)` does for a single argument.
pub fn to_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize + ?Sized,
    W: Writer,
{
    encode(value, writer, true)
}

/// Encode the fields of `value` as an argument list, like
/// `abi.encode(a, b, c)` does. Differs from [to_writer] only for dynamic
/// values, which do not get the leading offset.
pub fn to_args_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize + ?Sized,
    W: Writer,
{
    encode(value, writer, false)
}

fn encode<T, W>(value: &T, writer: &mut W, wrapped: bool) -> Result<()>
where
    T: Serialize + ?Sized,
    W: Writer,
{
    let layout = measure(value)?;
    let mut serializer = Serializer {
        writer,
        pass: Pass::Head {
            offset: layout.head,
        },
        dynamic: layout.dynamic,
        inline: layout.inline,
    };

    if layout.dynamic && wrapped {
        serializer.write_uint(SLOT_SIZE);
    }
    value.serialize(&mut serializer)?;
    if layout.dynamic {
        serializer.pass = Pass::Tail;
        value.serialize(&mut serializer)?;
    }
    Ok(())
}

fn measure<T>(value: &T) -> Result<Layout>
where
    T: Serialize + ?Sized,
{
    let mut serializer = Serializer {
        writer: &mut Discard,
        pass: Pass::MeasureHead(0),
        dynamic: false,
        inline: false,
    };
    value.serialize(&mut serializer)?;
    match serializer.pass {
        Pass::MeasureHead(head) => Ok(Layout {
            head,
            dynamic: serializer.dynamic,
            inline: serializer.inline,
        }),
        _ => unreachable!("serializer changed its own pass while measuring"),
    }
}

fn tail_size<T>(value: &T) -> Result<usize>
where
    T: Serialize + ?Sized,
{
    let mut serializer = Serializer {
        writer: &mut Discard,
        pass: Pass::MeasureTail(0),
        dynamic: false,
        inline: false,
    };
    value.serialize(&mut serializer)?;
    match serializer.pass {
        Pass::MeasureTail(size) => Ok(size),
        _ => unreachable!("serializer changed its own pass while measuring"),
    }
}

/// Size of `len` bytes after padding to full slots.
fn padded(len: usize) -> usize {
    (len + SLOT_SIZE - 1) / SLOT_SIZE * SLOT_SIZE
}

impl<'a, W> Serializer<'a, W>
where
    W: Writer,
{
    // Panics if N > SLOT_SIZE
    fn slot_right<const N: usize>(&mut self, v: [u8; N]) {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[SLOT_SIZE - N..].copy_from_slice(&v);
        self.writer.write(&bytes);
    }

    // Panics if N > SLOT_SIZE
    fn slot_signed<const N: usize>(&mut self, negative: bool, v: [u8; N]) {
        let mut bytes = [if negative { 0xff } else { 0x00 }; SLOT_SIZE];
        bytes[SLOT_SIZE - N..].copy_from_slice(&v);
        self.writer.write(&bytes);
    }

    // Panics if v.len() > SLOT_SIZE
    fn slot_left(&mut self, v: &[u8]) {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[..v.len()].copy_from_slice(v);
        self.writer.write(&bytes);
    }

    fn write_uint(&mut self, v: usize) {
        self.slot_right(v.to_be_bytes());
    }

    /// Write the padded content of `v` slot by slot.
    fn write_padded(&mut self, v: &[u8]) {
        let chunks = v.chunks_exact(SLOT_SIZE);
        let rem = chunks.remainder();
        for chunk in chunks {
            self.writer.write(chunk);
        }
        if !rem.is_empty() {
            self.slot_left(rem);
        }
    }

    /// Static single-slot values only ever contribute to the head.
    fn scalar(&mut self, write: impl FnOnce(&mut Self)) -> Result<()> {
        match self.pass {
            Pass::MeasureHead(head) => self.pass = Pass::MeasureHead(head + SLOT_SIZE),
            Pass::Head { .. } => write(self),
            Pass::MeasureTail(_) | Pass::Tail => {}
        }
        Ok(())
    }

    /// Run `pass` for a child value with its own layout.
    fn nested<T>(&mut self, value: &T, pass: Pass) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let layout = measure(value)?;
        let mut serializer = Serializer {
            writer: &mut *self.writer,
            pass,
            dynamic: layout.dynamic,
            inline: layout.inline,
        };
        value.serialize(&mut serializer)
    }

    /// Shared by struct fields, tuple elements and array elements.
    ///
    /// Static children are written in place during [Pass::Head]. Dynamic
    /// children get an offset in the head and are written completely
    /// (their own head and tail) during [Pass::Tail].
    fn element<T>(&mut self, value: &T, in_array: bool) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let layout = measure(value)?;
        match self.pass {
            Pass::MeasureHead(head) => {
                let size = if layout.indirect() {
                    SLOT_SIZE
                } else {
                    layout.head
                };
                self.pass = Pass::MeasureHead(head + size);
                self.dynamic |= layout.dynamic || layout.inline;
            }
            Pass::Head { offset } if layout.indirect() => {
                // Offsets of array elements count from the first element,
                // the length slot in front of them is not included.
                let relative = if in_array { offset - SLOT_SIZE } else { offset };
                self.write_uint(relative);
                self.pass = Pass::Head {
                    offset: offset + layout.head + tail_size(value)?,
                };
            }
            Pass::Head { .. } => {
                // Static, so nothing below can ever read this offset.
                self.nested(value, Pass::Head {
                    offset: layout.head,
                })?;
            }
            Pass::MeasureTail(size) => {
                let head = if layout.indirect() { layout.head } else { 0 };
                self.pass = Pass::MeasureTail(size + head + tail_size(value)?);
            }
            Pass::Tail if layout.indirect() => {
                // The offset handed down is the child's own head size: its
                // tail starts right behind it.
                self.nested(value, Pass::Head {
                    offset: layout.head,
                })?;
                self.nested(value, Pass::Tail)?;
            }
            Pass::Tail => {}
        }
        Ok(())
    }
}

macro_rules! unsigned {
    ($($method:ident: $T:ty),*) => {
        $(
            fn $method(self, v: $T) -> Result<()> {
                self.scalar(|s| s.slot_right(v.to_be_bytes()))
            }
        )*
    };
}

macro_rules! signed {
    ($($method:ident: $T:ty),*) => {
        $(
            fn $method(self, v: $T) -> Result<()> {
                self.scalar(|s| s.slot_signed(v < 0, v.to_be_bytes()))
            }
        )*
    };
}

impl<'a, 'b, W> ser::Serializer for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Impossible<(), Error>;
    type SerializeMap = Impossible<(), Error>;
    type SerializeStruct = Self;
    type SerializeStructVariant = Impossible<(), Error>;

    unsigned!(serialize_u8: u8, serialize_u16: u16, serialize_u32: u32, serialize_u64: u64, serialize_u128: u128);
    signed!(serialize_i8: i8, serialize_i16: i16, serialize_i32: i32, serialize_i64: i64, serialize_i128: i128);

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.serialize_u8(v as u8)
    }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::TypeNotRepresentable("f32"))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::TypeNotRepresentable("f64"))
    }

    fn serialize_char(self, _: char) -> Result<()> {
        Err(Error::TypeNotYetSupported("char"))
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        // Same layout as `bytes`, but there is no other use for
        // serialize_str, so it does not need the DynamicMarker detour.
        match self.pass {
            Pass::MeasureHead(_) => self.dynamic = true,
            Pass::Head { .. } => {}
            Pass::MeasureTail(size) => {
                self.pass = Pass::MeasureTail(size + SLOT_SIZE + padded(v.len()));
            }
            Pass::Tail => {
                self.write_uint(v.len());
                self.write_padded(v.as_bytes());
            }
        }
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        match self.pass {
            Pass::MeasureHead(head) => self.pass = Pass::MeasureHead(head + padded(v.len())),
            Pass::Head { .. } => self.write_padded(v),
            Pass::MeasureTail(_) | Pass::Tail => {}
        }
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("none"))
    }

    fn serialize_some<T: ?Sized>(self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("some"))
    }

    fn serialize_unit(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<()> {
        if name != MARK_DYNAMIC_NAME {
            return Err(Error::TypeNotRepresentable("unit struct"));
        }
        if let Pass::MeasureHead(_) = self.pass {
            self.inline = true;
        }
        Ok(())
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit variant (enum)"))
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.element(value, false)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("newtype variant (enum)"))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        match self.pass {
            Pass::MeasureHead(head) => {
                self.dynamic = true;
                self.pass = Pass::MeasureHead(head + SLOT_SIZE);
            }
            Pass::Head { .. } => self.write_uint(len.ok_or(Error::UnknownLength)?),
            Pass::MeasureTail(_) | Pass::Tail => {}
        }
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::TypeNotRepresentable("tuple variant (enum)"))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::TypeNotRepresentable("struct variant"))
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

impl<'a, 'b, W> SerializeSeq for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.element(value, true)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeTuple for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.element(value, false)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeTupleStruct for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.element(value, false)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeStruct for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.element(value, false)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}
