//! AMQP 1.0 type system values and their binary encoding.
//!
//! The engine only needs the subset of the type system used by performatives,
//! delivery states, and transactional control messages, but the decoder
//! understands every fixed-width and variable-width constructor so that peers
//! using alternative encodings (for example `uint` sent as `smalluint`, or
//! symbolic descriptors) are accepted.

#![expect(clippy::big_endian_bytes, reason = "AMQP encodes numbers in network byte order")]

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::DecodeError;

/// Format codes defined by the AMQP 1.0 type system.
pub(crate) mod code {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const BOOLEAN_TRUE: u8 = 0x41;
    pub const BOOLEAN_FALSE: u8 = 0x42;
    pub const UINT0: u8 = 0x43;
    pub const ULONG0: u8 = 0x44;
    pub const LIST0: u8 = 0x45;
    pub const UBYTE: u8 = 0x50;
    pub const BYTE: u8 = 0x51;
    pub const SMALL_UINT: u8 = 0x52;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const SMALL_INT: u8 = 0x54;
    pub const SMALL_LONG: u8 = 0x55;
    pub const BOOLEAN: u8 = 0x56;
    pub const USHORT: u8 = 0x60;
    pub const SHORT: u8 = 0x61;
    pub const UINT: u8 = 0x70;
    pub const INT: u8 = 0x71;
    pub const FLOAT: u8 = 0x72;
    pub const CHAR: u8 = 0x73;
    pub const ULONG: u8 = 0x80;
    pub const LONG: u8 = 0x81;
    pub const DOUBLE: u8 = 0x82;
    pub const TIMESTAMP: u8 = 0x83;
    pub const UUID: u8 = 0x98;
    pub const VBIN8: u8 = 0xa0;
    pub const STR8: u8 = 0xa1;
    pub const SYM8: u8 = 0xa3;
    pub const VBIN32: u8 = 0xb0;
    pub const STR32: u8 = 0xb1;
    pub const SYM32: u8 = 0xb3;
    pub const LIST8: u8 = 0xc0;
    pub const MAP8: u8 = 0xc1;
    pub const LIST32: u8 = 0xd0;
    pub const MAP32: u8 = 0xd1;
    pub const ARRAY8: u8 = 0xe0;
    pub const ARRAY32: u8 = 0xf0;
}

/// An AMQP symbolic value (ASCII identifier such as `amqp:decode-error`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol from any string-like value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }

    /// Borrow the symbol text.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self { Self(value.to_owned()) }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self { Self(value) }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool { self.0 == other }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool { self.0 == *other }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Descriptor of a described type, in numeric or symbolic form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    /// Numeric descriptor (domain id in the high 32 bits).
    Code(u64),
    /// Symbolic descriptor such as `amqp:open:list`.
    Name(Symbol),
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "0x{code:016x}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// A decoded AMQP value.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    /// The null value; also the encoding of every omitted field.
    #[default]
    Null,
    /// `boolean`.
    Bool(bool),
    /// `ubyte`.
    Ubyte(u8),
    /// `ushort`.
    Ushort(u16),
    /// `uint`.
    Uint(u32),
    /// `ulong`.
    Ulong(u64),
    /// `byte`.
    Byte(i8),
    /// `short`.
    Short(i16),
    /// `int`.
    Int(i32),
    /// `long`.
    Long(i64),
    /// `float`.
    Float(f32),
    /// `double`.
    Double(f64),
    /// `timestamp` in milliseconds since the Unix epoch.
    Timestamp(i64),
    /// `uuid`.
    Uuid([u8; 16]),
    /// `char`.
    Char(char),
    /// `binary`.
    Binary(Bytes),
    /// `string`.
    String(String),
    /// `symbol`.
    Symbol(Symbol),
    /// `list`.
    List(Vec<Value>),
    /// `map`, kept in wire order.
    Map(Vec<(Value, Value)>),
    /// `array`; all elements share one constructor on the wire.
    Array(Vec<Value>),
    /// A described value.
    Described(Box<Descriptor>, Box<Value>),
}

impl Value {
    /// Build a described value with a numeric descriptor.
    #[must_use]
    pub fn described(code: u64, value: Self) -> Self {
        Self::Described(Box::new(Descriptor::Code(code)), Box::new(value))
    }

    /// Return `true` for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool { matches!(self, Self::Null) }

    /// Encode this value, appending the bytes to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Null => dst.put_u8(code::NULL),
            Self::Bool(true) => dst.put_u8(code::BOOLEAN_TRUE),
            Self::Bool(false) => dst.put_u8(code::BOOLEAN_FALSE),
            Self::Ubyte(v) => {
                dst.put_u8(code::UBYTE);
                dst.put_u8(*v);
            }
            Self::Ushort(v) => {
                dst.put_u8(code::USHORT);
                dst.put_u16(*v);
            }
            Self::Uint(v) => encode_uint(*v, dst),
            Self::Ulong(v) => encode_ulong(*v, dst),
            Self::Byte(v) => {
                dst.put_u8(code::BYTE);
                dst.put_i8(*v);
            }
            Self::Short(v) => {
                dst.put_u8(code::SHORT);
                dst.put_i16(*v);
            }
            Self::Int(v) => match i8::try_from(*v) {
                Ok(small) => {
                    dst.put_u8(code::SMALL_INT);
                    dst.put_i8(small);
                }
                Err(_) => {
                    dst.put_u8(code::INT);
                    dst.put_i32(*v);
                }
            },
            Self::Long(v) => match i8::try_from(*v) {
                Ok(small) => {
                    dst.put_u8(code::SMALL_LONG);
                    dst.put_i8(small);
                }
                Err(_) => {
                    dst.put_u8(code::LONG);
                    dst.put_i64(*v);
                }
            },
            Self::Float(v) => {
                dst.put_u8(code::FLOAT);
                dst.put_u32(v.to_bits());
            }
            Self::Double(v) => {
                dst.put_u8(code::DOUBLE);
                dst.put_u64(v.to_bits());
            }
            Self::Timestamp(v) => {
                dst.put_u8(code::TIMESTAMP);
                dst.put_i64(*v);
            }
            Self::Uuid(v) => {
                dst.put_u8(code::UUID);
                dst.put_slice(v);
            }
            Self::Char(v) => {
                dst.put_u8(code::CHAR);
                dst.put_u32(u32::from(*v));
            }
            Self::Binary(v) => encode_variable(code::VBIN8, code::VBIN32, v, dst),
            Self::String(v) => encode_variable(code::STR8, code::STR32, v.as_bytes(), dst),
            Self::Symbol(v) => encode_variable(code::SYM8, code::SYM32, v.as_str().as_bytes(), dst),
            Self::List(items) => encode_list(items, dst),
            Self::Map(entries) => encode_map(entries, dst),
            Self::Array(items) => encode_array(items, dst),
            Self::Described(descriptor, value) => {
                dst.put_u8(code::DESCRIBED);
                match descriptor.as_ref() {
                    Descriptor::Code(c) => encode_ulong(*c, dst),
                    Descriptor::Name(name) => {
                        encode_variable(code::SYM8, code::SYM32, name.as_str().as_bytes(), dst);
                    }
                }
                value.encode(dst);
            }
        }
    }

    /// Encode this value into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one value from the front of `src`, advancing past it.
    ///
    /// # Errors
    /// Returns a [`DecodeError`] if the bytes are truncated or malformed.
    pub fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let constructor = take_u8(src, "constructor")?;
        if constructor == code::DESCRIBED {
            let descriptor = decode_descriptor(src)?;
            let value = Self::decode(src)?;
            return Ok(Self::Described(Box::new(descriptor), Box::new(value)));
        }
        decode_body(constructor, src)
    }
}

fn encode_uint(v: u32, dst: &mut BytesMut) {
    if v == 0 {
        dst.put_u8(code::UINT0);
    } else if let Ok(small) = u8::try_from(v) {
        dst.put_u8(code::SMALL_UINT);
        dst.put_u8(small);
    } else {
        dst.put_u8(code::UINT);
        dst.put_u32(v);
    }
}

fn encode_ulong(v: u64, dst: &mut BytesMut) {
    if v == 0 {
        dst.put_u8(code::ULONG0);
    } else if let Ok(small) = u8::try_from(v) {
        dst.put_u8(code::SMALL_ULONG);
        dst.put_u8(small);
    } else {
        dst.put_u8(code::ULONG);
        dst.put_u64(v);
    }
}

fn encode_variable(short: u8, long: u8, bytes: &[u8], dst: &mut BytesMut) {
    match u8::try_from(bytes.len()) {
        Ok(len) => {
            dst.put_u8(short);
            dst.put_u8(len);
        }
        Err(_) => {
            dst.put_u8(long);
            dst.put_u32(len_u32(bytes.len()));
        }
    }
    dst.put_slice(bytes);
}

/// Compound sizes are bounded by the frame size, which is a `u32`.
#[expect(
    clippy::cast_possible_truncation,
    reason = "compound bodies never exceed the u32 frame size limit"
)]
const fn len_u32(len: usize) -> u32 { len as u32 }

fn encode_compound(short: u8, long: u8, count: usize, body: &[u8], dst: &mut BytesMut) {
    match (u8::try_from(body.len() + 1), u8::try_from(count)) {
        (Ok(size), Ok(small_count)) => {
            dst.put_u8(short);
            dst.put_u8(size);
            dst.put_u8(small_count);
        }
        _ => {
            dst.put_u8(long);
            dst.put_u32(len_u32(body.len() + 4));
            dst.put_u32(len_u32(count));
        }
    }
    dst.put_slice(body);
}

fn encode_list(items: &[Value], dst: &mut BytesMut) {
    if items.is_empty() {
        dst.put_u8(code::LIST0);
        return;
    }
    let mut body = BytesMut::new();
    for item in items {
        item.encode(&mut body);
    }
    encode_compound(code::LIST8, code::LIST32, items.len(), &body, dst);
}

fn encode_map(entries: &[(Value, Value)], dst: &mut BytesMut) {
    let mut body = BytesMut::new();
    for (key, value) in entries {
        key.encode(&mut body);
        value.encode(&mut body);
    }
    encode_compound(code::MAP8, code::MAP32, entries.len() * 2, &body, dst);
}

/// Element constructor and body writer for arrays.
///
/// Arrays always use the wide element encodings so every element shares one
/// constructor regardless of its magnitude.
fn array_element(value: &Value, body: &mut BytesMut) -> Option<u8> {
    match value {
        Value::Bool(v) => {
            body.put_u8(u8::from(*v));
            Some(code::BOOLEAN)
        }
        Value::Ubyte(v) => {
            body.put_u8(*v);
            Some(code::UBYTE)
        }
        Value::Ushort(v) => {
            body.put_u16(*v);
            Some(code::USHORT)
        }
        Value::Uint(v) => {
            body.put_u32(*v);
            Some(code::UINT)
        }
        Value::Ulong(v) => {
            body.put_u64(*v);
            Some(code::ULONG)
        }
        Value::Int(v) => {
            body.put_i32(*v);
            Some(code::INT)
        }
        Value::Long(v) => {
            body.put_i64(*v);
            Some(code::LONG)
        }
        Value::Binary(v) => {
            body.put_u32(len_u32(v.len()));
            body.put_slice(v);
            Some(code::VBIN32)
        }
        Value::String(v) => {
            body.put_u32(len_u32(v.len()));
            body.put_slice(v.as_bytes());
            Some(code::STR32)
        }
        Value::Symbol(v) => {
            body.put_u32(len_u32(v.as_str().len()));
            body.put_slice(v.as_str().as_bytes());
            Some(code::SYM32)
        }
        _ => None,
    }
}

fn encode_array(items: &[Value], dst: &mut BytesMut) {
    let mut body = BytesMut::new();
    let mut constructor = None;
    for item in items {
        match (array_element(item, &mut body), constructor) {
            (Some(found), None) => constructor = Some(found),
            (Some(found), Some(expected)) if found == expected => {}
            _ => {
                // Heterogeneous or unsupported element kinds cannot share a
                // constructor; fall back to a list, which every decoder that
                // accepts `multiple` fields also tolerates.
                encode_list(items, dst);
                return;
            }
        }
    }
    let mut framed = BytesMut::with_capacity(body.len() + 1);
    framed.put_u8(constructor.unwrap_or(code::NULL));
    framed.put_slice(&body);
    encode_compound(code::ARRAY8, code::ARRAY32, items.len(), &framed, dst);
}

fn take_u8(src: &mut Bytes, what: &'static str) -> Result<u8, DecodeError> {
    if src.remaining() < 1 {
        return Err(DecodeError::UnexpectedEof(what));
    }
    Ok(src.get_u8())
}

fn take_exact(src: &mut Bytes, len: usize, what: &'static str) -> Result<Bytes, DecodeError> {
    if src.remaining() < len {
        return Err(DecodeError::UnexpectedEof(what));
    }
    Ok(src.split_to(len))
}

fn take_len(src: &mut Bytes, wide: bool, what: &'static str) -> Result<usize, DecodeError> {
    if wide {
        Ok(u32::from_be_bytes(take_array(src, what)?) as usize)
    } else {
        Ok(usize::from(take_u8(src, what)?))
    }
}

fn take_string(src: &mut Bytes, wide: bool, what: &'static str) -> Result<String, DecodeError> {
    let len = take_len(src, wide, what)?;
    let raw = take_exact(src, len, what)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(what))
}

fn decode_descriptor(src: &mut Bytes) -> Result<Descriptor, DecodeError> {
    match Value::decode(src)? {
        Value::Ulong(code) => Ok(Descriptor::Code(code)),
        Value::Symbol(name) => Ok(Descriptor::Name(name)),
        other => Err(DecodeError::UnknownDescriptor(format!("{other:?}"))),
    }
}

/// Decode a fixed-width body of `N` bytes.
fn take_array<const N: usize>(src: &mut Bytes, what: &'static str) -> Result<[u8; N], DecodeError> {
    let raw = take_exact(src, N, what)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&raw);
    Ok(out)
}

#[expect(
    clippy::cognitive_complexity,
    reason = "one flat match arm per AMQP constructor reads best as a table"
)]
fn decode_body(constructor: u8, src: &mut Bytes) -> Result<Value, DecodeError> {
    let value = match constructor {
        code::NULL => Value::Null,
        code::BOOLEAN_TRUE => Value::Bool(true),
        code::BOOLEAN_FALSE => Value::Bool(false),
        code::BOOLEAN => Value::Bool(take_u8(src, "boolean")? != 0),
        code::UINT0 => Value::Uint(0),
        code::ULONG0 => Value::Ulong(0),
        code::LIST0 => Value::List(Vec::new()),
        code::UBYTE => Value::Ubyte(take_u8(src, "ubyte")?),
        code::BYTE => Value::Byte(i8::from_be_bytes(take_array::<1>(src, "byte")?)),
        code::SMALL_UINT => Value::Uint(u32::from(take_u8(src, "smalluint")?)),
        code::SMALL_ULONG => Value::Ulong(u64::from(take_u8(src, "smallulong")?)),
        code::SMALL_INT => Value::Int(i32::from(i8::from_be_bytes(take_array::<1>(src, "smallint")?))),
        code::SMALL_LONG => {
            Value::Long(i64::from(i8::from_be_bytes(take_array::<1>(src, "smalllong")?)))
        }
        code::USHORT => Value::Ushort(u16::from_be_bytes(take_array(src, "ushort")?)),
        code::SHORT => Value::Short(i16::from_be_bytes(take_array(src, "short")?)),
        code::UINT => Value::Uint(u32::from_be_bytes(take_array(src, "uint")?)),
        code::INT => Value::Int(i32::from_be_bytes(take_array(src, "int")?)),
        code::FLOAT => Value::Float(f32::from_bits(u32::from_be_bytes(take_array(src, "float")?))),
        code::CHAR => {
            let raw = u32::from_be_bytes(take_array(src, "char")?);
            Value::Char(char::from_u32(raw).ok_or(DecodeError::InvalidChar(raw))?)
        }
        code::ULONG => Value::Ulong(u64::from_be_bytes(take_array(src, "ulong")?)),
        code::LONG => Value::Long(i64::from_be_bytes(take_array(src, "long")?)),
        code::DOUBLE => Value::Double(f64::from_bits(u64::from_be_bytes(take_array(src, "double")?))),
        code::TIMESTAMP => Value::Timestamp(i64::from_be_bytes(take_array(src, "timestamp")?)),
        code::UUID => Value::Uuid(take_array(src, "uuid")?),
        code::VBIN8 | code::VBIN32 => {
            let len = take_len(src, constructor == code::VBIN32, "binary")?;
            Value::Binary(take_exact(src, len, "binary")?)
        }
        code::STR8 | code::STR32 => Value::String(take_string(src, constructor == code::STR32, "string")?),
        code::SYM8 | code::SYM32 => {
            Value::Symbol(Symbol(take_string(src, constructor == code::SYM32, "symbol")?))
        }
        code::LIST8 | code::LIST32 => Value::List(decode_compound(src, constructor == code::LIST32, "list")?),
        code::MAP8 | code::MAP32 => {
            let flat = decode_compound(src, constructor == code::MAP32, "map")?;
            let mut entries = Vec::new();
            let mut iter = flat.into_iter();
            while let Some(key) = iter.next() {
                let mapped = iter.next().ok_or(DecodeError::UnexpectedEof("map"))?;
                entries.push((key, mapped));
            }
            Value::Map(entries)
        }
        code::ARRAY8 | code::ARRAY32 => Value::Array(decode_array(src, constructor == code::ARRAY32)?),
        other => return Err(DecodeError::InvalidConstructor(other)),
    };
    Ok(value)
}

fn decode_compound(
    src: &mut Bytes,
    wide: bool,
    what: &'static str,
) -> Result<Vec<Value>, DecodeError> {
    let size = take_len(src, wide, what)?;
    let mut body = take_exact(src, size, what)?;
    let count = take_len(&mut body, wide, what)?;
    // Every element occupies at least one byte, which bounds the allocation.
    let mut items = Vec::with_capacity(count.min(body.remaining()));
    for _ in 0..count {
        items.push(Value::decode(&mut body)?);
    }
    Ok(items)
}

fn decode_array(src: &mut Bytes, wide: bool) -> Result<Vec<Value>, DecodeError> {
    let size = take_len(src, wide, "array")?;
    let mut body = take_exact(src, size, "array")?;
    let count = take_len(&mut body, wide, "array")?;
    let mut constructor = take_u8(&mut body, "array constructor")?;
    let mut descriptor = None;
    if constructor == code::DESCRIBED {
        descriptor = Some(decode_descriptor(&mut body)?);
        constructor = take_u8(&mut body, "array constructor")?;
    }
    let mut items = Vec::with_capacity(count.min(body.remaining()));
    for _ in 0..count {
        let element = decode_body(constructor, &mut body)?;
        items.push(match &descriptor {
            Some(d) => Value::Described(Box::new(d.clone()), Box::new(element)),
            None => element,
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Value, DecodeError> {
        let mut src = Bytes::copy_from_slice(bytes);
        Value::decode(&mut src)
    }

    #[rstest]
    #[case(Value::Uint(0), &[0x43])]
    #[case(Value::Uint(7), &[0x52, 0x07])]
    #[case(Value::Uint(0x0102_0304), &[0x70, 0x01, 0x02, 0x03, 0x04])]
    #[case(Value::Ulong(0x10), &[0x53, 0x10])]
    #[case(Value::Bool(true), &[0x41])]
    #[case(Value::Int(-1), &[0x54, 0xff])]
    #[case(Value::Symbol(Symbol::from("ab")), &[0xa3, 0x02, b'a', b'b'])]
    #[case(Value::List(Vec::new()), &[0x45])]
    fn encodes_compact_forms(#[case] value: Value, #[case] expected: &[u8]) {
        assert_eq!(value.to_bytes().as_ref(), expected);
    }

    #[test]
    fn decodes_wide_forms_into_same_value() {
        assert_eq!(decode_all(&[0x70, 0, 0, 0, 5]), Ok(Value::Uint(5)));
        assert_eq!(decode_all(&[0x80, 0, 0, 0, 0, 0, 0, 0, 9]), Ok(Value::Ulong(9)));
        assert_eq!(decode_all(&[0x56, 0x01]), Ok(Value::Bool(true)));
    }

    #[test]
    fn described_list_survives_encoding() {
        let value = Value::described(
            0x10,
            Value::List(vec![Value::String("container".to_owned()), Value::Null]),
        );
        assert_eq!(decode_all(&value.to_bytes()), Ok(value));
    }

    #[test]
    fn symbolic_descriptor_is_preserved() {
        let value = Value::Described(
            Box::new(Descriptor::Name(Symbol::from("amqp:open:list"))),
            Box::new(Value::List(Vec::new())),
        );
        assert_eq!(decode_all(&value.to_bytes()), Ok(value));
    }

    #[test]
    fn symbol_array_uses_single_constructor() {
        let value = Value::Array(vec![
            Value::Symbol(Symbol::from("a")),
            Value::Symbol(Symbol::from("bc")),
        ]);
        let bytes = value.to_bytes();
        assert_eq!(bytes.first(), Some(&code::ARRAY8));
        assert_eq!(decode_all(&bytes), Ok(value));
    }

    #[test]
    fn large_list_switches_to_wide_encoding() {
        let items = vec![Value::Binary(Bytes::from(vec![0u8; 300]))];
        let bytes = Value::List(items.clone()).to_bytes();
        assert_eq!(bytes.first(), Some(&code::LIST32));
        assert_eq!(decode_all(&bytes), Ok(Value::List(items)));
    }

    #[rstest]
    #[case(&[])]
    #[case(&[0x70, 0x00])]
    #[case(&[0xa1, 0x05, b'a'])]
    #[case(&[0xc0, 0x04, 0x02, 0x43])]
    fn truncated_input_is_rejected(#[case] bytes: &[u8]) {
        assert!(matches!(decode_all(bytes), Err(DecodeError::UnexpectedEof(_))));
    }

    #[test]
    fn unknown_constructor_is_rejected() {
        assert_eq!(decode_all(&[0x01]), Err(DecodeError::InvalidConstructor(0x01)));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert_eq!(
            decode_all(&[0xa1, 0x01, 0xff]),
            Err(DecodeError::InvalidUtf8("string"))
        );
    }
}
