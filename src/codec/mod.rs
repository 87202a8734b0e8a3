//! Variant codec.
//!
//! Serializes typed scalar and array values into the opaque `variantbinary`
//! column and back. The layout is private to this crate:
//!
//! ```text
//! [encoding byte][payload]
//!   encoding byte = type id (low 6 bits) | ARRAY_FLAG (0x80) for arrays
//!   scalar payload = little-endian value, strings/bytes length-prefixed (u32)
//!   array payload  = u32 element count, then each element's scalar payload
//! ```
//!
//! The header makes every blob self-describing; the separately stored type
//! tag is checked against it on decode so a mislabelled row is reported
//! instead of silently reinterpreted.

mod error;

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use error::CodecError;

const ARRAY_FLAG: u8 = 0x80;
const TYPE_MASK: u8 = 0x3f;

/// Scalar type of a [`Variant`].
///
/// The numeric ids follow the OPC UA built-in type ids and are part of the
/// stored binary format; never renumber them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantType {
    Null = 0,
    Boolean = 1,
    SByte = 2,
    Byte = 3,
    Int16 = 4,
    UInt16 = 5,
    Int32 = 6,
    UInt32 = 7,
    Int64 = 8,
    UInt64 = 9,
    Float = 10,
    Double = 11,
    String = 12,
    DateTime = 13,
    Guid = 14,
    ByteString = 15,
}

impl VariantType {
    fn from_id(id: u8) -> Option<Self> {
        use VariantType::*;
        Some(match id {
            0 => Null,
            1 => Boolean,
            2 => SByte,
            3 => Byte,
            4 => Int16,
            5 => UInt16,
            6 => Int32,
            7 => UInt32,
            8 => Int64,
            9 => UInt64,
            10 => Float,
            11 => Double,
            12 => String,
            13 => DateTime,
            14 => Guid,
            15 => ByteString,
            _ => return None,
        })
    }

    /// Name stored in the `varianttype` column.
    pub fn name(self) -> &'static str {
        use VariantType::*;
        match self {
            Null => "Null",
            Boolean => "Boolean",
            SByte => "SByte",
            Byte => "Byte",
            Int16 => "Int16",
            UInt16 => "UInt16",
            Int32 => "Int32",
            UInt32 => "UInt32",
            Int64 => "Int64",
            UInt64 => "UInt64",
            Float => "Float",
            Double => "Double",
            String => "String",
            DateTime => "DateTime",
            Guid => "Guid",
            ByteString => "ByteString",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        (0..=15).filter_map(Self::from_id).find(|t| t.name() == name)
    }
}

/// Runtime type tag persisted next to each encoded value.
///
/// Rendered as the scalar type name, with a `[]` suffix for arrays
/// (`"Double"`, `"Int32[]"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    pub variant_type: VariantType,
    pub is_array: bool,
}

impl TypeTag {
    fn encoding_byte(self) -> u8 {
        let id = self.variant_type as u8;
        if self.is_array {
            id | ARRAY_FLAG
        } else {
            id
        }
    }

    fn from_encoding_byte(byte: u8) -> Result<Self, CodecError> {
        let variant_type = VariantType::from_id(byte & TYPE_MASK)
            .ok_or_else(|| CodecError::UnknownTypeTag(format!("0x{byte:02x}")))?;
        Ok(Self {
            variant_type,
            is_array: byte & ARRAY_FLAG != 0,
        })
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_array {
            write!(f, "{}[]", self.variant_type.name())
        } else {
            f.write_str(self.variant_type.name())
        }
    }
}

impl FromStr for TypeTag {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, is_array) = match s.strip_suffix("[]") {
            Some(name) => (name, true),
            None => (s, false),
        };
        let variant_type =
            VariantType::from_name(name).ok_or_else(|| CodecError::UnknownTypeTag(s.to_string()))?;
        Ok(Self {
            variant_type,
            is_array,
        })
    }
}

/// A typed, possibly array-valued data value.
///
/// Equality compares floating point payloads bit-for-bit, so `NaN` equals
/// itself and a decoded value compares equal to the value that was encoded.
#[derive(Debug, Clone)]
pub enum Variant {
    Null,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    ByteString(Vec<u8>),
    /// Homogeneous array; `element` is kept so empty arrays stay typed.
    Array {
        element: VariantType,
        items: Vec<Variant>,
    },
}

impl Variant {
    /// Build a typed array, rejecting nested arrays and mixed element types.
    pub fn array(element: VariantType, items: Vec<Variant>) -> Result<Self, CodecError> {
        check_array(element, &items)?;
        Ok(Variant::Array { element, items })
    }

    pub fn type_tag(&self) -> TypeTag {
        let scalar = |variant_type| TypeTag {
            variant_type,
            is_array: false,
        };
        match self {
            Variant::Null => scalar(VariantType::Null),
            Variant::Boolean(_) => scalar(VariantType::Boolean),
            Variant::SByte(_) => scalar(VariantType::SByte),
            Variant::Byte(_) => scalar(VariantType::Byte),
            Variant::Int16(_) => scalar(VariantType::Int16),
            Variant::UInt16(_) => scalar(VariantType::UInt16),
            Variant::Int32(_) => scalar(VariantType::Int32),
            Variant::UInt32(_) => scalar(VariantType::UInt32),
            Variant::Int64(_) => scalar(VariantType::Int64),
            Variant::UInt64(_) => scalar(VariantType::UInt64),
            Variant::Float(_) => scalar(VariantType::Float),
            Variant::Double(_) => scalar(VariantType::Double),
            Variant::String(_) => scalar(VariantType::String),
            Variant::DateTime(_) => scalar(VariantType::DateTime),
            Variant::Guid(_) => scalar(VariantType::Guid),
            Variant::ByteString(_) => scalar(VariantType::ByteString),
            Variant::Array { element, .. } => TypeTag {
                variant_type: *element,
                is_array: true,
            },
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        use Variant::*;
        match (self, other) {
            (Null, Null) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (SByte(a), SByte(b)) => a == b,
            (Byte(a), Byte(b)) => a == b,
            (Int16(a), Int16(b)) => a == b,
            (UInt16(a), UInt16(b)) => a == b,
            (Int32(a), Int32(b)) => a == b,
            (UInt32(a), UInt32(b)) => a == b,
            (Int64(a), Int64(b)) => a == b,
            (UInt64(a), UInt64(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            (Guid(a), Guid(b)) => a == b,
            (ByteString(a), ByteString(b)) => a == b,
            (
                Array {
                    element: ea,
                    items: ia,
                },
                Array {
                    element: eb,
                    items: ib,
                },
            ) => ea == eb && ia == ib,
            _ => false,
        }
    }
}

/// Encode a value into its binary column representation.
///
/// Arrays built directly through [`Variant::Array`] are validated here with
/// the same rules as [`Variant::array`], so every encoded blob decodes.
pub fn encode(value: &Variant) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(value.type_tag().encoding_byte());
    match value {
        Variant::Array { element, items } => {
            check_array(*element, items)?;
            buf.put_u32_le(length_prefix(items.len())?);
            for item in items {
                put_scalar(&mut buf, item)?;
            }
        }
        scalar => put_scalar(&mut buf, scalar)?,
    }
    Ok(buf.to_vec())
}

fn check_array(element: VariantType, items: &[Variant]) -> Result<(), CodecError> {
    if element == VariantType::Null {
        return Err(CodecError::NullArray);
    }
    for item in items {
        let tag = item.type_tag();
        if tag.is_array {
            return Err(CodecError::NestedArray);
        }
        if tag.variant_type != element {
            return Err(CodecError::MixedArray {
                expected: element.name(),
                found: tag.to_string(),
            });
        }
    }
    Ok(())
}

fn length_prefix(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge(len))
}

fn put_scalar(buf: &mut BytesMut, value: &Variant) -> Result<(), CodecError> {
    match value {
        Variant::Null => {}
        Variant::Boolean(v) => buf.put_u8(u8::from(*v)),
        Variant::SByte(v) => buf.put_i8(*v),
        Variant::Byte(v) => buf.put_u8(*v),
        Variant::Int16(v) => buf.put_i16_le(*v),
        Variant::UInt16(v) => buf.put_u16_le(*v),
        Variant::Int32(v) => buf.put_i32_le(*v),
        Variant::UInt32(v) => buf.put_u32_le(*v),
        Variant::Int64(v) => buf.put_i64_le(*v),
        Variant::UInt64(v) => buf.put_u64_le(*v),
        Variant::Float(v) => buf.put_u32_le(v.to_bits()),
        Variant::Double(v) => buf.put_u64_le(v.to_bits()),
        Variant::String(v) => {
            buf.put_u32_le(length_prefix(v.len())?);
            buf.put_slice(v.as_bytes());
        }
        Variant::DateTime(v) => {
            buf.put_i64_le(v.timestamp());
            buf.put_u32_le(v.timestamp_subsec_nanos());
        }
        Variant::Guid(v) => buf.put_slice(v.as_bytes()),
        Variant::ByteString(v) => {
            buf.put_u32_le(length_prefix(v.len())?);
            buf.put_slice(v);
        }
        Variant::Array { .. } => return Err(CodecError::NestedArray),
    }
    Ok(())
}

/// Decode a stored value, checking it against the stored type tag.
pub fn decode(bytes: &[u8], tag: &str) -> Result<Variant, CodecError> {
    let expected: TypeTag = tag.parse()?;
    let value = decode_tagged(bytes)?;
    let found = value.type_tag();
    if found != expected {
        return Err(CodecError::TagMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(value)
}

/// Decode a stored value using only its embedded header.
pub fn decode_tagged(bytes: &[u8]) -> Result<Variant, CodecError> {
    let mut buf = bytes;
    need(&buf, 1)?;
    let tag = TypeTag::from_encoding_byte(buf.get_u8())?;

    let value = if tag.is_array {
        if tag.variant_type == VariantType::Null {
            return Err(CodecError::NullArray);
        }
        need(&buf, 4)?;
        let count = buf.get_u32_le() as usize;
        let available = buf.remaining();
        if count > available / min_width(tag.variant_type) {
            return Err(CodecError::ArrayTooLong { count, available });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(get_scalar(&mut buf, tag.variant_type)?);
        }
        Variant::Array {
            element: tag.variant_type,
            items,
        }
    } else {
        get_scalar(&mut buf, tag.variant_type)?
    };

    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(value)
}

fn need(buf: &&[u8], len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            needed: len,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn get_len_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len)?;
    let data = (*buf)[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

/// Smallest encoded size of one scalar; length-prefixed types count the prefix.
fn min_width(variant_type: VariantType) -> usize {
    match variant_type {
        VariantType::Null => 0,
        VariantType::Boolean | VariantType::SByte | VariantType::Byte => 1,
        VariantType::Int16 | VariantType::UInt16 => 2,
        VariantType::Int32 | VariantType::UInt32 | VariantType::Float => 4,
        VariantType::Int64 | VariantType::UInt64 | VariantType::Double => 8,
        VariantType::DateTime => 12,
        VariantType::Guid => 16,
        VariantType::String | VariantType::ByteString => 4,
    }
}

fn get_scalar(buf: &mut &[u8], variant_type: VariantType) -> Result<Variant, CodecError> {
    need(buf, min_width(variant_type))?;

    Ok(match variant_type {
        VariantType::Null => Variant::Null,
        VariantType::Boolean => Variant::Boolean(buf.get_u8() != 0),
        VariantType::SByte => Variant::SByte(buf.get_i8()),
        VariantType::Byte => Variant::Byte(buf.get_u8()),
        VariantType::Int16 => Variant::Int16(buf.get_i16_le()),
        VariantType::UInt16 => Variant::UInt16(buf.get_u16_le()),
        VariantType::Int32 => Variant::Int32(buf.get_i32_le()),
        VariantType::UInt32 => Variant::UInt32(buf.get_u32_le()),
        VariantType::Int64 => Variant::Int64(buf.get_i64_le()),
        VariantType::UInt64 => Variant::UInt64(buf.get_u64_le()),
        VariantType::Float => Variant::Float(f32::from_bits(buf.get_u32_le())),
        VariantType::Double => Variant::Double(f64::from_bits(buf.get_u64_le())),
        VariantType::String => {
            let raw = get_len_prefixed(buf)?;
            Variant::String(String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?)
        }
        VariantType::DateTime => {
            let secs = buf.get_i64_le();
            let nanos = buf.get_u32_le();
            let dt = DateTime::from_timestamp(secs, nanos)
                .ok_or(CodecError::InvalidTimestamp { secs, nanos })?;
            Variant::DateTime(dt)
        }
        VariantType::Guid => {
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Variant::Guid(Uuid::from_bytes(raw))
        }
        VariantType::ByteString => Variant::ByteString(get_len_prefixed(buf)?),
    })
}
