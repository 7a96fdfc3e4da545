use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

/// The closed set of resource value types.
///
/// The `...Array` variants mean "multiple instances of that scalar"; the
/// in-memory and on-wire layout of each instance is the scalar layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    None,
    String,
    Integer,
    Float,
    Boolean,
    Opaque,
    Time,
    ObjectLink,
    StringArray,
    IntegerArray,
    FloatArray,
    BooleanArray,
    OpaqueArray,
    TimeArray,
    ObjectLinkArray,
}

impl ResourceType {
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Self::StringArray
                | Self::IntegerArray
                | Self::FloatArray
                | Self::BooleanArray
                | Self::OpaqueArray
                | Self::TimeArray
                | Self::ObjectLinkArray
        )
    }

    /// The per-instance scalar type.
    pub fn scalar(&self) -> Self {
        match self {
            Self::StringArray => Self::String,
            Self::IntegerArray => Self::Integer,
            Self::FloatArray => Self::Float,
            Self::BooleanArray => Self::Boolean,
            Self::OpaqueArray => Self::Opaque,
            Self::TimeArray => Self::Time,
            Self::ObjectLinkArray => Self::ObjectLink,
            other => *other,
        }
    }

    /// Numeric types are the only ones the gt/lt/step notification
    /// attributes apply to.
    pub fn is_numeric(&self) -> bool {
        matches!(self.scalar(), Self::Integer | Self::Float | Self::Time)
    }

    /// Check an encoded width against the allowed widths for this type.
    pub fn check_width(&self, len: usize) -> Result<(), Error> {
        let ok = match self.scalar() {
            Self::Integer | Self::Time => matches!(len, 1 | 2 | 4 | 8),
            Self::Float => matches!(len, 4 | 8),
            Self::Boolean => len == 1,
            Self::ObjectLink => len == 4,
            Self::None => len == 0,
            Self::String | Self::Opaque => true,
            Self::StringArray
            | Self::IntegerArray
            | Self::FloatArray
            | Self::BooleanArray
            | Self::OpaqueArray
            | Self::TimeArray
            | Self::ObjectLinkArray => unreachable!("scalar() never returns an array variant"),
        };

        if ok { Ok(()) } else { Err(Error::TypeMismatch) }
    }
}

/// Encode a signed integer in the smallest of 1/2/4/8 big-endian bytes that
/// preserves the value.
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::value::{decode_integer, encode_integer};
///
/// assert_eq!(encode_integer(5).as_ref(), &[0x05]);
/// assert_eq!(encode_integer(-128).as_ref(), &[0x80]);
/// assert_eq!(encode_integer(128).as_ref(), &[0x00, 0x80]);
/// assert_eq!(encode_integer(i64::MIN).len(), 8);
///
/// for value in [0, -1, 127, -128, 32767, -32768, i64::from(i32::MAX),
///               i64::from(i32::MIN), i64::MAX, i64::MIN] {
///     assert_eq!(decode_integer(&encode_integer(value)).unwrap(), value);
/// }
/// ```
pub fn encode_integer(value: i64) -> Bytes {
    let mut bytes = BytesMut::with_capacity(8);

    if let Ok(value) = i8::try_from(value) {
        bytes.put_i8(value);
    } else if let Ok(value) = i16::try_from(value) {
        bytes.put_i16(value);
    } else if let Ok(value) = i32::try_from(value) {
        bytes.put_i32(value);
    } else {
        bytes.put_i64(value);
    }

    bytes.freeze()
}

pub fn decode_integer(bytes: &[u8]) -> Result<i64, Error> {
    Ok(match bytes.len() {
        1 => i8::from_be_bytes(bytes.try_into()?) as i64,
        2 => i16::from_be_bytes(bytes.try_into()?) as i64,
        4 => i32::from_be_bytes(bytes.try_into()?) as i64,
        8 => i64::from_be_bytes(bytes.try_into()?),
        _ => return Err(Error::TypeMismatch),
    })
}

/// Encode a float in 4 bytes when the narrowing is lossless, 8 otherwise.
pub fn encode_float(value: f64) -> Bytes {
    let mut bytes = BytesMut::with_capacity(8);

    let narrowed = value as f32;
    if narrowed as f64 == value {
        bytes.put_f32(narrowed);
    } else {
        bytes.put_f64(value);
    }

    bytes.freeze()
}

pub fn decode_float(bytes: &[u8]) -> Result<f64, Error> {
    Ok(match bytes.len() {
        4 => f32::from_be_bytes(bytes.try_into()?) as f64,
        8 => f64::from_be_bytes(bytes.try_into()?),
        _ => return Err(Error::TypeMismatch),
    })
}

pub fn encode_boolean(value: bool) -> Bytes {
    Bytes::from(vec![value as u8])
}

pub fn decode_boolean(bytes: &[u8]) -> Result<bool, Error> {
    match bytes {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(Error::TypeMismatch),
    }
}

/// Two big-endian 16-bit ids: object id then object instance id.
pub fn encode_object_link(object_id: u16, object_instance_id: u16) -> Bytes {
    let mut bytes = BytesMut::with_capacity(4);
    bytes.put_u16(object_id);
    bytes.put_u16(object_instance_id);
    bytes.freeze()
}

pub fn decode_object_link(bytes: &[u8]) -> Result<(u16, u16), Error> {
    if bytes.len() != 4 {
        return Err(Error::TypeMismatch);
    }

    Ok((
        u16::from_be_bytes(bytes[0..2].try_into()?),
        u16::from_be_bytes(bytes[2..4].try_into()?),
    ))
}

/// Decode any numeric value to an f64 for threshold comparisons.
pub fn decode_numeric(resource_type: ResourceType, bytes: &[u8]) -> Result<f64, Error> {
    match resource_type.scalar() {
        ResourceType::Integer | ResourceType::Time => Ok(decode_integer(bytes)? as f64),
        ResourceType::Float => decode_float(bytes),
        _ => Err(Error::TypeMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_widths() {
        assert_eq!(encode_integer(0).len(), 1);
        assert_eq!(encode_integer(127).len(), 1);
        assert_eq!(encode_integer(-1).len(), 1);
        assert_eq!(encode_integer(32767).len(), 2);
        assert_eq!(encode_integer(-32768).len(), 2);
        assert_eq!(encode_integer(32768).len(), 4);
        assert_eq!(encode_integer(i64::from(i32::MIN)).len(), 4);
        assert_eq!(encode_integer(i64::from(i32::MAX) + 1).len(), 8);
    }

    #[test]
    fn float_narrowing() {
        assert_eq!(encode_float(0.5).len(), 4);
        assert_eq!(encode_float(0.1).len(), 8);
        assert_eq!(decode_float(&encode_float(0.1)).unwrap(), 0.1);
    }

    #[test]
    fn object_link_round_trip() {
        let bytes = encode_object_link(3, 0);
        assert_eq!(bytes.as_ref(), &[0x00, 0x03, 0x00, 0x00]);
        assert_eq!(decode_object_link(&bytes).unwrap(), (3, 0));
    }

    #[test]
    fn width_checks() {
        assert!(ResourceType::Integer.check_width(3).is_err());
        assert!(ResourceType::Float.check_width(2).is_err());
        assert!(ResourceType::Boolean.check_width(1).is_ok());
        assert!(ResourceType::String.check_width(0).is_ok());
    }
}
