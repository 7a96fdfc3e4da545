//! ## OMA Lightweight Machine-to-Machine (LwM2M) wire formats
//!
//! [OMA-TS-LightweightM2M]: http://www.openmobilealliance.org/release/LightweightM2M/
//! [RFC7252]: https://tools.ietf.org/html/rfc7252
//! [RFC6690]: https://tools.ietf.org/html/rfc6690
//!
//! LwM2M addresses a hierarchy of objects, object instances, resources and
//! resource instances, each identified by a 16-bit id. Payloads carrying a
//! slice of that hierarchy travel in one of four interchangeable content
//! formats: the OMA TLV binary format, the pre-SenML JSON profile, plain
//! text for single scalar resources, and raw octets for opaque resources.
//! All four produce and consume the same detached tree representation
//! ([`node::Node`]), driven by the object and resource schemas held in a
//! [`registry::DefinitionRegistry`].
//!
//! The transport beneath every payload is CoAP [RFC7252]; a compact message
//! codec lives in [`coap`]. Discover responses and registration bodies use
//! the CoRE link format [RFC6690] implemented in [`link`].

pub mod coap;
pub mod link;
pub mod node;
pub mod opaque;
pub mod path;
pub mod registry;
pub mod senml;
pub mod serdes;
pub mod text;
pub mod tlv;
pub mod value;

use std::{array::TryFromSliceError, str::Utf8Error};

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug)]
pub enum Error {
    /// Malformed URI, out-of-range id or trailing garbage.
    PathInvalid,
    /// The object or resource is unknown to the definition registry.
    NotDefined,
    /// The definition exists but no instance does.
    NotFound,
    /// The wire encoding conflicts with the registered resource type.
    TypeMismatch,
    /// The bytes are structurally invalid for the content format.
    DecodeError,
    /// No codec handles this content format at this level.
    CodecNotFound,
    /// Duplicate registration attempt.
    AlreadyDefined,
    /// Cardinality or operation rules rejected a definition.
    DefinitionInvalid,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// CoAP Content-Format identifiers recognized by the stack.
///
/// The values are the canonical ones from the LwM2M registry; the legacy
/// aliases that appeared in earlier drafts are folded onto them by
/// [`ContentFormat::from_media_type`].
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::ContentFormat;
///
/// assert_eq!(ContentFormat::from_media_type(1542), Some(ContentFormat::Tlv));
/// assert_eq!(ContentFormat::from_media_type(11542), Some(ContentFormat::Tlv));
/// assert_eq!(ContentFormat::from_media_type(50), Some(ContentFormat::Json));
/// assert_eq!(ContentFormat::from_media_type(9999), None);
/// ```
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ContentFormat {
    PlainText = 0,
    LinkFormat = 40,
    Opaque = 42,
    Tlv = 1542,
    Json = 1543,
}

impl ContentFormat {
    /// Translate a numeric media type to a canonical content format.
    ///
    /// Accepts the canonical ids plus the legacy `+text` (1541), `+opaque`
    /// (1544), IANA tlv/json (11542/11543) and `application/json` (50)
    /// aliases. Everything downstream of the dispatcher sees canonical
    /// variants only.
    pub fn from_media_type(value: u16) -> Option<Self> {
        Some(match value {
            0 | 1541 => Self::PlainText,
            40 => Self::LinkFormat,
            42 | 1544 => Self::Opaque,
            1542 | 11542 => Self::Tlv,
            50 | 1543 | 11543 => Self::Json,
            _ => return None,
        })
    }
}
