//! Compact CoAP (RFC 7252) message codec.
//!
//! [RFC7252]: https://tools.ietf.org/html/rfc7252
//!
//! Only what an LwM2M endpoint needs: the four methods, the response codes
//! the dispatcher maps onto, and the options carrying paths, queries,
//! content negotiation and observe sequence numbers. Reliability (retries,
//! dedup) stays with the transport owner; this module is purely the wire
//! image.

use bytes::{BufMut, Bytes, BytesMut};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

pub const VERSION: u8 = 1;

/// Payload marker between the option list and the payload.
const PAYLOAD_MARKER: u8 = 0xFF;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

/// Method and response codes, `class.detail` packed as `class << 5 | detail`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum Code {
    Empty = 0x00,
    Get = 0x01,
    Post = 0x02,
    Put = 0x03,
    Delete = 0x04,
    /// 2.01
    Created = 0x41,
    /// 2.02
    Deleted = 0x42,
    /// 2.03
    Valid = 0x43,
    /// 2.04
    Changed = 0x44,
    /// 2.05
    Content = 0x45,
    /// 4.00
    BadRequest = 0x80,
    /// 4.01
    Unauthorized = 0x81,
    /// 4.02
    BadOption = 0x82,
    /// 4.03
    Forbidden = 0x83,
    /// 4.04
    NotFound = 0x84,
    /// 4.05
    MethodNotAllowed = 0x85,
    /// 4.06
    NotAcceptable = 0x86,
    /// 4.15
    UnsupportedContentFormat = 0x8F,
    /// 5.00
    InternalServerError = 0xA0,
}

impl Code {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Get | Self::Post | Self::Put | Self::Delete)
    }

    pub fn is_success(&self) -> bool {
        (u8::from(*self)) >> 5 == 2
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = u8::from(*self);
        write!(f, "{}.{:02}", value >> 5, value & 0x1F)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
pub enum OptionNumber {
    Observe = 6,
    LocationPath = 8,
    UriPath = 11,
    ContentFormat = 12,
    UriQuery = 15,
    Accept = 17,
}

/// A decoded (or under-construction) CoAP message.
///
/// Options are kept sorted by number; repeats of the same number keep their
/// insertion order, which is what carries multi-segment paths.
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::coap::{Code, Message, MessageType};
///
/// let mut message = Message::new(MessageType::Confirmable, Code::Get, 12345);
/// message.set_token(&[0xAB, 0xCD]);
/// message.set_uri_path("/3/0/0");
/// message.set_accept(0);
///
/// let bytes = message.encode();
/// assert_eq!(
///     bytes.as_ref(),
///     &[
///         0x42, 0x01, 0x30, 0x39, 0xAB, 0xCD, 0xB1, 0x33, 0x01, 0x30,
///         0x01, 0x30, 0x60,
///     ],
/// );
///
/// let decoded = Message::decode(&bytes).unwrap();
/// assert_eq!(decoded.uri_path(), "/3/0/0");
/// assert_eq!(decoded.accept(), Some(0));
/// assert_eq!(decoded.token(), &[0xAB, 0xCD]);
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageType,
    pub code: Code,
    pub message_id: u16,
    token: Vec<u8>,
    options: Vec<(u16, Vec<u8>)>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// An acknowledgement carrying the response for `request`.
    pub fn response(request: &Message, code: Code) -> Self {
        let mut message = Self::new(MessageType::Acknowledgement, code, request.message_id);
        message.set_token(&request.token);
        message
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn set_token(&mut self, token: &[u8]) {
        assert!(token.len() <= 8);
        self.token = token.to_vec();
    }

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let index = self
            .options
            .partition_point(|(existing, _)| *existing <= number);

        self.options.insert(index, (number, value));
    }

    fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(existing, _)| *existing == number)
            .map(|(_, value)| value.as_slice())
    }

    fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |(existing, _)| *existing == number)
            .map(|(_, value)| value.as_slice())
    }

    fn put_uint(&mut self, number: u16, value: u32) {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|byte| **byte == 0).count();
        self.add_option(number, bytes[skip..].to_vec());
    }

    fn uint(&self, number: u16) -> Option<u32> {
        let bytes = self.option(number)?;
        if bytes.len() > 4 {
            return None;
        }

        let mut value = 0u32;
        for byte in bytes {
            value = (value << 8) | *byte as u32;
        }

        Some(value)
    }

    pub fn set_uri_path(&mut self, path: &str) {
        for segment in path.split('/').filter(|it| !it.is_empty()) {
            self.add_option(OptionNumber::UriPath.into(), segment.as_bytes().to_vec());
        }
    }

    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.option_values(OptionNumber::UriPath.into()) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }

        path
    }

    pub fn add_uri_query(&mut self, query: &str) {
        self.add_option(OptionNumber::UriQuery.into(), query.as_bytes().to_vec());
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.option_values(OptionNumber::UriQuery.into())
            .map(|it| String::from_utf8_lossy(it).to_string())
            .collect()
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.put_uint(OptionNumber::ContentFormat.into(), format as u32);
    }

    pub fn content_format(&self) -> Option<u16> {
        self.uint(OptionNumber::ContentFormat.into())
            .map(|it| it as u16)
    }

    pub fn set_accept(&mut self, format: u16) {
        self.put_uint(OptionNumber::Accept.into(), format as u32);
    }

    pub fn accept(&self) -> Option<u16> {
        self.uint(OptionNumber::Accept.into()).map(|it| it as u16)
    }

    pub fn set_observe(&mut self, value: u32) {
        self.put_uint(OptionNumber::Observe.into(), value & 0x00FF_FFFF);
    }

    pub fn observe(&self) -> Option<u32> {
        self.uint(OptionNumber::Observe.into())
    }

    pub fn set_location_path(&mut self, path: &str) {
        for segment in path.split('/').filter(|it| !it.is_empty()) {
            self.add_option(
                OptionNumber::LocationPath.into(),
                segment.as_bytes().to_vec(),
            );
        }
    }

    pub fn location_path(&self) -> String {
        let mut path = String::new();
        for segment in self.option_values(OptionNumber::LocationPath.into()) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }

        path
    }

    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }

    pub fn encode(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(64 + self.payload.len());

        bytes.put_u8(
            VERSION << 6 | u8::from(self.kind) << 4 | self.token.len() as u8,
        );
        bytes.put_u8(self.code.into());
        bytes.put_u16(self.message_id);
        bytes.put(self.token.as_slice());

        let mut previous = 0u16;
        for (number, value) in &self.options {
            let delta = number - previous;
            previous = *number;

            let (delta_nibble, delta_ext) = nibble(delta);
            let (length_nibble, length_ext) = nibble(value.len() as u16);

            bytes.put_u8(delta_nibble << 4 | length_nibble);
            put_ext(&mut bytes, delta_nibble, delta_ext);
            put_ext(&mut bytes, length_nibble, length_ext);
            bytes.put(value.as_slice());
        }

        if !self.payload.is_empty() {
            bytes.put_u8(PAYLOAD_MARKER);
            bytes.put(self.payload.as_ref());
        }

        bytes.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 || bytes[0] >> 6 != VERSION {
            return Err(Error::DecodeError);
        }

        let kind = MessageType::try_from((bytes[0] >> 4) & 0b11).map_err(|_| Error::DecodeError)?;
        let token_length = (bytes[0] & 0x0F) as usize;
        if token_length > 8 || bytes.len() < 4 + token_length {
            return Err(Error::DecodeError);
        }

        let code = Code::try_from(bytes[1]).map_err(|_| Error::DecodeError)?;
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        let token = bytes[4..4 + token_length].to_vec();

        let mut message = Self {
            kind,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Bytes::new(),
        };

        let mut offset = 4 + token_length;
        let mut number = 0u16;
        while offset < bytes.len() {
            if bytes[offset] == PAYLOAD_MARKER {
                if offset + 1 >= bytes.len() {
                    // A marker with no payload behind it is malformed.
                    return Err(Error::DecodeError);
                }

                message.payload = Bytes::copy_from_slice(&bytes[offset + 1..]);
                break;
            }

            let delta_nibble = bytes[offset] >> 4;
            let length_nibble = bytes[offset] & 0x0F;
            offset += 1;

            let delta = take_ext(bytes, &mut offset, delta_nibble)?;
            let length = take_ext(bytes, &mut offset, length_nibble)? as usize;

            if bytes.len() < offset + length {
                return Err(Error::DecodeError);
            }

            number = number.checked_add(delta).ok_or(Error::DecodeError)?;
            message
                .options
                .push((number, bytes[offset..offset + length].to_vec()));

            offset += length;
        }

        Ok(message)
    }
}

fn nibble(value: u16) -> (u8, u16) {
    if value < 13 {
        (value as u8, 0)
    } else if value < 269 {
        (13, value - 13)
    } else {
        (14, value - 269)
    }
}

fn put_ext(bytes: &mut BytesMut, nibble: u8, ext: u16) {
    match nibble {
        13 => bytes.put_u8(ext as u8),
        14 => bytes.put_u16(ext),
        _ => {}
    }
}

fn take_ext(bytes: &[u8], offset: &mut usize, nibble: u8) -> Result<u16, Error> {
    Ok(match nibble {
        15 => return Err(Error::DecodeError),
        14 => {
            if bytes.len() < *offset + 2 {
                return Err(Error::DecodeError);
            }

            let value = u16::from_be_bytes([bytes[*offset], bytes[*offset + 1]]) + 269;
            *offset += 2;
            value
        }
        13 => {
            if bytes.len() < *offset + 1 {
                return Err(Error::DecodeError);
            }

            let value = bytes[*offset] as u16 + 13;
            *offset += 1;
            value
        }
        _ => nibble as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_round_trip() {
        let mut request = Message::new(MessageType::Confirmable, Code::Post, 7);
        request.set_token(&[1, 2, 3, 4]);

        let mut response = Message::response(&request, Code::Created);
        response.set_location_path("/rd/5");
        response.set_payload(Bytes::from_static(b"ok"));

        let decoded = Message::decode(&response.encode()).unwrap();
        assert_eq!(decoded.kind, MessageType::Acknowledgement);
        assert_eq!(decoded.code, Code::Created);
        assert_eq!(decoded.message_id, 7);
        assert_eq!(decoded.token(), &[1, 2, 3, 4]);
        assert_eq!(decoded.location_path(), "/rd/5");
        assert_eq!(decoded.payload.as_ref(), b"ok");
    }

    #[test]
    fn observe_is_24_bit() {
        let mut message = Message::new(MessageType::NonConfirmable, Code::Content, 1);
        message.set_observe(0x0100_0001);

        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.observe(), Some(1));
    }

    #[test]
    fn large_content_format_uses_two_bytes() {
        let mut message = Message::new(MessageType::Confirmable, Code::Put, 1);
        message.set_content_format(1542);

        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.content_format(), Some(1542));
    }

    #[test]
    fn queries_accumulate() {
        let mut message = Message::new(MessageType::Confirmable, Code::Post, 1);
        message.set_uri_path("/rd");
        message.add_uri_query("ep=imagination1");
        message.add_uri_query("lt=30");

        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.uri_path(), "/rd");
        assert_eq!(decoded.uri_query(), vec!["ep=imagination1", "lt=30"]);
    }

    #[test]
    fn truncated_rejected() {
        assert!(Message::decode(&[0x42, 0x01, 0x00]).is_err());
        assert!(Message::decode(&[0x42, 0x01, 0x00, 0x01, 0xAB]).is_err());

        let mut message = Message::new(MessageType::Confirmable, Code::Get, 1);
        message.set_uri_path("/3");
        let bytes = message.encode();
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
