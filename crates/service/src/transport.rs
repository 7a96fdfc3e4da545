//! The CoAP transport port.
//!
//! The session cores never own a socket. Everything outbound goes through
//! this trait; everything inbound is pushed in by the host calling
//! `handle_request` / `handle_response`. Implementations must not block:
//! `send` hands the datagram to the OS or an outbound queue and returns.

use std::net::SocketAddr;

use codec::coap::Message;

use crate::Error;

pub trait Transport {
    /// Ship one CoAP message towards `peer`.
    fn send(&mut self, peer: SocketAddr, message: Message) -> Result<(), Error>;
}

/// Resolve a `coap://host:port` URI to a socket address.
///
/// DTLS (`coaps://`) terminates below this layer, so both schemes map to
/// the bare address. The default CoAP port applies when none is given.
///
/// # Test
///
/// ```
/// use lwm2m_stack_service::transport::parse_coap_uri;
///
/// assert_eq!(
///     parse_coap_uri("coap://127.0.0.1:15685").unwrap().port(),
///     15685,
/// );
/// assert_eq!(parse_coap_uri("coap://127.0.0.1").unwrap().port(), 5683);
/// assert!(parse_coap_uri("http://127.0.0.1").is_none());
/// ```
pub fn parse_coap_uri(uri: &str) -> Option<SocketAddr> {
    let rest = uri
        .strip_prefix("coap://")
        .or_else(|| uri.strip_prefix("coaps://"))?;

    let rest = rest.split('/').next()?;
    if let Ok(address) = rest.parse::<SocketAddr>() {
        return Some(address);
    }

    let ip = rest.parse::<std::net::IpAddr>().ok()?;
    Some(SocketAddr::new(ip, 5683))
}

/// An in-memory transport that records everything sent; the test harness
/// for every state machine.
#[derive(Debug, Default)]
pub struct QueueTransport {
    pub sent: Vec<(SocketAddr, Message)>,
}

impl QueueTransport {
    pub fn take(&mut self) -> Vec<(SocketAddr, Message)> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for QueueTransport {
    fn send(&mut self, peer: SocketAddr, message: Message) -> Result<(), Error> {
        self.sent.push((peer, message));
        Ok(())
    }
}
