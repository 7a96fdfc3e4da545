//! ## OMA Lightweight Machine-to-Machine (LwM2M) protocol core
//!
//! [OMA-TS-LightweightM2M]: http://www.openmobilealliance.org/release/LightweightM2M/
//!
//! A session is one LwM2M endpoint: a [`client::ClientService`] owns the
//! definition registry, the object store, the attribute and observer
//! stores and the bootstrap/registration machines of a device; a
//! [`server::ServerService`] owns the registry of clients registered with
//! a management server. Sessions are single-threaded and cooperative: the
//! host pushes received CoAP messages in, calls `process` on a timer, and
//! everything outbound leaves through the [`transport::Transport`] port.
//! Co-hosted sessions are fully independent instances.

pub mod attributes;
pub mod bootstrap;
pub mod client;
pub mod clients;
pub mod endpoints;
pub mod notify;
pub mod objects;
pub mod registration;
pub mod server;
pub mod store;
pub mod transport;

pub use client::{ClientOptions, ClientService};
pub use server::{ServerOptions, ServerService};
pub use store::Origin;

#[derive(Debug)]
pub enum Error {
    PathInvalid,
    NotDefined,
    NotFound,
    TypeMismatch,
    DecodeError,
    CodecNotFound,
    /// The operations mask forbids the request.
    OperationNotPermitted,
    /// The origin is not permitted: ACL or bootstrap-state gating.
    Unauthorized,
    /// Creation would violate cardinality rules.
    CannotCreate,
    /// Deletion would violate cardinality or mandatory rules.
    CannotDelete,
    AlreadyDefined,
    DefinitionInvalid,
    Timeout,
    TransportError,
    /// Invariant violation; never surfaced silently.
    Internal,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        match value {
            codec::Error::PathInvalid => Self::PathInvalid,
            codec::Error::NotDefined => Self::NotDefined,
            codec::Error::NotFound => Self::NotFound,
            codec::Error::TypeMismatch => Self::TypeMismatch,
            codec::Error::DecodeError => Self::DecodeError,
            codec::Error::CodecNotFound => Self::CodecNotFound,
            codec::Error::AlreadyDefined => Self::AlreadyDefined,
            codec::Error::DefinitionInvalid => Self::DefinitionInvalid,
            codec::Error::Utf8Error(_) | codec::Error::TryFromSliceError(_) => Self::DecodeError,
        }
    }
}

/// Session event callbacks.
///
/// Every method has a default no-op body; hosts implement what they care
/// about. All callbacks fire from within `process` or `handle_request` on
/// the session's thread, so implementations must not block.
pub trait ServiceHandler {
    /// bootstrap complete
    ///
    /// The client holds at least one usable Security/Server pair, either
    /// from the factory payload or written by a bootstrap server, and the
    /// registration machines may now run.
    #[allow(unused_variables)]
    fn on_bootstrapped(&self) {}

    /// bootstrap failed
    ///
    /// The bootstrap conversation exhausted its retries. The host may
    /// restart the machine or shut the session down.
    #[allow(unused_variables)]
    fn on_bootstrap_failed(&self) {}

    /// registration complete
    ///
    /// The server at `short_server_id` accepted the Register request and
    /// assigned `location`, which all Update and Deregister traffic for
    /// this server will use.
    #[allow(unused_variables)]
    fn on_registered(&self, short_server_id: u16, location: &str) {}

    /// registration failed
    ///
    /// The retry backoff hit its cap without an acknowledgement. The
    /// machine stays in its failed state until the host intervenes.
    #[allow(unused_variables)]
    fn on_register_failed(&self, short_server_id: u16) {}

    /// registration update acknowledged
    #[allow(unused_variables)]
    fn on_registration_updated(&self, short_server_id: u16) {}

    /// deregistered
    ///
    /// Either the host requested it during shutdown or the server
    /// acknowledged a Deregister.
    #[allow(unused_variables)]
    fn on_deregistered(&self, short_server_id: u16) {}

    /// notification emitted
    ///
    /// An observation fired; `sequence` is the Observe option value it
    /// carried.
    #[allow(unused_variables)]
    fn on_notification(&self, path: &str, sequence: u32) {}

    /// a resource was executed by a server
    #[allow(unused_variables)]
    fn on_execute(&self, path: &str, arguments: &[u8]) {}

    /// server side: client registered
    ///
    /// A new endpoint completed Registration. A re-register by an endpoint
    /// name already present replaces the prior record (and tears down the
    /// prior record's observations) before this fires.
    #[allow(unused_variables)]
    fn on_client_registered(&self, endpoint: &str, location: &str) {}

    /// server side: client refreshed its registration
    #[allow(unused_variables)]
    fn on_client_updated(&self, endpoint: &str, location: &str) {}

    /// server side: client deregistered
    #[allow(unused_variables)]
    fn on_client_deregistered(&self, endpoint: &str, location: &str) {}

    /// server side: client lifetime expired
    ///
    /// The periodic sweep found `now - last update > lifetime` and dropped
    /// the record.
    #[allow(unused_variables)]
    fn on_client_expired(&self, endpoint: &str, location: &str) {}
}

/// One factory-provisioned Security record.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct SecurityRecord {
    pub server_uri: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub bootstrap: bool,
    pub short_server_id: u16,
    #[cfg_attr(feature = "serde", serde(default))]
    pub hold_off_time: u32,
}

/// One factory-provisioned Server record.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct ServerRecord {
    pub short_server_id: u16,
    pub lifetime: u32,
    #[cfg_attr(feature = "serde", serde(default = "ServerRecord::binding"))]
    pub binding: String,
}

impl ServerRecord {
    fn binding() -> String {
        "U".to_string()
    }
}

/// The provisioning payload a host injects when no bootstrap server is
/// involved.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct FactoryBootstrap {
    pub security: SecurityRecord,
    pub server: ServerRecord,
}
