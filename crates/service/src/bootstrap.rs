//! The client-side bootstrap state machine.
//!
//! Provisioning happens one of three ways: the factory payload already
//! injected Security/Server instances (the machine starts bootstrapped), a
//! usable non-bootstrap Security entry already exists (`CheckExisting`),
//! or the machine holds off and then POSTs a bootstrap request, accepts
//! the bootstrap server's writes to `/0` and `/1`, and waits for
//! `POST /bs` as the finish signal.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use codec::coap::{Code, Message, MessageType};

use crate::{
    objects::security,
    store::ObjectStore,
    transport::{Transport, parse_coap_uri},
};

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotBootStrapped,
    BootStrapPending,
    CheckExisting,
    ClientHoldOff,
    /// Waiting for the server to send a bootstrap finished.
    BootStrapFinishPending,
    BootStrapped,
    BootStrapFailed,
}

#[derive(Debug)]
pub struct BootstrapMachine {
    state: BootstrapState,
    endpoint_name: String,
    deadline: Option<Instant>,
    attempts: u32,
    server_address: Option<SocketAddr>,
}

impl BootstrapMachine {
    pub fn new(endpoint_name: &str) -> Self {
        Self {
            state: BootstrapState::NotBootStrapped,
            endpoint_name: endpoint_name.to_string(),
            deadline: None,
            attempts: 0,
            server_address: None,
        }
    }

    /// Factory mode: the host injected the Security/Server instances, no
    /// conversation happens.
    pub fn new_bootstrapped(endpoint_name: &str) -> Self {
        Self {
            state: BootstrapState::BootStrapped,
            ..Self::new(endpoint_name)
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.state == BootstrapState::BootStrapped
    }

    /// Bootstrap-origin writes are only valid while the conversation with
    /// the bootstrap server is open.
    pub fn accepts_bootstrap_writes(&self, peer: SocketAddr) -> bool {
        self.state == BootstrapState::BootStrapFinishPending
            && self.server_address == Some(peer)
    }

    /// Restart after a failure; the host decides when.
    pub fn restart(&mut self) {
        self.state = BootstrapState::NotBootStrapped;
        self.deadline = None;
        self.attempts = 0;
    }

    /// The bootstrap server's Security entry, if one is provisioned.
    fn bootstrap_server(store: &ObjectStore) -> Option<(u16, SocketAddr, u32)> {
        for instance_id in store.instance_ids(security::OBJECT_ID).collect::<Vec<u16>>() {
            if store.boolean(security::OBJECT_ID, instance_id, security::BOOTSTRAP) != Some(true) {
                continue;
            }

            let uri = store.string(security::OBJECT_ID, instance_id, security::SERVER_URI)?;
            let address = parse_coap_uri(&uri)?;
            let hold_off = store
                .integer(security::OBJECT_ID, instance_id, security::HOLD_OFF_TIME)
                .unwrap_or(0)
                .max(0) as u32;

            return Some((instance_id, address, hold_off));
        }

        None
    }

    /// Whether a usable (non-bootstrap) Security entry exists.
    fn has_server_credentials(store: &ObjectStore) -> bool {
        store
            .instance_ids(security::OBJECT_ID)
            .collect::<Vec<u16>>()
            .into_iter()
            .any(|instance_id| {
                store.boolean(security::OBJECT_ID, instance_id, security::BOOTSTRAP)
                    == Some(false)
                    && store
                        .integer(security::OBJECT_ID, instance_id, security::SHORT_SERVER_ID)
                        .is_some()
            })
    }

    fn send_request<T: Transport>(&mut self, transport: &mut T, now: Instant) {
        let Some(address) = self.server_address else {
            self.state = BootstrapState::BootStrapFailed;
            return;
        };

        let mut message = Message::new(
            MessageType::Confirmable,
            Code::Post,
            rand::random::<u16>(),
        );
        message.set_token(&rand::random::<[u8; 8]>());
        message.set_uri_path("/bs");
        message.add_uri_query(&format!("ep={}", self.endpoint_name));

        self.attempts += 1;
        self.deadline = Some(now + REQUEST_TIMEOUT);
        self.state = BootstrapState::BootStrapFinishPending;

        log::info!(
            "bootstrap request: server={:?}, endpoint={:?}, attempt={}",
            address,
            self.endpoint_name,
            self.attempts
        );

        if transport.send(address, message).is_err() {
            self.failure();
        }
    }

    fn failure(&mut self) {
        if self.attempts >= MAX_ATTEMPTS {
            log::error!("bootstrap failed after {} attempts", self.attempts);
            self.state = BootstrapState::BootStrapFailed;
        } else {
            // Back to pending; the next tick re-sends.
            self.state = BootstrapState::ClientHoldOff;
            self.deadline = None;
        }
    }

    /// `POST /bs` arrived from the bootstrap server.
    pub fn finish(&mut self, peer: SocketAddr) -> bool {
        if self.state == BootstrapState::BootStrapFinishPending
            && self.server_address == Some(peer)
        {
            self.state = BootstrapState::BootStrapped;
            self.deadline = None;
            true
        } else {
            false
        }
    }

    /// Advance the machine; returns how long the caller may sleep before
    /// the next deadline, or `None` when idle.
    pub fn tick<T: Transport>(
        &mut self,
        now: Instant,
        store: &ObjectStore,
        transport: &mut T,
    ) -> Option<Duration> {
        match self.state {
            BootstrapState::NotBootStrapped => {
                self.state = BootstrapState::BootStrapPending;
                self.tick(now, store, transport)
            }
            BootstrapState::BootStrapPending => {
                if Self::has_server_credentials(store) {
                    self.state = BootstrapState::CheckExisting;
                    return self.tick(now, store, transport);
                }

                match Self::bootstrap_server(store) {
                    Some((_, address, hold_off)) => {
                        self.server_address = Some(address);
                        self.state = BootstrapState::ClientHoldOff;
                        self.deadline = Some(now + Duration::from_secs(hold_off as u64));
                        self.deadline.map(|deadline| deadline - now)
                    }
                    None => {
                        log::error!("no bootstrap server and no existing credentials");
                        self.state = BootstrapState::BootStrapFailed;
                        None
                    }
                }
            }
            BootstrapState::CheckExisting => {
                self.state = BootstrapState::BootStrapped;
                None
            }
            BootstrapState::ClientHoldOff => match self.deadline {
                Some(deadline) if now < deadline => Some(deadline - now),
                _ => {
                    self.send_request(transport, now);
                    self.deadline.map(|deadline| deadline - now)
                }
            },
            BootstrapState::BootStrapFinishPending => match self.deadline {
                Some(deadline) if now < deadline => Some(deadline - now),
                _ => {
                    self.failure();
                    Some(Duration::from_secs(0))
                }
            },
            BootstrapState::BootStrapped | BootstrapState::BootStrapFailed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QueueTransport;

    use bytes::Bytes;
    use codec::registry::DefinitionRegistry;

    use crate::objects::register_standard_objects;
    use crate::store::Origin;

    fn store_with_bootstrap_server(registry: &DefinitionRegistry) -> ObjectStore {
        let mut store = ObjectStore::new();
        store
            .create_object_instance(registry, Origin::Bootstrap, 0, Some(0))
            .unwrap();

        for (resource_id, value) in [
            (
                security::SERVER_URI,
                Bytes::from_static(b"coap://127.0.0.1:15685"),
            ),
            (security::BOOTSTRAP, Bytes::from_static(&[1])),
            (security::HOLD_OFF_TIME, Bytes::from_static(&[0])),
        ] {
            store
                .set_resource_instance(
                    registry,
                    Origin::Bootstrap,
                    0,
                    0,
                    resource_id,
                    0,
                    value,
                )
                .unwrap();
        }

        store
    }

    #[test]
    fn server_driven_flow() {
        let mut registry = DefinitionRegistry::new();
        register_standard_objects(&mut registry).unwrap();

        let store = store_with_bootstrap_server(&registry);
        let mut transport = QueueTransport::default();
        let mut machine = BootstrapMachine::new("imagination1");

        let now = Instant::now();
        machine.tick(now, &store, &mut transport);
        machine.tick(now, &store, &mut transport);

        assert_eq!(machine.state(), BootstrapState::BootStrapFinishPending);

        let (peer, message) = transport.take().pop().unwrap();
        assert_eq!(peer, "127.0.0.1:15685".parse().unwrap());
        assert_eq!(message.uri_path(), "/bs");
        assert_eq!(message.uri_query(), vec!["ep=imagination1"]);

        assert!(machine.accepts_bootstrap_writes(peer));
        assert!(machine.finish(peer));
        assert!(machine.is_bootstrapped());
    }

    #[test]
    fn existing_credentials_skip_the_conversation() {
        let mut registry = DefinitionRegistry::new();
        register_standard_objects(&mut registry).unwrap();

        let mut store = ObjectStore::new();
        store
            .create_object_instance(&registry, Origin::Bootstrap, 0, Some(1))
            .unwrap();
        store
            .set_resource_instance(
                &registry,
                Origin::Bootstrap,
                0,
                1,
                security::BOOTSTRAP,
                0,
                Bytes::from_static(&[0]),
            )
            .unwrap();
        store
            .set_resource_instance(
                &registry,
                Origin::Bootstrap,
                0,
                1,
                security::SHORT_SERVER_ID,
                0,
                Bytes::from_static(&[1]),
            )
            .unwrap();

        let mut transport = QueueTransport::default();
        let mut machine = BootstrapMachine::new("imagination1");

        let now = Instant::now();
        machine.tick(now, &store, &mut transport);
        machine.tick(now, &store, &mut transport);

        assert!(machine.is_bootstrapped());
        assert!(transport.take().is_empty());
    }

    #[test]
    fn no_server_no_credentials_fails() {
        let mut registry = DefinitionRegistry::new();
        register_standard_objects(&mut registry).unwrap();

        let store = ObjectStore::new();
        let mut transport = QueueTransport::default();
        let mut machine = BootstrapMachine::new("imagination1");

        machine.tick(Instant::now(), &store, &mut transport);
        assert_eq!(machine.state(), BootstrapState::BootStrapFailed);

        machine.restart();
        assert_eq!(machine.state(), BootstrapState::NotBootStrapped);
    }
}
