//! The per-server registration state machine.
//!
//! One machine per Server object entry. Register ships the link-format
//! object list; Registered refreshes at half the lifetime or on demand;
//! transport failures back off exponentially up to a cap before the
//! failure surfaces to the host.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use codec::{
    coap::{Code, Message, MessageType},
    link::{Link, serialise},
    registry::DefinitionRegistry,
};

use crate::{
    objects::{security, server},
    store::ObjectStore,
    transport::{Transport, parse_coap_uri},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(64);
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    NotRegistered,
    Register,
    Registering,
    Registered,
    UpdatingRegistration,
    Deregister,
    Deregistering,
    RegisterFailed,
    RegisterFailedRetry,
}

/// What `handle_response` observed, for the session to relay to its
/// handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    Registered { location: String },
    Updated,
    Deregistered,
    Failed,
}

#[derive(Debug)]
struct Pending {
    token: Vec<u8>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct RegistrationMachine {
    pub short_server_id: u16,
    server_instance_id: u16,
    endpoint_name: String,
    address: SocketAddr,
    state: RegistrationState,
    location: String,
    last_update: Option<Instant>,
    pending: Option<Pending>,
    attempts: u32,
    backoff: Duration,
    retry_at: Option<Instant>,
    update_requested: bool,
    /// Store version the advertised object list was built at; a newer
    /// store version means the list must be re-sent with the next Update.
    list_version: u64,
}

/// The link-format payload advertised at registration: the alternate-path
/// root plus every object except Security.
pub fn object_links(registry: &DefinitionRegistry, store: &ObjectStore) -> String {
    let mut links = vec![Link::new("/").with_param("rt", "\"oma.lwm2m\"")];

    for object in registry.objects() {
        if object.id == security::OBJECT_ID {
            continue;
        }

        let mut instances = store.instance_ids(object.id).peekable();
        if instances.peek().is_none() {
            links.push(Link::new(format!("/{}", object.id)));
        } else {
            for instance_id in instances {
                links.push(Link::new(format!("/{}/{}", object.id, instance_id)));
            }
        }
    }

    serialise(&links)
}

/// Find the Security instance carrying credentials for `short_server_id`.
fn server_address(store: &ObjectStore, short_server_id: u16) -> Option<SocketAddr> {
    for instance_id in store.instance_ids(security::OBJECT_ID).collect::<Vec<u16>>() {
        if store.boolean(security::OBJECT_ID, instance_id, security::BOOTSTRAP) != Some(false) {
            continue;
        }

        if store.integer(security::OBJECT_ID, instance_id, security::SHORT_SERVER_ID)
            != Some(short_server_id as i64)
        {
            continue;
        }

        let uri = store.string(security::OBJECT_ID, instance_id, security::SERVER_URI)?;
        return parse_coap_uri(&uri);
    }

    None
}

/// Build one machine per Server object instance with credentials.
pub fn machines_from_store(
    endpoint_name: &str,
    store: &ObjectStore,
) -> Vec<RegistrationMachine> {
    let mut machines = Vec::new();

    for instance_id in store.instance_ids(server::OBJECT_ID).collect::<Vec<u16>>() {
        let Some(short_server_id) =
            store.integer(server::OBJECT_ID, instance_id, server::SHORT_SERVER_ID)
        else {
            continue;
        };

        let short_server_id = short_server_id as u16;
        let Some(address) = server_address(store, short_server_id) else {
            log::warn!("no security entry for short server id {short_server_id}");
            continue;
        };

        machines.push(RegistrationMachine {
            short_server_id,
            server_instance_id: instance_id,
            endpoint_name: endpoint_name.to_string(),
            address,
            state: RegistrationState::Register,
            location: String::new(),
            last_update: None,
            pending: None,
            attempts: 0,
            backoff: BACKOFF_INITIAL,
            retry_at: None,
            update_requested: false,
            list_version: 0,
        });
    }

    machines
}

impl RegistrationMachine {
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn peer(&self) -> SocketAddr {
        self.address
    }

    fn lifetime(&self, store: &ObjectStore) -> u32 {
        store
            .integer(server::OBJECT_ID, self.server_instance_id, server::LIFETIME)
            .unwrap_or(86400)
            .clamp(1, u32::MAX as i64) as u32
    }

    fn binding(&self, store: &ObjectStore) -> String {
        store
            .string(server::OBJECT_ID, self.server_instance_id, server::BINDING)
            .unwrap_or_else(|| "U".to_string())
    }

    /// Ask for an early registration update, with or without refreshing
    /// the advertised object list.
    pub fn request_update(&mut self) {
        self.update_requested = true;
    }

    /// Begin a graceful deregistration.
    pub fn deregister(&mut self) {
        if matches!(
            self.state,
            RegistrationState::Registered | RegistrationState::UpdatingRegistration
        ) {
            self.state = RegistrationState::Deregister;
        } else {
            self.state = RegistrationState::NotRegistered;
        }
    }

    fn send<T: Transport>(
        &mut self,
        transport: &mut T,
        now: Instant,
        message: Message,
        next: RegistrationState,
    ) {
        self.pending = Some(Pending {
            token: message.token().to_vec(),
            deadline: now + REQUEST_TIMEOUT,
        });

        if transport.send(self.address, message).is_err() {
            self.transport_failure(now);
            return;
        }

        self.state = next;
    }

    fn send_register<T: Transport>(
        &mut self,
        transport: &mut T,
        now: Instant,
        registry: &DefinitionRegistry,
        store: &ObjectStore,
    ) {
        let mut message = Message::new(
            MessageType::Confirmable,
            Code::Post,
            rand::random::<u16>(),
        );
        message.set_token(&rand::random::<[u8; 8]>());
        message.set_uri_path("/rd");
        message.add_uri_query(&format!("ep={}", self.endpoint_name));
        message.add_uri_query(&format!("lt={}", self.lifetime(store)));
        message.add_uri_query(&format!("b={}", self.binding(store)));
        message.set_content_format(codec::ContentFormat::LinkFormat.into());
        message.set_payload(object_links(registry, store).into_bytes().into());

        self.list_version = store.version();
        self.attempts += 1;

        log::info!(
            "register: server={:?}, short_server_id={}, lifetime={}",
            self.address,
            self.short_server_id,
            self.lifetime(store)
        );

        self.send(transport, now, message, RegistrationState::Registering);
    }

    fn send_update<T: Transport>(
        &mut self,
        transport: &mut T,
        now: Instant,
        registry: &DefinitionRegistry,
        store: &ObjectStore,
    ) {
        let mut message = Message::new(
            MessageType::Confirmable,
            Code::Post,
            rand::random::<u16>(),
        );
        message.set_token(&rand::random::<[u8; 8]>());
        message.set_uri_path(&self.location);
        message.add_uri_query(&format!("lt={}", self.lifetime(store)));

        // Only re-send the object list when it changed since it was last
        // advertised.
        if store.version() != self.list_version {
            message.set_content_format(codec::ContentFormat::LinkFormat.into());
            message.set_payload(object_links(registry, store).into_bytes().into());
            self.list_version = store.version();
        }

        log::info!(
            "registration update: server={:?}, location={:?}",
            self.address,
            self.location
        );

        self.send(transport, now, message, RegistrationState::UpdatingRegistration);
    }

    fn send_deregister<T: Transport>(&mut self, transport: &mut T, now: Instant) {
        let mut message = Message::new(
            MessageType::Confirmable,
            Code::Delete,
            rand::random::<u16>(),
        );
        message.set_token(&rand::random::<[u8; 8]>());
        message.set_uri_path(&self.location);

        log::info!(
            "deregister: server={:?}, location={:?}",
            self.address,
            self.location
        );

        self.send(transport, now, message, RegistrationState::Deregistering);
    }

    fn transport_failure(&mut self, now: Instant) {
        self.pending = None;

        match self.state {
            RegistrationState::Deregistering | RegistrationState::Deregister => {
                // Best-effort; a lost Deregister resets the machine anyway.
                self.state = RegistrationState::NotRegistered;
            }
            _ => {
                if self.attempts >= MAX_ATTEMPTS {
                    log::error!(
                        "registration failed: server={:?}, attempts={}",
                        self.address,
                        self.attempts
                    );

                    self.state = RegistrationState::RegisterFailed;
                } else {
                    self.state = RegistrationState::RegisterFailedRetry;
                    self.retry_at = Some(now + self.backoff);
                    self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// Route a response to this machine. Returns the observed event when
    /// the token matches an outstanding request.
    pub fn handle_response(
        &mut self,
        peer: SocketAddr,
        message: &Message,
        now: Instant,
    ) -> Option<RegistrationEvent> {
        if peer != self.address {
            return None;
        }

        let pending = self.pending.as_ref()?;
        if message.token() != pending.token.as_slice() {
            return None;
        }

        self.pending = None;

        match (self.state, message.code) {
            (RegistrationState::Registering, Code::Created) => {
                self.location = message.location_path();
                if self.location.is_empty() {
                    self.transport_failure(now);
                    return Some(RegistrationEvent::Failed);
                }

                self.state = RegistrationState::Registered;
                self.last_update = Some(now);
                self.attempts = 0;
                self.backoff = BACKOFF_INITIAL;

                Some(RegistrationEvent::Registered {
                    location: self.location.clone(),
                })
            }
            (RegistrationState::UpdatingRegistration, Code::Changed) => {
                self.state = RegistrationState::Registered;
                self.last_update = Some(now);

                Some(RegistrationEvent::Updated)
            }
            (RegistrationState::Deregistering, _) => {
                self.state = RegistrationState::NotRegistered;
                Some(RegistrationEvent::Deregistered)
            }
            (RegistrationState::UpdatingRegistration, Code::NotFound) => {
                // The server forgot us; fall back to a fresh Register.
                self.state = RegistrationState::Register;
                self.location.clear();
                None
            }
            _ => {
                self.transport_failure(now);
                Some(RegistrationEvent::Failed)
            }
        }
    }

    /// Advance the machine; returns the next deadline delay, or `None`
    /// when idle.
    pub fn tick<T: Transport>(
        &mut self,
        now: Instant,
        registry: &DefinitionRegistry,
        store: &ObjectStore,
        transport: &mut T,
    ) -> Option<Duration> {
        if let Some(pending) = &self.pending {
            if now >= pending.deadline {
                self.transport_failure(now);
            } else {
                return Some(pending.deadline - now);
            }
        }

        match self.state {
            RegistrationState::Register => {
                self.send_register(transport, now, registry, store);
                self.pending.as_ref().map(|it| it.deadline - now)
            }
            RegistrationState::Registered => {
                let lifetime = self.lifetime(store);
                let refresh = Duration::from_secs((lifetime / 2).max(1) as u64);
                let due = self
                    .last_update
                    .map(|it| it + refresh)
                    .unwrap_or(now);

                let list_changed = store.version() != self.list_version;
                if self.update_requested || list_changed || now >= due {
                    self.update_requested = false;
                    self.send_update(transport, now, registry, store);
                    self.pending.as_ref().map(|it| it.deadline - now)
                } else {
                    Some(due - now)
                }
            }
            RegistrationState::Deregister => {
                self.send_deregister(transport, now);
                self.pending.as_ref().map(|it| it.deadline - now)
            }
            RegistrationState::RegisterFailedRetry => match self.retry_at {
                Some(retry_at) if now < retry_at => Some(retry_at - now),
                _ => {
                    self.state = RegistrationState::Register;
                    Some(Duration::from_secs(0))
                }
            },
            RegistrationState::Registering
            | RegistrationState::UpdatingRegistration
            | RegistrationState::Deregistering => {
                self.pending.as_ref().map(|it| it.deadline - now)
            }
            RegistrationState::NotRegistered | RegistrationState::RegisterFailed => None,
        }
    }
}
