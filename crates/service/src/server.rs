//! The server session: the Registration interface of a management server.
//!
//! Serves `POST /rd` (register), `POST /rd/<n>` (update) and
//! `DELETE /rd/<n>` (deregister) and sweeps expired registrations from
//! `process`. Device-management traffic towards clients originates with
//! the embedding application, which reads the registry to learn where
//! each client lives.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use codec::{
    ContentFormat,
    coap::{Code, Message},
    link,
};

use crate::{
    Error, ServiceHandler,
    clients::ClientRegistry,
    endpoints::{EndpointKind, EndpointTable, error_code},
    transport::Transport,
};

/// How often expired registrations are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct ServerOptions<T> {
    /// Default lifetime for registrations that do not carry `lt=`.
    pub default_lifetime: u32,
    pub handler: T,
}

pub struct ServerService<T> {
    clients: ClientRegistry,
    endpoints: EndpointTable,
    default_lifetime: u32,
    last_sweep: Option<Instant>,
    handler: T,
}

impl<T: ServiceHandler> ServerService<T> {
    pub fn new(options: ServerOptions<T>) -> Self {
        let mut endpoints = EndpointTable::default();
        endpoints.insert("/rd", EndpointKind::Registration);

        Self {
            clients: ClientRegistry::new(),
            endpoints,
            default_lifetime: options.default_lifetime,
            last_sweep: None,
            handler: options.handler,
        }
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Route one received CoAP request and send the response.
    pub fn handle_message<U: Transport>(
        &mut self,
        peer: SocketAddr,
        message: &Message,
        now: Instant,
        transport: &mut U,
    ) {
        if !message.code.is_request() {
            return;
        }

        let response = match self.dispatch(peer, message, now) {
            Ok(response) => response,
            Err(error) => {
                log::debug!(
                    "registration request failed: peer={:?}, path={:?}, error={:?}",
                    peer,
                    message.uri_path(),
                    error
                );

                Message::response(message, error_code(&error))
            }
        };

        if transport.send(peer, response).is_err() {
            log::warn!("response to {peer:?} failed to send");
        }
    }

    /// Sweep expired registrations; returns the next-timeout hint.
    pub fn process<U: Transport>(&mut self, now: Instant, _transport: &mut U) -> Duration {
        let due = self
            .last_sweep
            .map(|at| at + SWEEP_INTERVAL)
            .unwrap_or(now);

        if now >= due {
            self.last_sweep = Some(now);
            for record in self.clients.sweep(now) {
                log::info!(
                    "registration expired: endpoint={:?}, location={:?}",
                    record.endpoint,
                    record.location
                );

                self.handler
                    .on_client_expired(&record.endpoint, &record.location);
            }

            SWEEP_INTERVAL
        } else {
            due - now
        }
    }

    fn dispatch(
        &mut self,
        peer: SocketAddr,
        message: &Message,
        now: Instant,
    ) -> Result<Message, Error> {
        let path = message.uri_path();

        match self.endpoints.lookup(&path) {
            Some(EndpointKind::Registration | EndpointKind::RegistrationLocation) => {}
            _ => return Err(Error::NotFound),
        }

        match (message.code, path.as_str()) {
            (Code::Post, "/rd") => self.register(peer, message, now),
            (Code::Post, _) => self.update(message, &path, now),
            (Code::Delete, _) => self.deregister(message, &path),
            _ => Err(Error::OperationNotPermitted),
        }
    }

    fn register(
        &mut self,
        peer: SocketAddr,
        message: &Message,
        now: Instant,
    ) -> Result<Message, Error> {
        let query = parse_query(&message.uri_query());

        let endpoint = query
            .get("ep")
            .filter(|it| !it.is_empty())
            .ok_or(Error::PathInvalid)?;

        let lifetime = query
            .lifetime()
            .unwrap_or(self.default_lifetime);

        let binding = query.get("b").unwrap_or("U");

        if let Some(format) = message.content_format() {
            if ContentFormat::from_media_type(format) != Some(ContentFormat::LinkFormat) {
                return Err(Error::CodecNotFound);
            }
        }

        let body = std::str::from_utf8(&message.payload).map_err(|_| Error::DecodeError)?;
        let objects = link::parse(body)?;

        let (record, replaced) =
            self.clients
                .register(endpoint, peer, lifetime, binding, objects, now);

        if let Some(replaced) = replaced {
            log::info!(
                "registration replaced: endpoint={:?}, old location={:?}",
                replaced.endpoint,
                replaced.location
            );
        }

        log::info!(
            "client registered: endpoint={:?}, location={:?}, lifetime={}",
            record.endpoint,
            record.location,
            record.lifetime
        );

        self.handler
            .on_client_registered(&record.endpoint, &record.location);

        let mut response = Message::response(message, Code::Created);
        response.set_location_path(&record.location);

        Ok(response)
    }

    fn update(&mut self, message: &Message, path: &str, now: Instant) -> Result<Message, Error> {
        let query = parse_query(&message.uri_query());
        let lifetime = query.lifetime();

        let objects = if message.payload.is_empty() {
            None
        } else {
            let body =
                std::str::from_utf8(&message.payload).map_err(|_| Error::DecodeError)?;
            Some(link::parse(body)?)
        };

        let record = self
            .clients
            .update(path, lifetime, objects, now)
            .ok_or(Error::NotFound)?;

        let (endpoint, location) = (record.endpoint.clone(), record.location.clone());
        log::info!(
            "registration updated: endpoint={:?}, location={:?}",
            endpoint,
            location
        );

        self.handler.on_client_updated(&endpoint, &location);

        Ok(Message::response(message, Code::Changed))
    }

    fn deregister(&mut self, message: &Message, path: &str) -> Result<Message, Error> {
        let record = self.clients.deregister(path).ok_or(Error::NotFound)?;

        log::info!(
            "client deregistered: endpoint={:?}, location={:?}",
            record.endpoint,
            record.location
        );

        self.handler
            .on_client_deregistered(&record.endpoint, &record.location);

        Ok(Message::response(message, Code::Deleted))
    }
}

struct Query(ahash::HashMap<String, String>);

impl Query {
    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn lifetime(&self) -> Option<u32> {
        self.get("lt").and_then(|it| it.parse().ok())
    }
}

fn parse_query(entries: &[String]) -> Query {
    use ahash::HashMapExt;

    let mut map = ahash::HashMap::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((name, value)) => {
                map.insert(name.to_string(), value.to_string());
            }
            None => {
                map.insert(entry.clone(), String::new());
            }
        }
    }

    Query(map)
}
