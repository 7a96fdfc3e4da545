//! The server-side registry of registered clients.
//!
//! Locations are handed out as `/rd/<monotonic counter>`. A re-register
//! under an endpoint name already present replaces the old record; a
//! periodic sweep drops records whose lifetime lapsed without an Update.

use std::net::SocketAddr;
use std::time::Instant;

use ahash::{HashMap, HashMapExt};

use codec::link::Link;

/// Everything a server session knows about one registered client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub endpoint: String,
    pub location: String,
    pub address: SocketAddr,
    pub lifetime: u32,
    pub binding: String,
    pub objects: Vec<Link>,
    pub last_update: Instant,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    /// Keyed by location path.
    clients: HashMap<String, ClientRecord>,
    next_location: u64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            next_location: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, location: &str) -> Option<&ClientRecord> {
        self.clients.get(location)
    }

    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<&ClientRecord> {
        self.clients.values().find(|it| it.endpoint == endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    /// Register a client, returning its new record and the record it
    /// replaced, if the endpoint name was already present.
    pub fn register(
        &mut self,
        endpoint: &str,
        address: SocketAddr,
        lifetime: u32,
        binding: &str,
        objects: Vec<Link>,
        now: Instant,
    ) -> (ClientRecord, Option<ClientRecord>) {
        let replaced = self
            .clients
            .iter()
            .find(|(_, record)| record.endpoint == endpoint)
            .map(|(location, _)| location.clone())
            .and_then(|location| self.clients.remove(&location));

        let location = format!("/rd/{}", self.next_location);
        self.next_location += 1;

        let record = ClientRecord {
            endpoint: endpoint.to_string(),
            location: location.clone(),
            address,
            lifetime,
            binding: binding.to_string(),
            objects,
            last_update: now,
        };

        self.clients.insert(location, record.clone());
        (record, replaced)
    }

    /// Refresh a registration; absent fields keep their stored values.
    pub fn update(
        &mut self,
        location: &str,
        lifetime: Option<u32>,
        objects: Option<Vec<Link>>,
        now: Instant,
    ) -> Option<&ClientRecord> {
        let record = self.clients.get_mut(location)?;

        if let Some(lifetime) = lifetime {
            record.lifetime = lifetime;
        }

        if let Some(objects) = objects {
            record.objects = objects;
        }

        record.last_update = now;
        Some(record)
    }

    pub fn deregister(&mut self, location: &str) -> Option<ClientRecord> {
        self.clients.remove(location)
    }

    /// Drop every record whose lifetime lapsed; returns what was dropped.
    pub fn sweep(&mut self, now: Instant) -> Vec<ClientRecord> {
        let expired = self
            .clients
            .iter()
            .filter(|(_, record)| {
                now.duration_since(record.last_update).as_secs() > record.lifetime as u64
            })
            .map(|(location, _)| location.clone())
            .collect::<Vec<String>>();

        expired
            .into_iter()
            .filter_map(|location| self.clients.remove(&location))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn address() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn locations_are_monotonic() {
        let mut registry = ClientRegistry::new();
        let now = Instant::now();

        let (first, _) = registry.register("a", address(), 30, "U", vec![], now);
        let (second, _) = registry.register("b", address(), 30, "U", vec![], now);

        assert_eq!(first.location, "/rd/0");
        assert_eq!(second.location, "/rd/1");
    }

    #[test]
    fn duplicate_endpoint_replaces() {
        let mut registry = ClientRegistry::new();
        let now = Instant::now();

        registry.register("a", address(), 30, "U", vec![], now);
        let (record, replaced) = registry.register("a", address(), 60, "U", vec![], now);

        assert_eq!(registry.len(), 1);
        assert_eq!(replaced.unwrap().location, "/rd/0");
        assert_eq!(record.location, "/rd/1");
        assert_eq!(registry.get("/rd/1").unwrap().lifetime, 60);
        assert!(registry.get("/rd/0").is_none());
    }

    #[test]
    fn sweep_expires_by_lifetime() {
        let mut registry = ClientRegistry::new();
        let now = Instant::now();

        registry.register("a", address(), 10, "U", vec![], now);
        registry.register("b", address(), 100, "U", vec![], now);

        let expired = registry.sweep(now + Duration::from_secs(11));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].endpoint, "a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_refreshes_last_update() {
        let mut registry = ClientRegistry::new();
        let now = Instant::now();

        let (record, _) = registry.register("a", address(), 10, "U", vec![], now);
        registry
            .update(&record.location, None, None, now + Duration::from_secs(9))
            .unwrap();

        assert!(registry.sweep(now + Duration::from_secs(11)).is_empty());
    }
}
