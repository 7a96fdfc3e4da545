use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Session counters, cheap enough to bump from every event callback.
#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    registrations: AtomicU64,
    updates: AtomicU64,
    notifications: AtomicU64,
    failures: AtomicU64,
}

#[derive(Default, Clone)]
pub struct Statistics(Arc<Counters>);

impl Statistics {
    pub fn add_request(&self) {
        self.0.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_registration(&self) {
        self.0.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_update(&self) {
        self.0.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_notification(&self) {
        self.0.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.0.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.0.requests.load(Ordering::Relaxed)
    }

    pub fn registrations(&self) -> u64 {
        self.0.registrations.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.0.updates.load(Ordering::Relaxed)
    }

    pub fn notifications(&self) -> u64 {
        self.0.notifications.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.0.failures.load(Ordering::Relaxed)
    }
}
