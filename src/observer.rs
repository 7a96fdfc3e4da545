use crate::statistics::Statistics;

use service::ServiceHandler;

/// Logs session events and keeps the daemon's counters.
#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl ServiceHandler for Observer {
    fn on_bootstrapped(&self) {
        log::info!("bootstrapped");
    }

    fn on_bootstrap_failed(&self) {
        log::error!("bootstrap failed");
        self.statistics.add_failure();
    }

    fn on_registered(&self, short_server_id: u16, location: &str) {
        log::info!(
            "registered: short_server_id={}, location={:?}",
            short_server_id,
            location
        );

        self.statistics.add_registration();
    }

    fn on_register_failed(&self, short_server_id: u16) {
        log::error!("registration failed: short_server_id={}", short_server_id);
        self.statistics.add_failure();
    }

    fn on_registration_updated(&self, short_server_id: u16) {
        log::debug!("registration updated: short_server_id={}", short_server_id);
        self.statistics.add_update();
    }

    fn on_deregistered(&self, short_server_id: u16) {
        log::info!("deregistered: short_server_id={}", short_server_id);
    }

    fn on_notification(&self, path: &str, sequence: u32) {
        log::debug!("notification: path={:?}, sequence={}", path, sequence);
        self.statistics.add_notification();
    }

    fn on_execute(&self, path: &str, arguments: &[u8]) {
        log::info!("execute: path={:?}, arguments={} bytes", path, arguments.len());
    }

    fn on_client_registered(&self, endpoint: &str, location: &str) {
        log::info!(
            "client registered: endpoint={:?}, location={:?}",
            endpoint,
            location
        );

        self.statistics.add_registration();
    }

    fn on_client_updated(&self, endpoint: &str, location: &str) {
        log::debug!(
            "client updated: endpoint={:?}, location={:?}",
            endpoint,
            location
        );

        self.statistics.add_update();
    }

    fn on_client_deregistered(&self, endpoint: &str, location: &str) {
        log::info!(
            "client deregistered: endpoint={:?}, location={:?}",
            endpoint,
            location
        );
    }

    fn on_client_expired(&self, endpoint: &str, location: &str) {
        log::warn!(
            "client expired: endpoint={:?}, location={:?}",
            endpoint,
            location
        );

        self.statistics.add_failure();
    }
}
