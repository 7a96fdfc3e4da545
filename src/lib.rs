pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use self::{config::Config, statistics::Statistics};

/// In order to let integration tests use the crate directly and start the
/// daemon, a function is opened to replace the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let statistics = Statistics::default();
    server::start(&config, &statistics).await
}
