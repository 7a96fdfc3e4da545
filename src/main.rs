use std::sync::Arc;

use lwm2m_stack::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    lwm2m_stack::startup(config).await
}
