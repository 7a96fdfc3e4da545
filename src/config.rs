use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

use service::FactoryBootstrap;

/// The role a daemon instance plays.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// A device: expose objects, bootstrap, register, notify.
    Client,
    /// A management server: accept registrations at `/rd`.
    Server,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Client {
    ///
    /// Client endpoint name
    ///
    /// The globally unique identity this client registers under. Bounded
    /// so it survives constrained registration URIs.
    ///
    pub endpoint_name: String,
    ///
    /// Bootstrap server URI
    ///
    /// The empty string selects factory mode: the `factory` table below
    /// must then carry one Security and one Server record.
    ///
    #[serde(default)]
    pub bootstrap_uri: String,
    ///
    /// Seconds to wait before contacting the bootstrap server.
    ///
    #[serde(default)]
    pub bootstrap_hold_off: u32,
    ///
    /// Factory bootstrap payload
    ///
    #[serde(default)]
    pub factory: Option<FactoryBootstrap>,
}

impl Client {
    /// Endpoint names ride in registration queries; keep them bounded.
    pub const MAX_ENDPOINT_NAME: usize = 63;
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Server {
    ///
    /// Default registration lifetime in seconds, applied when a client
    /// registers without `lt=`.
    ///
    #[serde(default = "Server::lifetime")]
    pub default_lifetime: u32,
}

impl Server {
    fn lifetime() -> u32 {
        86400
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            default_lifetime: Self::lifetime(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    ///
    /// Daemon role
    ///
    pub mode: Mode,
    ///
    /// CoAP listen address
    ///
    #[serde(default = "Config::listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub client: Option<Client>,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn listen() -> SocketAddr {
        "0.0.0.0:5683".parse().unwrap()
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: lwm2m-stack --config /etc/lwm2m/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    pub fn load() -> Result<Self> {
        Self::from_str(&read_to_string(&Cli::parse().config)?)
    }

    pub fn from_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mode == Mode::Client {
            let client = self
                .client
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("client mode requires a [client] table"))?;

            if client.endpoint_name.is_empty()
                || client.endpoint_name.len() > Client::MAX_ENDPOINT_NAME
            {
                anyhow::bail!(
                    "endpoint name must be 1..={} bytes",
                    Client::MAX_ENDPOINT_NAME
                );
            }

            if client.bootstrap_uri.is_empty() && client.factory.is_none() {
                anyhow::bail!("factory records are required without a bootstrap server");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_parses() {
        let config = Config::from_str(
            r#"
            mode = "client"
            listen = "0.0.0.0:56830"

            [client]
            endpoint-name = "imagination1"

            [client.factory.security]
            server-uri = "coap://127.0.0.1:5683"
            short-server-id = 1

            [client.factory.server]
            short-server-id = 1
            lifetime = 30

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Client);
        let client = config.client.unwrap();
        assert_eq!(client.endpoint_name, "imagination1");
        assert_eq!(client.factory.unwrap().server.lifetime, 30);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_str("mode = \"server\"\nbogus = 1").is_err());
    }

    #[test]
    fn client_without_credentials_is_rejected() {
        assert!(
            Config::from_str(
                r#"
                mode = "client"

                [client]
                endpoint-name = "x"
                "#,
            )
            .is_err()
        );
    }
}
