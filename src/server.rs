use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::net::UdpSocket;

use codec::coap::Message;
use service::{
    ClientOptions, ClientService, ServerOptions, ServerService, transport::Transport,
};

use crate::{
    config::{Config, Mode},
    observer::Observer,
    statistics::Statistics,
};

/// Largest datagram the daemon accepts; everything LwM2M ships fits well
/// under a single MTU.
const MTU: usize = 1500;

/// The [`Transport`] port over a tokio UDP socket.
///
/// Sends are best-effort: a full socket buffer drops the datagram the way
/// the network would, and the protocol's retry machinery recovers.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl Transport for UdpTransport {
    fn send(&mut self, peer: SocketAddr, message: Message) -> Result<(), service::Error> {
        let bytes = message.encode();
        match self.socket.try_send_to(&bytes, peer) {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                log::warn!("socket busy, dropping datagram for {peer:?}");
                Ok(())
            }
            Err(error) => {
                log::error!("send to {peer:?} failed: {error}");
                Err(service::Error::TransportError)
            }
        }
    }
}

pub async fn start(config: &Config, statistics: &Statistics) -> Result<()> {
    let socket = Arc::new(UdpSocket::bind(config.listen).await?);
    log::info!("listening: address={:?}, mode={:?}", config.listen, config.mode);

    match config.mode {
        Mode::Client => run_client(config, statistics, socket).await,
        Mode::Server => run_server(config, statistics, socket).await,
    }
}

async fn run_client(
    config: &Config,
    statistics: &Statistics,
    socket: Arc<UdpSocket>,
) -> Result<()> {
    let client = config
        .client
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("client mode requires a [client] table"))?;

    let mut session = ClientService::new(ClientOptions {
        endpoint_name: client.endpoint_name.clone(),
        bootstrap_uri: client.bootstrap_uri.clone(),
        bootstrap_hold_off: client.bootstrap_hold_off,
        factory: client.factory.clone(),
        default_attributes: Default::default(),
        handler: Observer::new(statistics.clone()),
    })
    .map_err(|error| anyhow::anyhow!("session setup failed: {error}"))?;

    let mut transport = UdpTransport {
        socket: socket.clone(),
    };

    let mut buffer = [0u8; MTU];
    loop {
        let timeout = session.process(Instant::now(), &mut transport);

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                session.shutdown(Instant::now(), &mut transport);
                return Ok(());
            }
            received = socket.recv_from(&mut buffer) => {
                let (size, peer) = received?;
                statistics.add_request();

                match Message::decode(&buffer[..size]) {
                    Ok(message) => {
                        session.handle_message(peer, &message, Instant::now(), &mut transport);
                    }
                    Err(error) => {
                        log::debug!("undecodable datagram from {peer:?}: {error}");
                    }
                }
            }
        }
    }
}

async fn run_server(
    config: &Config,
    statistics: &Statistics,
    socket: Arc<UdpSocket>,
) -> Result<()> {
    let mut session = ServerService::new(ServerOptions {
        default_lifetime: config.server.default_lifetime,
        handler: Observer::new(statistics.clone()),
    });

    let mut transport = UdpTransport {
        socket: socket.clone(),
    };

    let mut buffer = [0u8; MTU];
    loop {
        let timeout = session.process(Instant::now(), &mut transport);

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                return Ok(());
            }
            received = socket.recv_from(&mut buffer) => {
                let (size, peer) = received?;
                statistics.add_request();

                match Message::decode(&buffer[..size]) {
                    Ok(message) => {
                        session.handle_message(peer, &message, Instant::now(), &mut transport);
                    }
                    Err(error) => {
                        log::debug!("undecodable datagram from {peer:?}: {error}");
                    }
                }
            }
        }
    }
}
