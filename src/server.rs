//! Game listener
//!
//! Speaks just enough of the Java Edition protocol to answer list-pings and
//! to turn login attempts away with a message. Players never reach the
//! backend through the gateway; once the server is up they are told to
//! connect to it directly.

use crate::engine::DecisionEngine;
use crate::error::ProtocolError;
use crate::protocol::{
    self, read_packet, write_frame, Handshake, LoginStart, NextState, Packet, StatusRequest,
    LEGACY_PING_BYTE,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GatewayServer {
    bind_addr: SocketAddr,
    engine: Arc<DecisionEngine>,
    shutdown_rx: watch::Receiver<bool>,
    client_timeout: Duration,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        engine: Arc<DecisionEngine>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            engine,
            shutdown_rx,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub async fn bind(self) -> anyhow::Result<BoundGateway> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        Ok(BoundGateway {
            listener,
            engine: self.engine,
            shutdown_rx: self.shutdown_rx,
            client_timeout: self.client_timeout,
        })
    }
}

/// A gateway whose listener is bound but not yet accepting
pub struct BoundGateway {
    listener: TcpListener,
    engine: Arc<DecisionEngine>,
    shutdown_rx: watch::Receiver<bool>,
    client_timeout: Duration,
}

impl BoundGateway {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let engine = Arc::clone(&self.engine);
                            let client_timeout = self.client_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, engine, client_timeout).await {
                                    debug!(peer = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn timed<T, F>(limit: Duration, fut: F) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProtocolError::TimedOut)?
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<DecisionEngine>,
    client_timeout: Duration,
) -> Result<(), ProtocolError> {
    let conn_id = Uuid::new_v4();
    stream.set_nodelay(true)?;

    // Pre-netty clients open with 0xFE, which is not a valid frame length
    let mut first = [0u8; 1];
    let n = timed(client_timeout, async {
        stream.peek(&mut first).await.map_err(ProtocolError::from)
    })
    .await?;
    if n == 0 {
        return Ok(());
    }
    if first[0] == LEGACY_PING_BYTE {
        debug!(conn = %conn_id, peer = %peer, "Legacy ping; closing");
        return Ok(());
    }

    let handshake = Handshake::decode(&timed(client_timeout, read_packet(&mut stream)).await?)?;
    debug!(
        conn = %conn_id,
        peer = %peer,
        protocol_version = handshake.protocol_version,
        address = %handshake.server_address,
        next_state = ?handshake.next_state,
        "Handshake"
    );

    match handshake.next_state {
        NextState::Status => {
            serve_status(&mut stream, peer, &engine, &handshake, client_timeout).await
        }
        NextState::Login | NextState::Transfer => {
            serve_login(&mut stream, peer, conn_id, &engine, client_timeout).await
        }
    }
}

async fn serve_status(
    stream: &mut TcpStream,
    peer: SocketAddr,
    engine: &DecisionEngine,
    handshake: &Handshake,
    client_timeout: Duration,
) -> Result<(), ProtocolError> {
    let mut answered = false;
    loop {
        let packet: Packet = match timed(client_timeout, read_packet(stream)).await {
            Ok(packet) => packet,
            // Many clients hang up without pinging
            Err(ProtocolError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };

        match StatusRequest::decode(&packet)? {
            StatusRequest::Request if !answered => {
                let payload = engine
                    .handle_ping(handshake.protocol_version, Some(peer))
                    .await;
                let frame = protocol::status_response(&payload)?;
                timed(client_timeout, write_frame(stream, &frame)).await?;
                answered = true;
            }
            StatusRequest::Request => {
                return Err(ProtocolError::UnexpectedPacket {
                    id: packet.id,
                    state: "status",
                });
            }
            StatusRequest::Ping(payload) => {
                timed(client_timeout, write_frame(stream, &protocol::pong(payload))).await?;
                return Ok(());
            }
        }
    }
}

async fn serve_login(
    stream: &mut TcpStream,
    peer: SocketAddr,
    conn_id: Uuid,
    engine: &DecisionEngine,
    client_timeout: Duration,
) -> Result<(), ProtocolError> {
    let login = LoginStart::decode(&timed(client_timeout, read_packet(stream)).await?)?;
    info!(conn = %conn_id, peer = %peer, username = %login.username, "Login attempt");

    let outcome = engine.handle_login(&login.username, Some(peer)).await;
    let frame = protocol::login_disconnect(&outcome.message());
    timed(client_timeout, write_frame(stream, &frame)).await
}
