/**
 * nat_traversal/endpoint.rs
 *
 * The one UDP socket shared by STUN, dialing and listening, and the
 * long-lived listen loop that runs on top of it
 */

use super::error::{AcceptError, DialError, ResolutionError};
use super::stun::StunClient;
use super::transport;
use super::types::{close_session, CloseCode};
use anyhow::{Context, Result};
use quinn::{Connection, Endpoint};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Local endpoint before the secure transport takes it over.
///
/// STUN has to happen here, while nothing else reads the socket. Turning it
/// into a [`PunchEndpoint`] consumes it, so the listen loop can only ever be
/// started once per socket.
#[derive(Debug)]
pub struct LocalEndpoint {
    socket: UdpSocket,
}

impl LocalEndpoint {
    /// Bind a fresh UDP socket (port 0 picks an ephemeral port)
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("Failed to create UDP socket")?;

        socket.bind(&addr.into()).context("Failed to bind UDP socket")?;
        socket
            .set_nonblocking(true)
            .context("Failed to set socket non-blocking")?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).context("Failed to register UDP socket")?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("Failed to get local address")
    }

    /// Ask the reflection server which address our NAT maps this socket to
    pub async fn reflect(&self, stun: &StunClient) -> Result<SocketAddr, ResolutionError> {
        stun.query(&self.socket).await
    }

    /// Hand the socket to QUIC and start the listen loop
    pub fn into_punch_endpoint(self) -> Result<(PunchEndpoint, IncomingSessions)> {
        let socket = self
            .socket
            .into_std()
            .context("Failed to detach UDP socket from tokio")?;
        let endpoint = transport::make_endpoint(socket)?;
        let incoming = IncomingSessions::spawn(endpoint.clone());
        Ok((PunchEndpoint { endpoint }, incoming))
    }
}

/// QUIC endpoint over the shared socket, used for dialing peers
#[derive(Debug, Clone)]
pub struct PunchEndpoint {
    endpoint: Endpoint,
}

impl PunchEndpoint {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("Failed to get local address")
    }

    /// One outbound handshake attempt
    pub async fn dial_once(&self, addr: SocketAddr) -> Result<Connection, DialError> {
        let connecting = self.endpoint.connect(addr, transport::SERVER_NAME)?;
        Ok(connecting.await?)
    }

    /// Stop accepting and dialing; existing sessions are closed
    pub fn close(&self) {
        self.endpoint.close(CloseCode::PeerLeft.code(), b"shutting down");
    }
}

/// Inbound sessions published by the listen loop
#[derive(Debug)]
pub struct IncomingSessions {
    rx: mpsc::UnboundedReceiver<Connection>,
    task: JoinHandle<()>,
}

impl IncomingSessions {
    fn spawn(endpoint: Endpoint) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(listen_loop(endpoint, tx));
        Self { rx, task }
    }

    /// Next inbound session, or `None` once the endpoint has shut down
    pub async fn recv(&mut self) -> Option<Connection> {
        self.rx.recv().await
    }

    /// An already queued inbound session, without waiting
    pub fn try_recv(&mut self) -> Option<Connection> {
        self.rx.try_recv().ok()
    }
}

impl Drop for IncomingSessions {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Accept handshakes until the endpoint closes. A failed handshake is logged
/// and the loop carries on.
async fn listen_loop(endpoint: Endpoint, tx: mpsc::UnboundedSender<Connection>) {
    while let Some(incoming) = endpoint.accept().await {
        let remote = incoming.remote_address();
        let tx = tx.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => {
                    log::debug!("Accepted session from {}", remote);
                    if let Err(mpsc::error::SendError(connection)) = tx.send(connection) {
                        close_session(&connection, CloseCode::PeerLeft, "not listening");
                    }
                }
                Err(source) => {
                    log::warn!("{}", AcceptError { remote, source });
                }
            }
        });
    }
    log::info!("Listener stopped: endpoint closed");
}
