/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - STUN discovery of the external address
 * - QUIC dial/listen racing over one shared UDP socket
 * - Simultaneous-open resolution down to one canonical session
 * - Length-prefixed message exchange over that session
 */

mod endpoint;
mod error;
mod framing;
mod hole_punching;
mod simultaneous_open;
mod stun;
mod transport;
mod types;

pub use endpoint::{IncomingSessions, LocalEndpoint, PunchEndpoint};
pub use error::{AcceptError, DialError, FrameError, PunchError, ResolutionError, SyncError};
pub use framing::{encode, read_frame, read_frame_bounded, write_frame};
pub use hole_punching::{dial_with_retry, DialPolicy, RaceOutcome, SessionRacer};
pub use simultaneous_open::{CanonicalSession, PeerSynchronizer, PeerToken, TieBreak};
pub use stun::{build_binding_response, StunClient};
pub use transport::ALPN;
pub use types::{
    close_session, remote_close_code, CloseCode, ConnectionState, Provenance, PunchConfig,
    DEFAULT_STUN_SERVER,
};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Grace period before a finished session is closed
const LINGER_TIMEOUT: Duration = Duration::from_secs(5);

/// Complete hole punching state machine for one local endpoint
pub struct NatTraversal {
    config: PunchConfig,
    endpoint: PunchEndpoint,
    incoming: IncomingSessions,
    local_addr: SocketAddr,
    external_addr: SocketAddr,
    state: ConnectionState,
}

impl NatTraversal {
    /// Bind the shared socket, learn its external address and start listening.
    ///
    /// Any failure here is fatal: without a socket, a mapping or a listener
    /// no peer attempt can work.
    pub async fn start(config: PunchConfig) -> Result<Self> {
        let local = LocalEndpoint::bind(config.bind_addr)?;
        let local_addr = local.local_addr()?;
        log::info!("Local address: {}", local_addr);

        // STUN must finish before QUIC starts reading the socket
        let stun = StunClient::new(config.stun_server.clone(), config.stun_timeout);
        let external_addr = local
            .reflect(&stun)
            .await
            .with_context(|| format!("STUN query to {} failed", config.stun_server))?;
        log::info!("External address: {}", external_addr);

        Self::with_external_addr(config, local, external_addr)
    }

    /// Start listening on an endpoint whose external address is already known
    pub fn with_external_addr(
        config: PunchConfig,
        local: LocalEndpoint,
        external_addr: SocketAddr,
    ) -> Result<Self> {
        let local_addr = local.local_addr()?;
        let (endpoint, incoming) = local
            .into_punch_endpoint()
            .context("Failed to start QUIC listener")?;

        Ok(Self {
            config,
            endpoint,
            incoming,
            local_addr,
            external_addr,
            state: ConnectionState::AwaitingTarget,
        })
    }

    /// Punch through to `target` (host:port) and settle on one session
    pub async fn connect(&mut self, target: &str) -> Result<CanonicalSession, PunchError> {
        let result = self.try_connect(target).await;
        match &result {
            Ok(canonical) => {
                self.state = ConnectionState::Exchanging;
                log::info!(
                    "Session established with {} ({:?})",
                    canonical.session.remote_address(),
                    canonical.provenance
                );
            }
            Err(e) => self.state = ConnectionState::Failed(e.to_string()),
        }
        result
    }

    async fn try_connect(&mut self, target: &str) -> Result<CanonicalSession, PunchError> {
        let peer = resolve_target(target).await?;

        self.state = ConnectionState::Racing;
        let policy = DialPolicy {
            attempts: self.config.dial_attempts,
            retry_delay: self.config.dial_retry_delay,
            handshake_timeout: self.config.handshake_timeout,
        };
        let outcome = SessionRacer::new(&self.endpoint, &mut self.incoming, policy)
            .race(peer, self.config.punch_timeout)
            .await;

        self.state = ConnectionState::Synchronizing;
        let synchronizer = PeerSynchronizer::new(self.config.sync_timeout);
        Ok(synchronizer
            .synchronize(outcome.dialed, outcome.listened)
            .await?)
    }

    /// Send `message` over the canonical stream and read the peer's message.
    ///
    /// The session is given a short grace period for the peer to finish
    /// reading and is then closed, so one peer never leaks into the next
    /// attempt.
    pub async fn exchange(
        &mut self,
        mut canonical: CanonicalSession,
        message: &[u8],
    ) -> Result<Vec<u8>, PunchError> {
        self.state = ConnectionState::Exchanging;

        let result = exchange_message(&mut canonical, message, self.config.max_message_len).await;
        let session = canonical.session;
        match &result {
            Ok(_) => {
                self.state = ConnectionState::Connected;
                tokio::spawn(linger(session));
            }
            Err(e) => {
                if let Some(code) = remote_close_code(&session) {
                    log::warn!("Peer closed the session with {}", code.name());
                }
                self.state = ConnectionState::Failed(e.to_string());
                close_session(&session, CloseCode::PeerLeft, "message exchange failed");
            }
        }
        result
    }

    /// Ready for the next peer
    pub fn reset(&mut self) {
        self.state = ConnectionState::AwaitingTarget;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn external_addr(&self) -> SocketAddr {
        self.external_addr
    }

    /// Get current connection state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn config(&self) -> &PunchConfig {
        &self.config
    }

    pub fn shutdown(&self) {
        self.endpoint.close();
    }
}

/// Write our message and read theirs over the canonical stream
pub async fn exchange_message(
    canonical: &mut CanonicalSession,
    message: &[u8],
    max_len: usize,
) -> Result<Vec<u8>, PunchError> {
    write_frame(&mut canonical.send, message).await?;
    if let Err(e) = canonical.send.finish() {
        log::debug!("Send stream already closed: {}", e);
    }

    Ok(read_frame_bounded(&mut canonical.recv, max_len).await?)
}

/// Keep `session` open until the peer closes it or the grace period ends.
/// Closing straight away could drop our message before the peer has read it.
async fn linger(session: quinn::Connection) {
    match tokio::time::timeout(LINGER_TIMEOUT, session.closed()).await {
        Ok(reason) => log::debug!("Session with {} ended: {}", session.remote_address(), reason),
        Err(_) => close_session(&session, CloseCode::PeerLeft, "message exchange complete"),
    }
}

/// Turn an operator-entered `host:port` into a socket address
pub async fn resolve_target(target: &str) -> Result<SocketAddr, PunchError> {
    let invalid = |reason: String| PunchError::InvalidTarget {
        target: target.to_string(),
        reason,
    };

    if target.is_empty() {
        return Err(invalid("empty address".to_string()));
    }

    let mut addrs = tokio::net::lookup_host(target)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| invalid("no IPv4 address".to_string()))
}
