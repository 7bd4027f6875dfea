/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use std::net::SocketAddr;
use std::time::Duration;
use quinn::VarInt;

/// Public STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Hole punching configuration
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// STUN server address (host:port)
    pub stun_server: String,

    /// Local UDP bind address (port 0 for random)
    pub bind_addr: SocketAddr,

    /// Deadline covering both dial and listen for one peer attempt
    pub punch_timeout: Duration,

    /// Outbound handshake attempts before giving up
    pub dial_attempts: u32,

    /// Fixed delay between outbound handshake attempts
    pub dial_retry_delay: Duration,

    /// Upper bound on a single outbound handshake
    pub handshake_timeout: Duration,

    /// How long to wait for the STUN binding response
    pub stun_timeout: Duration,

    /// Upper bound on each synchronisation leg
    pub sync_timeout: Duration,

    /// Largest application message accepted from a peer
    pub max_message_len: usize,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            punch_timeout: Duration::from_secs(20),
            dial_attempts: 10,
            dial_retry_delay: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(5),
            stun_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(10),
            max_message_len: 1024 * 1024,
        }
    }
}

/// Coordinator state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingTarget,
    Racing,
    Synchronizing,
    Exchanging,
    Connected,
    Failed(String),
}

/// Which side of the race produced a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// This side initiated the handshake
    Dialed,
    /// The remote side initiated, observed through the listen loop
    Listened,
}

/// Application close codes sent to the peer when a session is dropped.
///
/// These are advisory: the receiving side only observes the session ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CloseCode {
    PeerLeft = 0,
    PeerAddrReceived = 1,
    PeerAddrInvalid = 2,
    PeerInitiator = 3,
    PeerNotInitiator = 4,
}

impl CloseCode {
    pub fn code(self) -> VarInt {
        VarInt::from_u32(self as u32)
    }

    pub fn from_code(code: VarInt) -> Option<Self> {
        match code.into_inner() {
            0 => Some(CloseCode::PeerLeft),
            1 => Some(CloseCode::PeerAddrReceived),
            2 => Some(CloseCode::PeerAddrInvalid),
            3 => Some(CloseCode::PeerInitiator),
            4 => Some(CloseCode::PeerNotInitiator),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CloseCode::PeerLeft => "ERR_PEER_LEFT",
            CloseCode::PeerAddrReceived => "ERR_PEER_ADDR_RECEIVED",
            CloseCode::PeerAddrInvalid => "ERR_PEER_ADDR_INVALID",
            CloseCode::PeerInitiator => "ERR_PEER_INITIATOR",
            CloseCode::PeerNotInitiator => "ERR_PEER_NOT_INITIATOR",
        }
    }
}

/// Close `session` with `code`, carrying `reason` as the close reason string
pub fn close_session(session: &quinn::Connection, code: CloseCode, reason: &str) {
    log::debug!(
        "Closing session with {} ({}): {}",
        session.remote_address(),
        code.name(),
        reason
    );
    session.close(code.code(), reason.as_bytes());
}

/// The close code the peer used when it shut `session` down, if any
pub fn remote_close_code(session: &quinn::Connection) -> Option<CloseCode> {
    match session.close_reason()? {
        quinn::ConnectionError::ApplicationClosed(close) => CloseCode::from_code(close.error_code),
        _ => None,
    }
}
