/**
 * nat_traversal/error.rs
 *
 * Error taxonomy for address discovery, session racing and peer sync
 */

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Reflection (STUN) round trip failed.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("failed to resolve reflection server {server}: {source}")]
    Lookup {
        server: String,
        #[source]
        source: io::Error,
    },

    #[error("reflection server {0} has no address matching the local socket family")]
    NoAddress(String),

    #[error("failed to send binding request: {0}")]
    Send(#[source] io::Error),

    #[error("failed to receive binding response: {0}")]
    Receive(#[source] io::Error),

    #[error("no binding response within {0:?}")]
    Timeout(Duration),

    #[error("got bogus message from STUN server")]
    NotStun,

    #[error("STUN server answered with error response")]
    ErrorResponse,

    #[error("invalid STUN response type: 0x{0:04x}")]
    UnexpectedType(u16),

    #[error("transaction ID mismatch")]
    TransactionMismatch,

    #[error("malformed STUN response: {0}")]
    Malformed(&'static str),

    #[error("no address attribute found in STUN response")]
    MissingAddress,
}

/// Outbound handshake to a peer failed.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("cannot start handshake: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] quinn::ConnectionError),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not dial {addr} after {attempts} attempts: {last}")]
    Exhausted {
        addr: SocketAddr,
        attempts: u32,
        last: Box<DialError>,
    },

    #[error("dial cancelled")]
    Cancelled,
}

/// A single inbound handshake failed; the listen loop keeps going.
#[derive(Debug, Error)]
#[error("error accepting session from {remote}: {source}")]
pub struct AcceptError {
    pub remote: SocketAddr,
    #[source]
    pub source: quinn::ConnectionError,
}

/// Length-prefixed framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("cannot frame an empty payload")]
    EmptyPayload,

    #[error("payload of {0} bytes does not fit a 32-bit length prefix")]
    TooLarge(usize),

    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    ExceedsLimit { len: usize, limit: usize },

    #[error("stream ended before the full frame was read: {0}")]
    TruncatedRead(#[source] io::Error),

    #[error("stream closed before the full frame was written: {0}")]
    TruncatedWrite(#[source] io::Error),
}

/// Peer synchronisation could not settle on a canonical session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no session to synchronise")]
    NoSession,

    #[error("unable to open dial stream with peer: {0}")]
    OpenStream(#[source] quinn::ConnectionError),

    #[error("unable to accept listen stream with peer: {0}")]
    AcceptStream(#[source] quinn::ConnectionError),

    #[error("control stream error: {0}")]
    Frame(#[from] FrameError),

    #[error("peer sent an invalid token")]
    InvalidToken,

    #[error("control exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("dial/listen remote addresses do not match: {dialed} {listened}")]
    AddressMismatch {
        dialed: SocketAddr,
        listened: SocketAddr,
    },

    #[error("local and remote peer tokens collided")]
    TokenCollision,

    #[error("unable to use dial leg or listen leg: {dial}; {listen}")]
    NoUsableLeg { dial: String, listen: String },
}

/// A per-peer hole punch attempt failed. The coordinator reports these and
/// moves on to the next peer.
#[derive(Debug, Error)]
pub enum PunchError {
    #[error("invalid peer address {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("synchronisation failed: {0}")]
    Synchronization(#[from] SyncError),

    #[error("message exchange failed: {0}")]
    Exchange(#[from] FrameError),
}
