/**
 * nat_traversal/simultaneous_open.rs
 *
 * Settles on one canonical session when both the dialed and the listened
 * session came up for the same peer
 *
 * Each side writes a random token on a stream it opens over its dialed
 * session and reads the peer's token from the stream it accepts over its
 * listened session. With both in hand, the greater token keeps its dialed
 * session and the smaller one keeps its listened session. Since both sides
 * compare the same two tokens, they pick the two ends of one session.
 */

use super::error::SyncError;
use super::framing;
use super::types::{close_session, CloseCode, Provenance};
use quinn::{Connection, RecvStream, SendStream};
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Tokens are at most 16 hex digits; anything longer is not a token
const MAX_TOKEN_LEN: usize = 64;

/// Random tie-break value. Compared as a string, not as a number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerToken(String);

impl PeerToken {
    /// Fresh token: a random u64 in lowercase hex
    pub fn random() -> Self {
        Self(format!("{:x}", rand::random::<u64>()))
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_wire(bytes: Vec<u8>) -> Result<Self, SyncError> {
        let token = String::from_utf8(bytes).map_err(|_| SyncError::InvalidToken)?;
        if token.is_empty() {
            return Err(SyncError::InvalidToken);
        }
        Ok(Self(token))
    }

    /// Who we are once both legs are up, or `None` if the tokens collided
    pub fn decide(&self, remote: &PeerToken) -> Option<TieBreak> {
        match self.cmp(remote) {
            Ordering::Greater => Some(TieBreak::Initiator),
            Ordering::Less => Some(TieBreak::NotInitiator),
            Ordering::Equal => None,
        }
    }
}

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of comparing tokens in the simultaneous-open case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Greater token: keep the dialed session
    Initiator,
    /// Smaller token: keep the listened session
    NotInitiator,
}

/// The session and stream kept for a peer
#[derive(Debug)]
pub struct CanonicalSession {
    pub session: Connection,
    pub send: SendStream,
    pub recv: RecvStream,
    pub provenance: Provenance,
    /// Handle of the session closed during the tie-break, if there was one
    pub rejected: Option<Connection>,
}

/// A session with its control stream open
#[derive(Debug)]
struct OpenedLeg {
    session: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl OpenedLeg {
    fn into_canonical(self, provenance: Provenance, rejected: Option<Connection>) -> CanonicalSession {
        CanonicalSession {
            session: self.session,
            send: self.send,
            recv: self.recv,
            provenance,
            rejected,
        }
    }

    fn close(mut self, code: CloseCode, reason: &str) -> Connection {
        if let Err(e) = self.send.finish() {
            log::debug!("Control stream already closed: {}", e);
        }
        close_session(&self.session, code, reason);
        self.session
    }
}

/// How one leg went
#[derive(Debug)]
enum Leg<T> {
    Absent,
    Failed(Connection, SyncError),
    Succeeded(T),
}

/// The four ways the two legs can combine
#[derive(Debug)]
enum Legs {
    Both {
        dialed: OpenedLeg,
        listened: OpenedLeg,
        remote_token: PeerToken,
    },
    DialedOnly {
        dialed: OpenedLeg,
        listen_failure: Option<(Connection, SyncError)>,
    },
    ListenedOnly {
        listened: OpenedLeg,
        dial_failure: Option<(Connection, SyncError)>,
    },
    Neither {
        dial_failure: Option<(Connection, SyncError)>,
        listen_failure: Option<(Connection, SyncError)>,
    },
}

impl Legs {
    fn combine(dial: Leg<OpenedLeg>, listen: Leg<(OpenedLeg, PeerToken)>) -> Self {
        let dial_failure = |leg: Leg<OpenedLeg>| match leg {
            Leg::Failed(session, e) => Some((session, e)),
            _ => None,
        };
        let listen_failure = |leg: Leg<(OpenedLeg, PeerToken)>| match leg {
            Leg::Failed(session, e) => Some((session, e)),
            _ => None,
        };

        match (dial, listen) {
            (Leg::Succeeded(dialed), Leg::Succeeded((listened, remote_token))) => Legs::Both {
                dialed,
                listened,
                remote_token,
            },
            (Leg::Succeeded(dialed), listen) => Legs::DialedOnly {
                dialed,
                listen_failure: listen_failure(listen),
            },
            (dial, Leg::Succeeded((listened, _))) => Legs::ListenedOnly {
                listened,
                dial_failure: dial_failure(dial),
            },
            (dial, listen) => Legs::Neither {
                dial_failure: dial_failure(dial),
                listen_failure: listen_failure(listen),
            },
        }
    }
}

/// Runs the token exchange for one punch attempt
#[derive(Debug)]
pub struct PeerSynchronizer {
    token: PeerToken,
    leg_timeout: Duration,
}

impl PeerSynchronizer {
    pub fn new(leg_timeout: Duration) -> Self {
        Self::with_token(PeerToken::random(), leg_timeout)
    }

    pub fn with_token(token: PeerToken, leg_timeout: Duration) -> Self {
        Self { token, leg_timeout }
    }

    pub fn token(&self) -> &PeerToken {
        &self.token
    }

    /// Pick one canonical (session, stream) out of whatever the race produced.
    ///
    /// On success exactly one session and stream remain open; every other
    /// session from this attempt has been closed with a close code the peer
    /// can see.
    pub async fn synchronize(
        self,
        dialed: Option<Connection>,
        listened: Option<Connection>,
    ) -> Result<CanonicalSession, SyncError> {
        if dialed.is_none() && listened.is_none() {
            return Err(SyncError::NoSession);
        }
        log::debug!("Synchronising with local token {}", self.token);

        let (dial, listen) = tokio::join!(
            self.dial_leg(dialed),
            self.listen_leg(listened),
        );

        match Legs::combine(dial, listen) {
            Legs::Both {
                dialed,
                listened,
                remote_token,
            } => self.break_tie(dialed, listened, &remote_token),
            Legs::DialedOnly {
                dialed,
                listen_failure,
            } => {
                let rejected = close_failed(listen_failure, "listen leg failed");
                Ok(dialed.into_canonical(Provenance::Dialed, rejected))
            }
            Legs::ListenedOnly {
                listened,
                dial_failure,
            } => {
                let rejected = close_failed(dial_failure, "dial leg failed");
                Ok(listened.into_canonical(Provenance::Listened, rejected))
            }
            Legs::Neither {
                dial_failure,
                listen_failure,
            } => {
                let describe = |failure: &Option<(Connection, SyncError)>| match failure {
                    Some((_, e)) => e.to_string(),
                    None => "no session".to_string(),
                };
                let dial = describe(&dial_failure);
                let listen = describe(&listen_failure);
                close_failed(dial_failure, "dial leg failed");
                close_failed(listen_failure, "listen leg failed");
                Err(SyncError::NoUsableLeg { dial, listen })
            }
        }
    }

    fn break_tie(
        &self,
        dialed: OpenedLeg,
        listened: OpenedLeg,
        remote_token: &PeerToken,
    ) -> Result<CanonicalSession, SyncError> {
        let dialed_addr = dialed.session.remote_address();
        let listened_addr = listened.session.remote_address();
        if dialed_addr != listened_addr {
            dialed.close(CloseCode::PeerAddrInvalid, "dial/listen remote addresses do not match");
            listened.close(CloseCode::PeerAddrInvalid, "dial/listen remote addresses do not match");
            return Err(SyncError::AddressMismatch {
                dialed: dialed_addr,
                listened: listened_addr,
            });
        }

        match self.token.decide(remote_token) {
            Some(TieBreak::Initiator) => {
                log::info!(
                    "Token {} beats {}: keeping dialed session",
                    self.token,
                    remote_token
                );
                let rejected =
                    listened.close(CloseCode::PeerInitiator, "Peer has decided it is the initiator");
                Ok(dialed.into_canonical(Provenance::Dialed, Some(rejected)))
            }
            Some(TieBreak::NotInitiator) => {
                log::info!(
                    "Token {} loses to {}: keeping listened session",
                    self.token,
                    remote_token
                );
                let rejected = dialed.close(
                    CloseCode::PeerNotInitiator,
                    "Peer has decided it is not the initiator",
                );
                Ok(listened.into_canonical(Provenance::Listened, Some(rejected)))
            }
            None => {
                dialed.close(CloseCode::PeerLeft, "peer tokens collided");
                listened.close(CloseCode::PeerLeft, "peer tokens collided");
                Err(SyncError::TokenCollision)
            }
        }
    }

    /// Open a stream on the dialed session and send our token
    async fn dial_leg(&self, dialed: Option<Connection>) -> Leg<OpenedLeg> {
        let Some(session) = dialed else {
            return Leg::Absent;
        };
        let result = bounded(self.leg_timeout, async {
            let (mut send, recv) = session.open_bi().await.map_err(SyncError::OpenStream)?;
            framing::write_frame(&mut send, self.token.as_str().as_bytes()).await?;
            Ok::<_, SyncError>((send, recv))
        })
        .await;

        match result {
            Ok((send, recv)) => Leg::Succeeded(OpenedLeg { session, send, recv }),
            Err(e) => {
                log::warn!("Dial leg with {} failed: {}", session.remote_address(), e);
                Leg::Failed(session, e)
            }
        }
    }

    /// Accept the peer's stream on the listened session and read its token
    async fn listen_leg(&self, listened: Option<Connection>) -> Leg<(OpenedLeg, PeerToken)> {
        let Some(session) = listened else {
            return Leg::Absent;
        };
        let result = bounded(self.leg_timeout, async {
            let (send, mut recv) = session.accept_bi().await.map_err(SyncError::AcceptStream)?;
            let bytes = framing::read_frame_bounded(&mut recv, MAX_TOKEN_LEN).await?;
            let token = PeerToken::from_wire(bytes)?;
            Ok::<_, SyncError>((send, recv, token))
        })
        .await;

        match result {
            Ok((send, recv, token)) => {
                log::debug!("Received peer token {}", token);
                Leg::Succeeded((OpenedLeg { session, send, recv }, token))
            }
            Err(e) => {
                log::warn!("Listen leg with {} failed: {}", session.remote_address(), e);
                Leg::Failed(session, e)
            }
        }
    }
}

async fn bounded<T, F>(limit: Duration, leg: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    tokio::time::timeout(limit, leg)
        .await
        .unwrap_or(Err(SyncError::Timeout(limit)))
}

fn close_failed(failure: Option<(Connection, SyncError)>, reason: &str) -> Option<Connection> {
    let (session, _) = failure?;
    close_session(&session, CloseCode::PeerLeft, reason);
    Some(session)
}
