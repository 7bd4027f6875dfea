/**
 * nat_traversal/hole_punching.rs
 *
 * Races an outbound handshake against inbound ones over the shared socket
 */

use super::endpoint::{IncomingSessions, PunchEndpoint};
use super::error::DialError;
use super::types::{close_session, CloseCode};
use quinn::Connection;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Retry policy for the dial task
#[derive(Debug, Clone, Copy)]
pub struct DialPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub handshake_timeout: Duration,
}

/// Whatever arrived before the deadline. Zero, one or both may be set.
#[derive(Debug, Default)]
pub struct RaceOutcome {
    pub dialed: Option<Connection>,
    pub listened: Option<Connection>,
}

impl RaceOutcome {
    pub fn is_empty(&self) -> bool {
        self.dialed.is_none() && self.listened.is_none()
    }
}

/// Session racer for one local endpoint
pub struct SessionRacer<'a> {
    endpoint: &'a PunchEndpoint,
    incoming: &'a mut IncomingSessions,
    policy: DialPolicy,
}

impl<'a> SessionRacer<'a> {
    pub fn new(
        endpoint: &'a PunchEndpoint,
        incoming: &'a mut IncomingSessions,
        policy: DialPolicy,
    ) -> Self {
        Self {
            endpoint,
            incoming,
            policy,
        }
    }

    /// Dial `peer` while waiting for an inbound session, until both have
    /// arrived or `timeout` passes.
    ///
    /// Both peers have to send at roughly the same time for their NATs to
    /// open, and neither knows when the other starts, so either leg (or
    /// both) may win. The dial task is cancelled when this returns; a dial
    /// that still completes afterwards closes its own session.
    ///
    /// Only an open session from `peer` can fill the listened slot. Anything
    /// else the listener queued, before or during the attempt, is closed so
    /// it cannot leak into a later attempt.
    pub async fn race(&mut self, peer: SocketAddr, timeout: Duration) -> RaceOutcome {
        let mut outcome = RaceOutcome::default();
        if timeout.is_zero() {
            return outcome;
        }

        // The peer may have started first, so its session can already be queued
        while let Some(connection) = self.incoming.try_recv() {
            if outcome.listened.is_none() && is_live_session_from(&connection, peer) {
                log::info!("Peer {} reached us before the attempt started", peer);
                outcome.listened = Some(connection);
            } else {
                discard(&connection, peer);
            }
        }

        let cancel = CancellationToken::new();
        let _cancel_on_return = cancel.clone().drop_guard();

        let (dial_tx, mut dial_rx) = oneshot::channel();
        tokio::spawn(dial_task(
            self.endpoint.clone(),
            peer,
            self.policy,
            cancel,
            dial_tx,
        ));

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut dial_done = false;
        let mut listen_done = outcome.listened.is_some();

        while !(dial_done && listen_done) {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    log::info!("Hole punch deadline of {:?} reached", timeout);
                    break;
                }
                result = &mut dial_rx, if !dial_done => {
                    dial_done = true;
                    match result {
                        Ok(Ok(connection)) => {
                            log::info!("Successfully dialed peer {}", connection.remote_address());
                            outcome.dialed = Some(connection);
                        }
                        Ok(Err(e)) => log::warn!("{}", e),
                        Err(_) => log::warn!("Dial task ended without a result"),
                    }
                }
                connection = self.incoming.recv(), if !listen_done => {
                    match connection {
                        Some(connection) if is_live_session_from(&connection, peer) => {
                            listen_done = true;
                            log::info!(
                                "Successfully received connection from {}",
                                connection.remote_address()
                            );
                            outcome.listened = Some(connection);
                        }
                        Some(connection) => discard(&connection, peer),
                        None => {
                            listen_done = true;
                            log::error!("Listener is gone, no inbound sessions will arrive");
                        }
                    }
                }
            }
        }

        // Duplicates and latecomers belong to no attempt
        while let Some(connection) = self.incoming.try_recv() {
            discard(&connection, peer);
        }

        outcome
    }
}

fn is_live_session_from(connection: &Connection, peer: SocketAddr) -> bool {
    connection.close_reason().is_none() && connection.remote_address() == peer
}

/// Drop an inbound session that cannot be this attempt's listened leg
fn discard(connection: &Connection, peer: SocketAddr) {
    let remote = connection.remote_address();
    if connection.close_reason().is_some() {
        log::debug!("Skipping closed session from {}", remote);
    } else if remote != peer {
        close_session(connection, CloseCode::PeerLeft, "session is not from the peer being punched");
    } else {
        close_session(connection, CloseCode::PeerLeft, "duplicate session from peer");
    }
}

/// Dial `peer` with retries and deliver exactly one result on `deliver`
async fn dial_task(
    endpoint: PunchEndpoint,
    peer: SocketAddr,
    policy: DialPolicy,
    cancel: CancellationToken,
    deliver: oneshot::Sender<Result<Connection, DialError>>,
) {
    let result = dial_with_retry(&endpoint, peer, policy, &cancel).await;
    if let Err(Ok(late)) = deliver.send(result) {
        close_session(&late, CloseCode::PeerLeft, "dial completed after deadline");
    }
}

/// Try up to `policy.attempts` handshakes with a fixed delay in between
pub async fn dial_with_retry(
    endpoint: &PunchEndpoint,
    peer: SocketAddr,
    policy: DialPolicy,
    cancel: &CancellationToken,
) -> Result<Connection, DialError> {
    let attempts = policy.attempts.max(1);
    let mut last = DialError::Cancelled;

    for attempt in 1..=attempts {
        let attempt_result = tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            result = tokio::time::timeout(policy.handshake_timeout, endpoint.dial_once(peer)) => {
                result.unwrap_or(Err(DialError::Timeout(policy.handshake_timeout)))
            }
        };

        match attempt_result {
            Ok(connection) => return Ok(connection),
            Err(e) => {
                log::debug!("Unable to dial {} (attempt {}/{}): {}", peer, attempt, attempts, e);
                last = e;
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DialError::Cancelled),
                _ = tokio::time::sleep(policy.retry_delay) => {}
            }
        }
    }

    Err(DialError::Exhausted {
        addr: peer,
        attempts,
        last: Box::new(last),
    })
}
