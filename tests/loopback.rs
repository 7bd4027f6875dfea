use holepunch::nat_traversal::{
    build_binding_response, close_session, dial_with_retry, exchange_message, read_frame,
    remote_close_code, write_frame, CloseCode, ConnectionState, DialPolicy, IncomingSessions,
    LocalEndpoint, NatTraversal, PeerSynchronizer, PeerToken, Provenance, PunchConfig,
    PunchEndpoint, SessionRacer, SyncError,
};
use quinn::Connection;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

fn policy() -> DialPolicy {
    DialPolicy {
        attempts: 10,
        retry_delay: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(1),
    }
}

fn loopback() -> (PunchEndpoint, IncomingSessions, SocketAddr) {
    let (endpoint, incoming) = LocalEndpoint::bind("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .into_punch_endpoint()
        .unwrap();
    let addr = endpoint.local_addr().unwrap();
    (endpoint, incoming, addr)
}

/// Handshake in both directions without racing.
/// Returns (a_dialed, a_listened, b_dialed, b_listened).
async fn dial_both_ways(
    a: &PunchEndpoint,
    a_incoming: &mut IncomingSessions,
    b: &PunchEndpoint,
    b_incoming: &mut IncomingSessions,
) -> (Connection, Connection, Connection, Connection) {
    let cancel = CancellationToken::new();
    let a_to_b = dial_with_retry(a, b.local_addr().unwrap(), policy(), &cancel)
        .await
        .unwrap();
    let b_from_a = b_incoming.recv().await.unwrap();
    let b_to_a = dial_with_retry(b, a.local_addr().unwrap(), policy(), &cancel)
        .await
        .unwrap();
    let a_from_b = a_incoming.recv().await.unwrap();
    (a_to_b, a_from_b, b_to_a, b_from_a)
}

/// Remote half of the token exchange that never closes anything.
/// Reads the other side's token before sending its own, so the other side
/// cannot decide (and close) before this one has what it needs.
async fn answer_tokens(dialed: &Connection, listened: &Connection, token: &str) -> Vec<u8> {
    let (_send, mut recv) = listened.accept_bi().await.unwrap();
    let remote = read_frame(&mut recv).await.unwrap();
    let (mut send, _recv) = dialed.open_bi().await.unwrap();
    write_frame(&mut send, token.as_bytes()).await.unwrap();
    remote
}

/// Answers every binding request with the address it came from
async fn spawn_reflector() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if len < 20 {
                continue;
            }
            let txid: [u8; 12] = buf[8..20].try_into().unwrap();
            let response = build_binding_response(&txid, from);
            let _ = socket.send_to(&response, from).await;
        }
    });
    addr
}

#[tokio::test]
async fn simultaneous_open_settles_on_one_session() {
    let (a, mut a_incoming, a_addr) = loopback();
    let (b, mut b_incoming, b_addr) = loopback();

    let mut a_racer = SessionRacer::new(&a, &mut a_incoming, policy());
    let mut b_racer = SessionRacer::new(&b, &mut b_incoming, policy());
    let (a_out, b_out) = tokio::join!(
        a_racer.race(b_addr, Duration::from_secs(5)),
        b_racer.race(a_addr, Duration::from_secs(5)),
    );

    let a_sync = PeerSynchronizer::with_token(PeerToken::new("3f2"), SYNC_TIMEOUT);
    let b_sync = PeerSynchronizer::with_token(PeerToken::new("a91"), SYNC_TIMEOUT);
    let (a_canon, b_canon) = tokio::join!(
        a_sync.synchronize(a_out.dialed, a_out.listened),
        b_sync.synchronize(b_out.dialed, b_out.listened),
    );
    let mut a_canon = a_canon.unwrap();
    let mut b_canon = b_canon.unwrap();

    // "a91" > "3f2": B keeps what it dialed, A keeps what it accepted
    assert_eq!(b_canon.provenance, Provenance::Dialed);
    assert_eq!(a_canon.provenance, Provenance::Listened);
    assert_eq!(a_canon.session.remote_address(), b_addr);
    assert_eq!(b_canon.session.remote_address(), a_addr);

    for rejected in [a_canon.rejected.take(), b_canon.rejected.take()] {
        let rejected = rejected.expect("the other session should have been rejected");
        assert!(rejected.close_reason().is_some());
    }
    assert!(a_canon.session.close_reason().is_none());
    assert!(b_canon.session.close_reason().is_none());

    write_frame(&mut a_canon.send, b"hello").await.unwrap();
    let received = read_frame(&mut b_canon.recv).await.unwrap();
    assert_eq!(received, b"hello");
}

#[tokio::test]
async fn single_leg_still_exchanges_messages() {
    let (a, _a_incoming, _a_addr) = loopback();
    let (_b, mut b_incoming, b_addr) = loopback();

    let cancel = CancellationToken::new();
    let (dialed, listened) = tokio::join!(
        dial_with_retry(&a, b_addr, policy(), &cancel),
        b_incoming.recv(),
    );
    let dialed = dialed.unwrap();
    let listened = listened.unwrap();

    let (a_canon, b_canon) = tokio::join!(
        PeerSynchronizer::new(SYNC_TIMEOUT).synchronize(Some(dialed), None),
        PeerSynchronizer::new(SYNC_TIMEOUT).synchronize(None, Some(listened)),
    );
    let mut a_canon = a_canon.unwrap();
    let mut b_canon = b_canon.unwrap();
    assert_eq!(a_canon.provenance, Provenance::Dialed);
    assert_eq!(b_canon.provenance, Provenance::Listened);
    assert!(a_canon.rejected.is_none());
    assert!(b_canon.rejected.is_none());

    let (from_b, from_a) = tokio::join!(
        exchange_message(&mut a_canon, b"ping from a", 1024),
        exchange_message(&mut b_canon, b"pong from b", 1024),
    );
    assert_eq!(from_b.unwrap(), b"pong from b");
    assert_eq!(from_a.unwrap(), b"ping from a");
}

#[tokio::test]
async fn mismatched_legs_close_both_sessions() {
    let (a, mut a_incoming, _a_addr) = loopback();
    let (_b, mut b_incoming, b_addr) = loopback();
    let (c, _c_incoming, _c_addr) = loopback();
    let a_addr = a.local_addr().unwrap();

    // A dials B while C dials A: both legs are up but for different peers
    let cancel_a = CancellationToken::new();
    let cancel_c = CancellationToken::new();
    let (a_to_b, c_to_a) = tokio::join!(
        dial_with_retry(&a, b_addr, policy(), &cancel_a),
        dial_with_retry(&c, a_addr, policy(), &cancel_c),
    );
    let a_to_b = a_to_b.unwrap();
    let c_to_a = c_to_a.unwrap();
    let b_from_a = b_incoming.recv().await.unwrap();
    let a_from_c = a_incoming.recv().await.unwrap();

    let a_dialed = a_to_b.clone();
    let a_listened = a_from_c.clone();
    let (a_result, _c_result) = tokio::join!(
        PeerSynchronizer::new(SYNC_TIMEOUT).synchronize(Some(a_to_b), Some(a_from_c)),
        PeerSynchronizer::new(SYNC_TIMEOUT).synchronize(Some(c_to_a.clone()), None),
    );

    assert!(matches!(a_result, Err(SyncError::AddressMismatch { .. })));
    assert!(a_dialed.close_reason().is_some());
    assert!(a_listened.close_reason().is_some());

    // Both remote ends learn why
    b_from_a.closed().await;
    assert_eq!(remote_close_code(&b_from_a), Some(CloseCode::PeerAddrInvalid));
    c_to_a.closed().await;
    assert_eq!(remote_close_code(&c_to_a), Some(CloseCode::PeerAddrInvalid));
}

#[tokio::test]
async fn two_coordinators_punch_and_exchange() {
    let reflector = spawn_reflector().await;
    let config = PunchConfig {
        stun_server: reflector.to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        punch_timeout: Duration::from_secs(5),
        dial_retry_delay: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(1),
        ..PunchConfig::default()
    };

    let mut a = NatTraversal::start(config.clone()).await.unwrap();
    let mut b = NatTraversal::start(config).await.unwrap();
    // Loopback has no NAT in the way
    assert_eq!(a.external_addr(), a.local_addr());
    assert_eq!(b.external_addr(), b.local_addr());

    let a_target = b.external_addr().to_string();
    let b_target = a.external_addr().to_string();
    let (a_canon, b_canon) = tokio::join!(a.connect(&a_target), b.connect(&b_target));
    let a_canon = a_canon.unwrap();
    let b_canon = b_canon.unwrap();
    assert_ne!(a_canon.provenance, b_canon.provenance);
    assert_eq!(a.state(), &ConnectionState::Exchanging);

    let (from_b, from_a) = tokio::join!(
        a.exchange(a_canon, b"hello from a"),
        b.exchange(b_canon, b"hello from b"),
    );
    assert_eq!(from_b.unwrap(), b"hello from b");
    assert_eq!(from_a.unwrap(), b"hello from a");
    assert_eq!(a.state(), &ConnectionState::Connected);

    a.reset();
    assert_eq!(a.state(), &ConnectionState::AwaitingTarget);
    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn session_from_another_peer_does_not_fill_the_listen_slot() {
    let (a, mut a_incoming, a_addr) = loopback();
    let (b, mut b_incoming, b_addr) = loopback();
    let (c, _c_incoming, _c_addr) = loopback();

    // C reaches A before A starts punching B
    let c_to_a = dial_with_retry(&c, a_addr, policy(), &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut a_racer = SessionRacer::new(&a, &mut a_incoming, policy());
    let mut b_racer = SessionRacer::new(&b, &mut b_incoming, policy());
    let (a_out, b_out) = tokio::join!(
        a_racer.race(b_addr, Duration::from_secs(5)),
        b_racer.race(a_addr, Duration::from_secs(5)),
    );

    assert_eq!(a_out.listened.as_ref().map(Connection::remote_address), Some(b_addr));
    assert_eq!(a_out.dialed.as_ref().map(Connection::remote_address), Some(b_addr));
    assert_eq!(b_out.listened.as_ref().map(Connection::remote_address), Some(a_addr));
    assert!(a_incoming.try_recv().is_none());

    c_to_a.closed().await;
    assert_eq!(remote_close_code(&c_to_a), Some(CloseCode::PeerLeft));
}

#[tokio::test]
async fn early_session_from_the_peer_is_kept() {
    let (a, mut a_incoming, a_addr) = loopback();
    let (b, _b_incoming, b_addr) = loopback();

    // B's operator was quicker: its handshake is queued before A races
    let b_to_a = dial_with_retry(&b, a_addr, policy(), &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = SessionRacer::new(&a, &mut a_incoming, policy())
        .race(b_addr, Duration::from_secs(5))
        .await;

    let listened = outcome.listened.expect("queued session from the peer");
    assert_eq!(listened.remote_address(), b_addr);
    assert!(listened.close_reason().is_none());
    assert!(b_to_a.close_reason().is_none());
    assert_eq!(outcome.dialed.map(|d| d.remote_address()), Some(b_addr));
}

#[tokio::test]
async fn closed_inbound_session_is_skipped() {
    let (a, mut a_incoming, a_addr) = loopback();
    let (c, _c_incoming, c_addr) = loopback();

    let c_to_a = dial_with_retry(&c, a_addr, policy(), &CancellationToken::new())
        .await
        .unwrap();
    close_session(&c_to_a, CloseCode::PeerLeft, "gave up");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = SessionRacer::new(&a, &mut a_incoming, policy())
        .race(c_addr, Duration::from_millis(500))
        .await;

    assert!(outcome.listened.is_none());
    assert_eq!(outcome.dialed.map(|d| d.remote_address()), Some(c_addr));
}

#[tokio::test]
async fn failing_legs_report_no_usable_leg() {
    let (a, mut a_incoming, _a_addr) = loopback();
    let (b, mut b_incoming, _b_addr) = loopback();
    let (a_dialed, a_listened, b_dialed, b_listened) =
        dial_both_ways(&a, &mut a_incoming, &b, &mut b_incoming).await;

    // B hangs up A's dialed session and never opens a stream on its own
    close_session(&b_listened, CloseCode::PeerLeft, "gone");
    a_dialed.closed().await;

    let result = PeerSynchronizer::new(Duration::from_millis(300))
        .synchronize(Some(a_dialed), Some(a_listened.clone()))
        .await;

    assert!(matches!(result, Err(SyncError::NoUsableLeg { .. })));
    assert!(a_listened.close_reason().is_some());
    b_dialed.closed().await;
    assert_eq!(remote_close_code(&b_dialed), Some(CloseCode::PeerLeft));
}

#[tokio::test]
async fn colliding_tokens_close_both_sessions() {
    let (a, mut a_incoming, _a_addr) = loopback();
    let (b, mut b_incoming, _b_addr) = loopback();
    let (a_dialed, a_listened, b_dialed, b_listened) =
        dial_both_ways(&a, &mut a_incoming, &b, &mut b_incoming).await;

    let a_sync = PeerSynchronizer::with_token(PeerToken::new("abc"), SYNC_TIMEOUT);
    let (result, seen_by_b) = tokio::join!(
        a_sync.synchronize(Some(a_dialed.clone()), Some(a_listened.clone())),
        answer_tokens(&b_dialed, &b_listened, "abc"),
    );

    assert!(matches!(result, Err(SyncError::TokenCollision)));
    assert_eq!(seen_by_b, b"abc");
    assert!(a_dialed.close_reason().is_some());
    assert!(a_listened.close_reason().is_some());

    b_dialed.closed().await;
    b_listened.closed().await;
    assert_eq!(remote_close_code(&b_dialed), Some(CloseCode::PeerLeft));
    assert_eq!(remote_close_code(&b_listened), Some(CloseCode::PeerLeft));
}

#[tokio::test]
async fn rejected_session_carries_tie_break_code() {
    // "3f2" < "a91": A keeps its listened session, drops the dialed one
    let (a, mut a_incoming, _a_addr) = loopback();
    let (b, mut b_incoming, _b_addr) = loopback();
    let (a_dialed, a_listened, b_dialed, b_listened) =
        dial_both_ways(&a, &mut a_incoming, &b, &mut b_incoming).await;

    let a_sync = PeerSynchronizer::with_token(PeerToken::new("3f2"), SYNC_TIMEOUT);
    let (canonical, _) = tokio::join!(
        a_sync.synchronize(Some(a_dialed), Some(a_listened)),
        answer_tokens(&b_dialed, &b_listened, "a91"),
    );
    let canonical = canonical.unwrap();
    assert_eq!(canonical.provenance, Provenance::Listened);
    b_listened.closed().await;
    assert_eq!(remote_close_code(&b_listened), Some(CloseCode::PeerNotInitiator));
    assert!(b_dialed.close_reason().is_none());

    // "fff" > "a91": A keeps its dialed session, drops the listened one
    let (a, mut a_incoming, _a_addr) = loopback();
    let (b, mut b_incoming, _b_addr) = loopback();
    let (a_dialed, a_listened, b_dialed, b_listened) =
        dial_both_ways(&a, &mut a_incoming, &b, &mut b_incoming).await;

    let a_sync = PeerSynchronizer::with_token(PeerToken::new("fff"), SYNC_TIMEOUT);
    let (canonical, _) = tokio::join!(
        a_sync.synchronize(Some(a_dialed), Some(a_listened)),
        answer_tokens(&b_dialed, &b_listened, "a91"),
    );
    let canonical = canonical.unwrap();
    assert_eq!(canonical.provenance, Provenance::Dialed);
    b_dialed.closed().await;
    assert_eq!(remote_close_code(&b_dialed), Some(CloseCode::PeerInitiator));
    assert!(b_listened.close_reason().is_none());
}
