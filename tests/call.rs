mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use common::{client, dead_endpoint, pool, StubServer, SLOW_REPLY};
use dendrite::{client::FrameKind, ErrorKind, Timeout};

#[test]
fn echo_round_trip() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);

    let response = client
        .call(&server.endpoint(), "echo", b"\x01\x02", Timeout::Infinite)
        .unwrap();
    assert_eq!(response, b"\x01\x02");

    let calls = server.journal().of_kind(FrameKind::Call);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].topic, "echo");
}

#[test]
fn calls_share_one_connection_per_endpoint() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);
    let endpoint = server.endpoint();

    // concurrent calls on the same topic must not be conflated
    let handles: Vec<_> = (0..8u8)
        .map(|n| {
            let client = client.clone();
            thread::spawn(move || {
                let payload = vec![n; n as usize + 1];
                let got = client
                    .call(&endpoint, "echo", &payload, Duration::from_secs(5))
                    .unwrap();
                assert_eq!(got, payload);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(server.journal().connects(), 1);
}

#[test]
fn silent_peer_times_out() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);
    // connect first so the measurement only covers the exchange
    client
        .call(&server.endpoint(), "echo", b"warm", Timeout::Infinite)
        .unwrap();

    let started = Instant::now();
    let err = client
        .call(&server.endpoint(), "silent", b"x", Duration::from_millis(50))
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.partial().is_none());
    assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
}

#[test]
fn zero_timeout_waits_for_slow_peers() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);

    let started = Instant::now();
    let response = client
        .call(&server.endpoint(), "slow", b"eventually", Duration::ZERO)
        .unwrap();
    assert_eq!(response, b"eventually");
    assert!(started.elapsed() >= SLOW_REPLY);
}

#[test]
fn remote_failures_keep_their_payload() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);

    let err = client
        .call(&server.endpoint(), "fail", b"diagnostic", Timeout::Infinite)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteError);
    assert_eq!(err.message(), "bad request");
    assert_eq!(err.partial(), Some(&b"diagnostic"[..]));
    assert!(err.code() > 0);

    // the connection survives an application-level failure
    let response = client
        .call(&server.endpoint(), "echo", b"ok", Timeout::Infinite)
        .unwrap();
    assert_eq!(response, b"ok");
    assert_eq!(server.journal().connects(), 1);
}

#[test]
fn invalid_arguments_never_reach_the_network() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);
    let endpoint = server.endpoint();

    let err = client
        .call(&endpoint, "echo", b"", Timeout::Infinite)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.code() < 0);
    let err = client
        .call(&endpoint, "", b"x", Timeout::Infinite)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = client
        .publish(&endpoint, "", b"x", Timeout::Infinite)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = client
        .publish(&endpoint, "log", b"", Timeout::Infinite)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.journal().connects(), 0);
}

#[test]
fn publish_returns_without_an_acknowledgement() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);

    client
        .publish(&server.endpoint(), "log", b"line", Duration::from_secs(1))
        .unwrap();
    assert!(server.journal().wait_for(|frames| {
        frames
            .iter()
            .any(|f| {
                f.kind == FrameKind::Publish
                    && f.topic == "log"
                    && f.payload == b"line"
            })
    }));
}

#[test]
fn connection_is_reopened_after_the_peer_hangs_up() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);
    let endpoint = server.endpoint();

    let err = client
        .call(&endpoint, "hangup", b"bye", Duration::from_secs(5))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);

    let response = client
        .call(&endpoint, "echo", b"again", Duration::from_secs(5))
        .unwrap();
    assert_eq!(response, b"again");
    assert_eq!(server.journal().connects(), 2);
}

#[test]
fn unreachable_endpoint_is_a_connection_failure() {
    let io = pool();
    let client = client(&io);
    let err = client
        .call(&dead_endpoint(&io), "echo", b"x", Duration::from_secs(5))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
}

#[test]
fn disconnect_forgets_the_cached_connection() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);
    let endpoint = server.endpoint();

    client.call(&endpoint, "echo", b"1", Timeout::Infinite).unwrap();
    assert!(client.disconnect(&endpoint));
    assert!(!client.disconnect(&endpoint));
    client.call(&endpoint, "echo", b"2", Timeout::Infinite).unwrap();
    assert_eq!(server.journal().connects(), 2);
}

#[test]
fn blocking_calls_work_from_pool_threads() {
    let io = pool();
    let server = StubServer::tcp(&io);
    let client = client(&io);
    let endpoint = server.endpoint();

    let (tx, rx) = std::sync::mpsc::channel();
    io.post(move || {
        let got = client.call(&endpoint, "echo", b"inner", Duration::from_secs(5));
        tx.send(got).unwrap();
    });
    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got.unwrap(), b"inner");
}

#[test]
fn topic_hashes_are_stable_per_client() {
    let io = pool();
    let client = client(&io);
    assert_eq!(client.topic_hash("echo"), client.topic_hash("echo"));
    assert_ne!(client.topic_hash("echo"), client.topic_hash("ohce"));
}
