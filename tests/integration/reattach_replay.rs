//! Reattach and replay semantics, driven over severable in-memory links.
//!
//! # Scenarios
//! 1. A killed transport loses nothing: bytes unread at the time of the cut
//!    are replayed over the next attachment, with no duplicates.
//! 2. Repeated reads across a reattach never see reordered bytes.
//! 3. A detach with no reattach closes the connection after the grace
//!    window; pending reads surface the closed error.
//! 4. Buffer-cap boundary: writing exactly the buffer size succeeds and the
//!    next byte blocks rather than erroring.

use std::time::Duration;

use tether::{ResumableConn, StreamError, TransportConfig};
use tether_test_utils::{flaky_link, pair};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

fn conn_pair(cfg: TransportConfig) -> (ResumableConn, ResumableConn) {
    (
        ResumableConn::new(None, None, cfg),
        ResumableConn::new(None, None, cfg),
    )
}

// ---------------------------------------------------------------------------
// Scenario 1: reattach preserves data
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reattach_replays_exactly_the_unconfirmed_tail() {
    let cfg = TransportConfig::default();
    let (server, client) = conn_pair(cfg);

    let (a, b, link) = flaky_link();
    server.attach(a).await.unwrap();
    client.attach(b).await.unwrap();

    let mut writer = client.clone();
    writer.write_all(b"abcdefghij").await.unwrap();

    let mut reader = server.clone();
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await.unwrap();
    assert_eq!(&head, b"abcd");

    // Kill the transport, then splice in a fresh one within the grace
    // window.
    link.sever();
    server.wait_detached().await;
    client.wait_detached().await;

    let (a2, b2, _link2) = flaky_link();
    server.attach(a2).await.unwrap();
    client.attach(b2).await.unwrap();

    let mut tail = [0u8; 6];
    timeout(Duration::from_secs(5), reader.read_exact(&mut tail))
        .await
        .expect("replay must deliver the tail")
        .unwrap();
    assert_eq!(&tail, b"efghij");

    server.close().await.unwrap();
    client.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 2: order survives the cut in both directions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn both_directions_survive_a_cut() {
    let cfg = TransportConfig::default();
    let (server, client) = conn_pair(cfg);

    let (a, b, link) = flaky_link();
    server.attach(a).await.unwrap();
    client.attach(b).await.unwrap();

    let mut client_stream = client.clone();
    let mut server_stream = server.clone();
    client_stream.write_all(b"upstream-1 ").await.unwrap();
    server_stream.write_all(b"downstream-1 ").await.unwrap();

    link.sever();
    server.wait_detached().await;
    client.wait_detached().await;

    let (a2, b2, _link2) = flaky_link();
    server.attach(a2).await.unwrap();
    client.attach(b2).await.unwrap();

    client_stream.write_all(b"upstream-2").await.unwrap();
    server_stream.write_all(b"downstream-2").await.unwrap();

    let mut up = [0u8; 21];
    server_stream.read_exact(&mut up).await.unwrap();
    assert_eq!(&up, b"upstream-1 upstream-2");

    let mut down = [0u8; 25];
    client_stream.read_exact(&mut down).await.unwrap();
    assert_eq!(&down, b"downstream-1 downstream-2");

    server.close().await.unwrap();
    client.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 3: detach timeout closes the conn
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn detach_without_reattach_closes_after_the_grace_window() {
    let cfg = TransportConfig::default();
    let (server, client) = conn_pair(cfg);

    let (a, b) = pair();
    server.attach(a).await.unwrap();
    client.attach(b).await.unwrap();

    let mut reader = server.clone();
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 4];
        reader.read(&mut buf).await
    });
    tokio::task::yield_now().await;

    client.detach().await;
    server.detach().await;

    // Past the grace window the connection gives up for good.
    tokio::time::sleep(cfg.detach_timeout + Duration::from_secs(1)).await;
    assert!(server.is_closed());
    assert!(client.is_closed());

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
}

// ---------------------------------------------------------------------------
// Scenario 4: buffer-cap boundary
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn a_full_replay_buffer_blocks_instead_of_erroring() {
    let cfg = TransportConfig {
        buffer_size: 4096,
        max_frame: 512,
        detach_timeout: Duration::from_secs(30),
    };
    let conn = ResumableConn::new(None, None, cfg);

    // Exactly the buffer size goes through with nobody consuming.
    let mut writer = conn.clone();
    let payload = vec![0x5au8; cfg.buffer_size];
    timeout(Duration::from_secs(1), writer.write_all(&payload))
        .await
        .expect("a buffer-sized write must not block")
        .unwrap();

    // One more byte parks until someone confirms consumption.
    let one_more = timeout(Duration::from_secs(1), writer.write(b"!")).await;
    assert!(one_more.is_err(), "the write should still be pending");
    assert!(!conn.is_closed());

    conn.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Attach on a closed conn
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attach_after_close_reports_the_closed_error() {
    let conn = ResumableConn::new(None, None, TransportConfig::default());
    conn.close().await.unwrap();
    let (a, _b) = pair();
    assert_eq!(conn.attach(a).await.unwrap_err(), StreamError::Closed);
}
