//! Chaos suite: the link dies over and over; the byte streams must not care.
//!
//! A fixed payload is pushed through a pair of durable connections while the
//! physical link underneath is repeatedly guillotined and replaced. Whatever
//! the cut points, each side must read exactly the bytes the other wrote:
//! same order, no gaps, no duplicates.

use std::time::Duration;

use tether::{ResumableConn, TransportConfig};
use tether_test_utils::flaky_link;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const TOTAL: usize = 256 * 1024;
const MAX_KILLS: usize = 500;

fn pattern(seed: u8) -> Vec<u8> {
    (0..TOTAL)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[tokio::test]
async fn byte_streams_survive_repeated_link_kills() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();

    let cfg = TransportConfig::default();
    let server = ResumableConn::new(None, None, cfg);
    let client = ResumableConn::new(None, None, cfg);

    let (a, b, link) = flaky_link();
    server.attach(a).await.unwrap();
    client.attach(b).await.unwrap();

    // Both directions at once: the replay buffer swallows the whole payload,
    // delivery is the pumps' problem across however many links it takes.
    let upstream = pattern(3);
    let downstream = pattern(17);
    let mut client_writer = client.clone();
    client_writer.write_all(&upstream).await.unwrap();
    let mut server_writer = server.clone();
    server_writer.write_all(&downstream).await.unwrap();

    let mut server_reader = server.clone();
    let collect_up = tokio::spawn(async move {
        let mut got = vec![0u8; TOTAL];
        server_reader.read_exact(&mut got).await.unwrap();
        got
    });
    let mut client_reader = client.clone();
    let collect_down = tokio::spawn(async move {
        let mut got = vec![0u8; TOTAL];
        client_reader.read_exact(&mut got).await.unwrap();
        got
    });

    let mut current = link;
    let mut kills = 0usize;
    while !(collect_up.is_finished() && collect_down.is_finished()) {
        assert!(kills < MAX_KILLS, "transfer made no progress after {kills} kills");
        tokio::time::sleep(Duration::from_millis(10)).await;
        current.sever();
        kills += 1;

        let (a, b, next) = flaky_link();
        server.attach(a).await.unwrap();
        client.attach(b).await.unwrap();
        current = next;
    }

    let got_up = timeout(Duration::from_secs(10), collect_up)
        .await
        .unwrap()
        .unwrap();
    let got_down = timeout(Duration::from_secs(10), collect_down)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got_up, upstream, "upstream bytes diverged");
    assert_eq!(got_down, downstream, "downstream bytes diverged");

    assert!(!server.is_closed());
    assert!(!client.is_closed());
    server.close().await.unwrap();
    client.close().await.unwrap();
}
