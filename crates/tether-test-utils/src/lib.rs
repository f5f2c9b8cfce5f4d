// tether-test-utils: in-memory link harness for the transport test suites.
//
// Provides a plain in-memory pipe and a severable "flaky" link whose death
// looks exactly like a dropped TCP connection: EOF on read, broken pipe on
// write. Integration tests guillotine the link mid-transfer to exercise the
// detach/reattach machinery.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex};
use tokio::task::JoinHandle;

const LINK_CAPACITY: usize = 64 * 1024;

/// A plain in-memory pipe: two connected endpoints.
pub fn pair() -> (DuplexStream, DuplexStream) {
    duplex(LINK_CAPACITY)
}

/// Handle to a severable link created by [`flaky_link`].
pub struct FlakyLink {
    relays: Vec<JoinHandle<()>>,
}

impl FlakyLink {
    /// Cut the link. Both endpoints observe a dead transport.
    pub fn sever(self) {
        for relay in self.relays {
            relay.abort();
        }
    }
}

/// Two endpoints joined through relay tasks that can be severed mid-flight.
///
/// Unlike [`pair`], the endpoints are decoupled from each other by an inner
/// pipe per side; killing the relays drops the inner pipes, which surfaces
/// on the endpoints as EOF / broken pipe without the test having to give up
/// its endpoint handles.
pub fn flaky_link() -> (DuplexStream, DuplexStream, FlakyLink) {
    let (a_user, a_inner) = duplex(LINK_CAPACITY);
    let (b_user, b_inner) = duplex(LINK_CAPACITY);
    let (a_read, a_write) = tokio::io::split(a_inner);
    let (b_read, b_write) = tokio::io::split(b_inner);
    let relays = vec![
        tokio::spawn(relay(a_read, b_write)),
        tokio::spawn(relay(b_read, a_write)),
    ];
    (a_user, b_user, FlakyLink { relays })
}

async fn relay(mut from: ReadHalf<DuplexStream>, mut to: WriteHalf<DuplexStream>) {
    let mut buf = [0u8; 4096];
    loop {
        match from.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if to.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}
