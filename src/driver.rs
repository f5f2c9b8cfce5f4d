//! Per-attachment worker: resumption handshake, then two pumps.
//!
//! Each attach spawns one driver task. It exchanges the position/window
//! header with the peer, reconciles the replay buffer, and then runs a
//! receive pump and a send pump concurrently on the split transport until
//! either fails or the attachment's cancellation token fires. Transport
//! failures stay local to the driver: the connection itself just returns to
//! the unattached state and arms its detach countdown.
//!
//! # Wire format, per attachment
//! 1. Both sides send `varint(read_position)`, `varint(free receive window)`.
//! 2. Then, repeatedly, in each direction: `varint(advance_window)`,
//!    `varint(frame_size)`, and `frame_size` payload bytes.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_wire::varint;

use crate::BoxedStream;
use crate::conn::{Shared, arm_detach_timer, wait_state};

pub(crate) async fn run(shared: Arc<Shared>, stream: BoxedStream, cancel: CancellationToken) {
    if let Err(err) = drive(&shared, stream, &cancel).await {
        debug!(error = %err, "attachment ended");
    }
    let mut st = shared.lock();
    st.attachment = None;
    if !st.closed {
        arm_detach_timer(&shared, &mut st);
    }
    st.broadcast();
}

async fn drive(
    shared: &Arc<Shared>,
    stream: BoxedStream,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    handshake(shared, &mut reader, &mut writer, cancel).await?;

    // Either pump failing takes the whole attachment down; dropping the
    // halves afterwards closes the physical transport.
    let receive = async {
        let res = receive_pump(shared, &mut reader, cancel).await;
        cancel.cancel();
        res
    };
    let send = async {
        let res = send_pump(shared, &mut writer, cancel).await;
        cancel.cancel();
        res
    };
    let (receive_res, send_res) = tokio::join!(receive, send);
    receive_res.and(send_res)
}

/// Exchange positions and windows, then reconcile the replay buffer.
///
/// The peer's declared read position must fall inside our replay range;
/// anything else means the streams are unrecoverably out of sync and the
/// physical transport is terminated (the connection survives; a later
/// attach may still line up).
async fn handshake(
    shared: &Arc<Shared>,
    reader: &mut BufReader<ReadHalf<BoxedStream>>,
    writer: &mut WriteHalf<BoxedStream>,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let mut header = Vec::with_capacity(2 * varint::MAX_VARINT_LEN);
    {
        let mut st = shared.lock();
        // The window start the peer will be told about: everything the local
        // reader has consumed so far.
        st.sent_window_start = st.read_position - st.receive_buffer.len() as u64;
        varint::put_varint(&mut header, st.read_position as i64);
        varint::put_varint(
            &mut header,
            (shared.cfg.buffer_size - st.receive_buffer.len()) as i64,
        );
    }
    abortable(cancel, writer.write_all(&header)).await?;

    let remote_read_position = abortable(cancel, varint::read_varint(reader)).await?;
    let remote_window = abortable(cancel, varint::read_varint(reader)).await?;
    if remote_read_position < 0 || remote_window < 0 {
        return Err(protocol_error("negative handshake header"));
    }
    let remote_read_position = remote_read_position as u64;
    let remote_window = remote_window as u64;

    let mut st = shared.lock();
    let replay_end = st.replay_position + st.replay_buffer.len() as u64;
    if remote_read_position < st.replay_position || remote_read_position > replay_end {
        return Err(protocol_error("peer read position outside our replay range"));
    }
    let confirmed = (remote_read_position - st.replay_position) as usize;
    st.replay_buffer.drain(..confirmed);
    st.replay_position = remote_read_position;
    st.remote_read_position = remote_read_position;
    st.remote_window = remote_window;
    st.broadcast();
    Ok(())
}

/// Apply peer frames: window advances shrink the replay buffer, payload
/// bytes land in the receive buffer.
async fn receive_pump(
    shared: &Arc<Shared>,
    reader: &mut BufReader<ReadHalf<BoxedStream>>,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let max_frame = shared.cfg.max_frame as u64;
    let buffer_size = shared.cfg.buffer_size;
    loop {
        let advance = abortable(cancel, varint::read_varint(reader)).await?;
        let frame_size = abortable(cancel, varint::read_varint(reader)).await?;
        if advance < 0 || frame_size < 0 {
            return Err(protocol_error("negative frame header"));
        }
        let advance = advance as u64;
        let frame_size = frame_size as u64;

        {
            let mut st = shared.lock();
            if advance > 0 {
                if advance > st.replay_buffer.len() as u64
                    || advance > st.remote_read_position - st.replay_position
                {
                    return Err(protocol_error("window advance outruns the replay buffer"));
                }
                st.remote_window += advance;
                st.replay_buffer.drain(..advance as usize);
                st.replay_position += advance;
                st.broadcast();
            }
            if frame_size == 0 {
                continue;
            }
            if frame_size > max_frame
                || frame_size > (buffer_size - st.replay_buffer.len()) as u64
                || frame_size > (buffer_size - st.receive_buffer.len()) as u64
            {
                return Err(protocol_error("frame exceeds negotiated limits"));
            }
        }

        // Commit payload bytes as they arrive: a transport failure mid-frame
        // must keep the prefix that was actually received.
        let mut frame = vec![0u8; frame_size as usize];
        let mut filled = 0usize;
        while filled < frame.len() {
            let n = abortable(cancel, async { reader.read(&mut frame[filled..]).await }).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            let mut st = shared.lock();
            st.receive_buffer.extend(&frame[filled..filled + n]);
            st.read_position += n as u64;
            st.broadcast();
            filled += n;
        }
    }
}

/// Ship replayable bytes within the peer's window, and report how much the
/// local reader has consumed since the last frame.
async fn send_pump(
    shared: &Arc<Shared>,
    writer: &mut WriteHalf<BoxedStream>,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let max_frame = shared.cfg.max_frame as u64;
    loop {
        let step = abortable(cancel, async {
            Ok::<_, io::Error>(
                wait_state(shared, |st| {
                    if st.closed {
                        return Some(None);
                    }
                    let mut chunk = Vec::new();
                    let replay_end = st.replay_position + st.replay_buffer.len() as u64;
                    if st.remote_window > 0 && replay_end > st.remote_read_position {
                        let offset = (st.remote_read_position - st.replay_position) as usize;
                        let len = (replay_end - st.remote_read_position)
                            .min(st.remote_window)
                            .min(max_frame) as usize;
                        chunk = copy_range(&st.replay_buffer, offset, len);
                    }
                    let window_start = st.read_position - st.receive_buffer.len() as u64;
                    let advance = window_start - st.sent_window_start;
                    if advance > 0 || !chunk.is_empty() {
                        Some(Some((advance, chunk)))
                    } else {
                        None
                    }
                })
                .await,
            )
        })
        .await?;

        let Some((advance, chunk)) = step else {
            return Ok(());
        };

        let mut header = Vec::with_capacity(2 * varint::MAX_VARINT_LEN);
        varint::put_varint(&mut header, advance as i64);
        varint::put_varint(&mut header, chunk.len() as i64);
        abortable(cancel, writer.write_all(&header)).await?;
        if !chunk.is_empty() {
            abortable(cancel, async { writer.write_all(&chunk).await }).await?;
        }

        let mut st = shared.lock();
        st.sent_window_start += advance;
        st.remote_read_position += chunk.len() as u64;
        st.remote_window -= chunk.len() as u64;
    }
}

/// Race a wire operation against the attachment's one-shot closer.
async fn abortable<T>(
    cancel: &CancellationToken,
    op: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "attachment closed",
        )),
        res = op => res,
    }
}

fn copy_range(buf: &VecDeque<u8>, offset: usize, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let (front, back) = buf.as_slices();
    if offset < front.len() {
        let take = (front.len() - offset).min(len);
        out.extend_from_slice(&front[offset..offset + take]);
        if take < len {
            out.extend_from_slice(&back[..len - take]);
        }
    } else {
        let start = offset - front.len();
        out.extend_from_slice(&back[start..start + len]);
    }
    out
}

fn protocol_error(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
