//! Byte bridge: couples a logical connection to an external byte stream.
//!
//! Two pumps run until both directions see EOF. Overlay bytes are written to
//! the output stream; stream bytes are read into pooled buffers and written
//! to the connection, with the buffer held until the overlay write finishes.
//! When every pool cell is in flight the input side parks (throttled) until
//! a write completes and frees one, so a slow overlay path back-pressures
//! the local reader instead of growing a queue.
//!
//! Half-close maps across the bridge: overlay EOF shuts down the output
//! stream's write side, stream EOF half-closes the connection. Once both
//! sides finish, the connection is closed and the bridge returns.

use std::sync::Arc;

use codec::Pool;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Notify, mpsc},
};

use crate::{Error, conn::Connection};

const BRIDGE_BUF_SIZE: usize = 32 * 1024;
const BRIDGE_POOL_SIZE: usize = 16;

/// Bridges a connection to a single bidirectional stream.
pub async fn bridge<S>(conn: Connection, stream: S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (input, output) = tokio::io::split(stream);
    bridge_split(conn, input, output).await
}

/// Bridges a connection to separate input and output streams (descriptor
/// pairs, pipes).
pub async fn bridge_split<R, W>(conn: Connection, input: R, output: W) -> Result<(), Error>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let pool = Pool::new(BRIDGE_BUF_SIZE, BRIDGE_POOL_SIZE);
    let released = Arc::new(Notify::new());

    let overlay_to_stream = tokio::spawn(pump_overlay(conn.clone(), output));
    let stream_to_overlay = tokio::spawn(pump_input(
        conn.clone(),
        input,
        pool,
        released,
    ));

    let overlay_eof = overlay_to_stream.await.unwrap_or(false);
    let input_eof = stream_to_overlay.await.unwrap_or(false);

    log::trace!(
        "bridge for conn[{}] done (overlay_eof={}, input_eof={})",
        conn.id(),
        overlay_eof,
        input_eof
    );

    conn.close().await
}

/// Overlay → stream. Returns true when the overlay reached clean EOF.
async fn pump_overlay<W>(conn: Connection, mut output: W) -> bool
where
    W: AsyncWrite + Unpin,
{
    loop {
        match conn.recv().await {
            Ok(Some(bytes)) => {
                if output.write_all(&bytes).await.is_err() {
                    log::warn!("bridge output write failed, closing conn[{}]", conn.id());
                    return false;
                }
            }
            Ok(None) => {
                // peer finished writing; pass the EOF along
                let _ = output.shutdown().await;
                return true;
            }
            Err(err) => {
                log::warn!("bridge overlay side failed: {}", err);
                return false;
            }
        }
    }
}

/// Stream → overlay. Returns true when the input reached clean EOF.
async fn pump_input<R>(
    conn: Connection,
    mut input: R,
    pool: Pool,
    released: Arc<Notify>,
) -> bool
where
    R: AsyncRead + Unpin,
{
    // overlay writes complete out of band so reads can stay ahead of them;
    // each in-flight write owns its pool cell until acked
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<codec::PoolBuf>();
    let writer = {
        let conn = conn.clone();
        let released = released.clone();
        tokio::spawn(async move {
            let mut ok = true;
            while let Some(buf) = write_rx.recv().await {
                let result = conn.write(&buf).await;
                drop(buf);
                released.notify_one();
                if result.is_err() {
                    ok = false;
                    break;
                }
            }

            // queued cells (if any) go back to the pool with the channel;
            // wake the reader so it can observe the failure
            drop(write_rx);
            released.notify_waiters();
            ok
        })
    };

    let mut throttled = false;
    let eof = loop {
        let mut buf = loop {
            match pool.acquire() {
                Some(buf) => {
                    if throttled {
                        log::trace!("unstalled conn[{}]", conn.id());
                        throttled = false;
                    }
                    break buf;
                }
                None => {
                    if !throttled {
                        log::trace!("stalled conn[{}]", conn.id());
                        throttled = true;
                    }
                    released.notified().await;
                }
            }
        };

        match input.read_buf(&mut *buf).await {
            Ok(0) => {
                let _ = conn.close_write().await;
                break true;
            }
            Ok(_) => {
                if write_tx.send(buf).is_err() {
                    break false;
                }
            }
            Err(err) => {
                log::warn!("bridge input read failed: {}", err);
                break false;
            }
        }
    };

    drop(write_tx);
    let writes_ok = writer.await.unwrap_or(false);
    eof && writes_ok
}
