//! Byte pump between local stdio and the agent socket.
//!
//! This is the far end of a cross-OS bridge: a remote shell session's
//! standard streams are piped into `tether relay`, which forwards them to the
//! socket. Carriage returns are dropped in both directions.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::normalize::strip_cr_in_place;

const RELAY_CHUNK: usize = 8192;

/// Relay until the socket side reaches end-of-file.
///
/// Local end-of-file half-closes the socket's write side; the socket's
/// answer is still drained into `local_out`.
pub async fn relay<I, O, S>(local_in: I, local_out: O, stream: S) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (socket_read, socket_write) = tokio::io::split(stream);

    let inbound = pump(local_in, socket_write);
    let outbound = pump(socket_read, local_out);
    tokio::pin!(inbound, outbound);

    let mut inbound_done = false;
    loop {
        tokio::select! {
            sent = &mut inbound, if !inbound_done => {
                let sent = sent?;
                tracing::debug!(bytes = sent, "Local input closed");
                inbound_done = true;
            }
            received = &mut outbound => {
                let received = received?;
                tracing::debug!(bytes = received, "Socket closed");
                return Ok(());
            }
        }
    }
}

async fn pump<R, W>(mut from: R, mut to: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK];
    let mut total = 0u64;

    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            to.shutdown().await?;
            return Ok(total);
        }

        let mut chunk = buf[..n].to_vec();
        strip_cr_in_place(&mut chunk);
        if chunk.is_empty() {
            continue;
        }
        to.write_all(&chunk).await?;
        to.flush().await?;
        total += chunk.len() as u64;
    }
}
