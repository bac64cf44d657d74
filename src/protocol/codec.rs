//! Newline-delimited JSON framing over any async byte stream.
//!
//! Lines are split by [`LinesCodec`] with a per-line cap; serde_json sits on top.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::error::{Result, TetherError};

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one JSON value per line.
pub struct FrameReader<R> {
    inner: FramedRead<R, LinesCodec>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Lines longer than `max_len` bytes are rejected.
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner: FramedRead::new(inner, LinesCodec::new_with_max_length(max_len)),
            max_len,
        }
    }

    /// Read the next frame. `Ok(None)` means the peer closed the stream.
    ///
    /// A line that is not valid JSON for `T` yields [`TetherError::Codec`];
    /// the reader stays usable for the following line. An oversized line is a
    /// [`TetherError::Protocol`] error and ends the stream.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            let line = match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(TetherError::Protocol(format!(
                        "frame exceeds {} bytes",
                        self.max_len
                    )));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

/// Writes one JSON value per line, flushing after each.
pub struct FrameWriter<W> {
    inner: FramedWrite<W, LinesCodec>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: FramedWrite::new(inner, LinesCodec::new()),
        }
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let line = serde_json::to_string(frame)?;
        self.inner.send(line).await.map_err(codec_error)
    }

    /// Close the write side; the peer reads end-of-stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        SinkExt::<String>::close(&mut self.inner).await.map_err(codec_error)
    }
}

fn codec_error(e: LinesCodecError) -> TetherError {
    match e {
        LinesCodecError::Io(e) => TetherError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            TetherError::Protocol("frame exceeds the line limit".into())
        }
    }
}
