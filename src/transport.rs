//! Filesystem-addressed duplex endpoint (Unix domain socket).

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};

use crate::error::{Result, TetherError};

/// A bound socket that owns its file on disk.
pub struct Listener {
    path: PathBuf,
    inner: Option<UnixListener>,
}

impl Listener {
    /// Bind at `path`, replacing a socket file left behind by an unclean exit.
    pub async fn listen(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(socket = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let inner = UnixListener::bind(&path)?;
        tracing::info!(socket = %path.display(), "Listening");

        Ok(Self {
            path,
            inner: Some(inner),
        })
    }

    /// Wait for the next connection. Fails once the listener is closed.
    pub async fn accept(&self) -> Result<UnixStream> {
        let listener = self
            .inner
            .as_ref()
            .ok_or_else(|| TetherError::Protocol("listener is closed".into()))?;
        let (stream, _addr) = listener.accept().await?;
        Ok(stream)
    }

    /// The socket file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unbind and remove the socket file. Safe to call more than once.
    pub fn close(&mut self) {
        if self.inner.take().is_none() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(socket = %self.path.display(), "Removed socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(socket = %self.path.display(), error = %e, "Failed to remove socket")
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect to the socket at `path`, giving up after `timeout`.
pub async fn dial(path: impl AsRef<Path>, timeout: Duration) -> Result<UnixStream> {
    let path = path.as_ref();
    match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TetherError::Connect {
            path: path.to_path_buf(),
            source,
        }),
        Err(_) => Err(TetherError::Timeout(format!(
            "connecting to {} after {}ms",
            path.display(),
            timeout.as_millis()
        ))),
    }
}
