//! Agent accept loop and per-connection request handling.
//!
//! Unary requests are answered in order on their connection. A connection
//! whose first request is `Exec` is handed to the Exec session for good.

use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Result, TetherError};
use crate::exec;
use crate::protocol::{error_response, ErrorCode, FrameReader, FrameWriter, Request};
use crate::service::ExecutionService;
use crate::transport::Listener;

/// The agent: a listener plus the execution service behind it.
pub struct Agent {
    listener: Listener,
    service: Arc<ExecutionService>,
}

impl Agent {
    /// Bind the configured socket path.
    pub async fn bind(config: Config) -> Result<Self> {
        let listener = Listener::listen(&config.socket_path).await?;
        Ok(Self {
            listener,
            service: Arc::new(ExecutionService::new(config)),
        })
    }

    /// Where the agent is listening.
    pub fn socket_path(&self) -> &Path {
        self.listener.path()
    }

    /// Shared handle to the service, for inspection while the agent runs.
    pub fn service(&self) -> Arc<ExecutionService> {
        Arc::clone(&self.service)
    }

    /// Serve connections until `shutdown` is cancelled, then tear down.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        tracing::debug!("New client connection");
                        let service = Arc::clone(&self.service);
                        let token = shutdown.child_token();
                        connections.spawn(handle_connection(service, stream, token));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        tracing::info!("Agent stopping");
        // Child tokens are already cancelled; sessions kill their processes.
        while connections.join_next().await.is_some() {}
        self.service.shutdown().await;
        self.listener.close();
        tracing::info!("Agent stopped");
        Ok(())
    }
}

/// Serve one client until it disconnects, sends a fatal frame, or `cancel` fires.
async fn handle_connection(
    service: Arc<ExecutionService>,
    stream: UnixStream,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, service.config().max_frame_len);
    let mut writer = FrameWriter::new(write_half);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next::<Request>() => next,
        };

        let request = match next {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!("Client disconnected");
                break;
            }
            Err(TetherError::Codec(e)) => {
                let resp = error_response(ErrorCode::InvalidRequest, format!("Invalid JSON: {e}"));
                if writer.send(&resp).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error reading from client");
                let _ = writer
                    .send(&error_response(ErrorCode::Protocol, e.to_string()))
                    .await;
                break;
            }
        };

        tracing::debug!(?request, "Received request");

        // Exec owns the rest of the connection.
        if request == Request::Exec {
            exec::run_session(&service, reader, writer, cancel).await;
            return;
        }

        let response = service.handle(request).await;
        if let Err(e) = writer.send(&response).await {
            tracing::warn!(error = %e, "Failed to write response");
            break;
        }
    }
}
