//! Execution service: the unary operations behind the agent's socket.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::Config;
use crate::error::Result;
use crate::normalize::strip_cr;
use crate::process::{spawn_piped, OutputChunk, ProcessRegistry, SpawnOptions};
use crate::protocol::{
    error_response, AgentStatus, ErrorCode, Request, Response, StartRequest, StartResponse,
    StdinRequest, StopRequest, StopResponse, VersionResponse,
};

/// How long shutdown waits for each killed process to be reaped.
const SHUTDOWN_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns the process registry of one agent instance.
pub struct ExecutionService {
    registry: ProcessRegistry,
    config: Config,
    started_at: DateTime<Utc>,
}

impl ExecutionService {
    /// A service with an empty registry, started now.
    pub fn new(config: Config) -> Self {
        Self {
            registry: ProcessRegistry::new(),
            config,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Headless processes started through this service.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Dispatch a unary request. `Exec` is handled by the connection loop.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Start(req) => match self.start(req).await {
                Ok(resp) => Response::Started(resp),
                Err(e) => error_response(ErrorCode::SpawnFailed, e.to_string()),
            },
            Request::Stop(req) => Response::Stopped(self.stop(req).await),
            Request::Status => Response::Status(self.status()),
            Request::Version => Response::Version(VersionResponse::current()),
            Request::Stdin(req) => {
                self.stdin(req);
                Response::StdinAck
            }
            Request::Exec => error_response(
                ErrorCode::InvalidRequest,
                "exec must be the first request on its own connection",
            ),
        }
    }

    /// Spawn a detached headless process and return its pid without waiting.
    ///
    /// Its output is copied into the agent's own stdout and stderr.
    pub async fn start(&self, req: StartRequest) -> Result<StartResponse> {
        let opts = SpawnOptions::new(&self.config.shell, &req.command)
            .workdir(&req.workdir)
            .env(req.env)
            .chunk_size(self.config.read_chunk_size);

        let mut ctx = spawn_piped(&opts)?;
        let pid = ctx.pid();

        if let Some(output) = ctx.take_output() {
            tokio::spawn(capture_headless_output(pid, output));
        }

        if let Err(e) = self.registry.register(ctx) {
            // Only reachable if the OS hands out a pid we still track.
            crate::process::force_kill(pid);
            return Err(e);
        }

        tracing::info!(pid, command = %req.command, "Started headless process");
        Ok(StartResponse { pid })
    }

    /// Stop a registered process. Unknown pids succeed with exit code 0.
    pub async fn stop(&self, req: StopRequest) -> StopResponse {
        let Some(mut ctx) = self.registry.remove(req.pid) else {
            tracing::debug!(pid = req.pid, "Stop for unknown pid");
            return StopResponse::default();
        };

        let grace = req
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.stop_timeout());
        let exit_code = ctx.terminate(grace).await;

        tracing::info!(pid = req.pid, exit_code, "Stopped process");
        StopResponse { exit_code }
    }

    /// Readiness snapshot: version, start time, live process count.
    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            running: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            processes: self.registry.len(),
        }
    }

    /// Queue bytes for a registered process's input without waiting on it.
    ///
    /// Unknown pids are ignored. When the process has stopped reading and its
    /// input queue is full, the bytes are dropped so the caller's connection
    /// never stalls behind it.
    pub fn stdin(&self, req: StdinRequest) {
        let Some(input) = self.registry.lookup(req.pid, |ctx| ctx.input()).flatten() else {
            tracing::debug!(pid = req.pid, "Dropping stdin for unknown or closed process");
            return;
        };

        let content = strip_cr(&req.content);
        if content.is_empty() {
            return;
        }
        let len = content.len();
        match input.try_send(content) {
            Ok(()) => tracing::trace!(pid = req.pid, bytes = len, "Queued stdin"),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    pid = req.pid,
                    bytes = len,
                    "Process input is backed up, dropping stdin"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(pid = req.pid, "Process input already closed");
            }
        }
    }

    /// Force-terminate every registered process.
    pub async fn shutdown(&self) {
        for mut ctx in self.registry.drain() {
            tracing::info!(pid = ctx.pid(), "Killing process on shutdown");
            ctx.kill();
            if tokio::time::timeout(SHUTDOWN_REAP_TIMEOUT, ctx.wait())
                .await
                .is_err()
            {
                tracing::warn!(pid = ctx.pid(), "Process not reaped before shutdown");
            }
        }
    }
}

async fn capture_headless_output(
    pid: u32,
    mut output: tokio::sync::mpsc::Receiver<OutputChunk>,
) {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    // Keep draining after a write failure so the child never blocks on a full pipe.
    while let Some(chunk) = output.recv().await {
        let written = match chunk {
            OutputChunk::Stdout(bytes) => stdout.write_all(&bytes).await,
            OutputChunk::Stderr(bytes) => stderr.write_all(&bytes).await,
        };
        if let Err(e) = written {
            tracing::debug!(pid, error = %e, "Failed to copy process output");
        }
    }

    let _ = stdout.flush().await;
    let _ = stderr.flush().await;
    tracing::debug!(pid, "Headless output drained");
}
