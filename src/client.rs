//! Controller-side connection to an agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Result, TetherError};
use crate::protocol::{
    AgentStatus, ExecRequestFrame, ExecResponseFrame, FrameReader, FrameWriter, Request,
    Response, StartRequest, StartResponse, StdinRequest, StopRequest, StopResponse,
    VersionResponse, DEFAULT_MAX_FRAME_LEN,
};
use crate::transport::dial;

struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    /// Set while a request awaits its response. Still set on entry means the
    /// previous call was cancelled and its response may be pending.
    in_flight: bool,
}

impl Connection {
    async fn open(path: &Path, timeout: Duration, max_frame_len: usize) -> Result<Self> {
        let stream = dial(path, timeout).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half, max_frame_len),
            writer: FrameWriter::new(write_half),
            in_flight: false,
        })
    }
}

/// Unary calls share one connection; every Exec stream dials its own.
pub struct Client {
    socket_path: PathBuf,
    timeout: Duration,
    max_frame_len: usize,
    conn: Mutex<Connection>,
}

impl Client {
    /// Dial the agent. Failure is reported, never retried.
    pub async fn connect(socket_path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        Self::connect_with_limit(socket_path, timeout, DEFAULT_MAX_FRAME_LEN).await
    }

    /// Dial using the socket, timeout and frame limit from `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::connect_with_limit(
            &config.socket_path,
            config.connect_timeout(),
            config.max_frame_len,
        )
        .await
    }

    async fn connect_with_limit(
        socket_path: impl AsRef<Path>,
        timeout: Duration,
        max_frame_len: usize,
    ) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let conn = Connection::open(&socket_path, timeout, max_frame_len).await?;
        tracing::debug!(socket = %socket_path.display(), "Connected to agent");
        Ok(Self {
            socket_path,
            timeout,
            max_frame_len,
            conn: Mutex::new(conn),
        })
    }

    /// The agent socket this client dials.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// One request, one response. Cancel-safe: if a previous call was dropped
    /// mid-flight, the connection is replaced so its stale response is never
    /// read as this call's answer.
    async fn call(&self, request: &Request) -> Result<Response> {
        let mut conn = self.conn.lock().await;
        if conn.in_flight {
            tracing::debug!(
                socket = %self.socket_path.display(),
                "Reconnecting after an abandoned call"
            );
            *conn = Connection::open(&self.socket_path, self.timeout, self.max_frame_len).await?;
        }

        conn.in_flight = true;
        conn.writer.send(request).await?;
        let response = conn.reader.next::<Response>().await?;
        conn.in_flight = false;

        match response {
            Some(Response::Error(err)) => Err(TetherError::Remote {
                code: err.code.as_str().to_string(),
                message: err.message,
            }),
            Some(response) => Ok(response),
            None => Err(TetherError::Protocol("agent closed the connection".into())),
        }
    }

    /// Start a headless process and return its pid.
    pub async fn start(
        &self,
        command: &str,
        workdir: &str,
        env: HashMap<String, String>,
    ) -> Result<StartResponse> {
        let request = Request::Start(StartRequest {
            command: command.to_string(),
            workdir: workdir.to_string(),
            env,
        });
        match self.call(&request).await? {
            Response::Started(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    /// Stop `pid`, letting the agent apply its default grace period when
    /// `timeout` is `None`.
    pub async fn stop(&self, pid: u32, timeout: Option<Duration>) -> Result<StopResponse> {
        let request = Request::Stop(StopRequest {
            pid,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        });
        match self.call(&request).await? {
            Response::Stopped(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    /// Readiness and process count of the agent.
    pub async fn status(&self) -> Result<AgentStatus> {
        match self.call(&Request::Status).await? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Agent version and protocol revision.
    pub async fn version(&self) -> Result<VersionResponse> {
        match self.call(&Request::Version).await? {
            Response::Version(version) => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Queue bytes for a headless process. Unknown pids are not an error.
    pub async fn stdin(&self, pid: u32, content: &[u8]) -> Result<()> {
        let request = Request::Stdin(StdinRequest {
            pid,
            content: content.to_vec(),
        });
        match self.call(&request).await? {
            Response::StdinAck => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Open an Exec stream on a fresh connection.
    pub async fn exec(&self) -> Result<ExecStream> {
        let mut conn = Connection::open(&self.socket_path, self.timeout, self.max_frame_len).await?;
        conn.writer.send(&Request::Exec).await?;
        Ok(ExecStream {
            sender: ExecSender {
                writer: conn.writer,
                eof_sent: false,
            },
            receiver: ExecReceiver {
                reader: conn.reader,
                finished: false,
            },
        })
    }
}

/// Dial and ask for status within a single deadline.
pub async fn probe(socket_path: impl AsRef<Path>, timeout: Duration) -> Result<AgentStatus> {
    let socket_path = socket_path.as_ref();
    let attempt = async {
        let client = Client::connect(socket_path, timeout).await?;
        client.status().await
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| {
            TetherError::Timeout(format!("agent at {} did not answer", socket_path.display()))
        })?
}

fn unexpected(response: Response) -> TetherError {
    TetherError::Protocol(format!("unexpected response: {response:?}"))
}

/// An open Exec stream, split into its two directions.
pub struct ExecStream {
    sender: ExecSender,
    receiver: ExecReceiver,
}

impl ExecStream {
    pub fn split(self) -> (ExecSender, ExecReceiver) {
        (self.sender, self.receiver)
    }
}

/// Outbound half of an Exec stream.
pub struct ExecSender {
    writer: FrameWriter<OwnedWriteHalf>,
    eof_sent: bool,
}

impl ExecSender {
    /// Send an Input frame. Fails once Eof has been sent.
    pub async fn send_input(&mut self, bytes: &[u8]) -> Result<()> {
        if self.eof_sent {
            return Err(TetherError::Protocol("input after eof".into()));
        }
        self.writer
            .send(&ExecRequestFrame::Input(bytes.to_vec()))
            .await
    }

    /// Send Eof. Later calls are no-ops.
    pub async fn send_eof(&mut self) -> Result<()> {
        if self.eof_sent {
            return Ok(());
        }
        self.eof_sent = true;
        self.writer.send(&ExecRequestFrame::Eof).await
    }

    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    /// Close the write side of the connection.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Inbound half of an Exec stream.
pub struct ExecReceiver {
    reader: FrameReader<OwnedReadHalf>,
    finished: bool,
}

impl ExecReceiver {
    /// Next output frame. `Ok(None)` after the `done` frame or stream end.
    pub async fn recv(&mut self) -> Result<Option<ExecResponseFrame>> {
        if self.finished {
            return Ok(None);
        }
        match self.reader.next::<Response>().await? {
            Some(Response::Exec(frame)) => {
                self.finished = frame.done;
                Ok(Some(frame))
            }
            Some(Response::Error(err)) => {
                self.finished = true;
                Err(TetherError::Remote {
                    code: err.code.as_str().to_string(),
                    message: err.message,
                })
            }
            Some(other) => Err(unexpected(other)),
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }
}
