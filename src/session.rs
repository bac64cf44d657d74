//! Controller loops: interactive Exec and headless Start/Stdin/Stop.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ExecReceiver, ExecSender};
use crate::error::Result;
use crate::protocol::{StartRequest, StopResponse};

const LOCAL_READ_CHUNK: usize = 4096;

/// Run `command` interactively, wiring `input` to the remote process and its
/// output to `stdout`/`stderr`. Returns the remote exit code when reported.
///
/// Eof goes out exactly once, after local input is exhausted and the agent
/// has reported `done` (or closed the stream). Once the agent is done, local
/// input counts as exhausted even if it is still open.
pub async fn run_interactive<I, O, E>(
    client: &Client,
    command: &str,
    input: I,
    stdout: O,
    stderr: E,
) -> Result<Option<i32>>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let (mut sender, mut receiver) = client.exec().await?.split();

    let mut first = command.as_bytes().to_vec();
    if !first.ends_with(b"\n") {
        first.push(b'\n');
    }
    sender.send_input(&first).await?;

    let remote_done = CancellationToken::new();
    let forward = tokio::spawn(forward_local_input(input, sender, remote_done.clone()));

    let received = receive_output(&mut receiver, stdout, stderr).await;
    remote_done.cancel();

    if let Err(e) = forward.await {
        tracing::warn!(error = %e, "Input forwarding task failed");
    }
    received
}

async fn receive_output<O, E>(
    receiver: &mut ExecReceiver,
    mut stdout: O,
    mut stderr: E,
) -> Result<Option<i32>>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    while let Some(frame) = receiver.recv().await? {
        if !frame.stdout.is_empty() {
            stdout.write_all(&frame.stdout).await?;
            stdout.flush().await?;
        }
        if !frame.stderr.is_empty() {
            stderr.write_all(&frame.stderr).await?;
            stderr.flush().await?;
        }
        if frame.done {
            tracing::debug!(exit_code = ?frame.exit_code, "Remote process done");
            return Ok(frame.exit_code);
        }
    }

    tracing::debug!("Agent closed the stream without a done frame");
    Ok(None)
}

async fn forward_local_input<I>(mut input: I, mut sender: ExecSender, remote_done: CancellationToken)
where
    I: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; LOCAL_READ_CHUNK];

    loop {
        let read = tokio::select! {
            biased;
            _ = remote_done.cancelled() => break,
            read = input.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!("Local input exhausted, waiting for remote completion");
                remote_done.cancelled().await;
                break;
            }
            Ok(n) => {
                if let Err(e) = sender.send_input(&buf[..n]).await {
                    tracing::debug!(error = %e, "Agent stopped accepting input");
                    remote_done.cancelled().await;
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read local input");
                remote_done.cancelled().await;
                break;
            }
        }
    }

    if let Err(e) = sender.send_eof().await {
        tracing::debug!(error = %e, "Eof not delivered, agent already closed the stream");
    }
    sender.close().await;
}

/// Start `request` headlessly, feed it `input` until end-of-file, then stop it.
///
/// Natural completion is not observed; Stop is safe after the process exits.
pub async fn run_headless<I>(client: &Client, request: StartRequest, mut input: I) -> Result<StopResponse>
where
    I: AsyncRead + Unpin,
{
    let started = client
        .start(&request.command, &request.workdir, request.env)
        .await?;
    let pid = started.pid;
    tracing::info!(pid, "Started remote process");

    let forwarded = forward_stdin(client, pid, &mut input).await;
    let stopped = client.stop(pid, None).await?;
    forwarded?;

    tracing::info!(pid, exit_code = stopped.exit_code, "Remote process stopped");
    Ok(stopped)
}

async fn forward_stdin<I>(client: &Client, pid: u32, input: &mut I) -> Result<()>
where
    I: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; LOCAL_READ_CHUNK];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        client.stdin(pid, &buf[..n]).await?;
    }
}
