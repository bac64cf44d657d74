//! Agent side of an interactive Exec stream.
//!
//! The first inbound frame carries the command. After that, inbound frames are
//! forwarded to the process's input on their own task while this task drains
//! process output into response frames. Once output ends, the exit code is
//! sent on a final `done` frame and the write side is closed.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::normalize::{strip_cr, strip_cr_in_place};
use crate::process::{spawn_interactive, ExecutionContext, OutputChunk, SpawnOptions};
use crate::protocol::{
    error_response, ErrorCode, ExecRequestFrame, ExecResponseFrame, FrameReader, FrameWriter,
    Response,
};
use crate::service::ExecutionService;

/// How a session's output phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainOutcome {
    /// Output reached end-of-file.
    Finished,
    /// Connection lost, bad frame, or agent shutdown.
    Aborted,
}

/// Serve one Exec stream to completion.
///
/// Cancelling `cancel` aborts the session and kills its process.
pub async fn run_session<R, W>(
    service: &ExecutionService,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let span = tracing::info_span!("exec", session = %Uuid::new_v4());
    serve(service, reader, writer, cancel).instrument(span).await
}

async fn serve<R, W>(
    service: &ExecutionService,
    mut reader: FrameReader<R>,
    mut writer: FrameWriter<W>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        frame = reader.next::<ExecRequestFrame>() => frame,
    };

    let command = match first {
        Ok(Some(ExecRequestFrame::Input(bytes))) => {
            String::from_utf8_lossy(&strip_cr(&bytes)).into_owned()
        }
        Ok(Some(ExecRequestFrame::Eof)) => {
            tracing::debug!("Eof before any command, nothing to run");
            let _ = writer.send(&Response::Exec(ExecResponseFrame::done(None))).await;
            let _ = writer.shutdown().await;
            return;
        }
        Ok(None) => {
            tracing::debug!("Client closed before sending a command");
            return;
        }
        Err(e) => {
            let _ = writer
                .send(&error_response(ErrorCode::Protocol, e.to_string()))
                .await;
            return;
        }
    };

    let config = service.config();
    let opts = SpawnOptions::new(&config.shell, command).chunk_size(config.read_chunk_size);
    let mut ctx = match spawn_interactive(&opts, config.use_pty, config.pty_rows, config.pty_cols) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!(error = %e, "Exec spawn failed");
            let _ = writer
                .send(&error_response(ErrorCode::SpawnFailed, e.to_string()))
                .await;
            return;
        }
    };
    tracing::info!(pid = ctx.pid(), command = %ctx.command(), "Exec session running");

    let session = cancel.child_token();
    let forward = tokio::spawn(
        forward_input(reader, ctx.take_input(), session.clone()).in_current_span(),
    );

    let outcome = match ctx.take_output() {
        Some(output) => drain_output(output, &mut writer, &session).await,
        None => DrainOutcome::Finished,
    };

    match outcome {
        DrainOutcome::Finished => finish(&mut ctx, &mut writer, &session).await,
        DrainOutcome::Aborted => {
            ctx.kill();
            let exit_code = ctx.wait().await;
            tracing::info!(pid = ctx.pid(), exit_code, "Exec session aborted");
        }
    }

    session.cancel();
    if let Err(e) = forward.await {
        tracing::warn!(error = %e, "Input forwarding task failed");
    }
}

/// Wait for exit and report it on the `done` frame.
async fn finish<W: AsyncWrite + Unpin>(
    ctx: &mut ExecutionContext,
    writer: &mut FrameWriter<W>,
    session: &CancellationToken,
) {
    let exit_code = tokio::select! {
        biased;
        code = ctx.wait() => code,
        _ = session.cancelled() => {
            ctx.kill();
            let code = ctx.wait().await;
            tracing::info!(pid = ctx.pid(), exit_code = code, "Exec session aborted after output closed");
            return;
        }
    };

    tracing::info!(pid = ctx.pid(), exit_code, "Exec session finished");
    if let Err(e) = writer
        .send(&Response::Exec(ExecResponseFrame::done(Some(exit_code))))
        .await
    {
        tracing::debug!(error = %e, "Client gone before done frame");
        return;
    }
    let _ = writer.shutdown().await;
}

async fn drain_output<W: AsyncWrite + Unpin>(
    mut output: mpsc::Receiver<OutputChunk>,
    writer: &mut FrameWriter<W>,
    session: &CancellationToken,
) -> DrainOutcome {
    loop {
        let chunk = tokio::select! {
            _ = session.cancelled() => return DrainOutcome::Aborted,
            chunk = output.recv() => chunk,
        };

        let frame = match chunk {
            None => return DrainOutcome::Finished,
            Some(OutputChunk::Stdout(mut bytes)) => {
                strip_cr_in_place(&mut bytes);
                ExecResponseFrame::stdout(bytes)
            }
            Some(OutputChunk::Stderr(mut bytes)) => {
                strip_cr_in_place(&mut bytes);
                ExecResponseFrame::stderr(bytes)
            }
        };
        if frame.stdout.is_empty() && frame.stderr.is_empty() {
            continue;
        }

        if let Err(e) = writer.send(&Response::Exec(frame)).await {
            tracing::info!(error = %e, "Client gone while streaming output");
            return DrainOutcome::Aborted;
        }
    }
}

/// Forward inbound frames to the process until Eof, disconnect, or cancellation.
///
/// A disconnect or bad frame before Eof cancels `session`, which kills the process.
async fn forward_input<R>(
    mut reader: FrameReader<R>,
    mut input: Option<mpsc::Sender<Vec<u8>>>,
    session: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut eof_received = false;

    loop {
        let frame = tokio::select! {
            _ = session.cancelled() => return,
            frame = reader.next::<ExecRequestFrame>() => frame,
        };

        match frame {
            Ok(Some(ExecRequestFrame::Input(mut bytes))) => {
                let Some(tx) = input.as_ref() else {
                    tracing::debug!(bytes = bytes.len(), "Input after process input closed, ignoring");
                    continue;
                };
                strip_cr_in_place(&mut bytes);
                if bytes.is_empty() {
                    continue;
                }
                if tx.send(bytes).await.is_err() {
                    tracing::debug!("Process stopped reading input");
                    input = None;
                }
            }
            Ok(Some(ExecRequestFrame::Eof)) => {
                eof_received = true;
                if input.take().is_some() {
                    tracing::debug!("Eof received, closing process input");
                }
            }
            Ok(None) => {
                if !eof_received {
                    tracing::info!("Client disconnected without Eof, aborting session");
                    session.cancel();
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bad frame on exec stream, aborting session");
                session.cancel();
                return;
            }
        }
    }
}
