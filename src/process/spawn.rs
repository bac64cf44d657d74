//! Spawning shell processes behind an [`ExecutionContext`].
//!
//! Two backends exist. Piped processes get plain stdin/stdout/stderr pipes
//! and run in their own process group. Terminal-backed processes run on a
//! pseudo-terminal, where stdout and stderr arrive merged on one stream.

use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};

use super::context::{
    exit_code_of, exit_code_of_wait, ExecutionContext, OutputChunk, UNKNOWN_EXIT_CODE,
};
use crate::error::{Result, TetherError};

const INPUT_QUEUE: usize = 64;
const OUTPUT_QUEUE: usize = 64;

/// End-of-transmission; ends input on a terminal in canonical mode.
const EOT: u8 = 0x04;

/// What to run and how.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub shell: String,
    pub command: String,
    pub workdir: Option<PathBuf>,
    /// Overlaid on the inherited environment; supplied keys win.
    pub env: HashMap<String, String>,
    pub chunk_size: usize,
}

impl SpawnOptions {
    pub fn new(shell: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            command: command.into(),
            workdir: None,
            env: HashMap::new(),
            chunk_size: 4096,
        }
    }

    /// Empty strings mean "inherit the agent's working directory".
    pub fn workdir(mut self, dir: &str) -> Self {
        self.workdir = if dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(dir))
        };
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }
}

/// Spawn `<shell> -c <command>` with piped stdio in a new process group.
pub fn spawn_piped(opts: &SpawnOptions) -> Result<ExecutionContext> {
    let mut cmd = Command::new(&opts.shell);
    cmd.arg("-c")
        .arg(&opts.command)
        .envs(&opts.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    if let Some(dir) = &opts.workdir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| TetherError::Spawn(format!("{}: {e}", opts.command)))?;
    let pid = child
        .id()
        .ok_or_else(|| TetherError::Spawn("process exited before its pid was known".into()))?;

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
    if let Some(stdin) = child.stdin.take() {
        tokio::spawn(pump_input(stdin, input_rx));
    }

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_output(stdout, opts.chunk_size, output_tx.clone(), OutputChunk::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_output(stderr, opts.chunk_size, output_tx, OutputChunk::Stderr));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                tracing::warn!(pid, error = %e, "Failed to reap process");
                UNKNOWN_EXIT_CODE
            }
        };
        tracing::debug!(pid, exit_code = code, "Process exited");
        let _ = exit_tx.send(Some(code));
    });

    tracing::info!(pid, command = %opts.command, "Spawned piped process");
    Ok(ExecutionContext::new(
        pid,
        opts.command.clone(),
        input_tx,
        output_rx,
        exit_rx,
    ))
}

/// Spawn `<shell> -c <command>` on a fresh pseudo-terminal.
///
/// Closing the input ends it with the terminal's EOF character. The master
/// writer stays open until the process is reaped, since dropping it types a
/// newline into the terminal.
pub fn spawn_pty(opts: &SpawnOptions, rows: u16, cols: u16) -> Result<ExecutionContext> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| TetherError::Spawn(format!("openpty: {e}")))?;

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TetherError::Spawn(format!("pty reader: {e}")))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| TetherError::Spawn(format!("pty writer: {e}")))?;

    let mut cmd = CommandBuilder::new(&opts.shell);
    cmd.arg("-c");
    cmd.arg(&opts.command);
    cmd.cwd(resolve_workdir(opts.workdir.as_deref())?);
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| TetherError::Spawn(format!("{}: {e}", opts.command)))?;
    // The master only reads end-of-file once no slave descriptor is left open here.
    drop(pair.slave);

    let Some(pid) = child.process_id() else {
        // No child outlives a failed spawn.
        let _ = child.kill();
        let _ = child.wait();
        return Err(TetherError::Spawn("terminal process has no pid".into()));
    };
    let master = pair.master;

    let parked: Arc<Mutex<Option<Box<dyn Write + Send>>>> = Arc::new(Mutex::new(None));
    let parked_for_reaper = Arc::clone(&parked);

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
    tokio::task::spawn_blocking(move || {
        let mut at_line_start = true;
        while let Some(bytes) = input_rx.blocking_recv() {
            if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
                return;
            }
            if let Some(last) = bytes.last() {
                at_line_start = *last == b'\n';
            }
        }
        // A partial line takes one EOF to flush and a second to read as end-of-file.
        let eof: &[u8] = if at_line_start { &[EOT] } else { &[EOT, EOT] };
        let _ = writer.write_all(eof).and_then(|_| writer.flush());
        *parked.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);
    });

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
    let chunk_size = opts.chunk_size;
    tokio::task::spawn_blocking(move || {
        // Keep the master open until the terminal drains.
        let _master = master;
        let mut buf = vec![0u8; chunk_size];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx
                        .blocking_send(OutputChunk::Stdout(buf[..n].to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once the last slave descriptor closes.
                Err(_) => break,
            }
        }
    });

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::task::spawn_blocking(move || {
        // Reaped by pid so a signal death keeps its number.
        let code = reap(pid);
        drop(child);
        parked_for_reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!(pid, exit_code = code, "Terminal process exited");
        let _ = exit_tx.send(Some(code));
    });

    tracing::info!(pid, command = %opts.command, rows, cols, "Spawned terminal process");
    Ok(ExecutionContext::new(
        pid,
        opts.command.clone(),
        input_tx,
        output_rx,
        exit_rx,
    ))
}

/// Block until `pid` exits and return its shell-style exit code.
fn reap(pid: u32) -> i32 {
    loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(status) => {
                if let Some(code) = exit_code_of_wait(status) {
                    return code;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(pid, error = %e, "Failed to reap terminal process");
                return UNKNOWN_EXIT_CODE;
            }
        }
    }
}

/// Terminal-backed when possible, piped when no terminal device is available.
pub fn spawn_interactive(
    opts: &SpawnOptions,
    use_pty: bool,
    rows: u16,
    cols: u16,
) -> Result<ExecutionContext> {
    if use_pty {
        match spawn_pty(opts, rows, cols) {
            Ok(ctx) => return Ok(ctx),
            Err(e) => {
                tracing::warn!(error = %e, "Terminal unavailable, falling back to pipes");
            }
        }
    }
    spawn_piped(opts)
}

fn resolve_workdir(workdir: Option<&Path>) -> Result<PathBuf> {
    match workdir {
        Some(dir) => Ok(dir.to_path_buf()),
        None => Ok(std::env::current_dir()?),
    }
}

async fn pump_input(mut stdin: ChildStdin, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = input.recv().await {
        if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
    // Dropping stdin closes the pipe.
}

async fn drain_output<R>(
    mut reader: R,
    chunk_size: usize,
    output: mpsc::Sender<OutputChunk>,
    wrap: fn(Vec<u8>) -> OutputChunk,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if output.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}
