//! Per-process execution state shared by the registry and Exec sessions.

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Reported when a process ended but its status could not be collected.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// A chunk of process output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// A spawned process and the channels its pump tasks expose.
///
/// Dropping the input sender closes the process's input. The output receiver
/// yields `None` once every output stream reached end-of-file. The exit watch
/// is fed by a reaper task that owns the OS child handle.
pub struct ExecutionContext {
    pid: u32,
    command: String,
    started_at: DateTime<Utc>,
    input: Option<mpsc::Sender<Vec<u8>>>,
    output: Option<mpsc::Receiver<OutputChunk>>,
    exit: watch::Receiver<Option<i32>>,
}

impl ExecutionContext {
    pub(crate) fn new(
        pid: u32,
        command: String,
        input: mpsc::Sender<Vec<u8>>,
        output: mpsc::Receiver<OutputChunk>,
        exit: watch::Receiver<Option<i32>>,
    ) -> Self {
        Self {
            pid,
            command,
            started_at: Utc::now(),
            input: Some(input),
            output: Some(output),
            exit,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// A handle for writing to the process's input, if it is still open.
    pub fn input(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.input.clone()
    }

    /// Take the input sender. Dropping it closes the process's input.
    pub fn take_input(&mut self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.input.take()
    }

    /// Take the output receiver; only one consumer drains it.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputChunk>> {
        self.output.take()
    }

    /// Request a graceful exit by closing the process's input.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Exit code once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Wait for the reaper to report the exit status.
    pub async fn wait(&mut self) -> i32 {
        let reported = self
            .exit
            .wait_for(|code| code.is_some())
            .await
            .map(|code| *code);
        match reported {
            Ok(code) => code.unwrap_or(UNKNOWN_EXIT_CODE),
            Err(_) => self.exit_code().unwrap_or(UNKNOWN_EXIT_CODE),
        }
    }

    /// Force-terminate the process group. No-op once the process was reaped,
    /// so a recycled pid is never signalled.
    pub fn kill(&self) {
        if self.has_exited() {
            return;
        }
        force_kill(self.pid);
    }

    /// Close input, wait up to `grace`, then force-terminate and reap.
    pub async fn terminate(&mut self, grace: Duration) -> i32 {
        self.close_input();

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(code) => code,
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Process ignored input close, killing"
                );
                self.kill();
                self.wait().await
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("started_at", &self.started_at)
            .field("input_open", &self.input.is_some())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

/// SIGKILL the process group led by `pid`, falling back to the single process.
pub fn force_kill(pid: u32) {
    let target = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(target, Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "killpg failed, signalling process directly");
        if let Err(e) = kill(target, Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "kill failed");
        }
    }
}

/// Map an OS exit status to a shell-style exit code.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(UNKNOWN_EXIT_CODE)
}

/// Same mapping for a raw wait status. `None` for states that are not a
/// termination (stopped, continued).
pub fn exit_code_of_wait(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[test]
    fn test_exit_code_of_signalled_process() {
        // Raw wait status: low 7 bits carry the terminating signal.
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[test]
    fn test_exit_code_of_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_code_of_wait(WaitStatus::Exited(pid, 4)), Some(4));
        assert_eq!(
            exit_code_of_wait(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(
            exit_code_of_wait(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            None
        );
    }

    #[tokio::test]
    async fn test_terminate_returns_reported_code() {
        let (input, mut input_rx) = mpsc::channel(1);
        let (_output_tx, output) = mpsc::channel(1);
        let (exit_tx, exit) = watch::channel(None);
        let mut ctx = ExecutionContext::new(1, "true".into(), input, output, exit);

        // Report exit as soon as input closes.
        tokio::spawn(async move {
            while input_rx.recv().await.is_some() {}
            let _ = exit_tx.send(Some(0));
        });

        assert_eq!(ctx.terminate(Duration::from_secs(1)).await, 0);
        assert!(ctx.has_exited());
        assert!(ctx.input().is_none());
    }
}
