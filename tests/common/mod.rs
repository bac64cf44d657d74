//! Shared harness: an agent on a throwaway socket.

#![allow(dead_code)]

use anyhow::Result;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tether::{Agent, Client, Config, ExecutionService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestAgent {
    pub dir: TempDir,
    pub socket: PathBuf,
    pub service: Arc<ExecutionService>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<tether::Result<()>>,
}

impl TestAgent {
    pub async fn client(&self) -> Result<Client> {
        Ok(Client::connect(&self.socket, TIMEOUT).await?)
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await??;
        Ok(())
    }
}

pub fn test_config(dir: &TempDir) -> Config {
    Config {
        socket_path: dir.path().join("agent.sock"),
        stop_timeout_ms: 2_000,
        ..Config::default()
    }
}

pub async fn spawn_agent() -> Result<TestAgent> {
    spawn_agent_with(|_| {}).await
}

pub async fn spawn_agent_with(configure: impl FnOnce(&mut Config)) -> Result<TestAgent> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    configure(&mut config);

    let agent = Agent::bind(config).await?;
    let socket = agent.socket_path().to_path_buf();
    let service = agent.service();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(agent.run(shutdown.clone()));

    Ok(TestAgent {
        dir,
        socket,
        service,
        shutdown,
        handle,
    })
}

pub fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Poll until `pid` no longer exists.
pub async fn wait_until_gone(pid: u32) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
