//! Headless operations: Start, Stop, Stdin, Status, Version.

mod common;

use anyhow::Result;
use common::{is_alive, spawn_agent, spawn_agent_with, test_config, wait_until_gone, TIMEOUT};
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;
use tether::protocol::{
    ErrorCode, Request, Response, StartRequest, StdinRequest, StopRequest, VersionResponse,
};
use tether::{ExecutionService, TetherError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

fn start_request(command: &str) -> StartRequest {
    StartRequest {
        command: command.to_string(),
        ..Default::default()
    }
}

fn stop_request(pid: u32, timeout_ms: Option<u64>) -> StopRequest {
    StopRequest { pid, timeout_ms }
}

#[tokio::test]
async fn test_start_then_stop_twice() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    let started = service.start(start_request("echo hi")).await?;
    assert!(started.pid > 0);
    assert!(service.registry().contains(started.pid));
    assert_eq!(service.registry().len(), 1);

    let first = service.stop(stop_request(started.pid, None)).await;
    assert_eq!(first.exit_code, 0);
    assert!(service.registry().is_empty());

    let second = service.stop(stop_request(started.pid, None)).await;
    assert_eq!(second.exit_code, 0, "repeated stop returns the default response");
    assert!(service.registry().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_stop_unknown_pid_is_not_an_error() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    let resp = service.stop(stop_request(u32::MAX - 1, None)).await;
    assert_eq!(resp.exit_code, 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_starts_are_independent() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    let (a, b) = tokio::join!(
        service.start(start_request("sleep 30")),
        service.start(start_request("sleep 31")),
    );
    let (a, b) = (a?.pid, b?.pid);
    assert_ne!(a, b);
    assert_eq!(service.registry().pids().len(), 2);

    // sleep ignores closed stdin, so the short grace period ends in SIGKILL.
    let stopped = service.stop(stop_request(a, Some(100))).await;
    assert_eq!(stopped.exit_code, 128 + 9);
    assert!(wait_until_gone(a).await);

    assert!(service.registry().contains(b), "other process stays registered");
    assert!(is_alive(b), "other process keeps running");

    service.stop(stop_request(b, Some(100))).await;
    assert!(service.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stop_reports_exit_code() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    let started = service.start(start_request("exit 7")).await?;
    let stopped = service.stop(stop_request(started.pid, None)).await;
    assert_eq!(stopped.exit_code, 7);
    Ok(())
}

#[tokio::test]
async fn test_start_applies_workdir_and_env() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    let mut env = HashMap::new();
    env.insert("TETHER_TEST_VAR".to_string(), "hello_world".to_string());
    let started = service
        .start(StartRequest {
            command: r#"printf %s "$TETHER_TEST_VAR" > env.txt"#.to_string(),
            workdir: dir.path().to_string_lossy().into_owned(),
            env,
        })
        .await?;

    let stopped = service.stop(stop_request(started.pid, None)).await;
    assert_eq!(stopped.exit_code, 0);

    let written = std::fs::read_to_string(dir.path().join("env.txt"))?;
    assert_eq!(written, "hello_world");
    Ok(())
}

#[tokio::test]
async fn test_start_with_missing_workdir_fails() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    let result = service
        .start(StartRequest {
            command: "true".to_string(),
            workdir: dir.path().join("missing").to_string_lossy().into_owned(),
            env: HashMap::new(),
        })
        .await;

    assert!(matches!(result, Err(TetherError::Spawn(_))));
    assert!(service.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stdin_reaches_process_without_cr() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    let started = service
        .start(StartRequest {
            command: "cat > in.txt".to_string(),
            workdir: dir.path().to_string_lossy().into_owned(),
            env: HashMap::new(),
        })
        .await?;

    service.stdin(StdinRequest {
        pid: started.pid,
        content: b"line one\r\n".to_vec(),
    });
    service.stdin(StdinRequest {
        pid: started.pid,
        content: b"line two\r\n".to_vec(),
    });

    // Closing input lets cat finish on its own.
    let stopped = service.stop(stop_request(started.pid, None)).await;
    assert_eq!(stopped.exit_code, 0);

    let written = std::fs::read_to_string(dir.path().join("in.txt"))?;
    assert_eq!(written, "line one\nline two\n");
    Ok(())
}

#[tokio::test]
async fn test_stdin_never_blocks_on_a_process_that_does_not_read() -> Result<()> {
    let agent = spawn_agent().await?;
    let client = agent.client().await?;

    let pid = client.start("sleep 30", "", HashMap::new()).await?.pid;

    // Far more than the pipe plus the input queue can hold.
    let chunk = vec![b'x'; 4096];
    let feed = async {
        for _ in 0..100 {
            client.stdin(pid, &chunk).await?;
        }
        Ok::<_, TetherError>(())
    };
    tokio::time::timeout(TIMEOUT, feed).await??;

    // The shared connection is still free for Stop.
    let stopped = tokio::time::timeout(
        TIMEOUT,
        client.stop(pid, Some(Duration::from_millis(100))),
    )
    .await??;
    assert_eq!(stopped.exit_code, 128 + 9);
    assert!(wait_until_gone(pid).await);

    agent.stop().await
}

#[tokio::test]
async fn test_run_headless_with_large_input_to_idle_process() -> Result<()> {
    let agent = spawn_agent_with(|config| config.stop_timeout_ms = 100).await?;
    let client = agent.client().await?;

    let request = StartRequest {
        command: "sleep 30".to_string(),
        ..Default::default()
    };
    let input = std::io::Cursor::new(vec![b'y'; 400 * 1024]);
    let stopped = tokio::time::timeout(
        TIMEOUT,
        tether::session::run_headless(&client, request, input),
    )
    .await??;

    assert_eq!(stopped.exit_code, 128 + 9);
    agent.stop().await
}

#[tokio::test]
async fn test_abandoned_call_does_not_leak_its_response() -> Result<()> {
    let agent = spawn_agent().await?;
    let client = agent.client().await?;

    let pid = client.start("sleep 30", "", HashMap::new()).await?.pid;

    // Give up on a slow Stop; its response arrives after the caller left.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        client.stop(pid, Some(Duration::from_secs(1))),
    )
    .await;
    assert!(abandoned.is_err());

    // The next call must see its own answer, not the late Stop response.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = client.status().await?;
    assert!(status.running);
    assert_eq!(status.processes, 0);

    agent.stop().await
}

#[tokio::test]
async fn test_stdin_for_unknown_pid_is_dropped() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    let resp = service
        .handle(Request::Stdin(StdinRequest {
            pid: u32::MAX - 1,
            content: b"ignored".to_vec(),
        }))
        .await;
    assert_eq!(resp, Response::StdinAck);
    Ok(())
}

#[tokio::test]
async fn test_exec_is_rejected_as_unary_request() -> Result<()> {
    let dir = TempDir::new()?;
    let service = ExecutionService::new(test_config(&dir));

    match service.handle(Request::Exec).await {
        Response::Error(err) => assert_eq!(err.code, ErrorCode::InvalidRequest),
        other => panic!("unexpected response: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_status_and_version_over_socket() -> Result<()> {
    let agent = spawn_agent().await?;

    let status = tokio::time::timeout(TIMEOUT, tether::probe(&agent.socket, TIMEOUT)).await??;
    assert!(status.running);
    assert_eq!(status.processes, 0);
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));

    let client = agent.client().await?;
    let version = client.version().await?;
    assert_eq!(version, VersionResponse::current());
    assert!(!version.needs_upgrade(&VersionResponse::current()));

    agent.stop().await
}

#[tokio::test]
async fn test_headless_lifecycle_over_socket() -> Result<()> {
    let agent = spawn_agent().await?;
    let client = agent.client().await?;

    let started = client.start("echo hi", "", HashMap::new()).await?;
    assert!(started.pid > 0);
    assert_eq!(client.status().await?.processes, 1);

    assert_eq!(client.stop(started.pid, None).await?.exit_code, 0);
    assert_eq!(client.stop(started.pid, None).await?.exit_code, 0);
    assert_eq!(client.status().await?.processes, 0);

    agent.stop().await
}

#[tokio::test]
async fn test_spawn_failure_surfaces_as_remote_error() -> Result<()> {
    let agent = spawn_agent().await?;
    let client = agent.client().await?;

    let missing = agent.dir.path().join("does-not-exist");
    let result = client
        .start("true", &missing.to_string_lossy(), HashMap::new())
        .await;

    match result {
        Err(TetherError::Remote { code, .. }) => assert_eq!(code, "spawn_failed"),
        other => panic!("expected remote error, got {other:?}"),
    }

    // The connection stays usable after an RPC error.
    assert!(client.status().await?.running);
    agent.stop().await
}

#[tokio::test]
async fn test_malformed_line_keeps_connection_open() -> Result<()> {
    let agent = spawn_agent().await?;

    let stream = UnixStream::connect(&agent.socket).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"this is not json\n").await?;
    let line = lines.next_line().await?.expect("error response");
    match serde_json::from_str::<Response>(&line)? {
        Response::Error(err) => assert_eq!(err.code, ErrorCode::InvalidRequest),
        other => panic!("unexpected response: {other:?}"),
    }

    write_half.write_all(b"{\"type\":\"status\"}\n").await?;
    let line = lines.next_line().await?.expect("status response");
    assert!(matches!(
        serde_json::from_str::<Response>(&line)?,
        Response::Status(_)
    ));

    agent.stop().await
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() -> Result<()> {
    let agent = spawn_agent_with(|config| config.max_frame_len = 1024).await?;

    let stream = UnixStream::connect(&agent.socket).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut frame = format!("{{\"type\":\"start\",\"command\":\"{}\"}}", "z".repeat(2048));
    frame.push('\n');
    write_half.write_all(frame.as_bytes()).await?;

    let line = lines.next_line().await?.expect("error response");
    match serde_json::from_str::<Response>(&line)? {
        Response::Error(err) => assert_eq!(err.code, ErrorCode::Protocol),
        other => panic!("unexpected response: {other:?}"),
    }
    // End of stream, or a reset if the agent closed with our bytes unread.
    assert!(
        !matches!(lines.next_line().await, Ok(Some(_))),
        "agent closes the connection"
    );

    // Other clients are unaffected.
    assert!(agent.client().await?.status().await?.running);
    agent.stop().await
}

#[tokio::test]
async fn test_shutdown_kills_registered_processes() -> Result<()> {
    let agent = spawn_agent().await?;
    let client = agent.client().await?;

    let pid = client.start("sleep 30", "", HashMap::new()).await?.pid;
    assert!(is_alive(pid));

    let socket = agent.socket.clone();
    let service = agent.service.clone();
    drop(client);
    agent.stop().await?;

    assert!(wait_until_gone(pid).await, "process should be killed on shutdown");
    assert!(service.registry().is_empty());
    assert!(!socket.exists(), "socket file removed on shutdown");

    // Nothing listens any more.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(tether::Client::connect(&socket, TIMEOUT).await.is_err());
    Ok(())
}
