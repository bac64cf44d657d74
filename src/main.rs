use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tether::protocol::{StartRequest, VersionResponse};
use tether::{probe, session, Agent, Client, Config};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Run commands on a worker host over a local socket", long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Config file (TOML); the standard search path is used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent socket path, overriding the config file
    #[arg(long, short, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the agent until SIGINT or SIGTERM
    Agent,

    /// Run a command interactively, forwarding local stdin
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Start a command headlessly, forward stdin, stop it at end of input
    Run {
        /// Working directory on the worker
        #[arg(long, default_value = "")]
        workdir: String,

        /// Environment override, KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Stop a headless process
    Stop {
        pid: u32,

        /// Grace period before the process is killed
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Check that the agent is reachable
    Status,

    /// Pump stdio to the agent socket, dropping carriage returns
    Relay,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // stdout carries process output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load(),
    };
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(match args.command {
        Commands::Agent => "info",
        _ => "warn",
    });
    let config = load_config(&args)?;

    let code = match args.command {
        Commands::Agent => run_agent(config).await?,
        Commands::Exec { command } => {
            let client = connect(&config).await?;
            let exit_code = session::run_interactive(
                &client,
                &command.join(" "),
                tokio::io::stdin(),
                tokio::io::stdout(),
                tokio::io::stderr(),
            )
            .await
            .context("Interactive session failed")?;
            exit_code.unwrap_or(1)
        }
        Commands::Run {
            workdir,
            env,
            command,
        } => {
            let client = connect(&config).await?;
            let request = StartRequest {
                command: command.join(" "),
                workdir,
                env: env.into_iter().collect::<HashMap<_, _>>(),
            };
            let stopped = session::run_headless(&client, request, tokio::io::stdin())
                .await
                .context("Headless run failed")?;
            stopped.exit_code
        }
        Commands::Stop { pid, timeout_ms } => {
            let client = connect(&config).await?;
            let stopped = client
                .stop(pid, timeout_ms.map(Duration::from_millis))
                .await
                .context("Stop failed")?;
            println!("{}", stopped.exit_code);
            0
        }
        Commands::Status => report_status(&config).await?,
        Commands::Relay => {
            let stream = tether::transport::dial(&config.socket_path, config.connect_timeout())
                .await
                .context("Failed to reach agent")?;
            tether::relay::relay(tokio::io::stdin(), tokio::io::stdout(), stream)
                .await
                .context("Relay failed")?;
            0
        }
    };

    // Exit directly: a pending stdin read would otherwise hold the runtime open.
    std::process::exit(code)
}

async fn connect(config: &Config) -> Result<Client> {
    Client::from_config(config)
        .await
        .with_context(|| format!("Failed to connect to agent at {}", config.socket_path.display()))
}

async fn run_agent(config: Config) -> Result<i32> {
    let shutdown = tether::shutdown::install_shutdown_handler()
        .context("Failed to install signal handlers")?;

    tracing::info!(socket = %config.socket_path.display(), shell = %config.shell, "Agent starting");
    let agent = Agent::bind(config)
        .await
        .context("Failed to bind agent socket")?;
    agent.run(shutdown).await.context("Agent failed")?;
    Ok(0)
}

async fn report_status(config: &Config) -> Result<i32> {
    let status = probe(&config.socket_path, config.connect_timeout())
        .await
        .with_context(|| format!("Agent at {} is not reachable", config.socket_path.display()))?;

    println!("running:    {}", status.running);
    println!("version:    {}", status.version);
    println!("started at: {}", status.started_at.to_rfc3339());
    println!("processes:  {}", status.processes);

    let client = connect(config).await?;
    let remote = client.version().await.context("Version exchange failed")?;
    if remote.needs_upgrade(&VersionResponse::current()) {
        eprintln!(
            "warning: agent runs {} (protocol {}), controller is {} (protocol {})",
            remote.version,
            remote.protocol,
            env!("CARGO_PKG_VERSION"),
            tether::protocol::PROTOCOL_VERSION
        );
    }

    Ok(if status.running { 0 } else { 1 })
}
