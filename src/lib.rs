//! Tether library - remote command execution over a local socket

pub mod client;
pub mod config;
pub mod error;
pub mod exec;
pub mod normalize;
pub mod process;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod transport;

// Re-export commonly used types
pub use client::{probe, Client, ExecReceiver, ExecSender, ExecStream};
pub use config::Config;
pub use error::{Result, TetherError};
pub use process::{ExecutionContext, ProcessRegistry};
pub use server::Agent;
pub use service::ExecutionService;
