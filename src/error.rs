use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Remote error ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("Process {0} is already registered")]
    DuplicatePid(u32),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TetherError>;
