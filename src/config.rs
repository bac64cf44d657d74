//! Agent and controller settings, read from TOML.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TetherError};

pub const DEFAULT_SOCKET_PATH: &str = "/var/tmp/tether.sock";

/// Every field has a default, so a config file only names what it changes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    // Transport
    pub socket_path: PathBuf,
    pub connect_timeout_ms: u64,
    pub max_frame_len: usize,

    // Process execution
    pub shell: String,
    pub stop_timeout_ms: u64,
    pub read_chunk_size: usize,

    // Terminal
    pub use_pty: bool,
    pub pty_rows: u16,
    pub pty_cols: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_timeout_ms: 10_000,
            max_frame_len: 16 * 1024 * 1024,
            shell: "/bin/sh".to_string(),
            stop_timeout_ms: 5_000,
            read_chunk_size: 4096,
            use_pty: true,
            pty_rows: 24,
            pty_cols: 80,
        }
    }
}

impl Config {
    /// Load from the first config file that exists, falling back to defaults.
    pub fn load() -> Self {
        for path in Self::candidate_paths() {
            if !path.exists() {
                continue;
            }
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::debug!(path = %path.display(), "Loaded config");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable config");
                }
            }
        }

        Config::default()
    }

    /// Load from an explicit path. Unlike [`Config::load`], failures are errors.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TetherError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| TetherError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn candidate_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("tether/config.toml")),
            dirs::home_dir().map(|p| p.join(".tether.toml")),
            Some(PathBuf::from("tether.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.read_chunk_size == 0 {
            return Err(TetherError::Config("read_chunk_size must be positive".into()));
        }
        if self.shell.trim().is_empty() {
            return Err(TetherError::Config("shell must not be empty".into()));
        }
        Ok(())
    }

    /// Bound on dialing the agent socket.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Default grace period before Stop kills a process.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            socket_path = "/tmp/custom.sock"
            stop_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/custom.sock"));
        assert_eq!(config.stop_timeout(), Duration::from_millis(250));
        assert_eq!(config.shell, "/bin/sh");
        assert_eq!(config.read_chunk_size, 4096);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let err = Config::parse("read_chunk_size = 0").unwrap_err();
        assert!(err.to_string().contains("read_chunk_size"));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(Config::parse("socket_path = [").is_err());
    }
}
