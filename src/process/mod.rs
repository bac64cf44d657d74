//! Process management for commands run on behalf of the controller

pub mod context;
pub mod registry;
pub mod spawn;

pub use context::{force_kill, ExecutionContext, OutputChunk, UNKNOWN_EXIT_CODE};
pub use registry::ProcessRegistry;
pub use spawn::{spawn_interactive, spawn_piped, spawn_pty, SpawnOptions};
