//! Process registry - tracks headless processes by pid

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::context::ExecutionContext;
use crate::error::{Result, TetherError};

/// In-memory pid → [`ExecutionContext`] map behind a single lock.
///
/// The lock is never held across an `.await` or any I/O; callers take what
/// they need out of a context and release the lock before acting on it.
#[derive(Default)]
pub struct ProcessRegistry {
    processes: Mutex<HashMap<u32, ExecutionContext>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, ExecutionContext>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly spawned process. A pid can only be present once.
    pub fn register(&self, ctx: ExecutionContext) -> Result<()> {
        let pid = ctx.pid();
        let mut processes = self.lock();
        if processes.contains_key(&pid) {
            return Err(TetherError::DuplicatePid(pid));
        }
        processes.insert(pid, ctx);
        tracing::debug!(pid, total = processes.len(), "Registered process");
        Ok(())
    }

    /// Run `f` against the context for `pid`, if registered.
    pub fn lookup<R>(&self, pid: u32, f: impl FnOnce(&ExecutionContext) -> R) -> Option<R> {
        self.lock().get(&pid).map(f)
    }

    /// Remove and return the context for `pid`. A miss is not an error.
    pub fn remove(&self, pid: u32) -> Option<ExecutionContext> {
        let removed = self.lock().remove(&pid);
        if removed.is_some() {
            tracing::debug!(pid, "Unregistered process");
        }
        removed
    }

    /// Whether `pid` is currently registered.
    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains_key(&pid)
    }

    /// Number of registered processes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered pids in ascending order.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Empty the registry, handing every context to the caller.
    pub fn drain(&self) -> Vec<ExecutionContext> {
        self.lock().drain().map(|(_, ctx)| ctx).collect()
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("pids", &self.pids())
            .finish()
    }
}
