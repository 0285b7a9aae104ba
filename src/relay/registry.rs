//! Process-wide connection registry, used only for the shutdown sweep: a
//! post-loop pass walks the registry, tearing down every live session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;

#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, AbortHandle>>,
}

/// RAII guard returned by [`Registry::insert`]; removes the session from
/// the registry exactly once, on drop, regardless of why the session's task
/// is ending. Owns its `Arc<Registry>` so it can be held across a spawned,
/// `'static` task.
pub struct RegistryGuard {
    registry: Arc<Registry>,
    id: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a session's abort handle and returns a guard that removes
    /// it again when dropped.
    pub fn insert(self: &Arc<Self>, handle: AbortHandle) -> RegistryGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().unwrap().insert(id, handle);
        RegistryGuard {
            registry: self.clone(),
            id,
        }
    }

    fn remove(&self, id: u64) {
        self.sessions.lock().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts every live session. Called once, after the accept loop has
    /// broken out on `SIGINT`/`SIGTERM`.
    pub fn sweep(&self) {
        let sessions = self.sessions.lock().unwrap();
        for handle in sessions.values() {
            handle.abort();
        }
    }
}
