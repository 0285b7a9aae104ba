//! Process-wide immutable configuration plus the one piece of runtime-mutable
//! state the relay engine needs: whether TCP Fast Open is still believed to
//! be supported. Discovering it is unsupported flips a single atomic flag
//! shared by every future session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::acl::AccessControl;
use crate::config::Config;

pub struct Context {
    config: Config,
    acl: AccessControl,
    fast_open_supported: AtomicBool,
}

/// Shared, reference-counted handle to the process-wide context. Cheap to
/// clone; every session task holds one.
pub type SharedContext = Arc<Context>;

impl Context {
    pub fn new(config: Config, acl: AccessControl) -> SharedContext {
        let fast_open_supported = config.fast_open;
        Arc::new(Context {
            config,
            acl,
            fast_open_supported: AtomicBool::new(fast_open_supported),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn acl(&self) -> &AccessControl {
        &self.acl
    }

    /// Whether a TFO first-send should still be attempted. Starts out equal
    /// to the configured flag and is permanently cleared process-wide the
    /// first time a session observes `ENOTCONN` from a TFO `sendto`.
    pub fn fast_open_enabled(&self) -> bool {
        self.fast_open_supported.load(Ordering::Relaxed)
    }

    /// Records that the kernel does not support TFO on this path. Idempotent
    /// and safe to call from multiple sessions racing the same discovery.
    pub fn disable_fast_open(&self) {
        self.fast_open_supported.store(false, Ordering::Relaxed);
    }
}
