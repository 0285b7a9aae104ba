//! TCP relay: the per-session engine (`local`) and its TCP-Fast-Open helper.

pub mod fastopen;
pub mod local;

/// Scratch buffer size used for each direction's single in-flight read.
pub const BUFFER_SIZE: usize = 2048;
