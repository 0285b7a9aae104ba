//! Host resolution.
//!
//! Resolves `(host, port)` pairs via the host resolver with address family
//! unspecified, taking the first result. Tokio's own `lookup_host` (backed
//! by the OS resolver on a blocking thread) is sufficient for the one
//! unconditional resolution this crate needs (see DESIGN.md).

use std::io;
use std::net::SocketAddr;

use tokio::net::lookup_host;

use crate::error::RelayError;

/// Resolves `host:port`, returning the first address the resolver offers.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, RelayError> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|_: io::Error| RelayError::ResolutionFailed(format!("{host}:{port}")))?;
    addrs
        .next()
        .ok_or_else(|| RelayError::ResolutionFailed(format!("{host}:{port}")))
}
