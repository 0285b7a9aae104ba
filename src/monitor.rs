//! Signal handling: `SIGINT`/`SIGTERM` break the accept loop; `SIGPIPE`
//! needs no handling since the Rust runtime installs `SIG_IGN` for it before
//! `main` runs; `SIGABRT` is left untouched.

use std::io;

/// Resolves once `SIGINT` or `SIGTERM` is received (on Unix), or once
/// Ctrl-C is received (elsewhere, where `SIGTERM` has no meaning).
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
