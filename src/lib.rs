//! Client-side half of an encrypted TCP tunnel: a SOCKS5 front end that
//! authenticates nothing, accepts `CONNECT` (and optionally `UDP_ASSOCIATE`)
//! requests, and relays the payload to an upstream server using a
//! shadowsocks-style framed, enciphered byte stream.

pub mod acl;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod monitor;
pub mod relay;

pub use context::{Context, SharedContext};
pub use error::StartupError;

/// Runs the SOCKS5 listener to completion: accepts sessions until a shutdown
/// signal arrives, then sweeps every live session before returning.
pub async fn run(ctx: SharedContext) -> Result<(), StartupError> {
    relay::tcprelay::local::run(ctx).await
}
