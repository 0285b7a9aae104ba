//! Relay: the SOCKS5 front end, the shadowsocks-framed back end, and the
//! collaborators (upstream selection, host resolution, the session
//! registry) the core engine in `tcprelay::local` is built from.

pub mod dns_resolver;
pub mod loadbalancing;
pub mod registry;
pub mod socks5;
pub mod tcprelay;
