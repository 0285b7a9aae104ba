//! Error taxonomy for the tunnel client.
//!
//! Nothing here crosses a session boundary back to the SOCKS5 client: every
//! variant is either fatal to startup (propagated out of `main`) or fatal to
//! one session (logged and absorbed by the relay loop).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can terminate the whole process before the accept loop starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind local address {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors produced while parsing CLI flags or a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("could not parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },

    #[error("no upstream servers configured")]
    NoServers,

    #[error("invalid server address {0}")]
    InvalidServerAddr(String),

    #[error("unsupported cipher method {0}")]
    UnsupportedCipher(String),
}

/// SOCKS5 handshake failures. Each carries the reply byte that should be
/// sent to the client (where one is defined) before the session closes.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported SOCKS5 command {cmd:#04x}")]
    UnsupportedCommand { cmd: u8, reply_code: u8 },

    #[error("unsupported SOCKS5 address type {atyp:#04x}")]
    UnsupportedAddressType { atyp: u8 },

    #[error("unexpected SOCKS5 version {0:#04x}")]
    BadVersion(u8),

    #[error("peer closed during handshake")]
    Eof,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// The SOCKS5 reply code to send before tearing the session down, if any
    /// reply is owed at all. An unsupported address type gets a bare close,
    /// same as a version mismatch or EOF — only an unsupported command is
    /// owed a reply.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            HandshakeError::UnsupportedCommand { reply_code, .. } => Some(*reply_code),
            HandshakeError::UnsupportedAddressType { .. }
            | HandshakeError::BadVersion(_)
            | HandshakeError::Eof
            | HandshakeError::Io(_) => None,
        }
    }
}

/// Stream cipher failures. Always session-fatal.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encrypt produced no output")]
    EncryptFailed,

    #[error("decrypt produced no output")]
    DecryptFailed,

    #[error("unknown cipher method {0}")]
    UnknownMethod(String),
}

/// Relay-loop failures: resolution, upstream I/O, cipher, and timeout.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("idle timeout after {0:?} of inactivity")]
    IdleTimeout(std::time::Duration),

    #[error("failed to resolve {0}")]
    ResolutionFailed(String),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
