//! Configuration surface: CLI flags merged with an optional TOML file into
//! one immutable [`Config`], applied once at startup. CLI flags take
//! precedence over the file, field by field.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::crypto::CipherKind;
use crate::error::ConfigError;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// One upstream relay's address, as a `(host, port)` pair. The host is kept
/// as text rather than eagerly resolved, since resolution happens per
/// session against the host resolver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl ServerAddr {
    /// Parses `host:port`, or `host` paired with `default_port` when no port
    /// is present.
    pub fn parse(text: &str, default_port: Option<u16>) -> Result<ServerAddr, ConfigError> {
        if let Some((host, port)) = text.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Ok(ServerAddr {
                    host: host.to_owned(),
                    port,
                });
            }
        }

        match default_port {
            Some(port) => Ok(ServerAddr {
                host: text.to_owned(),
                port,
            }),
            None => Err(ConfigError::InvalidServerAddr(text.to_owned())),
        }
    }
}

/// One upstream relay and the secret used to talk to it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub addr: ServerAddr,
    pub password: String,
    #[serde(deserialize_with = "deserialize_cipher")]
    pub method: CipherKind,
}

fn deserialize_cipher<'de, D>(d: D) -> Result<CipherKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use std::str::FromStr;
    let s = String::deserialize(d)?;
    CipherKind::from_str(&s).map_err(serde::de::Error::custom)
}

/// The on-disk config file shape. CLI flags override these field-by-field in
/// [`Config::merge_cli`].
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    local_address: Option<IpAddr>,
    local_port: Option<u16>,
    server: Option<Vec<FileServer>>,
    timeout: Option<u64>,
    fast_open: Option<bool>,
    enable_udp: Option<bool>,
    acl: Option<PathBuf>,
    outbound_interface: Option<String>,
    pid_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    address: String,
    port: Option<u16>,
    password: String,
    method: String,
}

/// Command-line flags, mirroring the original `sslocal` binary's flag names.
#[derive(Debug, Parser)]
#[command(name = "sslocal", about = "SOCKS5 front end for an encrypted TCP tunnel")]
pub struct Cli {
    /// Local address to bind the SOCKS5 listener to.
    #[arg(short = 'b', long = "local-addr")]
    pub local_addr: Option<SocketAddr>,

    /// Upstream relay address, e.g. `example.com:8388`.
    #[arg(short = 's', long = "server-addr")]
    pub server_addr: Option<String>,

    /// Shared secret for the upstream relay.
    #[arg(short = 'k', long = "password")]
    pub password: Option<String>,

    /// Stream cipher method.
    #[arg(short = 'm', long = "encrypt-method")]
    pub encrypt_method: Option<String>,

    /// Path to a TOML configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Idle timeout, in seconds.
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Enable TCP Fast Open for the upstream connection.
    #[arg(long = "fast-open")]
    pub fast_open: bool,

    /// Accept SOCKS5 UDP_ASSOCIATE requests (replies with the bound address
    /// and closes the TCP session; no UDP datagram forwarding is provided).
    #[arg(short = 'u', long = "enable-udp")]
    pub enable_udp: bool,

    /// Path to an access-control list file (bypass/direct routing).
    #[arg(long = "acl")]
    pub acl: Option<PathBuf>,

    /// Outbound network interface name for upstream connections.
    #[arg(long = "outbound-interface")]
    pub outbound_interface: Option<String>,

    /// Write the process PID to this file once the listener is bound.
    #[arg(long = "pid-file")]
    pub pid_file: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// The fully merged, immutable startup configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub local_addr: SocketAddr,
    pub servers: Vec<ServerConfig>,
    pub timeout: Duration,
    pub fast_open: bool,
    pub enable_udp: bool,
    pub acl_path: Option<PathBuf>,
    pub outbound_interface: Option<String>,
    pub pid_file: Option<PathBuf>,
    pub verbose: u8,
}

impl Config {
    /// Builds a [`Config`] from parsed CLI flags, optionally merging in a
    /// TOML file named by `--config`. CLI flags take precedence field by
    /// field over the file, and the file's server list is replaced wholesale
    /// if `--server-addr` is also given on the command line.
    pub fn from_cli(cli: Cli) -> Result<Config, ConfigError> {
        let file = match &cli.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };

        let local_addr = cli.local_addr.unwrap_or_else(|| {
            SocketAddr::new(
                file.local_address.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
                file.local_port.unwrap_or(1080),
            )
        });

        let mut servers = Vec::new();
        if let Some(file_servers) = file.server {
            for fs in file_servers {
                let addr = ServerAddr::parse(&fs.address, fs.port)?;
                let method = fs
                    .method
                    .parse()
                    .map_err(|_| ConfigError::UnsupportedCipher(fs.method.clone()))?;
                servers.push(ServerConfig {
                    addr,
                    password: fs.password,
                    method,
                });
            }
        }

        if let (Some(addr), Some(password), Some(method)) =
            (cli.server_addr.as_deref(), cli.password.as_deref(), cli.encrypt_method.as_deref())
        {
            let addr = ServerAddr::parse(addr, None)?;
            let method = method
                .parse()
                .map_err(|_| ConfigError::UnsupportedCipher(method.to_owned()))?;
            servers = vec![ServerConfig {
                addr,
                password: password.to_owned(),
                method,
            }];
        }

        if servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        Ok(Config {
            local_addr,
            servers,
            timeout: Duration::from_secs(cli.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS)),
            fast_open: cli.fast_open || file.fast_open.unwrap_or(false),
            enable_udp: cli.enable_udp || file.enable_udp.unwrap_or(false),
            acl_path: cli.acl.or(file.acl),
            outbound_interface: cli.outbound_interface.or(file.outbound_interface),
            pid_file: cli.pid_file.or(file.pid_file),
            verbose: cli.verbose,
        })
    }
}

fn load_file(path: &std::path::Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
