//! SOCKS5 wire types: the greeting/request parsing and the shadowsocks
//! address header encoding, both built on `AsyncRead`/`AsyncWrite` so the
//! handshake state machine in `tcprelay::local` can simply `.await` each
//! stage instead of hand-rolling partial-read bookkeeping. A request is
//! buffered until it is fully read rather than parsed off a single `recv`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_METHOD_NONE: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// The synthesized, constant SOCKS5 CONNECT success reply. It never
/// discloses the real upstream bind address.
pub const SUCCESS_REPLY: [u8; 10] = [SOCKS5_VERSION, REPLY_SUCCEEDED, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// A destination address as carried on the wire: either a literal socket
/// address or a domain name plus port to be resolved later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(s) => write!(f, "{s}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl Address {
    /// The textual host, as consulted against the access-list collaborator.
    pub fn host(&self) -> String {
        match self {
            Address::Socket(s) => s.ip().to_string(),
            Address::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(s) => s.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Encodes the shadowsocks address header: `atyp || addr || port`.
    pub fn write_header(&self, out: &mut Vec<u8>) {
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Domain(host, port) => {
                out.push(ATYP_DOMAIN);
                out.push(host.len() as u8);
                out.extend_from_slice(host.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }
}

/// Reads and discards the SOCKS5 greeting (`VER | NMETHODS | METHODS`),
/// replying with unconditional no-auth.
pub async fn read_greeting<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.map_err(map_eof)?;
    let (ver, nmethods) = (header[0], header[1]);
    if ver != SOCKS5_VERSION {
        return Err(HandshakeError::BadVersion(ver));
    }

    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await.map_err(map_eof)?;
    Ok(())
}

pub async fn write_greeting_reply<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await?;
    Ok(())
}

/// A parsed SOCKS5 request: `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`.
#[derive(Debug)]
pub struct Request {
    pub cmd: u8,
    pub address: Address,
}

/// Reads one SOCKS5 request, buffering across short reads until the whole
/// (possibly variable-length) message is available.
pub async fn read_request<S>(stream: &mut S) -> Result<Request, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut fixed = [0u8; 4];
    stream.read_exact(&mut fixed).await.map_err(map_eof)?;
    let (ver, cmd, _rsv, atyp) = (fixed[0], fixed[1], fixed[2], fixed[3]);

    if ver != SOCKS5_VERSION {
        return Err(HandshakeError::BadVersion(ver));
    }

    let address = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await.map_err(map_eof)?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Address::Socket(SocketAddr::new(IpAddr::V4(ip), port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await.map_err(map_eof)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Address::Socket(SocketAddr::new(IpAddr::V6(ip), port))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await.map_err(map_eof)?;
            let len = len_buf[0] as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await.map_err(map_eof)?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await.map_err(map_eof)?;
            let port = u16::from_be_bytes(port_buf);
            let host = String::from_utf8_lossy(&name).into_owned();
            Address::Domain(host, port)
        }
        other => {
            return Err(HandshakeError::UnsupportedAddressType { atyp: other });
        }
    };

    // Command acceptance depends on whether UDP associate is enabled at
    // startup, which this parser has no visibility into; the caller
    // validates `cmd` against that policy.
    Ok(Request { cmd, address })
}

/// Writes a SOCKS5 reply carrying `bind_addr` (used for UDP_ASSOCIATE, which
/// discloses the real bound address, unlike the synthesized CONNECT success
/// reply).
pub async fn write_reply_with_addr<S>(stream: &mut S, rep: u8, bind_addr: SocketAddr) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(10);
    out.push(SOCKS5_VERSION);
    out.push(rep);
    out.push(0x00);
    Address::Socket(bind_addr).write_header(&mut out);
    stream.write_all(&out).await?;
    Ok(())
}

/// Writes a short error reply with no address/port at all:
/// `{ver=5, rep=..., rsv=0, atyp=1}`, four bytes total. This is what an
/// unsupported command actually gets on the wire, not the 10-byte reply
/// `write_reply_with_addr` produces for a real bind address.
pub async fn write_error_reply<S>(stream: &mut S, rep: u8) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS5_VERSION, rep, 0x00, ATYP_IPV4]).await?;
    Ok(())
}

fn map_eof(err: std::io::Error) -> HandshakeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        HandshakeError::Eof
    } else {
        HandshakeError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn greeting_reply_is_exactly_05_00() {
        let mut out = Vec::new();
        write_greeting_reply(&mut out).await.unwrap();
        assert_eq!(out, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn reads_ipv4_connect_request() {
        let mut input: &[u8] = &[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        let req = read_request(&mut input).await.unwrap();
        assert_eq!(req.cmd, CMD_CONNECT);
        assert_eq!(req.address, Address::Socket("127.0.0.1:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn reads_domain_request_with_max_length_name() {
        let name = "a".repeat(255);
        let mut input = vec![0x05, 0x01, 0x00, 0x03, 255];
        input.extend_from_slice(name.as_bytes());
        input.extend_from_slice(&80u16.to_be_bytes());
        let mut input: &[u8] = &input;
        let req = read_request(&mut input).await.unwrap();
        assert_eq!(req.address, Address::Domain(name, 80));
    }

    #[tokio::test]
    async fn bind_command_is_parsed_but_left_for_the_caller_to_reject() {
        let mut input: &[u8] = &[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        let req = read_request(&mut input).await.unwrap();
        assert_eq!(req.cmd, CMD_BIND);
    }

    #[tokio::test]
    async fn unknown_address_type_is_fatal_with_no_reply_owed() {
        let mut input: &[u8] = &[0x05, 0x01, 0x00, 0x7f, 0, 0];
        let err = read_request(&mut input).await.unwrap_err();
        assert_eq!(err.reply_code(), None);
    }

    #[tokio::test]
    async fn unsupported_command_reply_is_exactly_four_bytes() {
        let mut out = Vec::new();
        write_error_reply(&mut out, REPLY_COMMAND_NOT_SUPPORTED).await.unwrap();
        assert_eq!(out, vec![0x05, REPLY_COMMAND_NOT_SUPPORTED, 0x00, ATYP_IPV4]);
    }

    #[test]
    fn address_header_encodes_domain_with_length_prefix() {
        let addr = Address::Domain("example.com".to_owned(), 443);
        let mut out = Vec::new();
        addr.write_header(&mut out);
        assert_eq!(out[0], ATYP_DOMAIN);
        assert_eq!(out[1], 11);
        assert_eq!(&out[2..13], b"example.com");
        assert_eq!(&out[13..15], &443u16.to_be_bytes());
    }

    #[test]
    fn success_reply_matches_the_synthesized_constant() {
        assert_eq!(SUCCESS_REPLY, [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }
}
