//! TCP Fast Open first send.
//!
//! Only Linux's `MSG_FASTOPEN` `sendto` path is implemented; every other
//! target reports the feature unsupported so the caller falls back to an
//! ordinary connect, exactly as if the kernel had returned `ENOTCONN`.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Outcome of one TFO first-send attempt.
pub enum FastOpenOutcome {
    /// The connect is in progress (`EINPROGRESS`); no bytes are confirmed
    /// sent yet. Caller proceeds exactly as the non-TFO path would, waiting
    /// on write-readiness.
    InProgress(TcpStream),
    /// `n` of `data.len()` bytes were sent and the socket is already
    /// connected (a full send) or partially connected with a residual to
    /// retry (`n < data.len()`).
    Sent { stream: TcpStream, n: usize },
    /// The kernel does not support TFO on this path (`ENOTCONN`); the
    /// caller disables the feature process-wide and falls back to an
    /// ordinary connect for this and all future sessions.
    Unsupported,
}

#[cfg(target_os = "linux")]
pub fn connect(addr: SocketAddr, data: &[u8]) -> io::Result<FastOpenOutcome> {
    linux::connect_fast_open(addr, data)
}

#[cfg(not(target_os = "linux"))]
pub fn connect(_addr: SocketAddr, _data: &[u8]) -> io::Result<FastOpenOutcome> {
    Ok(FastOpenOutcome::Unsupported)
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd};

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    const MSG_FASTOPEN: libc::c_int = 0x2000_0000;

    pub fn connect_fast_open(addr: SocketAddr, data: &[u8]) -> io::Result<FastOpenOutcome> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        let dest = SockAddr::from(addr);
        let ret = unsafe {
            libc::sendto(
                socket.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                MSG_FASTOPEN,
                dest.as_ptr(),
                dest.len(),
            )
        };

        if ret >= 0 {
            let n = ret as usize;
            let stream = into_tokio_stream(socket)?;
            return Ok(FastOpenOutcome::Sent { stream, n });
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) => {
                let stream = into_tokio_stream(socket)?;
                Ok(FastOpenOutcome::InProgress(stream))
            }
            Some(libc::ENOTCONN) => Ok(FastOpenOutcome::Unsupported),
            _ => Err(err),
        }
    }

    fn into_tokio_stream(socket: Socket) -> io::Result<TcpStream> {
        let std_stream: std::net::TcpStream = unsafe {
            let fd = socket.as_raw_fd();
            mem::forget(socket);
            std::net::TcpStream::from_raw_fd(fd)
        };
        std_stream.set_nonblocking(true)?;
        TcpStream::from_std(std_stream)
    }
}
