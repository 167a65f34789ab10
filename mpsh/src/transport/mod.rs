//! Byte links to a board: serial ports and telnet sessions.

use std::fmt;
use std::io;
use std::net::SocketAddr;

mod network;
mod serial;

pub use network::{NetworkLink, NetworkOptions};
pub use serial::{SerialLink, SerialOptions};

/// Where a board is attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Endpoint {
    /// A serial port.
    Serial {
        /// Device path, e.g. `/dev/ttyACM0`.
        path: String,
        /// Line speed.
        baud: u32,
    },
    /// A telnet session.
    Network {
        /// Host name as given by the user.
        host: String,
        /// Resolved socket address.
        addr: SocketAddr,
    },
}

impl Endpoint {
    /// Returns `true` if `id` names this endpoint: the serial path, or the
    /// host name or IP address of a network board.
    pub fn matches(&self, id: &str) -> bool {
        match self {
            Self::Serial { path, .. } => path == id,
            Self::Network { host, addr } => host == id || addr.ip().to_string() == id,
        }
    }

    /// Returns `true` if both endpoints reach the same physical link.
    pub fn same_link(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Serial { path: a, .. }, Self::Serial { path: b, .. }) => a == b,
            (Self::Network { addr: a, .. }, Self::Network { addr: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { path, .. } => f.write_str(path),
            Self::Network { host, .. } => write!(f, "telnet://{host}"),
        }
    }
}

/// Raw byte I/O with a board.
///
/// Reads wait at most a short poll interval and return `Ok(0)` when
/// nothing arrived; deadlines are enforced by the caller.
pub trait Transport: Send + fmt::Debug {
    /// Reads whatever is available, up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes some of `data`, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Opens a second handle on the same link, for a concurrent reader.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;

    /// Releases the link. Later reads and writes fail.
    fn close(&mut self);

    /// Returns `true` until [`close`](Self::close) is called.
    fn is_open(&self) -> bool;

    /// Identity of the link.
    fn endpoint(&self) -> &Endpoint;
}

/// Error returned by reads and writes on a closed transport.
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "link closed")
}

/// Maps a poll timeout to an empty read.
pub(crate) fn poll_result(res: io::Result<usize>) -> io::Result<usize> {
    match res {
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(0),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_identity() {
        let serial = Endpoint::Serial {
            path: "/dev/ttyACM0".into(),
            baud: 115_200,
        };
        let other_baud = Endpoint::Serial {
            path: "/dev/ttyACM0".into(),
            baud: 9600,
        };
        let net = Endpoint::Network {
            host: "board.local".into(),
            addr: "192.168.1.5:23".parse().unwrap(),
        };
        assert!(serial.matches("/dev/ttyACM0"));
        assert!(serial.same_link(&other_baud));
        assert!(net.matches("board.local"));
        assert!(net.matches("192.168.1.5"));
        assert!(!net.same_link(&serial));
        assert_eq!(net.to_string(), "telnet://board.local");
    }

    #[test]
    fn timeouts_read_as_empty() {
        let e = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(poll_result(Err(e)).unwrap(), 0);
        let e = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(poll_result(Err(e)).is_err());
    }
}
