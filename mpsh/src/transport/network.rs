//! Telnet link to a networked board.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use mpsh_proto::control::{TELNET_LOGIN, TELNET_PASSWORD, TELNET_WELCOME};

use super::{Endpoint, Transport, closed_error, poll_result};
use crate::{Error, Result};

/// Default telnet port.
pub const TELNET_PORT: u16 = 23;

const POLL: Duration = Duration::from_millis(20);

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// Credentials and timeouts for a telnet login.
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Login name.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Bound on TCP connect.
    pub connect_timeout: Duration,
    /// Bound on each login prompt.
    pub login_timeout: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            user: "micro".into(),
            password: "python".into(),
            connect_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(5),
        }
    }
}

/// Strips telnet negotiation from the byte stream and refuses every option.
#[derive(Debug, Default)]
struct TelnetFilter {
    state: FilterState,
}

#[derive(Debug, Default, Clone, Copy)]
enum FilterState {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

impl TelnetFilter {
    /// Copies data bytes of `raw` into `out`; negotiation replies go to `reply`.
    fn feed(&mut self, raw: &[u8], out: &mut [u8], reply: &mut Vec<u8>) -> usize {
        let mut n = 0;
        for &b in raw {
            self.state = match (self.state, b) {
                (FilterState::Data, IAC) => FilterState::Iac,
                (FilterState::Data, _) => {
                    out[n] = b;
                    n += 1;
                    FilterState::Data
                }
                (FilterState::Iac, IAC) => {
                    out[n] = IAC;
                    n += 1;
                    FilterState::Data
                }
                (FilterState::Iac, DO | DONT | WILL | WONT) => FilterState::Option(b),
                (FilterState::Iac, SB) => FilterState::Sub,
                (FilterState::Iac, _) => FilterState::Data,
                (FilterState::Option(cmd), opt) => {
                    match cmd {
                        DO => reply.extend_from_slice(&[IAC, WONT, opt]),
                        WILL => reply.extend_from_slice(&[IAC, DONT, opt]),
                        _ => {}
                    }
                    FilterState::Data
                }
                (FilterState::Sub, IAC) => FilterState::SubIac,
                (FilterState::Sub, _) => FilterState::Sub,
                (FilterState::SubIac, SE) => FilterState::Data,
                (FilterState::SubIac, _) => FilterState::Sub,
            };
        }
        n
    }
}

/// Doubles every IAC byte of outgoing data.
fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

/// A board reached over telnet.
#[derive(Debug)]
pub struct NetworkLink {
    stream: Option<TcpStream>,
    filter: TelnetFilter,
    endpoint: Endpoint,
}

impl NetworkLink {
    /// Resolves `host` (optionally `host:port`), connects and logs in.
    pub fn open(host: &str, opts: &NetworkOptions) -> Result<Self> {
        let addr = resolve(host)?;
        tracing::debug!(host, %addr, "connecting");
        let stream = TcpStream::connect_timeout(&addr, opts.connect_timeout)
            .map_err(|e| Error::Transport(format!("no response from {host}: {e}")))?;
        stream.set_read_timeout(Some(POLL))?;
        stream.set_nodelay(true)?;

        let mut link = Self {
            stream: Some(stream),
            filter: TelnetFilter::default(),
            endpoint: Endpoint::Network {
                host: host.to_owned(),
                addr,
            },
        };
        link.login(opts)?;
        Ok(link)
    }

    fn login(&mut self, opts: &NetworkOptions) -> Result<()> {
        let failed =
            || Error::Transport("failed to establish a telnet connection with the board".into());
        if !self.expect(TELNET_LOGIN, opts.login_timeout)? {
            return Err(failed());
        }
        self.send_line(&opts.user)?;
        if !self.expect(TELNET_PASSWORD, opts.login_timeout)? {
            return Err(failed());
        }
        std::thread::sleep(Duration::from_millis(200));
        self.send_line(&opts.password)?;
        if !self.expect(TELNET_WELCOME, opts.login_timeout)? {
            return Err(Error::Transport("telnet login rejected".into()));
        }
        tracing::debug!("telnet login succeeded");
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.extend_from_slice(b"\r\n");
        let escaped = escape(&data);
        self.stream()?.write_all(&escaped)
    }

    /// Reads until `marker` shows up or `timeout` passes.
    fn expect(&mut self, marker: &[u8], timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            let n = self.read(&mut buf)?;
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(marker.len()).any(|w| w == marker) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(closed_error)
    }
}

fn resolve(host: &str) -> Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let found = match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_socket_addrs(),
        _ => (host, TELNET_PORT).to_socket_addrs(),
    };
    found
        .map_err(|e| Error::Transport(format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| Error::Transport(format!("cannot resolve {host}")))
}

impl Transport for NetworkLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut raw = vec![0u8; buf.len()];
        let n = match self.stream()?.read(&mut raw) {
            Ok(0) if !raw.is_empty() => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ));
            }
            res => poll_result(res)?,
        };
        let mut reply = Vec::new();
        let out = self.filter.feed(&raw[..n], buf, &mut reply);
        if !reply.is_empty() {
            self.stream()?.write_all(&reply)?;
        }
        Ok(out)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let escaped = escape(data);
        self.stream()?.write_all(&escaped)?;
        Ok(data.len())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let stream = self.stream.as_ref().ok_or_else(closed_error)?.try_clone()?;
        Ok(Box::new(Self {
            stream: Some(stream),
            filter: TelnetFilter::default(),
            endpoint: self.endpoint.clone(),
        }))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
