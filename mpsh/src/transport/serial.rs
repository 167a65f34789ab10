//! Serial port link.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mpsh_proto::CTRL_C;
use serialport::SerialPort;

use super::{Endpoint, Transport, closed_error, poll_result};
use crate::{Error, Result};

/// Read poll interval.
const POLL: Duration = Duration::from_millis(20);
/// Interval between checks while waiting for the port to appear.
const WAIT_STEP: Duration = Duration::from_millis(500);
/// Backoff between attempts to wake the prompt.
const WAKE_BACKOFF: Duration = Duration::from_millis(500);
/// Wake attempts stop after this long when no abort flag is given.
const WAKE_LIMIT: Duration = Duration::from_secs(10);

/// How to open a serial port.
#[derive(Debug, Clone)]
pub struct SerialOptions {
    /// Line speed.
    pub baud: u32,
    /// How long to wait for the port to appear and open.
    pub wait: Duration,
    /// Set by the caller to give up waiting.
    pub abort: Option<Arc<AtomicBool>>,
}

impl SerialOptions {
    /// Options for `baud` with no waiting.
    pub fn new(baud: u32) -> Self {
        Self {
            baud,
            wait: Duration::ZERO,
            abort: None,
        }
    }

    /// Waits up to `wait` for the port.
    #[must_use]
    pub const fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Stops waiting as soon as `flag` is set.
    #[must_use]
    pub fn abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.as_ref().is_some_and(|f| f.load(Ordering::SeqCst)) {
            return Err(Error::Transport("Interrupted".into()));
        }
        Ok(())
    }
}

/// A board on a serial port.
pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
    endpoint: Endpoint,
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink")
            .field("endpoint", &self.endpoint)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialLink {
    /// Opens `path` and wakes the prompt with a Ctrl-C.
    ///
    /// With a non-zero wait, polls for the port to appear and open, giving
    /// up with a not-found error once the wait is exhausted or with
    /// `Interrupted` once the abort flag is set.
    pub fn open(path: &str, opts: &SerialOptions) -> Result<Self> {
        let deadline = Instant::now() + opts.wait;

        if !opts.wait.is_zero() && !Path::new(path).exists() {
            tracing::info!(port = path, wait = ?opts.wait, "waiting for serial port to exist");
            while !Path::new(path).exists() {
                opts.check_abort()?;
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::Transport(format!("serial port {path} not found")));
                }
                tracing::info!(port = path, left = left.as_secs(), "still waiting");
                thread::sleep(WAIT_STEP.min(left));
            }
        }

        let mut port = loop {
            match serialport::new(path, opts.baud).timeout(POLL).open() {
                Ok(port) => break port,
                Err(e) if Instant::now() < deadline => {
                    tracing::debug!(port = path, "open failed, retrying: {e}");
                    opts.check_abort()?;
                    thread::sleep(WAIT_STEP);
                }
                Err(e) => return Err(Error::Transport(format!("{path}: {e}"))),
            }
        };

        // Ctrl-C kills a half-typed line; a newline would run it.
        let wake_deadline = Instant::now() + opts.wait.max(WAKE_LIMIT);
        let mut announced = false;
        while let Err(e) = port.write_all(&[CTRL_C]) {
            if !announced {
                tracing::info!(port = path, "waiting for link to be connected");
                announced = true;
            }
            opts.check_abort()?;
            if opts.abort.is_none() && Instant::now() >= wake_deadline {
                return Err(Error::Transport(format!("{path}: {e}")));
            }
            thread::sleep(WAKE_BACKOFF);
        }

        Ok(Self {
            port: Some(port),
            endpoint: Endpoint::Serial {
                path: path.to_owned(),
                baud: opts.baud,
            },
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(closed_error)
    }
}

impl Transport for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        poll_result(self.port()?.read(buf))
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.port()?.write(data)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let port = self.port.as_ref().ok_or_else(closed_error)?.try_clone()?;
        Ok(Box::new(Self {
            port: Some(port),
            endpoint: self.endpoint.clone(),
        }))
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
