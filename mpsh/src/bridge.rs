//! Interactive pass-through to the board's friendly REPL.
//!
//! A worker thread copies board output to the local output while the
//! calling thread relays keystrokes. The quit key sets a shared flag and
//! writes a filler byte so a board that only answers when spoken to still
//! wakes the worker.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mpsh_proto::CTRL_X;

use crate::Result;
use crate::device::Device;
use crate::transport::Transport;

/// Key that leaves the bridge.
pub const QUIT_KEY: u8 = CTRL_X;

/// Board silence after which an unattended session ends.
const IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between polls of a local input with nothing to read.
const INPUT_POLL: Duration = Duration::from_millis(10);

/// Why a bridge session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The quit key was pressed.
    Quit,
    /// The initial line asked to leave and the board went quiet.
    Idle,
    /// The link failed; the device is closed.
    Disconnected,
}

/// How the worker stopped.
enum Pumped {
    Cancelled,
    Idle,
    Failed,
}

/// One pass-through session on a device.
#[derive(Debug)]
pub struct Bridge<'a> {
    device: &'a Device,
    initial: Option<String>,
    idle_timeout: Duration,
}

impl<'a> Bridge<'a> {
    /// A session on `device`.
    pub const fn new(device: &'a Device) -> Self {
        Self {
            device,
            initial: None,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    /// Sends `line` once the prompt is awake.
    ///
    /// `~` separates statements. A trailing `~` ends the session as soon
    /// as the board stops printing, without reading local input.
    #[must_use]
    pub fn initial_line(mut self, line: &str) -> Self {
        self.initial = Some(line.trim().to_owned()).filter(|l| !l.is_empty());
        self
    }

    /// How long the board must stay silent to end an unattended session.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Runs the session until the quit key, an idle unattended session or a
    /// link failure.
    ///
    /// `input` is polled: a read returning no bytes means no key is pending.
    pub fn run<R, W>(self, mut input: R, output: W) -> Result<BridgeExit>
    where
        R: Read,
        W: Write + Send,
    {
        let (line, unattended) = match self.initial.as_deref() {
            Some(line) => match line.strip_suffix('~') {
                Some(rest) => (Some(rest.split('~').collect::<Vec<_>>().join(";")), true),
                None => (Some(line.split('~').collect::<Vec<_>>().join(";")), false),
            },
            None => (None, false),
        };
        let (reader, pending) = self.device.reader()?;
        tracing::debug!(board = self.device.name(), unattended, "bridge started");

        let cancel = AtomicBool::new(false);
        let done = AtomicBool::new(false);
        let idle = self.idle_timeout;

        let (relayed, pumped) = thread::scope(|s| {
            let (cancel, done) = (&cancel, &done);
            let worker = s.spawn(move || {
                let pumped = pump(reader, &pending, output, cancel, unattended.then_some(idle));
                done.store(true, Ordering::SeqCst);
                pumped
            });
            let relayed = self.relay(&mut input, line.as_deref(), unattended, cancel, done);
            if relayed.is_err() {
                cancel.store(true, Ordering::SeqCst);
            }
            let pumped = worker
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (relayed, pumped)
        });

        match (relayed, pumped) {
            (_, Pumped::Failed) => {
                self.device.close();
                Ok(BridgeExit::Disconnected)
            }
            (Err(e), _) if e.is_disconnect() => Ok(BridgeExit::Disconnected),
            (Err(e), _) => Err(e),
            (Ok(()), Pumped::Idle) => Ok(BridgeExit::Idle),
            (Ok(()), Pumped::Cancelled) => Ok(BridgeExit::Quit),
        }
    }

    /// Wakes the prompt, sends the initial line and relays keystrokes until
    /// the worker stops.
    fn relay(
        &self,
        input: &mut impl Read,
        line: Option<&str>,
        unattended: bool,
        cancel: &AtomicBool,
        done: &AtomicBool,
    ) -> Result<()> {
        self.device.write_raw(b"\r")?;
        if let Some(line) = line {
            self.device.write_raw(line.as_bytes())?;
            self.device.write_raw(b"\r")?;
        }
        if unattended {
            return Ok(());
        }

        let mut buf = [0u8; 64];
        while !done.load(Ordering::SeqCst) {
            let n = match input.read(&mut buf) {
                Ok(0) => {
                    thread::sleep(INPUT_POLL);
                    continue;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let mut out = Vec::with_capacity(n);
            for &key in &buf[..n] {
                match key {
                    QUIT_KEY => {
                        cancel.store(true, Ordering::SeqCst);
                        out.push(b' ');
                        break;
                    }
                    b'\n' => out.push(b'\r'),
                    other => out.push(other),
                }
            }
            self.device.write_raw(&out)?;
        }
        Ok(())
    }
}

/// Copies board output to `out` until cancelled, idle for `idle` (when
/// given) or the link fails.
fn pump(
    mut reader: Box<dyn Transport>,
    pending: &[u8],
    mut out: impl Write,
    cancel: &AtomicBool,
    idle: Option<Duration>,
) -> Pumped {
    let mut emit = |data: &[u8]| out.write_all(data).and_then(|()| out.flush());
    if emit(pending).is_err() {
        return Pumped::Cancelled;
    }
    let mut buf = [0u8; 256];
    let mut last = Instant::now();
    while !cancel.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => {
                if idle.is_some_and(|idle| last.elapsed() >= idle) {
                    return Pumped::Idle;
                }
            }
            Ok(n) => {
                last = Instant::now();
                if emit(&buf[..n]).is_err() {
                    return Pumped::Cancelled;
                }
            }
            Err(e) => {
                tracing::debug!("bridge reader stopped: {e}");
                return Pumped::Failed;
            }
        }
    }
    Pumped::Cancelled
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::testing::{BoardState, open_fake};

    /// Output shared with the test.
    #[derive(Debug, Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    /// Yields its keys after a delay, then reports nothing pending forever.
    struct Keys {
        keys: Vec<u8>,
        at: Instant,
    }

    impl Keys {
        fn after(delay: Duration, keys: &[u8]) -> Self {
            Self {
                keys: keys.to_vec(),
                at: Instant::now() + delay,
            }
        }
    }

    impl Read for Keys {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if Instant::now() < self.at || self.keys.is_empty() {
                return Ok(0);
            }
            let n = buf.len().min(self.keys.len());
            buf[..n].copy_from_slice(&self.keys[..n]);
            self.keys.drain(..n);
            Ok(n)
        }
    }

    #[test]
    fn quit_key_ends_the_session() {
        let (dev, board) = open_fake(BoardState::default());
        let sink = Sink::default();
        let keys = Keys::after(Duration::from_millis(200), b"1+1\n\x18ignored");
        let exit = Bridge::new(&dev).run(keys, sink.clone()).unwrap();
        assert_eq!(exit, BridgeExit::Quit);
        assert!(dev.is_open());
        assert!(sink.text().contains(">>> "), "{:?}", sink.text());

        // The quit key is replaced by a filler byte and nothing after it is sent.
        let deadline = Instant::now() + Duration::from_secs(1);
        while !board.state.lock().typed.ends_with(b"1+1\r ") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let typed = board.state.lock().typed.clone();
        assert!(typed.ends_with(b"1+1\r "), "{:?}", String::from_utf8_lossy(&typed));
    }

    #[test]
    fn unattended_line_leaves_when_idle() {
        let (dev, _board) = open_fake(BoardState::default());
        let sink = Sink::default();
        let exit = Bridge::new(&dev)
            .initial_line("import os ~ os.listdir() ~")
            .idle_timeout(Duration::from_millis(200))
            .run(io::empty(), sink.clone())
            .unwrap();
        assert_eq!(exit, BridgeExit::Idle);
        // The fake board echoes in its friendly mode.
        assert!(sink.text().contains("import os ; os.listdir() "), "{:?}", sink.text());
    }

    #[test]
    fn lost_link_disconnects() {
        let (dev, _board) = open_fake(BoardState::default());
        let exit = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(200));
                dev.close();
            });
            Bridge::new(&dev).run(io::empty(), io::sink()).unwrap()
        });
        assert_eq!(exit, BridgeExit::Disconnected);
        assert!(!dev.is_open());
    }

    #[test]
    fn closed_device_cannot_bridge() {
        let (dev, _board) = open_fake(BoardState::default());
        dev.close();
        assert!(Bridge::new(&dev).run(io::empty(), io::sink()).is_err());
    }
}
