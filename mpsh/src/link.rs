//! Buffered reads with deadlines on top of a [`Transport`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::transport::{Endpoint, Transport, closed_error};

const READ_CHUNK: usize = 256;

/// A transport plus the bytes read past the last match.
///
/// Timeouts are inactivity bounds: the deadline moves forward whenever data
/// arrives. They surface as [`io::ErrorKind::TimedOut`], which transports
/// never produce themselves.
///
/// Setting the shutdown flag from another thread fails the next read or
/// write with [`io::ErrorKind::NotConnected`], which ends a pending wait
/// within one transport poll.
#[derive(Debug)]
pub(crate) struct Link {
    transport: Box<dyn Transport>,
    pending: Vec<u8>,
    shutdown: Arc<AtomicBool>,
}

impl Link {
    pub(crate) fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that shuts the link down when set.
    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        Ok(())
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        self.transport.endpoint()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Reads once from the transport into the pending buffer.
    fn fill(&mut self) -> io::Result<usize> {
        self.check_open()?;
        let mut buf = [0u8; READ_CHUNK];
        let n = self.transport.read(&mut buf)?;
        self.pending.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Returns everything up to and including `ending`.
    pub(crate) fn read_until(&mut self, ending: &[u8], timeout: Duration) -> io::Result<Vec<u8>> {
        let mut deadline = Instant::now() + timeout;
        let mut searched = 0;
        loop {
            if let Some(pos) = find(&self.pending[searched..], ending) {
                let end = searched + pos + ending.len();
                let rest = self.pending.split_off(end);
                return Ok(std::mem::replace(&mut self.pending, rest));
            }
            searched = self.pending.len().saturating_sub(ending.len().saturating_sub(1));
            if Instant::now() >= deadline {
                return Err(timed_out(ending));
            }
            if self.fill()? > 0 {
                deadline = Instant::now() + timeout;
            }
        }
    }

    /// Returns exactly `n` bytes.
    pub(crate) fn read_exact(&mut self, n: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let mut deadline = Instant::now() + timeout;
        while self.pending.len() < n {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("got {} of {n} bytes", self.pending.len()),
                ));
            }
            if self.fill()? > 0 {
                deadline = Instant::now() + timeout;
            }
        }
        let rest = self.pending.split_off(n);
        Ok(std::mem::replace(&mut self.pending, rest))
    }

    pub(crate) fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        self.check_open()?;
        while !data.is_empty() {
            match self.transport.write(data)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => data = &data[n..],
            }
        }
        Ok(())
    }

    /// Discards pending bytes and everything the board has already sent.
    pub(crate) fn drain(&mut self) -> io::Result<()> {
        self.pending.clear();
        while self.fill()? > 0 {
            self.pending.clear();
        }
        self.pending.clear();
        Ok(())
    }

    /// Hands out bytes read but not yet consumed.
    pub(crate) fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pending.clear();
        self.transport.close();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn timed_out(ending: &[u8]) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("timed out waiting for {:?}", String::from_utf8_lossy(ending)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pipe_pair;

    #[test]
    fn read_until_keeps_the_rest() {
        let (host, mut board) = pipe_pair();
        let mut link = Link::new(Box::new(host));
        board.send(b"abc>def");
        assert_eq!(link.read_until(b">", Duration::from_secs(1)).unwrap(), b"abc>");
        assert_eq!(link.read_exact(3, Duration::from_secs(1)).unwrap(), b"def");
    }

    #[test]
    fn marker_split_across_reads() {
        let (host, mut board) = pipe_pair();
        let mut link = Link::new(Box::new(host));
        let sender = std::thread::spawn(move || {
            board.send(b"xx\r\n");
            std::thread::sleep(Duration::from_millis(50));
            board.send(b"OK!");
            board
        });
        let got = link.read_until(b"\nOK", Duration::from_secs(1)).unwrap();
        assert_eq!(got, b"xx\r\nOK");
        let _board = sender.join().unwrap();
    }

    #[test]
    fn timeout_is_reported() {
        let (host, _board) = pipe_pair();
        let mut link = Link::new(Box::new(host));
        let err = link.read_until(b">", Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        let err = link.read_exact(2, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn drain_discards_everything() {
        let (host, mut board) = pipe_pair();
        let mut link = Link::new(Box::new(host));
        board.send(b"junk");
        link.drain().unwrap();
        board.send(b"fresh");
        assert_eq!(link.read_exact(5, Duration::from_secs(1)).unwrap(), b"fresh");
    }

    #[test]
    fn shutdown_ends_a_pending_read() {
        let (host, _board) = pipe_pair();
        let mut link = Link::new(Box::new(host));
        let flag = link.shutdown_flag();
        let started = Instant::now();
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(100));
                flag.store(true, Ordering::SeqCst);
            });
            let err = link.read_until(b">", Duration::from_secs(5)).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        });
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(link.write_all(b"x").is_err());
    }
}
