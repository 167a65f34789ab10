//! Raw REPL exchange.
//!
//! One exchange walks `Idle → EnteringMode → Transmitting → AwaitingResult
//! → ExitingMode → Idle`. Errors are classified by the phase they happen
//! in: a silent board while awaiting the result is a [`Error::Timeout`],
//! a silent board anywhere else is a [`Error::Protocol`] error, and any
//! link failure is an [`Error::Transport`] error. The caller closes the
//! device for the first and the last.

use std::io;
use std::thread;
use std::time::Duration;

use mpsh_proto::control::{
    END_OF_OUTPUT, ENTER_RAW, EXEC_OK, EXIT_RAW, INTERRUPT, RAW_BANNER_NO_PROMPT, RAW_PROMPT,
    SOFT_REBOOT, SOFT_RESET, TX_SLICE, TX_SLICE_PAUSE_MS,
};
use mpsh_proto::{ACK, FrameCodec};

use crate::link::Link;
use crate::{Error, Result};

/// How long the board gets to answer each framing step.
const STEP_TIMEOUT: Duration = Duration::from_secs(1);

/// Where an exchange currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Between exchanges.
    Idle,
    /// Interrupting the board and switching to raw mode.
    EnteringMode,
    /// Sending code.
    Transmitting,
    /// Waiting for the side channel or the output.
    AwaitingResult,
    /// Switching back to the friendly REPL.
    ExitingMode,
    /// The link failed; the device is unusable.
    Closed,
}

/// Output of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Output {
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

/// Drives one raw REPL exchange over a borrowed link.
#[derive(Debug)]
pub(crate) struct RawRepl<'a> {
    link: &'a mut Link,
    phase: Phase,
    soft_reset: bool,
}

impl<'a> RawRepl<'a> {
    pub(crate) fn new(link: &'a mut Link, soft_reset: bool) -> Self {
        Self {
            link,
            phase: Phase::Idle,
            soft_reset,
        }
    }

    pub(crate) const fn phase(&self) -> Phase {
        self.phase
    }

    /// Classifies an I/O failure by the current phase.
    fn fail(&mut self, e: io::Error, timeout: Duration, what: &str) -> Error {
        if e.kind() != io::ErrorKind::TimedOut {
            self.phase = Phase::Closed;
            return Error::Transport(format!("{}: {e}", self.link.endpoint()));
        }
        if self.phase == Phase::AwaitingResult {
            self.phase = Phase::Closed;
            return Error::Timeout(timeout);
        }
        Error::Protocol(format!("{what}: {e}"))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.link
            .write_all(data)
            .map_err(|e| self.fail(e, Duration::ZERO, "write"))
    }

    fn read_until(&mut self, ending: &[u8], timeout: Duration, what: &str) -> Result<Vec<u8>> {
        self.link
            .read_until(ending, timeout)
            .map_err(|e| self.fail(e, timeout, what))
    }

    fn read_exact(&mut self, n: usize, timeout: Duration, what: &str) -> Result<Vec<u8>> {
        self.link
            .read_exact(n, timeout)
            .map_err(|e| self.fail(e, timeout, what))
    }

    /// Interrupts the board and enters raw mode, soft resetting if configured.
    pub(crate) fn enter(&mut self) -> Result<()> {
        self.phase = Phase::EnteringMode;
        self.write(INTERRUPT)?;
        thread::sleep(Duration::from_millis(TX_SLICE_PAUSE_MS));
        self.link
            .drain()
            .map_err(|e| self.fail(e, Duration::ZERO, "drain"))?;
        self.write(ENTER_RAW)?;
        // The prompt character is left for `exec_no_follow`.
        self.read_until(RAW_BANNER_NO_PROMPT, STEP_TIMEOUT, "could not enter raw repl")?;
        if self.soft_reset {
            self.write(SOFT_RESET)?;
            self.read_until(SOFT_REBOOT, STEP_TIMEOUT, "could not soft reboot")?;
            self.read_until(RAW_BANNER_NO_PROMPT, STEP_TIMEOUT, "could not enter raw repl")?;
        }
        Ok(())
    }

    /// Sends `code` and starts it without reading its output.
    pub(crate) fn exec_no_follow(&mut self, code: &[u8]) -> Result<()> {
        self.read_until(RAW_PROMPT, STEP_TIMEOUT, "could not enter raw repl")?;
        self.phase = Phase::Transmitting;
        tracing::debug!(bytes = code.len(), "sending code");
        for (i, slice) in code.chunks(TX_SLICE).enumerate() {
            if i > 0 {
                thread::sleep(Duration::from_millis(TX_SLICE_PAUSE_MS));
            }
            self.write(slice)?;
        }
        self.write(&[mpsh_proto::CTRL_D])?;
        let reply = self.read_exact(EXEC_OK.len(), STEP_TIMEOUT, "could not exec command")?;
        if reply != EXEC_OK {
            return Err(Error::Protocol(format!(
                "could not exec command (response: {:?})",
                String::from_utf8_lossy(&reply)
            )));
        }
        self.phase = Phase::AwaitingResult;
        Ok(())
    }

    /// Hands the link to a transfer running alongside the remote code.
    pub(crate) fn side_channel(&mut self, codec: FrameCodec, timeout: Duration) -> SideChannel<'_, 'a> {
        SideChannel {
            repl: self,
            codec,
            timeout,
        }
    }

    /// Collects stdout and stderr of the running code.
    pub(crate) fn follow(&mut self, timeout: Duration) -> Result<Output> {
        self.phase = Phase::AwaitingResult;
        let mut stdout = self.read_until(END_OF_OUTPUT, timeout, "awaiting output")?;
        stdout.truncate(stdout.len() - END_OF_OUTPUT.len());
        let mut stderr = self.read_until(END_OF_OUTPUT, timeout, "awaiting error output")?;
        stderr.truncate(stderr.len() - END_OF_OUTPUT.len());
        Ok(Output { stdout, stderr })
    }

    /// Returns the board to the friendly REPL.
    pub(crate) fn exit(&mut self) -> Result<()> {
        self.phase = Phase::ExitingMode;
        self.write(EXIT_RAW)?;
        self.phase = Phase::Idle;
        Ok(())
    }

    /// Runs `code` to completion inside one raw-mode bracket.
    pub(crate) fn run(&mut self, code: &[u8], timeout: Duration) -> Result<Output> {
        self.enter()?;
        self.exec_no_follow(code)?;
        let out = self.follow(timeout)?;
        self.exit()?;
        Ok(out)
    }
}

/// Byte-level access to the link while remote code is waiting for a transfer.
///
/// Every read is bounded by the call timeout; a silent board is a
/// [`Error::Timeout`].
#[derive(Debug)]
pub struct SideChannel<'r, 'a> {
    repl: &'r mut RawRepl<'a>,
    codec: FrameCodec,
    timeout: Duration,
}

impl SideChannel<'_, '_> {
    /// Frame sizing and encoding agreed with the remote code.
    pub const fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Reads exactly `n` bytes.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        self.repl.read_exact(n, self.timeout, "side channel")
    }

    /// Writes all of `data`.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.repl.write(data)
    }

    /// Waits for the board's flow-control acknowledgement.
    pub fn wait_ack(&mut self) -> Result<()> {
        let got = self.read(1)?;
        if got != [ACK] {
            return Err(Error::Protocol(format!(
                "expected ACK, board sent {:?}",
                String::from_utf8_lossy(&got)
            )));
        }
        Ok(())
    }

    /// Acknowledges a received frame.
    pub fn ack(&mut self) -> Result<()> {
        self.write(&[ACK])
    }
}
