//! Control bytes and prompt markers of the MicroPython raw REPL.
//!
//! These values are a compatibility requirement with the board firmware:
//! changing any of them breaks the exchange.

/// Ctrl-A: switch the board into raw execution mode.
pub const CTRL_A: u8 = 0x01;
/// Ctrl-B: leave raw mode and return to the friendly REPL.
pub const CTRL_B: u8 = 0x02;
/// Ctrl-C: interrupt whatever the board is running.
pub const CTRL_C: u8 = 0x03;
/// Ctrl-D: execute the buffered code (raw mode) / end-of-output marker.
pub const CTRL_D: u8 = 0x04;
/// Ctrl-X: leaves a pass-through session on the host side.
pub const CTRL_X: u8 = 0x18;

/// Flow-control acknowledgement exchanged once per file transfer frame.
pub const ACK: u8 = 0x06;

/// Sent before entering raw mode: interrupt twice to kill any running program.
pub const INTERRUPT: &[u8] = b"\r\x03\x03";
/// Sent to enter raw mode.
pub const ENTER_RAW: &[u8] = b"\r\x01";
/// Sent to leave raw mode.
pub const EXIT_RAW: &[u8] = b"\r\x02";
/// Sent to ask the board for a soft reset while in raw mode.
pub const SOFT_RESET: &[u8] = b"\x04";

/// Banner printed by the board when raw mode is entered, ending in the prompt.
pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
/// Banner printed after a soft reset, before the prompt character.
pub const RAW_BANNER_NO_PROMPT: &[u8] = b"raw REPL; CTRL-B to exit\r\n";
/// Printed by the board when a soft reset completes.
pub const SOFT_REBOOT: &[u8] = b"soft reboot\r\n";
/// Raw-mode prompt character.
pub const RAW_PROMPT: &[u8] = b">";
/// Reply confirming the transmitted code was accepted for execution.
pub const EXEC_OK: &[u8] = b"OK";
/// Terminates stdout and then stderr of an execution.
pub const END_OF_OUTPUT: &[u8] = b"\x04";

/// Payloads are transmitted in slices of this many bytes.
pub const TX_SLICE: usize = 256;
/// Pause between two transmitted slices, in milliseconds.
pub const TX_SLICE_PAUSE_MS: u64 = 10;

/// Telnet login prompt for the user name.
pub const TELNET_LOGIN: &[u8] = b"Login as:";
/// Telnet login prompt for the password.
pub const TELNET_PASSWORD: &[u8] = b"Password:";
/// Tail of the banner printed once the telnet login succeeded.
pub const TELNET_WELCOME: &[u8] = b"for more information.";

/// Sentinel printed by the call epilogue when the function returned nothing.
pub const NO_VALUE: &str = "None";
