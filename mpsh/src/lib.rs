//! Remote shell plumbing for MicroPython boards.
//!
//! `mpsh` drives a board over a serial port or a telnet session through
//! its raw REPL: code is shipped with constants injected, run under a
//! timeout, and its output read back. On top of that sit file transfer,
//! an rsync-style tree sync and an interactive pass-through bridge.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mpsh::{ConfigStore, ConnectionRegistry, LocalTree, RemoteTree, SyncOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(ConfigStore::open("boards.json")?);
//! let registry = ConnectionRegistry::new(config);
//! let board = registry.connect_serial("/dev/ttyACM0", None)?;
//!
//! print!("{}", board.exec("import sys; print(sys.version)")?);
//!
//! let report = mpsh::sync(
//!     &LocalTree,
//!     "src",
//!     &RemoteTree::new(&board),
//!     "/flash",
//!     &SyncOptions::default(),
//! )?;
//! assert!(report.is_success());
//! # Ok(()) }
//! ```
//!
//! Every call on a [`Device`] is one blocking raw-REPL exchange. A link
//! failure, or a board silent past the call timeout, closes the device;
//! later calls fail at once without touching the link.

mod bridge;
mod config;
mod device;
mod error;
mod files;
mod link;
mod registry;
mod repl;
mod scan;
mod sync;
mod transport;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeExit, QUIT_KEY};
pub use config::{BoardConfig, ConfigError, ConfigStore, DEFAULT_SECTION, validate_option};
pub use device::{DEFAULT_TIMEOUT, Device, RemoteCall, Status};
pub use error::{Error, Result};
pub use files::{EntryKind, FileEntry};
pub use mpsh_proto::{Literal, ops};
pub use registry::ConnectionRegistry;
pub use repl::SideChannel;
pub use scan::{BoardPort, is_board, scan};
pub use sync::{
    Action, FileTree, LocalTree, NameFilter, RemoteTree, SyncItemError, SyncOptions, SyncReport,
    join, plan, sync,
};
pub use transport::{
    Endpoint, NetworkLink, NetworkOptions, SerialLink, SerialOptions, Transport,
};
