//! Error types for mpsh operations.

use std::time::Duration;

use crate::config::ConfigError;

/// Alias for `Result<T, mpsh::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by board operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The link to the board is closed or broken.
    ///
    /// The owning device is closed when this is raised.
    #[error("{0}")]
    Transport(String),

    /// The board did not finish answering in time.
    #[error("no response from board within {0:?}")]
    Timeout(Duration),

    /// The board answered with unexpected framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Code executed on the board raised an exception or an operation was
    /// refused by the board.
    #[error("board error: {0}")]
    Remote(String),

    /// Invalid configuration option or value.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No board matches the request.
    #[error("no board connected")]
    NoDevice,

    /// A host-side I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if the error closed the device.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    pub(crate) fn closed(endpoint: impl std::fmt::Display) -> Self {
        Self::Transport(format!("{endpoint} closed"))
    }
}

impl From<mpsh_proto::FrameError> for Error {
    fn from(e: mpsh_proto::FrameError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<mpsh_proto::LiteralError> for Error {
    fn from(e: mpsh_proto::LiteralError) -> Self {
        Self::Protocol(e.to_string())
    }
}
