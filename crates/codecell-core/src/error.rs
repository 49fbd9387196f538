//! Error types for codecell-core.
//!
//! Only failures of the machinery itself are errors. A Python exception,
//! an interrupted run or a cancelled run is a normal outcome and is reported
//! through [`crate::ExecutionStatus`].

use thiserror::Error;

/// Result type for codecell-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in codecell-core.
///
/// `Clone` because a single bootstrap outcome is handed to every caller
/// waiting on the same `initialize()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Runtime or package bootstrap failed.
    #[error("runtime initialization failed: {0}")]
    Init(String),

    /// The worker thread could not be created or went away.
    #[error("worker transport error: {0}")]
    Transport(String),

    /// A malformed message crossed the interpreter boundary.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Render the error with a recovery hint for interactive front ends.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::Init(_) => {
                "check that python3 and the required packages are installed \
                 (set CODECELL_PYTHON or CODECELL_PACKAGES to override)"
            }
            Error::Transport(_) => "reset the execution service and initialize it again",
            Error::Protocol(_) => "the interpreter driver is out of sync; reset the service",
            Error::Io(_) => "check file permissions and paths",
        };
        format!("{}\n  hint: {}", self, hint)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
