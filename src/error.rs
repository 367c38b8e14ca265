//! Error type shared by every device-tree operation.
//!
//! Failures fall into three kinds that callers are expected to tell apart:
//!
//! - [`DtError::MissingInput`] - a source, overlay, or scaffold directory is absent
//! - [`DtError::InvalidArgument`] - the request itself is malformed
//! - [`DtError::ToolFailure`] - an external tool reported failure; its
//!   diagnostic output is carried verbatim so it can be shown to the user
//!
//! The remaining variants wrap I/O, repository, and configuration problems.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DtError {
    #[error("{0}")]
    MissingInput(String),

    #[error("{0}")]
    InvalidArgument(String),

    /// `message` is our summary; `stderr` is the tool's own output, untouched.
    #[error("{message}\n{stderr}")]
    ToolFailure {
        tool: String,
        message: String,
        stderr: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("repository error: {0}")]
    Repository(String),

    #[error("invalid configuration '{}': {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error("storage area is locked by another process: {}", .0.display())]
    Locked(PathBuf),
}

pub type Result<T> = std::result::Result<T, DtError>;

impl DtError {
    pub fn missing(msg: impl Into<String>) -> Self {
        Self::MissingInput(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>, stderr: &[u8]) -> Self {
        Self::ToolFailure {
            tool: tool.into(),
            message: message.into(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }
}

/// Attach a human-readable context string to `std::io` failures.
///
/// Mirrors `anyhow::Context` so call sites read the same way, while keeping
/// the typed [`DtError`] at the library boundary.
pub trait IoContext<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| DtError::Io {
            context: f().into(),
            source,
        })
    }
}
