use std::path::PathBuf;

use crate::ports::PortScope;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected before anything is queued or written.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A persisted document exists but cannot be trusted; surfaced to the operator as fatal.
    #[error("malformed document {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no ports available in {scope} range {start}-{end}")]
    PortsExhausted { scope: PortScope, start: u16, end: u16 },
    #[error("operation not found in queue: {0}")]
    UnknownOperation(String),
    #[error("no queued change set")]
    NoQueue,
    #[error("settings error: {0}")]
    Settings(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
