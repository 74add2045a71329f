//! Error types shared across the classification engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while loading index files or reading sequence input.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure, annotated with the file it came from.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read when the failure occurred.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File opened fine but its contents are not what we expect.
    #[error("{path} is not a valid {what} file: {reason}")]
    InvalidFormat {
        /// Offending file.
        path: PathBuf,
        /// Human name of the expected format ("taxonomy", "hash table", ...).
        what: &'static str,
        /// What went wrong.
        reason: String,
    },
}

impl CoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(
        path: impl Into<PathBuf>,
        what: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidFormat {
            path: path.into(),
            what,
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
