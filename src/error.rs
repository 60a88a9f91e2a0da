//! Sorting errors.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::io;

use crate::stream::StorageId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SortError>;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// A constructor parameter is out of its valid range.
    InvalidArgument(String),
    /// The requested output ID lies inside the factory's temporary namespace.
    OutputInTempDir {
        /// The rejected output ID.
        output: StorageId,
        /// The factory's temporary namespace ID.
        temp_dir: StorageId,
    },
    /// Host-level I/O failure (open/read/write/seek/rename/remove).
    Io(io::Error),
    /// Record-level encode/decode failure or truncated record data.
    Serialization(String),
    /// A single record's footprint exceeds the whole memory budget.
    MemoryLimit {
        /// Estimated footprint of the offending record.
        footprint: u64,
        /// The configured budget in bytes.
        limit: u64,
    },
    /// Contract misuse: write after finalize, value from an exhausted stream.
    InvalidState(String),
    /// Invariant violation inside the sorter itself.
    Internal(String),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            SortError::OutputInTempDir { output, temp_dir } => {
                write!(f, "output ID '{}' lies inside the temporary namespace '{}'", output, temp_dir)
            }
            SortError::Io(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Serialization(msg) => write!(f, "serialization error: {}", msg),
            SortError::MemoryLimit { footprint, limit } => {
                write!(f, "single record footprint ({} bytes) exceeds memory limit ({} bytes)", footprint, limit)
            }
            SortError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            SortError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::Io(err)
    }
}
