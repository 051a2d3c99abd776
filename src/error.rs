use std::fmt;
use std::io;

use crate::config::PageId;

/// Crate-wide error type. A typed enum so callers can match on the failure
/// kind instead of inspecting a message string.
#[derive(Debug)]
pub enum Error {
    /// Magic mismatch on open.
    InvalidDatabase,
    /// Another process holds the file's advisory lock.
    LockBusy,
    /// `beginTx` called while a transaction is already active.
    TransactionActive,
    /// A mutating call was made outside an active transaction.
    NoActiveTransaction,
    /// `page_id >= page_count`.
    PageOutOfBounds { page_id: PageId, page_count: PageId },
    /// Attempt to free page 0.
    CannotFreeMetaPage,
    /// Underlying file or mmap operation failed.
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidDatabase => write!(f, "invalid database: magic mismatch"),
            Error::LockBusy => write!(f, "database file is locked by another process"),
            Error::TransactionActive => write!(f, "a transaction is already active"),
            Error::NoActiveTransaction => write!(f, "no active transaction"),
            Error::PageOutOfBounds { page_id, page_count } => write!(
                f,
                "page {} out of bounds (page_count = {})",
                page_id, page_count
            ),
            Error::CannotFreeMetaPage => write!(f, "cannot free the metadata page"),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
