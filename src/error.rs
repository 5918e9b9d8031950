use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A storage invariant was broken: an insert that does not match a
    /// block's schema, a version collision, or a mirror failure between
    /// indexes. These indicate engine corruption and are never retried.
    InvariantViolation(String),
    /// Optimistic validation failed at commit time because another writer
    /// committed to a token in this transaction's footprint. The transaction
    /// must be discarded and may be retried.
    TransactionConflict,
    /// A write was attempted on a read-only structure (flushed block, sealed
    /// page).
    ReadOnly,
    /// Persisted data is unreadable: bad magic, checksum mismatch, or a
    /// truncated or garbled entry. The affected block or page is quarantined.
    Corruption(String),
    /// Invalid user input or configuration.
    InvalidInput(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Error::TransactionConflict => write!(f, "transaction conflict, retry transaction"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Corruption(msg) => write!(f, "corrupt data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
