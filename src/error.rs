use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Engine errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The query or operation was cancelled before completion.
    Cancelled,
    /// Invalid argument: wrong arity, type mismatch, unknown column, index
    /// out of range. Detected eagerly while planning an operator.
    InvalidArgument(String),
    /// Column sizes disagree within a block, or a filter mask does not match
    /// the row count. Indicates a construction bug upstream.
    SizeMismatch(String),
    /// A configured resource limit was exceeded: rows to GROUP BY, distinct
    /// set size, execution time, quota, too many parts per month.
    LimitExceeded(String),
    /// An IO error.
    IO(String),
    /// On-disk data failed validation: checksum mismatch, truncated file,
    /// empty part, marks of different sizes. The part should be reported
    /// broken and not read.
    Corruption(String),
    /// An internal invariant was violated: unknown method variant, unknown
    /// overflow mode, inconsistent engine state.
    Logical(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Cancelled => write!(f, "query was cancelled"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::SizeMismatch(msg) => write!(f, "size mismatch: {msg}"),
            Error::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corrupted data: {msg}"),
            Error::Logical(msg) => write!(f, "logical error: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)).into() };
}

/// An engine Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            // Truncated or malformed data is an integrity problem, not a
            // transport one: the part should be reported broken.
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                Error::Corruption(err.to_string())
            }
            _ => Error::IO(err.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
