use std::fmt::Display;

/// Cinderlog errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The key is not present in the log.
    NotFound,
    /// Invalid stored data: a checksum mismatch, a truncated footer or
    /// index stream, out-of-order keys in a sorted block, or a malformed
    /// filter tail.
    Corruption(String),
    /// An IO error from the underlying storage.
    Io(String),
    /// An operation was attempted on a sink or writer after it was closed.
    Disconnected(String),
    /// Invalid caller input.
    InvalidArgument(String),
    /// The target already exists. Reserved for metadata paths layered on
    /// top of the engine; the core never produces it.
    AlreadyExists(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "key not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Disconnected(msg) => write!(f, "disconnected: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)).into() };
}

/// A cinderlog Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
