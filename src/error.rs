use std::fmt::Display;

/// Errors surfaced by the engine.
///
/// A missing key is not an error: `get` returns `Ok(None)`.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// On-disk data failed validation: a bad manifest record, a WAL CRC
    /// mismatch under paranoid checks, or a table checksum failure.
    Corruption(String),
    /// Invalid caller input: comparator mismatch, contradictory open flags,
    /// an out-of-range level.
    InvalidArgument(String),
    /// An underlying filesystem failure.
    Io(String),
    /// Another process holds the database directory lock.
    LockFailed(String),
    /// The operation was aborted because the engine is closing.
    Shutdown,
    /// A prior background task failed; the cause is latched and returned for
    /// every subsequent write until the engine is reopened.
    Background(Box<Error>),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::LockFailed(msg) => write!(f, "lock failed: {msg}"),
            Error::Shutdown => write!(f, "database is shutting down"),
            Error::Background(cause) => write!(f, "background task failed: {cause}"),
        }
    }
}

/// A tephradb Result.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
