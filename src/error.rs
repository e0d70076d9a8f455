use std::fmt::Display;

/// emberdb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The database is closed.
    Closed,
    /// Another process holds the lock file.
    Locked,
    /// On-disk state failed a consistency check (bad signature, data file
    /// without an index, torn structures).
    Corrupted(String),
    /// The request could not be parsed, typically an invalid topic.
    BadRequest,
    /// An entry was submitted without a topic.
    TopicEmpty,
    /// Topic exceeds the maximum topic length.
    TopicTooLarge,
    /// An entry was submitted without a payload.
    ValueEmpty,
    /// Payload exceeds the maximum value length.
    ValueTooLarge,
    /// A delete was submitted without a message id.
    MsgIdEmpty,
    /// The message id refers to a deleted entry.
    MsgIdDeleted,
    /// The entry does not exist or its index record is unreadable.
    EntryInvalid,
    /// The store holds the maximum number of keys.
    Full,
    /// A delete was attempted on an immutable batch.
    Immutable,
    /// The iterator is exhausted.
    IterationDone,
    /// The write-ahead log cannot reuse or allocate a block.
    WalFull,
    /// An IO error.
    Io(String),
    /// A checksum mismatch.
    Crc,
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "database is closed"),
            Error::Locked => write!(f, "database is in use by another process"),
            Error::Corrupted(msg) => write!(f, "corrupted: {msg}"),
            Error::BadRequest => write!(f, "invalid request"),
            Error::TopicEmpty => write!(f, "topic is empty"),
            Error::TopicTooLarge => write!(f, "topic exceeds maximum length"),
            Error::ValueEmpty => write!(f, "payload is empty"),
            Error::ValueTooLarge => write!(f, "payload exceeds maximum length"),
            Error::MsgIdEmpty => write!(f, "message id is empty"),
            Error::MsgIdDeleted => write!(f, "message id refers to a deleted entry"),
            Error::EntryInvalid => write!(f, "entry not found"),
            Error::Full => write!(f, "database reached maximum number of keys"),
            Error::Immutable => write!(f, "batch is immutable"),
            Error::IterationDone => write!(f, "iteration done"),
            Error::WalFull => write!(f, "write ahead log is full"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Crc => write!(f, "checksum mismatch"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

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

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
