use thiserror::Error;
use tokio::task::JoinError;

use crate::digests::ObjectId;
use crate::model::ObjectKind;

/// Errors related to talking to the underlying storage.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),
}

/// Errors surfaced by the object read pipeline.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FetchError {
    /// The object is absent from both the local store and the backing store.
    /// Maps to ENOENT for reads.
    #[error("{kind} {id} not found")]
    NotFound { kind: ObjectKind, id: ObjectId },

    /// An object read back from the local store hashed to a different value
    /// than its key. The offending key has been evicted before this error is
    /// returned.
    #[error("{kind} {id} is corrupt: contents hash to {actual}")]
    ObjectCorrupt {
        kind: ObjectKind,
        id: ObjectId,
        actual: ObjectId,
    },

    /// A recoverable backing store failure. Retried a bounded number of
    /// times at the object store boundary.
    #[error("transient backing store error: {0}")]
    Transient(String),

    /// The awaiting caller cancelled the fetch.
    #[error("fetch cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] Error),
}

impl FetchError {
    pub fn not_found(kind: ObjectKind, id: &ObjectId) -> Self {
        FetchError::NotFound {
            kind,
            id: id.clone(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<JoinError> for FetchError {
    fn from(value: JoinError) -> Self {
        FetchError::Storage(value.into())
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidRequest(value.to_string())
        } else {
            Error::StorageError(value.to_string())
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::StorageError(msg) => Self::new(std::io::ErrorKind::Other, msg),
        }
    }
}
