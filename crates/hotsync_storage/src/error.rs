//! Error types for record store operations.

use crate::code::ResultCode;
use std::io;
use thiserror::Error;

/// Result type for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// How far the effect of an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Skip the record and continue.
    Record,
    /// Abort reconciliation of the current database only.
    Database,
    /// End the whole session.
    Session,
}

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database, record or preference not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The record has been deleted.
    #[error("record {0:#010x} is deleted")]
    RecordDeleted(u32),

    /// The record is in use on the handheld.
    #[error("record {0:#010x} is busy")]
    RecordBusy(u32),

    /// The database is read-only or was opened without write access.
    #[error("database is read-only: {0}")]
    ReadOnly(String),

    /// The store has no room for the write.
    #[error("no space left in store for {needed} bytes")]
    NoSpace {
        /// Bytes the write needed.
        needed: usize,
    },

    /// The database is already open with a conflicting mode.
    #[error("database already open: {0}")]
    AlreadyOpen(String),

    /// More databases open than the store allows.
    #[error("too many open databases (limit {limit})")]
    TooManyOpenFiles {
        /// Maximum number of concurrently open databases.
        limit: usize,
    },

    /// A database with this name already exists on the card.
    #[error("database already exists: {0}")]
    FileAlreadyExists(String),

    /// The handle does not refer to an open database.
    #[error("invalid database handle {0}")]
    BadHandle(u8),

    /// The operation does not apply to this kind of database.
    #[error("bad operation: {0}")]
    BadOperation(String),

    /// An argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The connection to the remote store is gone.
    #[error("connection lost")]
    LostConnection,

    /// The handheld requested cancellation.
    #[error("sync cancelled by handheld")]
    RemoteCancel,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted store could not be decoded or encoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The store directory is locked by another process.
    #[error("store locked: another process has exclusive access")]
    Locked,
}

impl StoreError {
    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Returns the result code for this error.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        match self {
            StoreError::NotFound(_) => ResultCode::NOT_FOUND,
            StoreError::RecordDeleted(_) => ResultCode::RECORD_DELETED,
            StoreError::RecordBusy(_) => ResultCode::RECORD_BUSY,
            StoreError::ReadOnly(_) => ResultCode::READ_ONLY,
            StoreError::NoSpace { .. } => ResultCode::REMOTE_NO_SPACE,
            StoreError::AlreadyOpen(_) => ResultCode::FILE_ALREADY_OPEN,
            StoreError::TooManyOpenFiles { .. } => ResultCode::TOO_MANY_OPEN_FILES,
            StoreError::FileAlreadyExists(_) => ResultCode::FILE_ALREADY_EXIST,
            StoreError::BadHandle(_) => ResultCode::NO_FILES_OPEN,
            StoreError::BadOperation(_) => ResultCode::BAD_OPERATION,
            StoreError::InvalidArgument(_) => ResultCode::BAD_ARG,
            StoreError::LostConnection => ResultCode::LOST_CONNECTION,
            StoreError::RemoteCancel => ResultCode::REMOTE_CANCEL_SYNC,
            StoreError::Io(_) | StoreError::Codec(_) | StoreError::Locked => {
                ResultCode::REMOTE_SYS
            }
        }
    }

    /// Classifies how far this error reaches.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StoreError::NotFound(_)
            | StoreError::RecordDeleted(_)
            | StoreError::RecordBusy(_)
            | StoreError::ReadOnly(_)
            | StoreError::InvalidArgument(_) => ErrorSeverity::Record,
            StoreError::TooManyOpenFiles { .. }
            | StoreError::LostConnection
            | StoreError::RemoteCancel => ErrorSeverity::Session,
            _ => ErrorSeverity::Database,
        }
    }
}
