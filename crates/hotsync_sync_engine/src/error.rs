//! Error types for the sync engine.

use hotsync_conduit::RegistryError;
use hotsync_storage::{ErrorSeverity, ResultCode, StoreError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Which side asked for the cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// The desktop user or the host process.
    Local,
    /// The handheld user.
    Remote,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Record store error on either side.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Conduit registry error.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The session was cancelled.
    #[error("sync cancelled ({0:?})")]
    Cancelled(CancelSource),

    /// Another session is still alive.
    #[error("a sync session is already active")]
    SessionActive,

    /// Sync metadata could not be read or written.
    #[error("sync metadata error: {0}")]
    Metadata(String),

    /// I/O error outside a record store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a metadata error.
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata(message.into())
    }

    /// Classifies how far this error reaches.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SyncError::Store(e) => e.severity(),
            SyncError::Cancelled(_) | SyncError::SessionActive => ErrorSeverity::Session,
            SyncError::Registry(_)
            | SyncError::InvalidStateTransition { .. }
            | SyncError::Metadata(_)
            | SyncError::Io(_) => ErrorSeverity::Database,
        }
    }

    /// Returns true for errors that end the session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Session
    }

    /// Returns true if either side cancelled.
    #[must_use]
    pub fn is_cancel(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled(_) | SyncError::Store(StoreError::RemoteCancel)
        )
    }

    /// Returns the result code for this error.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        match self {
            SyncError::Store(e) => e.code(),
            SyncError::Registry(e) => e.code(),
            SyncError::Cancelled(CancelSource::Local) => ResultCode::LOCAL_CANCEL_SYNC,
            SyncError::Cancelled(CancelSource::Remote) => ResultCode::REMOTE_CANCEL_SYNC,
            SyncError::InvalidStateTransition { .. } => ResultCode::BAD_OPERATION,
            SyncError::SessionActive => ResultCode::FILE_ALREADY_OPEN,
            SyncError::Metadata(_) | SyncError::Io(_) => ResultCode::REMOTE_SYS,
        }
    }
}
