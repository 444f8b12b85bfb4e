//! Error types for the conduit registry.

use hotsync_storage::{FourCc, ResultCode};
use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned by the conduit registry.
///
/// All of them are recoverable and surfaced to the caller.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No conduit is registered for the creator.
    #[error("no conduit registered for creator {0}")]
    NotFound(FourCc),

    /// A conduit is already registered for the creator.
    #[error("creator {0} is already in use")]
    AlreadyInUse(FourCc),

    /// The caller's buffer cannot hold the value and its terminator.
    #[error("buffer too small: {required} bytes required")]
    BufferTooSmall {
        /// Bytes needed, including the trailing NUL.
        required: usize,
    },

    /// The registry file could not be accessed.
    #[error("registry access denied: {0}")]
    AccessDenied(String),

    /// The creator ID is the wildcard or otherwise unusable.
    #[error("invalid creator ID: {0}")]
    InvalidCreator(String),

    /// I/O error while loading or saving the registry.
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The registry file is malformed.
    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Registry error number, counted down from -1000.
    #[must_use]
    pub fn number(&self) -> i32 {
        const BASE: i32 = -1000;
        match self {
            RegistryError::NotFound(_) => BASE - 3,
            RegistryError::AlreadyInUse(_) => BASE - 5,
            RegistryError::AccessDenied(_) => BASE - 6,
            RegistryError::BufferTooSmall { .. } => BASE - 10,
            RegistryError::InvalidCreator(_) => BASE - 12,
            RegistryError::Io(_) | RegistryError::Serialization(_) => BASE - 20,
        }
    }

    /// Result code in the conduit class.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        ResultCode::conduit(self.number().unsigned_abs() - 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotsync_storage::ErrorClass;

    #[test]
    fn numbers_count_down() {
        let memo = FourCc::from_bytes(*b"memo");
        assert_eq!(RegistryError::NotFound(memo).number(), -1003);
        assert_eq!(RegistryError::AlreadyInUse(memo).number(), -1005);
        assert_eq!(
            RegistryError::BufferTooSmall { required: 8 }.number(),
            -1010
        );
    }

    #[test]
    fn codes_are_conduit_class() {
        let err = RegistryError::AlreadyInUse(FourCc::from_bytes(*b"memo"));
        assert_eq!(err.code().class(), ErrorClass::Conduit);
        assert_eq!(err.code().raw(), 0x1005);
        assert!(!err.code().is_fatal());
    }

    #[test]
    fn display() {
        let err = RegistryError::BufferTooSmall { required: 12 };
        assert_eq!(err.to_string(), "buffer too small: 12 bytes required");
    }
}
