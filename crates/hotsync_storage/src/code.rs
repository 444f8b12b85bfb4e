//! Numeric result codes.
//!
//! Every error in the workspace maps onto a 32-bit result code. The high
//! bits identify the class of the error (conduit, transport, sync manager,
//! host application, expansion API) and a dedicated fatal bit marks errors
//! that end the whole session.

use std::fmt;

/// Conduit error class.
pub const COND_ERR_CLASS: u32 = 0x0000_1000;
/// Communications / transport error class.
pub const TRANS_ERR_CLASS: u32 = 0x0000_2000;
/// Sync manager error class.
pub const SYNC_ERR_CLASS: u32 = 0x0000_4000;
/// Host application error class.
pub const HSAPP_ERR_CLASS: u32 = 0x0000_8000;
/// Expansion manager error class.
pub const EXPAPI_ERR_CLASS: u32 = 0x0000_2900;
/// Virtual file system error class.
pub const VFSAPI_ERR_CLASS: u32 = 0x0000_2A00;
/// Set on errors that terminate the session.
pub const SYNC_FATAL_ERR_MASK: u32 = 0x1000_0000;

const SYNC_FATAL_ERR: u32 = SYNC_FATAL_ERR_MASK + SYNC_ERR_CLASS;

/// Class of a [`ResultCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Conduit (registry) errors.
    Conduit,
    /// Transport errors.
    Transport,
    /// Sync manager errors.
    SyncManager,
    /// Host application errors.
    HostApplication,
    /// Expansion manager errors.
    ExpansionApi,
    /// Virtual file system errors.
    Vfs,
    /// Success or unclassified value.
    None,
}

/// A classified result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(u32);

impl ResultCode {
    /// Success.
    pub const NONE: Self = Self(0);
    /// Unknown error.
    pub const UNKNOWN: Self = Self(SYNC_ERR_CLASS + 0x01);
    /// Requested database, record or resource not found.
    pub const NOT_FOUND: Self = Self(SYNC_ERR_CLASS + 0x03);
    /// Attempt to open a database failed.
    pub const FILE_NOT_OPEN: Self = Self(SYNC_ERR_CLASS + 0x04);
    /// Record is in use by the handheld.
    pub const RECORD_BUSY: Self = Self(SYNC_ERR_CLASS + 0x06);
    /// Record has been deleted or archived.
    pub const RECORD_DELETED: Self = Self(SYNC_ERR_CLASS + 0x07);
    /// Database is read-only.
    pub const READ_ONLY: Self = Self(SYNC_ERR_CLASS + 0x09);
    /// Database with the same name already exists.
    pub const FILE_ALREADY_EXIST: Self = Self(SYNC_ERR_CLASS + 0x0B);
    /// Database is already open.
    pub const FILE_ALREADY_OPEN: Self = Self(SYNC_ERR_CLASS + 0x0C);
    /// Operation on a database when none is open.
    pub const NO_FILES_OPEN: Self = Self(SYNC_ERR_CLASS + 0x0D);
    /// Operation not supported on this database type.
    pub const BAD_OPERATION: Self = Self(SYNC_ERR_CLASS + 0x0E);
    /// Invalid argument.
    pub const BAD_ARG: Self = Self(SYNC_ERR_CLASS + 0x17);
    /// Caller buffer too small for the reply.
    pub const LOCAL_BUFF_TOO_SMALL: Self = Self(SYNC_ERR_CLASS + 0x12);
    /// Remote data store is full.
    pub const REMOTE_NO_SPACE: Self = Self(SYNC_ERR_CLASS + 0x14);
    /// Generic remote system error.
    pub const REMOTE_SYS: Self = Self(SYNC_ERR_CLASS + 0x15);
    /// Request not supported by the remote.
    pub const UNKNOWN_REQUEST: Self = Self(SYNC_ERR_CLASS + 0x19);
    /// More than one database open at a time.
    pub const TOO_MANY_OPEN_FILES: Self = Self(SYNC_FATAL_ERR + 0x403);
    /// Cancel requested from the handheld.
    pub const REMOTE_CANCEL_SYNC: Self = Self(SYNC_FATAL_ERR + 0x405);
    /// Connection lost. Carries the transport class bit as well.
    pub const LOST_CONNECTION: Self = Self(SYNC_FATAL_ERR + TRANS_ERR_CLASS + 0x410);
    /// Cancel requested from the desktop.
    pub const LOCAL_CANCEL_SYNC: Self = Self(SYNC_FATAL_ERR + 0x411);

    /// Builds a conduit-class code from a registry error number.
    #[must_use]
    pub const fn conduit(detail: u32) -> Self {
        Self(COND_ERR_CLASS + (detail & 0xFF))
    }

    /// Wraps a raw value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns true for session-ending codes.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        self.0 & SYNC_FATAL_ERR_MASK != 0
    }

    /// Returns true if the transport bit is set (connection loss).
    #[must_use]
    pub const fn is_transport(self) -> bool {
        self.0 & TRANS_ERR_CLASS != 0 && self.0 & 0x0F00 != 0x0900 && self.0 & 0x0F00 != 0x0A00
    }

    /// Returns true for success.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Returns the class encoded in the high bits.
    #[must_use]
    pub fn class(self) -> ErrorClass {
        let low = self.0 & !SYNC_FATAL_ERR_MASK;
        if low == 0 {
            return ErrorClass::None;
        }
        if low & SYNC_ERR_CLASS != 0 {
            return ErrorClass::SyncManager;
        }
        if low & HSAPP_ERR_CLASS != 0 {
            return ErrorClass::HostApplication;
        }
        match low & 0xFF00 {
            0x2900 => return ErrorClass::ExpansionApi,
            0x2A00 => return ErrorClass::Vfs,
            _ => {}
        }
        if low & TRANS_ERR_CLASS != 0 {
            return ErrorClass::Transport;
        }
        if low & COND_ERR_CLASS != 0 {
            return ErrorClass::Conduit;
        }
        ErrorClass::None
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
