//! Database descriptors, open modes and option sets.

use crate::tag::FourCc;
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Maximum database name length in bytes, excluding the terminator.
pub const MAX_DB_NAME_LEN: usize = 31;

/// Records a single database can hold; record indices are 16-bit.
pub const MAX_RECORDS: usize = 1 << 16;

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident: $repr:ty { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            /// The empty set.
            #[must_use]
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Creates a set from raw bits.
            #[must_use]
            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            /// Returns the raw bits.
            #[must_use]
            pub const fn bits(self) -> $repr {
                self.0
            }

            /// Returns true if every bit of `other` is set.
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Sets the bits of `other`.
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clears the bits of `other`.
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

flag_set! {
    /// Database flags.
    DbFlags: u16 {
        /// Resource database (clear for a record database).
        RESOURCE = 0x0001;
        /// ROM-based, read-only database.
        READ_ONLY = 0x0002;
        /// The application info block changed.
        APP_INFO_DIRTY = 0x0004;
        /// Back up when no conduit handles the database.
        BACKUP = 0x0008;
        /// A newer version may be installed under another name.
        OK_TO_INSTALL_NEWER = 0x0010;
        /// Reset the device after installing.
        RESET_AFTER_INSTALL = 0x0020;
        /// Beaming is not allowed.
        COPY_PREVENTION = 0x0040;
        /// File stream database.
        STREAM = 0x0080;
        /// Hidden from the launcher.
        HIDDEN = 0x0100;
        /// Launchable data database.
        LAUNCHABLE_DATA = 0x0200;
        /// To be deleted on next close.
        RECYCLABLE = 0x0400;
        /// Bundled with the application of the same creator.
        BUNDLE = 0x0800;
        /// Currently open.
        OPEN = 0x8000;
    }
}

flag_set! {
    /// Miscellaneous database list flags.
    MiscFlags: u8 {
        /// The user disabled sync for the owning application.
        EXCLUDE_FROM_SYNC = 0x80;
        /// Stored in RAM (otherwise ROM).
        RAM_BASED = 0x40;
    }
}

flag_set! {
    /// Open mode bit set.
    OpenMode: u8 {
        /// Include secret records in reads.
        SHOW_SECRET = 0x10;
        /// No other handle may open the database.
        EXCLUSIVE = 0x20;
        /// Write access.
        WRITE = 0x40;
        /// Read access.
        READ = 0x80;
    }
}

impl OpenMode {
    /// Read, write and exclusive, the default for a sync.
    pub const SYNC: Self = Self(0x80 | 0x40 | 0x20);
}

flag_set! {
    /// Which expensive fields a catalog lookup computes.
    InfoOptions: u8 {
        /// Name, creator, type, flags and dates.
        ATTRIBUTES = 0x80;
        /// Record count and byte totals.
        SIZE = 0x40;
        /// Size of the largest record. Only honoured for open databases.
        MAX_REC_SIZE = 0x20;
    }
}

/// Options applied when closing a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseOptions {
    /// Stamp the backup date.
    pub update_backup_date: bool,
    /// Stamp the modification date.
    pub update_mod_date: bool,
}

impl CloseOptions {
    /// Close without touching any date.
    pub const PLAIN: Self = Self {
        update_backup_date: false,
        update_mod_date: false,
    };

    /// Close after a successful sync.
    pub const SYNCED: Self = Self {
        update_backup_date: true,
        update_mod_date: true,
    };
}

/// Handle to an open database. Valid only for the store that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbHandle(u8);

impl DbHandle {
    /// Wraps a raw handle value.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// Description of a database on a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    /// Database name, unique per card.
    pub name: String,
    /// Type tag.
    pub db_type: FourCc,
    /// Creator tag.
    pub creator: FourCc,
    /// Memory card number.
    pub card: u8,
    /// Version.
    pub version: u16,
    /// Modification number, bumped on every change.
    pub mod_number: u32,
    /// Database flags.
    pub flags: DbFlags,
    /// Miscellaneous flags.
    pub misc_flags: MiscFlags,
    /// Creation time.
    pub created_at: i64,
    /// Last modification time.
    pub modified_at: i64,
    /// Last backup time, zero if never backed up.
    pub backed_up_at: i64,
}

impl DatabaseDescriptor {
    /// Returns true for record databases.
    #[must_use]
    pub fn is_record_db(&self) -> bool {
        !self.flags.contains(DbFlags::RESOURCE)
    }

    /// Returns true if the database should be skipped by a sync.
    #[must_use]
    pub fn excluded_from_sync(&self) -> bool {
        self.misc_flags.contains(MiscFlags::EXCLUDE_FROM_SYNC)
    }
}

/// Size information, only present when [`InfoOptions::SIZE`] is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DbSizeInfo {
    /// Number of records.
    pub num_records: u32,
    /// Bytes used including per-record overhead.
    pub total_bytes: u32,
    /// Bytes of record data.
    pub data_bytes: u32,
    /// Application info block size.
    pub app_info_size: u32,
    /// Sort info block size.
    pub sort_info_size: u32,
}

/// Result of a catalog lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    /// Descriptor.
    pub descriptor: DatabaseDescriptor,
    /// Size information, if requested.
    pub size: Option<DbSizeInfo>,
    /// Largest record size, if requested for an open database.
    pub max_record_size: Option<u32>,
}

/// Parameters for creating a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDatabase {
    /// Name.
    pub name: String,
    /// Creator tag.
    pub creator: FourCc,
    /// Type tag.
    pub db_type: FourCc,
    /// Card number.
    pub card: u8,
    /// Flags.
    pub flags: DbFlags,
    /// Version.
    pub version: u16,
}

impl CreateDatabase {
    /// Describes a record database on card 0.
    pub fn record_db(name: impl Into<String>, creator: FourCc, db_type: FourCc) -> Self {
        Self {
            name: name.into(),
            creator,
            db_type,
            card: 0,
            flags: DbFlags::BACKUP,
            version: 0,
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// Sets the card.
    #[must_use]
    pub fn on_card(mut self, card: u8) -> Self {
        self.card = card;
        self
    }
}

/// Position of a "read next modified record" scan.
///
/// Owned by the caller, one per database and direction. Creating a new
/// cursor (or calling [`SyncCursor::reset`]) restarts the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncCursor {
    next_index: usize,
}

impl SyncCursor {
    /// A cursor at the start of the store.
    #[must_use]
    pub const fn new() -> Self {
        Self { next_index: 0 }
    }

    /// Restarts the scan.
    pub fn reset(&mut self) {
        self.next_index = 0;
    }

    /// Index of the next record to examine.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.next_index
    }

    /// Moves the cursor past `index`.
    pub fn advance_past(&mut self, index: usize) {
        self.next_index = index + 1;
    }
}
