//! # HotSync Storage
//!
//! Record store abstraction for HotSync.
//!
//! Both sides of a synchronization, the handheld device and the desktop
//! mirror, are reached through the [`RecordStore`] trait: open a database,
//! enumerate and edit its records, read catalog information.
//!
//! ## Design Principles
//!
//! - At most one handle per exclusive open; stores may cap open handles
//! - The busy attribute belongs to the handheld and is never written
//! - Size fields are only computed when requested
//! - Result codes follow the sync manager numbering ([`ResultCode`])
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For tests and simulated devices
//! - [`FileStore`] - Persistent directory-backed mirror
//!
//! ## Example
//!
//! ```rust
//! use hotsync_storage::{
//!     CategoryId, CreateDatabase, FourCc, InMemoryStore, RecordStore, RecordWrite, SyncCursor,
//! };
//!
//! let mut store = InMemoryStore::new();
//! let spec = CreateDatabase::record_db("MemoDB", "memo".parse().unwrap(), "DATA".parse().unwrap());
//! store.ensure_database(&spec).unwrap();
//! store.app_write("MemoDB", RecordWrite::new(CategoryId::UNFILED, b"buy milk".to_vec())).unwrap();
//!
//! let handle = store.open("MemoDB", 0, hotsync_storage::OpenMode::SYNC).unwrap();
//! let mut cursor = SyncCursor::new();
//! let changed = store.read_next_modified(handle, &mut cursor).unwrap().unwrap();
//! assert!(changed.attributes.dirty);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
mod code;
mod database;
mod error;
mod file;
mod memory;
mod record;
mod store;
mod tag;

pub use catalog::{find_by_name, DbSearch, SearchOptions};
pub use code::{
    ErrorClass, ResultCode, COND_ERR_CLASS, EXPAPI_ERR_CLASS, HSAPP_ERR_CLASS,
    SYNC_ERR_CLASS, SYNC_FATAL_ERR_MASK, TRANS_ERR_CLASS, VFSAPI_ERR_CLASS,
};
pub use database::{
    CloseOptions, CreateDatabase, DatabaseDescriptor, DbFlags, DbHandle, DbInfo, DbSizeInfo,
    InfoOptions, MiscFlags, OpenMode, SyncCursor, MAX_DB_NAME_LEN,
    MAX_RECORDS,
};
pub use error::{ErrorSeverity, StoreError, StoreResult};
pub use file::FileStore;
pub use memory::{InMemoryStore, StoreImage, StoreStats};
pub use record::{
    CategoryId, Preference, PreferenceKey, Record, RecordAttributes, RecordId, RecordWrite,
    WritableAttributes,
};
pub use store::RecordStore;
pub use tag::FourCc;
