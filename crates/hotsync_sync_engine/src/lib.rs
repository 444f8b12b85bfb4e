//! # HotSync Sync Engine
//!
//! Session and record reconciliation for HotSync.
//!
//! This crate provides:
//! - Session management (one live session, one open handheld database)
//! - Per-database state machine (idle → opening → reconciling → done)
//! - Fast and slow record reconciliation against a stored baseline
//! - Conflict detection and pluggable resolution
//! - Preference and app info exchange
//! - A simulated handheld for tests and the CLI
//!
//! ## Architecture
//!
//! A [`SyncSession`] walks the conduit registry in priority order. For each
//! handheld database it runs a [`DbSynchronizer`] against the desktop mirror
//! supplied by a [`MirrorProvider`]:
//! 1. Select fast or slow sync from the pairing and the stored metadata
//! 2. Apply handheld changes to the desktop, then desktop changes to the
//!    handheld
//! 3. Clear bookkeeping flags once both sides are safe
//! 4. Store the new baseline
//!
//! ## Key Invariants
//!
//! - Handheld flags are cleared only after the desktop was flushed
//! - Skipped records keep their flags and are retried next session
//! - The loser of a conflict survives as a duplicate record
//! - Cancellation is observed between records, never inside one
//! - A cancelled or failed database stamps no dates

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod device;
mod engine;
mod error;
mod metadata;
mod preferences;
mod session;

pub use config::SyncConfig;
pub use conflict::{
    resolve_conflict, Conflict, ConflictPolicy, ConflictResolution, ConflictResolver, TieBreak,
};
pub use device::{CallAppResult, CardInfo, RemoteDevice, SimulatedDevice, SystemInfo, UserInfo};
pub use engine::{
    select_mode, DbSyncJob, DbSyncReport, DbSyncState, DbSyncStats, DbSynchronizer,
};
pub use error::{CancelSource, SyncError, SyncResult};
pub use metadata::{
    CreatorMetadata, DbSyncMetadata, Fingerprint, JsonMetadataStore, MemoryMetadataStore,
    MetadataStore, PreferenceBaseline,
};
pub use preferences::{preference_winner, sync_preferences, PreferenceReport};
pub use session::{
    CancelToken, DbLogEntry, DbOutcome, DirectoryMirrors, HandleSlot, MemoryMirrors,
    MirrorProvider, OpenHandle, SessionLog, SessionOutcome, SyncManager, SyncSession,
};
