//! Sync sessions.
//!
//! A [`SyncManager`] hands out at most one live [`SyncSession`]. The session
//! owns the single open handheld database, the cancellation token and the
//! per-database log.

use crate::config::SyncConfig;
use crate::device::RemoteDevice;
use crate::engine::{DbSyncJob, DbSyncReport, DbSynchronizer};
use crate::error::{CancelSource, SyncError, SyncResult};
use crate::metadata::{CreatorMetadata, DbSyncMetadata, MetadataStore};
use crate::preferences::{sync_preferences, PreferenceReport};
use hotsync_conduit::{ConduitConfig, ConduitRegistry, PreferenceScope, SyncType};
use hotsync_storage::{
    find_by_name, CloseOptions, CreateDatabase, DbHandle, DbInfo, DbSearch, FileStore, FourCc,
    InMemoryStore, InfoOptions, OpenMode, RecordStore, SearchOptions, StoreError,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Shared cancellation flag.
///
/// Clones observe the same flag. The engine checks it between records, so
/// no record is ever half-written.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Fails with [`SyncError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled(CancelSource::Local));
        }
        Ok(())
    }
}

/// The handheld database currently open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    /// Handle returned by the device.
    pub handle: DbHandle,
    /// Database name.
    pub name: String,
    /// Card number.
    pub card: u8,
}

/// Holder of the one handheld database a session may have open.
#[derive(Debug, Default)]
pub struct HandleSlot {
    open: Option<OpenHandle>,
}

impl HandleSlot {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    fn occupied(&self) -> SyncResult<()> {
        match &self.open {
            Some(current) => Err(StoreError::AlreadyOpen(current.name.clone()).into()),
            None => Ok(()),
        }
    }

    /// Opens a database on `device`.
    ///
    /// # Errors
    ///
    /// `AlreadyOpen` without contacting the device if a database is open.
    pub fn open<D: RecordStore + ?Sized>(
        &mut self,
        device: &mut D,
        name: &str,
        card: u8,
        mode: OpenMode,
    ) -> SyncResult<DbHandle> {
        self.occupied()?;
        let handle = device.open(name, card, mode)?;
        self.open = Some(OpenHandle {
            handle,
            name: name.to_string(),
            card,
        });
        Ok(handle)
    }

    /// Creates and opens a database on `device`.
    ///
    /// # Errors
    ///
    /// `AlreadyOpen` without contacting the device if a database is open.
    pub fn create<D: RecordStore + ?Sized>(
        &mut self,
        device: &mut D,
        spec: &CreateDatabase,
    ) -> SyncResult<DbHandle> {
        self.occupied()?;
        let handle = device.create(spec)?;
        self.open = Some(OpenHandle {
            handle,
            name: spec.name.clone(),
            card: spec.card,
        });
        Ok(handle)
    }

    /// Closes the open database, if any. The slot is emptied even when the
    /// device reports an error.
    pub fn close<D: RecordStore + ?Sized>(
        &mut self,
        device: &mut D,
        options: CloseOptions,
    ) -> SyncResult<()> {
        match self.open.take() {
            Some(open) => Ok(device.close(open.handle, options)?),
            None => Ok(()),
        }
    }

    /// The open database.
    pub fn current(&self) -> Option<&OpenHandle> {
        self.open.as_ref()
    }

    /// Returns true while a database is open.
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

/// Outcome of one database in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DbOutcome {
    /// Reconciled with the given sync type.
    Synced(SyncType),
    /// Left alone, with the reason.
    Skipped(String),
    /// Failed, with the reason.
    Failed(String),
    /// Interrupted by a cancellation.
    Aborted(String),
    /// Not reached because the session stopped earlier.
    NotAttempted,
}

impl fmt::Display for DbOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbOutcome::Synced(mode) => write!(f, "synced ({mode})"),
            DbOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
            DbOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            DbOutcome::Aborted(reason) => write!(f, "aborted: {reason}"),
            DbOutcome::NotAttempted => f.write_str("not attempted"),
        }
    }
}

/// Log line for one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbLogEntry {
    /// Owning creator.
    pub creator: FourCc,
    /// Database name.
    pub database: String,
    /// What happened.
    pub outcome: DbOutcome,
    /// Details for databases that ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<DbSyncReport>,
}

/// Overall outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Every database synced or was skipped on purpose.
    #[default]
    Completed,
    /// The session ran to the end but some databases failed.
    CompletedWithErrors,
    /// Cancelled by either side.
    Cancelled,
    /// Stopped by a session-level error.
    Failed,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::CompletedWithErrors => "completed with errors",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Failed => "failed",
        })
    }
}

/// Per-database log of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionLog {
    /// One entry per database, in sync order.
    pub entries: Vec<DbLogEntry>,
    /// Overall outcome.
    pub outcome: SessionOutcome,
}

impl SessionLog {
    /// The entry for `database`.
    pub fn entry(&self, database: &str) -> Option<&DbLogEntry> {
        self.entries.iter().find(|e| e.database == database)
    }

    /// Human-readable lines, as forwarded to the handheld.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{} {}: {}", e.creator, e.database, e.outcome))
            .collect();
        lines.push(format!("HotSync {}", self.outcome));
        lines
    }

    fn push(&mut self, creator: FourCc, database: impl Into<String>, outcome: DbOutcome) {
        self.entries.push(DbLogEntry {
            creator,
            database: database.into(),
            outcome,
            report: None,
        });
    }
}

/// Supplies the desktop mirror store for each conduit.
pub trait MirrorProvider {
    /// The store holding `conduit`'s mirror databases.
    fn mirror(&mut self, conduit: &ConduitConfig) -> SyncResult<&mut dyn RecordStore>;
}

/// Mirrors kept in memory, one store per creator.
#[derive(Debug, Default)]
pub struct MemoryMirrors {
    stores: BTreeMap<FourCc, InMemoryStore>,
}

impl MemoryMirrors {
    /// No mirrors yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a prepared store for `creator`.
    pub fn insert(&mut self, creator: FourCc, store: InMemoryStore) {
        self.stores.insert(creator, store);
    }

    /// The store for `creator`.
    pub fn store(&self, creator: FourCc) -> Option<&InMemoryStore> {
        self.stores.get(&creator)
    }

    /// The store for `creator`, mutably.
    pub fn store_mut(&mut self, creator: FourCc) -> Option<&mut InMemoryStore> {
        self.stores.get_mut(&creator)
    }
}

impl MirrorProvider for MemoryMirrors {
    fn mirror(&mut self, conduit: &ConduitConfig) -> SyncResult<&mut dyn RecordStore> {
        Ok(self
            .stores
            .entry(conduit.creator)
            .or_insert_with(InMemoryStore::new))
    }
}

/// Mirrors persisted under a root directory, one [`FileStore`] per conduit
/// in the conduit's directory (or a directory named after the creator).
#[derive(Debug)]
pub struct DirectoryMirrors {
    root: PathBuf,
    open: BTreeMap<FourCc, FileStore>,
}

impl DirectoryMirrors {
    /// Mirrors under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: BTreeMap::new(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory used for `conduit`.
    pub fn path_for(&self, conduit: &ConduitConfig) -> PathBuf {
        let dir = conduit
            .directory
            .clone()
            .unwrap_or_else(|| conduit.creator.to_string_lossy());
        self.root.join(dir)
    }
}

impl MirrorProvider for DirectoryMirrors {
    fn mirror(&mut self, conduit: &ConduitConfig) -> SyncResult<&mut dyn RecordStore> {
        let path = self.path_for(conduit);
        let store = match self.open.entry(conduit.creator) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(path = %path.display(), "opening mirror store");
                entry.insert(FileStore::open(&path, true)?)
            }
        };
        Ok(store)
    }
}

#[derive(Debug)]
struct SessionGuard {
    active: Arc<Mutex<bool>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *self.active.lock() = false;
    }
}

/// Hands out sync sessions, one at a time.
#[derive(Debug, Clone, Default)]
pub struct SyncManager {
    active: Arc<Mutex<bool>>,
}

impl SyncManager {
    /// Creates a manager with no live session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a session is alive.
    pub fn is_active(&self) -> bool {
        *self.active.lock()
    }

    /// Starts a session for the desktop identified by `pc_identifier`.
    ///
    /// # Errors
    ///
    /// `SessionActive` until the previous session is dropped.
    pub fn begin_session(&self, pc_identifier: u32, config: SyncConfig) -> SyncResult<SyncSession> {
        {
            let mut active = self.active.lock();
            if *active {
                return Err(SyncError::SessionActive);
            }
            *active = true;
        }
        info!(pc_identifier = %format_args!("{pc_identifier:#010x}"), "sync session started");
        Ok(SyncSession {
            _guard: SessionGuard {
                active: Arc::clone(&self.active),
            },
            config,
            pc_identifier,
            cancel: CancelToken::new(),
            slot: HandleSlot::new(),
            clock: None,
        })
    }
}

/// Where a database comes from in the session plan.
#[derive(Debug)]
enum PlanItem {
    Sync { database: String, card: u8 },
    Skip { database: String, reason: String },
}

#[derive(Debug)]
struct CreatorPlan {
    conduit: ConduitConfig,
    items: Vec<PlanItem>,
}

/// One live sync session.
///
/// Dropping the session ends it and lets the manager start another.
#[derive(Debug)]
pub struct SyncSession {
    _guard: SessionGuard,
    config: SyncConfig,
    pc_identifier: u32,
    cancel: CancelToken,
    slot: HandleSlot,
    clock: Option<i64>,
}

impl SyncSession {
    /// Token that cancels this session.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Session configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// This desktop's PC identifier.
    pub fn pc_identifier(&self) -> u32 {
        self.pc_identifier
    }

    /// Fixes the session time instead of reading the system clock.
    #[must_use]
    pub fn with_time(mut self, now: i64) -> Self {
        self.clock = Some(now);
        self
    }

    /// The handheld database currently open.
    pub fn open_handle(&self) -> Option<&OpenHandle> {
        self.slot.current()
    }

    /// Opens a handheld database outside a full sync.
    ///
    /// # Errors
    ///
    /// `AlreadyOpen` if the session already holds a database.
    pub fn open_remote<D: RemoteDevice + ?Sized>(
        &mut self,
        device: &mut D,
        name: &str,
        card: u8,
        mode: OpenMode,
    ) -> SyncResult<DbHandle> {
        self.slot.open(device, name, card, mode)
    }

    /// Closes the handheld database opened with [`Self::open_remote`].
    pub fn close_remote<D: RemoteDevice + ?Sized>(
        &mut self,
        device: &mut D,
        options: CloseOptions,
    ) -> SyncResult<()> {
        self.slot.close(device, options)
    }

    fn now(&self) -> i64 {
        self.clock.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
                .unwrap_or(0)
        })
    }

    /// Synchronizes every registered conduit in priority order.
    ///
    /// Databases are discovered first, then reconciled one at a time. A
    /// cancellation or a session-level error stops the session: the
    /// current database is logged as aborted (or failed) and the rest as
    /// not attempted. The sync is recorded on the handheld only if the
    /// session ran to the end.
    pub fn run<D, M, S>(
        &mut self,
        device: &mut D,
        registry: &mut ConduitRegistry,
        mirrors: &mut M,
        metadata: &mut S,
    ) -> SessionLog
    where
        D: RemoteDevice + ?Sized,
        M: MirrorProvider + ?Sized,
        S: MetadataStore + ?Sized,
    {
        let now = self.now();
        let mut log = SessionLog::default();
        let outcome = match self.run_inner(device, registry, mirrors, metadata, now, &mut log) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "sync session stopped");
                if e.is_cancel() {
                    SessionOutcome::Cancelled
                } else {
                    SessionOutcome::Failed
                }
            }
        };
        log.outcome = outcome;

        if let Err(e) = self.slot.close(device, CloseOptions::PLAIN) {
            debug!(error = %e, "closing leftover handheld database failed");
        }
        if matches!(
            outcome,
            SessionOutcome::Completed | SessionOutcome::CompletedWithErrors
        ) {
            if let Err(e) = device.record_sync(self.pc_identifier, now) {
                warn!(error = %e, "failed to record sync on handheld");
            }
        }
        if device.is_connected() {
            for line in log.lines() {
                if let Err(e) = device.add_log_entry(&line) {
                    debug!(error = %e, "failed to forward log");
                    break;
                }
            }
        }
        info!(%outcome, databases = log.entries.len(), "sync session finished");
        log
    }

    fn run_inner<D, M, S>(
        &mut self,
        device: &mut D,
        registry: &mut ConduitRegistry,
        mirrors: &mut M,
        metadata: &mut S,
        now: i64,
        log: &mut SessionLog,
    ) -> SyncResult<SessionOutcome>
    where
        D: RemoteDevice + ?Sized,
        M: MirrorProvider + ?Sized,
        S: MetadataStore + ?Sized,
    {
        let user = device.read_user_id()?;
        let paired = user.last_sync_pc == self.pc_identifier;
        debug!(user = %user.user_name, paired, "handheld identified");

        let plan = self.plan(device, registry)?;
        let mut stop: Option<SessionOutcome> = None;
        let mut had_errors = false;

        for creator_plan in plan {
            let conduit = creator_plan.conduit;
            let creator = conduit.creator;
            let mut creator_meta = if stop.is_none() {
                match metadata.load(creator) {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        warn!(%creator, error = %e, "failed to load sync metadata");
                        had_errors = true;
                        None
                    }
                }
            } else {
                None
            };
            let first_sync = creator_meta
                .as_ref()
                .map_or(true, |meta| meta.databases.is_empty());

            for item in creator_plan.items {
                let (database, card) = match item {
                    PlanItem::Skip { database, reason } => {
                        log.push(creator, database, DbOutcome::Skipped(reason));
                        continue;
                    }
                    PlanItem::Sync { database, card } => (database, card),
                };
                if stop.is_some() {
                    log.push(creator, database, DbOutcome::NotAttempted);
                    continue;
                }
                let Some(meta) = creator_meta.as_mut() else {
                    log.push(
                        creator,
                        database,
                        DbOutcome::Failed("sync metadata unavailable".to_string()),
                    );
                    continue;
                };
                let result = self.sync_database(
                    device, &conduit, mirrors, metadata, meta, &database, card, paired, now,
                );
                match result {
                    Ok(report) => {
                        let outcome = match &report.skipped {
                            Some(reason) => DbOutcome::Skipped(reason.clone()),
                            None => DbOutcome::Synced(report.mode),
                        };
                        log.entries.push(DbLogEntry {
                            creator,
                            database,
                            outcome,
                            report: Some(report),
                        });
                    }
                    Err(e) if e.is_cancel() => {
                        log.push(creator, database, DbOutcome::Aborted(e.to_string()));
                        stop = Some(SessionOutcome::Cancelled);
                    }
                    Err(e) if e.is_fatal() => {
                        log.push(creator, database, DbOutcome::Failed(e.to_string()));
                        stop = Some(SessionOutcome::Failed);
                    }
                    Err(e) => {
                        log.push(creator, database, DbOutcome::Failed(e.to_string()));
                        had_errors = true;
                    }
                }
            }

            if stop.is_some() || !conduit.enabled {
                continue;
            }
            if let Some(meta) = creator_meta.as_mut() {
                let slow = self.config.force_slow || !paired || first_sync;
                match self.sync_creator_preferences(device, &conduit, mirrors, metadata, meta, slow)
                {
                    Ok(report) => {
                        debug!(%creator, pulled = report.pulled, pushed = report.pushed, "preferences synced");
                    }
                    Err(e) if e.is_cancel() || e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(%creator, error = %e, "preference sync failed");
                        log.push(creator, "preferences", DbOutcome::Failed(e.to_string()));
                        had_errors = true;
                    }
                }
            }
            if conduit.sync_preference.scope == PreferenceScope::Temporary {
                registry.clear_temporary_preference(creator)?;
                debug!(%creator, "temporary sync preference consumed");
            }
        }

        Ok(match stop {
            Some(outcome) => outcome,
            None if had_errors => SessionOutcome::CompletedWithErrors,
            None => SessionOutcome::Completed,
        })
    }

    /// Discovers the databases of every conduit, in priority order.
    fn plan<D: RemoteDevice + ?Sized>(
        &self,
        device: &D,
        registry: &ConduitRegistry,
    ) -> SyncResult<Vec<CreatorPlan>> {
        let mut plan = Vec::new();
        for creator in registry.list_creators() {
            let conduit = registry.get(creator)?.clone();
            let label = conduit
                .remote
                .clone()
                .unwrap_or_else(|| conduit.creator.to_string());
            if !conduit.enabled {
                plan.push(CreatorPlan {
                    conduit,
                    items: vec![PlanItem::Skip {
                        database: label,
                        reason: "conduit disabled".to_string(),
                    }],
                });
                continue;
            }

            let found: Vec<DbInfo> = match &conduit.remote {
                Some(name) => match find_by_name(device, name, 0, InfoOptions::ATTRIBUTES) {
                    Ok(info) => vec![info],
                    Err(StoreError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(e.into()),
                },
                None => DbSearch::new(
                    FourCc::WILDCARD,
                    creator,
                    SearchOptions::LATEST,
                    InfoOptions::ATTRIBUTES,
                )
                .collect(device)?,
            };

            let mut items = Vec::new();
            if found.is_empty() {
                items.push(PlanItem::Skip {
                    database: label,
                    reason: "no database on handheld".to_string(),
                });
            }
            for info in found {
                let descriptor = info.descriptor;
                let item = if descriptor.excluded_from_sync() {
                    PlanItem::Skip {
                        database: descriptor.name,
                        reason: "excluded from sync".to_string(),
                    }
                } else if !descriptor.is_record_db() {
                    PlanItem::Skip {
                        database: descriptor.name,
                        reason: "resource database".to_string(),
                    }
                } else {
                    PlanItem::Sync {
                        database: descriptor.name,
                        card: descriptor.card,
                    }
                };
                items.push(item);
            }
            plan.push(CreatorPlan { conduit, items });
        }
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn sync_database<D, M, S>(
        &mut self,
        device: &mut D,
        conduit: &ConduitConfig,
        mirrors: &mut M,
        metadata: &mut S,
        creator_meta: &mut CreatorMetadata,
        database: &str,
        card: u8,
        paired: bool,
        now: i64,
    ) -> SyncResult<DbSyncReport>
    where
        D: RemoteDevice + ?Sized,
        M: MirrorProvider + ?Sized,
        S: MetadataStore + ?Sized,
    {
        let local = mirrors.mirror(conduit)?;
        let mut db_meta = creator_meta
            .database(database)
            .cloned()
            .unwrap_or_else(|| DbSyncMetadata::new(database));
        let job = DbSyncJob::new(conduit.creator, database)
            .on_card(card)
            .with_requested(conduit.sync_preference.requested())
            .with_pairing(self.pc_identifier, paired)
            .at(now);

        let mut engine = DbSynchronizer::new(&self.config, &self.cancel);
        let report = engine.run(device, &mut self.slot, local, &mut db_meta, &job)?;
        if report.skipped.is_none() {
            creator_meta.set_database(db_meta);
            metadata.save(creator_meta)?;
        }
        Ok(report)
    }

    fn sync_creator_preferences<D, M, S>(
        &self,
        device: &mut D,
        conduit: &ConduitConfig,
        mirrors: &mut M,
        metadata: &mut S,
        creator_meta: &mut CreatorMetadata,
        slow: bool,
    ) -> SyncResult<PreferenceReport>
    where
        D: RemoteDevice + ?Sized,
        M: MirrorProvider + ?Sized,
        S: MetadataStore + ?Sized,
    {
        self.cancel.check()?;
        let local = mirrors.mirror(conduit)?;
        let report = sync_preferences(device, &mut *local, conduit.creator, creator_meta, slow)?;
        local.flush()?;
        metadata.save(creator_meta)?;
        Ok(report)
    }
}
