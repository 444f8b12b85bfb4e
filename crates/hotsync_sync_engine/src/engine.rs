//! Reconciliation of one handheld database with its desktop mirror.
//!
//! A [`DbSynchronizer`] walks one database pair through
//! `Idle → Opening → ModeSelection → Reconciling → Closing → Done`. Any
//! error moves it to `Failed`, a cancellation to `Cancelled`; both release
//! the open handles without stamping dates.

use crate::config::SyncConfig;
use crate::conflict::{resolve_conflict, Conflict, ConflictResolution};
use crate::device::RemoteDevice;
use crate::error::{SyncError, SyncResult};
use crate::metadata::{DbSyncMetadata, Fingerprint};
use crate::session::{CancelToken, HandleSlot};
use hotsync_conduit::SyncType;
use hotsync_storage::{
    CloseOptions, CreateDatabase, DatabaseDescriptor, DbFlags, DbHandle, ErrorSeverity, FourCc,
    InfoOptions, OpenMode, Record, RecordId, RecordStore, RecordWrite, StoreError, StoreResult,
    SyncCursor, WritableAttributes, MAX_RECORDS,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

const SYNC_OPEN_MODE: OpenMode =
    OpenMode::from_bits(OpenMode::SYNC.bits() | OpenMode::SHOW_SECRET.bits());

/// State of a database reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DbSyncState {
    /// Not started.
    Idle,
    /// Opening both databases.
    Opening,
    /// Choosing the sync type.
    ModeSelection,
    /// Exchanging records.
    Reconciling,
    /// Clearing flags and closing.
    Closing,
    /// Finished successfully.
    Done,
    /// Stopped by an error.
    Failed,
    /// Stopped by a cancellation.
    Cancelled,
}

impl DbSyncState {
    /// Returns true while databases may be open.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DbSyncState::Opening
                | DbSyncState::ModeSelection
                | DbSyncState::Reconciling
                | DbSyncState::Closing
        )
    }

    /// Returns true once the reconciliation is over.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DbSyncState::Done | DbSyncState::Failed | DbSyncState::Cancelled
        )
    }

    /// Returns true if `next` may follow this state.
    pub fn can_transition_to(&self, next: DbSyncState) -> bool {
        use DbSyncState::*;
        match (self, next) {
            (current, Failed | Cancelled) => !current.is_terminal(),
            (Idle, Opening)
            | (Opening, ModeSelection)
            | (ModeSelection, Reconciling)
            | (ModeSelection, Closing)
            | (Reconciling, Closing)
            | (Closing, Done) => true,
            _ => false,
        }
    }
}

/// Counters for one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DbSyncStats {
    /// Records looked at.
    pub records_examined: u64,
    /// Changes applied to the desktop.
    pub pulled: u64,
    /// Changes applied to the handheld.
    pub pushed: u64,
    /// Category moves on either side.
    pub category_changes: u64,
    /// Records changed on both sides.
    pub conflicts: u64,
    /// Records skipped and left for the next sync.
    pub skipped: u64,
    /// Yields to the handheld.
    pub yields: u64,
}

impl DbSyncStats {
    /// Total record changes on both sides.
    pub fn writes(&self) -> u64 {
        self.pulled + self.pushed + self.category_changes
    }
}

/// Result of reconciling one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbSyncReport {
    /// Owning creator.
    pub creator: FourCc,
    /// Database name.
    pub database: String,
    /// Sync type that ran.
    pub mode: SyncType,
    /// Counters.
    pub stats: DbSyncStats,
    /// Conflicts and how they were resolved.
    pub conflicts: Vec<Conflict>,
    /// The handheld's deleted records were purged and its flags reset.
    pub remote_flags_cleared: bool,
    /// The desktop's flags were reset.
    pub local_flags_cleared: bool,
    /// Why nothing was exchanged, for skipped databases.
    pub skipped: Option<String>,
}

impl DbSyncReport {
    fn new(job: &DbSyncJob, mode: SyncType) -> Self {
        Self {
            creator: job.creator,
            database: job.database.clone(),
            mode,
            stats: DbSyncStats::default(),
            conflicts: Vec::new(),
            remote_flags_cleared: false,
            local_flags_cleared: false,
            skipped: None,
        }
    }
}

/// What to synchronize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSyncJob {
    /// Owning creator.
    pub creator: FourCc,
    /// Handheld database name; the mirror uses the same name.
    pub database: String,
    /// Card holding the database.
    pub card: u8,
    /// Sync type requested by the conduit preference.
    pub requested: Option<SyncType>,
    /// The handheld last synced with this desktop.
    pub paired: bool,
    /// This desktop's PC identifier.
    pub pc_identifier: u32,
    /// Current time, recorded as the sync time.
    pub now: i64,
}

impl DbSyncJob {
    /// A job for a database on card 0.
    pub fn new(creator: FourCc, database: impl Into<String>) -> Self {
        Self {
            creator,
            database: database.into(),
            card: 0,
            requested: None,
            paired: false,
            pc_identifier: 0,
            now: 0,
        }
    }

    /// Sets the card.
    #[must_use]
    pub fn on_card(mut self, card: u8) -> Self {
        self.card = card;
        self
    }

    /// Sets the requested sync type.
    #[must_use]
    pub fn with_requested(mut self, requested: Option<SyncType>) -> Self {
        self.requested = requested;
        self
    }

    /// Sets the pairing information.
    #[must_use]
    pub fn with_pairing(mut self, pc_identifier: u32, paired: bool) -> Self {
        self.pc_identifier = pc_identifier;
        self.paired = paired;
        self
    }

    /// Sets the sync time.
    #[must_use]
    pub fn at(mut self, now: i64) -> Self {
        self.now = now;
        self
    }
}

/// Chooses the sync type for a database.
///
/// Non-reconciling requests are honoured as is. Otherwise slow sync is
/// chosen when requested, forced, when the database was never synced, or
/// when the handheld last synced with another desktop.
pub fn select_mode(job: &DbSyncJob, config: &SyncConfig, metadata: &DbSyncMetadata) -> SyncType {
    match job.requested {
        Some(requested) if !requested.is_reconcile() => return requested,
        Some(SyncType::Slow) => return SyncType::Slow,
        _ => {}
    }
    if config.force_slow
        || !metadata.has_synced()
        || !job.paired
        || metadata.pc_identifier != job.pc_identifier
    {
        SyncType::Slow
    } else {
        SyncType::Fast
    }
}

/// Drives one database pair through a reconciliation.
pub struct DbSynchronizer<'a> {
    config: &'a SyncConfig,
    cancel: &'a CancelToken,
    state: DbSyncState,
    local_handle: Option<DbHandle>,
}

impl<'a> DbSynchronizer<'a> {
    /// Creates an idle synchronizer.
    pub fn new(config: &'a SyncConfig, cancel: &'a CancelToken) -> Self {
        Self {
            config,
            cancel,
            state: DbSyncState::Idle,
            local_handle: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> DbSyncState {
        self.state
    }

    fn transition(&mut self, next: DbSyncState) -> SyncResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", self.state),
                to: format!("{next:?}"),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Reconciles `job.database` on the handheld with the same-named
    /// database in `local`, creating the mirror if needed.
    ///
    /// The handheld database is opened through `slot`. On success the
    /// baseline in `metadata` is replaced, except for backups.
    ///
    /// # Errors
    ///
    /// Fails on database- and session-level errors; record-level errors are
    /// logged and counted in [`DbSyncStats::skipped`]. Whatever the outcome,
    /// no handle stays open.
    pub fn run<R, L>(
        &mut self,
        remote: &mut R,
        slot: &mut HandleSlot,
        local: &mut L,
        metadata: &mut DbSyncMetadata,
        job: &DbSyncJob,
    ) -> SyncResult<DbSyncReport>
    where
        R: RemoteDevice + ?Sized,
        L: RecordStore + ?Sized,
    {
        let result = self.run_inner(remote, slot, local, metadata, job);
        if let Err(e) = &result {
            let next = if e.is_cancel() {
                DbSyncState::Cancelled
            } else {
                DbSyncState::Failed
            };
            if self.state.can_transition_to(next) {
                self.state = next;
            }
            if let Some(handle) = self.local_handle.take() {
                if let Err(close_err) = local.close(handle, CloseOptions::PLAIN) {
                    warn!(database = %job.database, error = %close_err, "failed to close mirror");
                }
            }
            if let Err(close_err) = slot.close(remote, CloseOptions::PLAIN) {
                debug!(database = %job.database, error = %close_err, "handheld close failed");
            }
            warn!(database = %job.database, state = ?self.state, error = %e, "database sync stopped");
        }
        result
    }

    fn run_inner<R, L>(
        &mut self,
        remote: &mut R,
        slot: &mut HandleSlot,
        local: &mut L,
        metadata: &mut DbSyncMetadata,
        job: &DbSyncJob,
    ) -> SyncResult<DbSyncReport>
    where
        R: RemoteDevice + ?Sized,
        L: RecordStore + ?Sized,
    {
        self.transition(DbSyncState::Opening)?;
        self.cancel.check()?;
        let rh = slot.open(remote, &job.database, job.card, SYNC_OPEN_MODE)?;
        let remote_info = remote.read_open_db_info(rh, InfoOptions::ATTRIBUTES)?;
        let lh = open_mirror(local, &remote_info.descriptor)?;
        self.local_handle = Some(lh);
        let local_info = local.read_open_db_info(lh, InfoOptions::ATTRIBUTES)?;

        self.transition(DbSyncState::ModeSelection)?;
        let mode = select_mode(job, self.config, metadata);
        let mut report = DbSyncReport::new(job, mode);
        if matches!(mode, SyncType::DoNothing | SyncType::Install) {
            info!(database = %job.database, %mode, "skipping database");
            report.skipped = Some(format!("sync type {mode}"));
            self.transition(DbSyncState::Closing)?;
            self.close(remote, slot, local, CloseOptions::PLAIN)?;
            self.transition(DbSyncState::Done)?;
            return Ok(report);
        }

        self.cancel.check()?;
        self.transition(DbSyncState::Reconciling)?;
        info!(creator = %job.creator, database = %job.database, %mode, "synchronizing database");

        let outcome = {
            let mut reconciler = Reconciler::new(
                &mut *remote,
                rh,
                &mut *local,
                lh,
                self.config,
                self.cancel,
                &*metadata,
                &job.database,
            );
            match mode {
                SyncType::Fast => reconciler.fast()?,
                SyncType::Slow => reconciler.slow()?,
                SyncType::HandheldToPc | SyncType::Backup => reconciler.copy_to_local()?,
                SyncType::PcToHandheld => reconciler.copy_to_remote()?,
                SyncType::DoNothing | SyncType::Install => {}
            }
            reconciler.sync_app_info(
                mode,
                remote_info.descriptor.flags,
                local_info.descriptor.flags,
            )?;
            let (remote_cleared, local_cleared) = reconciler.finish(mode != SyncType::Backup)?;
            let (records, app_info) = reconciler.new_baseline()?;
            Outcome {
                stats: reconciler.stats,
                conflicts: reconciler.conflicts,
                remote_cleared,
                local_cleared,
                records,
                app_info,
            }
        };

        self.transition(DbSyncState::Closing)?;
        let close = CloseOptions {
            update_backup_date: self.config.update_backup_date,
            update_mod_date: outcome.stats.pushed + outcome.stats.category_changes > 0,
        };
        self.close(remote, slot, local, close)?;

        if mode != SyncType::Backup {
            metadata.name = job.database.clone();
            metadata.pc_identifier = job.pc_identifier;
            metadata.last_sync = job.now.max(1);
            metadata.records = outcome.records;
            metadata.app_info = outcome.app_info;
        }

        report.stats = outcome.stats;
        report.conflicts = outcome.conflicts;
        report.remote_flags_cleared = outcome.remote_cleared;
        report.local_flags_cleared = outcome.local_cleared;
        self.transition(DbSyncState::Done)?;
        info!(
            database = %job.database,
            pulled = report.stats.pulled,
            pushed = report.stats.pushed,
            conflicts = report.stats.conflicts,
            skipped = report.stats.skipped,
            "database synchronized"
        );
        Ok(report)
    }

    fn close<R, L>(
        &mut self,
        remote: &mut R,
        slot: &mut HandleSlot,
        local: &mut L,
        options: CloseOptions,
    ) -> SyncResult<()>
    where
        R: RemoteDevice + ?Sized,
        L: RecordStore + ?Sized,
    {
        if let Some(handle) = self.local_handle.take() {
            local.close(handle, CloseOptions::PLAIN)?;
        }
        slot.close(remote, options)
    }
}

struct Outcome {
    stats: DbSyncStats,
    conflicts: Vec<Conflict>,
    remote_cleared: bool,
    local_cleared: bool,
    records: BTreeMap<RecordId, Fingerprint>,
    app_info: Option<Fingerprint>,
}

/// Opens the mirror of `descriptor`, creating it on first sync.
fn open_mirror<L: RecordStore + ?Sized>(
    local: &mut L,
    descriptor: &DatabaseDescriptor,
) -> SyncResult<DbHandle> {
    match local.open(&descriptor.name, descriptor.card, SYNC_OPEN_MODE) {
        Ok(handle) => Ok(handle),
        Err(StoreError::NotFound(_)) => {
            let mut flags = descriptor.flags;
            flags.remove(DbFlags::OPEN);
            flags.remove(DbFlags::APP_INFO_DIRTY);
            flags.remove(DbFlags::READ_ONLY);
            let spec = CreateDatabase {
                name: descriptor.name.clone(),
                creator: descriptor.creator,
                db_type: descriptor.db_type,
                card: descriptor.card,
                flags,
                version: descriptor.version,
            };
            let created = local.create(&spec)?;
            local.close(created, CloseOptions::PLAIN)?;
            debug!(database = %descriptor.name, "created mirror database");
            Ok(local.open(&descriptor.name, descriptor.card, SYNC_OPEN_MODE)?)
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToLocal,
    ToRemote,
    Both,
}

/// An archived record the desktop already holds; kept as archive only.
fn is_archive_entry(record: &Record) -> bool {
    record.attributes.deleted && record.attributes.archived && !record.attributes.dirty
}

fn differs_only_in_category(a: &Record, b: &Record) -> bool {
    a.data == b.data && a.attributes.secret == b.attributes.secret && a.category != b.category
}

fn same_state(a: &Record, b: &Record) -> bool {
    match (a.attributes.deleted, b.attributes.deleted) {
        (true, true) => true,
        (false, false) => a.same_content(b),
        _ => false,
    }
}

fn ignore_missing(result: StoreResult<()>) -> StoreResult<()> {
    match result {
        Err(StoreError::NotFound(_)) => Ok(()),
        other => other,
    }
}

fn clean_write(record: &Record) -> RecordWrite {
    record.to_write(WritableAttributes::clean(record.attributes.secret))
}

/// Every record in index order. Holes and hidden records are skipped.
///
/// A database larger than the 16-bit index range fails instead of being
/// read in part.
fn read_all<S: RecordStore + ?Sized>(store: &S, handle: DbHandle) -> StoreResult<Vec<Record>> {
    let count = store.record_count(handle)?;
    let Some(last) = count.checked_sub(1) else {
        return Ok(Vec::new());
    };
    let last = u16::try_from(last).map_err(|_| {
        StoreError::BadOperation(format!(
            "{count} records exceed the {MAX_RECORDS} addressable by index"
        ))
    })?;
    let mut records = Vec::with_capacity(usize::from(last) + 1);
    for index in 0..=last {
        match store.read_by_index(handle, index) {
            Ok(record) => records.push(record),
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

/// Every dirty or deleted record, read to exhaustion before anything is
/// changed so that index shifts cannot skip records.
fn read_modified<S: RecordStore + ?Sized>(store: &S, handle: DbHandle) -> StoreResult<Vec<Record>> {
    let mut cursor = SyncCursor::new();
    let mut records = Vec::new();
    while let Some(record) = store.read_next_modified(handle, &mut cursor)? {
        records.push(record);
    }
    Ok(records)
}

struct Reconciler<'a, R: ?Sized, L: ?Sized> {
    remote: &'a mut R,
    rh: DbHandle,
    local: &'a mut L,
    lh: DbHandle,
    config: &'a SyncConfig,
    cancel: &'a CancelToken,
    previous: &'a DbSyncMetadata,
    name: &'a str,
    stats: DbSyncStats,
    conflicts: Vec<Conflict>,
    unsettled: BTreeSet<RecordId>,
    relocated: BTreeMap<RecordId, RecordId>,
    remote_skipped: bool,
    push_failed: bool,
    since_yield: u32,
}

impl<'a, R, L> Reconciler<'a, R, L>
where
    R: RemoteDevice + ?Sized,
    L: RecordStore + ?Sized,
{
    #[allow(clippy::too_many_arguments)]
    fn new(
        remote: &'a mut R,
        rh: DbHandle,
        local: &'a mut L,
        lh: DbHandle,
        config: &'a SyncConfig,
        cancel: &'a CancelToken,
        previous: &'a DbSyncMetadata,
        name: &'a str,
    ) -> Self {
        Self {
            remote,
            rh,
            local,
            lh,
            config,
            cancel,
            previous,
            name,
            stats: DbSyncStats::default(),
            conflicts: Vec::new(),
            unsettled: BTreeSet::new(),
            relocated: BTreeMap::new(),
            remote_skipped: false,
            push_failed: false,
            since_yield: 0,
        }
    }

    /// Record boundary: cancellation, link and periodic yield.
    fn checkpoint(&mut self) -> SyncResult<()> {
        self.cancel.check()?;
        if !self.remote.is_connected() {
            return Err(StoreError::LostConnection.into());
        }
        self.stats.records_examined += 1;
        self.since_yield += 1;
        if self.config.yield_every > 0 && self.since_yield >= self.config.yield_every {
            self.since_yield = 0;
            self.remote.yield_cycles(self.config.yield_max_ms)?;
            self.stats.yields += 1;
            self.cancel.check()?;
        }
        Ok(())
    }

    fn mark_unsettled(&mut self, id: RecordId, direction: Direction) {
        self.stats.skipped += 1;
        self.unsettled.insert(id);
        match direction {
            Direction::ToLocal => self.remote_skipped = true,
            Direction::ToRemote => self.push_failed = true,
            Direction::Both => {
                self.remote_skipped = true;
                self.push_failed = true;
            }
        }
    }

    /// Turns record-level failures into skips.
    fn settle<T>(
        &mut self,
        id: RecordId,
        direction: Direction,
        result: StoreResult<T>,
    ) -> SyncResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.severity() == ErrorSeverity::Record => {
                warn!(database = self.name, record = %id, error = %e, "skipping record");
                self.mark_unsettled(id, direction);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn skip_busy(&mut self, id: RecordId, direction: Direction) {
        warn!(database = self.name, record = %id, "record busy on handheld, retrying next sync");
        self.mark_unsettled(id, direction);
    }

    fn current_id(&self, mut id: RecordId) -> RecordId {
        for _ in 0..=self.relocated.len() {
            match self.relocated.get(&id) {
                Some(&next) => id = next,
                None => break,
            }
        }
        id
    }

    fn local_record(&self, id: RecordId) -> SyncResult<Option<Record>> {
        match self.local.read_by_id(self.lh, id) {
            Ok(record) if is_archive_entry(&record) => Ok(None),
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remote_record(&self, id: RecordId) -> SyncResult<Option<Record>> {
        match self.remote.read_by_id(self.rh, id) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies the handheld version to the desktop.
    fn pull(&mut self, remote: &Record, local: Option<&Record>) -> SyncResult<()> {
        let id = remote.id;
        if remote.attributes.deleted {
            if remote.attributes.archived && !self.config.purge_archived_locally {
                let tombstone =
                    remote.to_write(WritableAttributes::archived_tombstone(remote.attributes.secret));
                let result = self.local.write(self.lh, tombstone);
                if self.settle(id, Direction::ToLocal, result)?.is_some() {
                    self.stats.pulled += 1;
                    debug!(database = self.name, record = %id, "archived on desktop");
                }
            } else if local.is_some() {
                let result = ignore_missing(self.local.delete(self.lh, id));
                if self.settle(id, Direction::ToLocal, result)?.is_some() {
                    self.stats.pulled += 1;
                    debug!(database = self.name, record = %id, "deleted on desktop");
                }
            }
            return Ok(());
        }

        if let Some(local) =
            local.filter(|l| !l.attributes.deleted && differs_only_in_category(l, remote))
        {
            let result = self
                .local
                .change_category(self.lh, id, local.category, remote.category);
            if self.settle(id, Direction::ToLocal, result)?.is_some() {
                self.stats.category_changes += 1;
                debug!(database = self.name, record = %id, "category changed on desktop");
            }
            return Ok(());
        }

        let result = self.local.write(self.lh, clean_write(remote));
        if self.settle(id, Direction::ToLocal, result)?.is_some() {
            self.stats.pulled += 1;
            debug!(database = self.name, record = %id, "pulled");
        }
        Ok(())
    }

    /// Applies the desktop version to the handheld.
    fn push(&mut self, local: &Record, remote: Option<&Record>) -> SyncResult<()> {
        let id = local.id;
        if local.attributes.deleted {
            if remote.is_some() {
                let result = ignore_missing(self.remote.delete(self.rh, id));
                if self.settle(id, Direction::ToRemote, result)?.is_some() {
                    self.stats.pushed += 1;
                    debug!(database = self.name, record = %id, "deleted on handheld");
                }
            }
            return Ok(());
        }

        if let Some(remote) =
            remote.filter(|r| !r.attributes.deleted && differs_only_in_category(local, r))
        {
            let result = self
                .remote
                .change_category(self.rh, id, remote.category, local.category);
            if self.settle(id, Direction::ToRemote, result)?.is_some() {
                self.stats.category_changes += 1;
                debug!(database = self.name, record = %id, "category changed on handheld");
            }
            return Ok(());
        }

        let result = self.remote.write(self.rh, clean_write(local));
        if self.settle(id, Direction::ToRemote, result)?.is_some() {
            self.stats.pushed += 1;
            debug!(database = self.name, record = %id, "pushed");
        }
        Ok(())
    }

    /// A record present on both sides.
    fn reconcile(&mut self, remote: Record, local: Record) -> SyncResult<()> {
        let (remote_changed, local_changed) = match self.previous.baseline(remote.id) {
            Some(base) => (
                remote.attributes.is_modified() || Fingerprint::of_record(&remote) != base,
                local.attributes.is_modified() || Fingerprint::of_record(&local) != base,
            ),
            // Copied by a session whose baseline was never saved.
            None if self.previous.has_synced() && !local.attributes.is_modified() => {
                (!same_state(&remote, &local), false)
            }
            None if self.previous.has_synced()
                && !remote.attributes.deleted
                && !local.attributes.deleted
                && !remote.same_content(&local) =>
            {
                return self.separate_creations(remote, local);
            }
            None => {
                let differ = !same_state(&remote, &local);
                (
                    remote.attributes.is_modified() || differ,
                    local.attributes.is_modified() || differ,
                )
            }
        };

        match (remote_changed, local_changed) {
            (false, false) => Ok(()),
            (true, false) => self.pull(&remote, Some(&local)),
            (false, true) => self.push(&local, Some(&remote)),
            (true, true) => match (remote.attributes.deleted, local.attributes.deleted) {
                (true, true) if remote.attributes.archived => self.pull(&remote, Some(&local)),
                (true, true) => Ok(()),
                // A modification beats a deletion.
                (true, false) => self.push(&local, Some(&remote)),
                (false, true) => self.pull(&remote, Some(&local)),
                (false, false) if remote.same_content(&local) => Ok(()),
                (false, false) => self.resolve(remote, local),
            },
        }
    }

    /// Both sides created a record under the same ID since the last sync.
    /// The desktop record moves to a fresh handheld ID and the handheld
    /// record is copied under the old one.
    fn separate_creations(&mut self, remote: Record, local: Record) -> SyncResult<()> {
        debug!(database = self.name, record = %remote.id, "same ID created on both sides");
        let id = local.id;
        self.push_new(vec![local])?;
        if self.unsettled.contains(&id) {
            // The handheld copy stays dirty until the desktop one moves.
            self.remote_skipped = true;
            return Ok(());
        }
        self.pull(&remote, None)
    }

    fn resolve(&mut self, remote: Record, local: Record) -> SyncResult<()> {
        let mut conflict = Conflict::new(local, remote);
        resolve_conflict(self.config.conflict_resolver.as_ref(), &mut conflict);
        self.stats.conflicts += 1;
        let id = conflict.id;
        let (winner, loser) = match conflict.outcome() {
            Some((winner, loser)) => (winner.clone(), loser.clone()),
            None => return Ok(()),
        };
        let resolution = conflict.resolution.unwrap_or(ConflictResolution::AcceptRemote);

        if conflict.is_category_only() {
            match resolution {
                ConflictResolution::AcceptRemote => {
                    let result =
                        self.local
                            .change_category(self.lh, id, loser.category, winner.category);
                    if self.settle(id, Direction::ToLocal, result)?.is_some() {
                        self.stats.category_changes += 1;
                    }
                }
                ConflictResolution::KeepLocal => {
                    let result =
                        self.remote
                            .change_category(self.rh, id, loser.category, winner.category);
                    if self.settle(id, Direction::ToRemote, result)?.is_some() {
                        self.stats.category_changes += 1;
                    }
                }
            }
            info!(database = self.name, record = %id, ?resolution, "resolved category conflict");
            self.conflicts.push(conflict);
            return Ok(());
        }

        match resolution {
            ConflictResolution::AcceptRemote => {
                let result = self.local.write(self.lh, clean_write(&winner));
                if self.settle(id, Direction::ToLocal, result)?.is_some() {
                    self.stats.pulled += 1;
                }
            }
            ConflictResolution::KeepLocal => {
                let result = self.remote.write(self.rh, clean_write(&winner));
                if self.settle(id, Direction::ToRemote, result)?.is_some() {
                    self.stats.pushed += 1;
                }
            }
        }

        // The losing version survives as a new record on both sides.
        let copy = RecordWrite::new(loser.category, loser.data.clone())
            .with_attributes(WritableAttributes::clean(loser.attributes.secret));
        let result = self.remote.write(self.rh, copy.clone());
        if let Some(duplicate) = self.settle(id, Direction::Both, result)? {
            self.claim_local_id(duplicate)?;
            let result = self.local.write(self.lh, copy.with_id(duplicate));
            if self.settle(duplicate, Direction::Both, result)?.is_some() {
                self.stats.pushed += 1;
                conflict.duplicate = Some(duplicate);
            }
        }
        info!(
            database = self.name,
            record = %id,
            ?resolution,
            duplicate = ?conflict.duplicate,
            "resolved conflict"
        );
        self.conflicts.push(conflict);
        Ok(())
    }

    /// A handheld record the desktop does not have.
    fn remote_only(&mut self, remote: Record) -> SyncResult<()> {
        if remote.attributes.deleted {
            return self.pull(&remote, None);
        }
        let unchanged = !remote.attributes.dirty
            && self.previous.baseline(remote.id) == Some(Fingerprint::of_record(&remote));
        if unchanged {
            // Deleted and purged on the desktop since the last sync.
            let result = ignore_missing(self.remote.delete(self.rh, remote.id));
            if self.settle(remote.id, Direction::ToRemote, result)?.is_some() {
                self.stats.pushed += 1;
                debug!(database = self.name, record = %remote.id, "deleted on handheld");
            }
            return Ok(());
        }
        self.pull(&remote, None)
    }

    /// Moves a local record away from an ID the handheld just assigned.
    fn claim_local_id(&mut self, id: RecordId) -> SyncResult<()> {
        let existing = match self.local.read_by_id(self.lh, id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let copy = RecordWrite::new(existing.category, existing.data.clone())
            .with_attributes(existing.attributes.writable());
        let moved = self.local.write(self.lh, copy)?;
        self.local.delete(self.lh, id)?;
        self.relocated.insert(id, moved);
        debug!(database = self.name, from = %id, to = %moved, "moved desktop record");
        Ok(())
    }

    /// Creates desktop-only records on the handheld and re-keys them to the
    /// handheld's IDs.
    fn push_new(&mut self, records: Vec<Record>) -> SyncResult<()> {
        for mut local in records {
            self.cancel.check()?;
            local.id = self.current_id(local.id);
            let write = RecordWrite::new(local.category, local.data.clone())
                .with_attributes(WritableAttributes::clean(local.attributes.secret));
            let result = self.remote.write(self.rh, write);
            let Some(new_id) = self.settle(local.id, Direction::ToRemote, result)? else {
                continue;
            };
            self.stats.pushed += 1;
            if new_id != local.id {
                self.claim_local_id(new_id)?;
                let rekeyed = clean_write(&local).with_id(new_id);
                let result = self
                    .local
                    .delete(self.lh, local.id)
                    .and_then(|()| self.local.write(self.lh, rekeyed));
                self.settle(new_id, Direction::Both, result)?;
                debug!(database = self.name, from = %local.id, to = %new_id, "re-keyed record");
            } else {
                debug!(database = self.name, record = %new_id, "created on handheld");
            }
        }
        Ok(())
    }

    fn fast(&mut self) -> SyncResult<()> {
        let remote_changes = read_modified(&*self.remote, self.rh)?;
        let mut seen = BTreeSet::new();
        for remote in remote_changes {
            self.checkpoint()?;
            seen.insert(remote.id);
            if remote.attributes.busy {
                self.skip_busy(remote.id, Direction::ToLocal);
                continue;
            }
            match self.local_record(remote.id)? {
                Some(local) => self.reconcile(remote, local)?,
                None => self.remote_only(remote)?,
            }
        }

        let local_changes = read_modified(&*self.local, self.lh)?;
        let mut created = Vec::new();
        for local in local_changes {
            if seen.contains(&local.id) || is_archive_entry(&local) {
                continue;
            }
            self.checkpoint()?;
            match self.remote_record(local.id)? {
                Some(remote) if remote.attributes.busy => {
                    self.skip_busy(remote.id, Direction::ToRemote);
                }
                Some(remote) => self.push(&local, Some(&remote))?,
                None if local.attributes.deleted => {}
                None => created.push(local),
            }
        }
        self.push_new(created)
    }

    fn slow(&mut self) -> SyncResult<()> {
        let remote_records = read_all(&*self.remote, self.rh)?;
        let local_records: Vec<Record> = read_all(&*self.local, self.lh)?
            .into_iter()
            .filter(|r| !is_archive_entry(r))
            .collect();
        let order: Vec<RecordId> = local_records.iter().map(|r| r.id).collect();
        let mut local_by_id: BTreeMap<RecordId, Record> =
            local_records.into_iter().map(|r| (r.id, r)).collect();

        for remote in remote_records {
            self.checkpoint()?;
            let local = local_by_id.remove(&remote.id);
            if remote.attributes.busy {
                self.skip_busy(remote.id, Direction::ToLocal);
                continue;
            }
            match local {
                Some(local) => self.reconcile(remote, local)?,
                None => self.remote_only(remote)?,
            }
        }

        let mut created = Vec::new();
        for id in order {
            let Some(mut local) = local_by_id.remove(&id) else {
                continue;
            };
            self.checkpoint()?;
            if local.attributes.deleted {
                continue;
            }
            let unchanged = !local.attributes.dirty
                && self.previous.baseline(local.id) == Some(Fingerprint::of_record(&local));
            if unchanged {
                // Deleted and purged on the handheld since the last sync.
                local.id = self.current_id(local.id);
                let result = ignore_missing(self.local.delete(self.lh, local.id));
                if self.settle(local.id, Direction::ToLocal, result)?.is_some() {
                    self.stats.pulled += 1;
                    debug!(database = self.name, record = %local.id, "deleted on desktop");
                }
            } else {
                created.push(local);
            }
        }
        self.push_new(created)
    }

    /// Handheld overwrites desktop.
    fn copy_to_local(&mut self) -> SyncResult<()> {
        let purged = self.local.purge_all(self.lh)?;
        debug!(database = self.name, purged, "cleared desktop database");
        for remote in read_all(&*self.remote, self.rh)? {
            self.checkpoint()?;
            if remote.attributes.busy {
                self.skip_busy(remote.id, Direction::ToLocal);
                continue;
            }
            self.pull(&remote, None)?;
        }
        Ok(())
    }

    /// Desktop overwrites handheld.
    fn copy_to_remote(&mut self) -> SyncResult<()> {
        let purged = self.remote.purge_all(self.rh)?;
        debug!(database = self.name, purged, "cleared handheld database");
        for local in read_all(&*self.local, self.lh)? {
            self.checkpoint()?;
            if local.attributes.deleted {
                continue;
            }
            let result = self.remote.write(self.rh, clean_write(&local));
            if self.settle(local.id, Direction::ToRemote, result)?.is_some() {
                self.stats.pushed += 1;
            }
        }
        Ok(())
    }

    /// Whole-block app info exchange; the handheld wins when both changed.
    fn sync_app_info(
        &mut self,
        mode: SyncType,
        remote_flags: DbFlags,
        local_flags: DbFlags,
    ) -> SyncResult<()> {
        let remote_block = self.remote.read_app_info(self.rh)?;
        let local_block = self.local.read_app_info(self.lh)?;
        if remote_block == local_block {
            return Ok(());
        }
        let toward_local = match mode {
            SyncType::HandheldToPc | SyncType::Backup => true,
            SyncType::PcToHandheld => false,
            _ => {
                let fingerprint = |b: &Option<Vec<u8>>| b.as_deref().map(Fingerprint::of_block);
                let base = self.previous.app_info;
                let (remote_changed, local_changed) = if self.previous.has_synced() {
                    (
                        remote_flags.contains(DbFlags::APP_INFO_DIRTY)
                            || fingerprint(&remote_block) != base,
                        local_flags.contains(DbFlags::APP_INFO_DIRTY)
                            || fingerprint(&local_block) != base,
                    )
                } else {
                    (true, true)
                };
                if !remote_changed && !local_changed {
                    return Ok(());
                }
                remote_changed
            }
        };
        if toward_local {
            if let Some(block) = remote_block {
                self.local.write_app_info(self.lh, &block)?;
                debug!(database = self.name, "app info pulled");
            }
        } else if let Some(block) = local_block {
            self.remote.write_app_info(self.rh, &block)?;
            debug!(database = self.name, "app info pushed");
        }
        Ok(())
    }

    /// Clears bookkeeping once it is safe to.
    ///
    /// The handheld is purged and reset only after the desktop flushed and
    /// no handheld record was skipped; the desktop is reset only if every
    /// push succeeded.
    fn finish(&mut self, clear_remote: bool) -> SyncResult<(bool, bool)> {
        self.local.flush()?;

        let remote_cleared = if !clear_remote {
            false
        } else if self.remote_skipped {
            warn!(database = self.name, "handheld records skipped, keeping handheld flags");
            false
        } else {
            let purged = self.remote.purge_deleted(self.rh)?;
            self.remote.reset_sync_flags(self.rh)?;
            debug!(database = self.name, purged, "handheld flags reset");
            true
        };

        let local_cleared = if self.push_failed {
            warn!(database = self.name, "pushes failed, keeping desktop flags");
            false
        } else {
            self.clean_local()?;
            self.local.reset_sync_flags(self.lh)?;
            self.local.flush()?;
            true
        };
        Ok((remote_cleared, local_cleared))
    }

    /// Drops desktop tombstones, keeping archived records unless configured
    /// otherwise.
    fn clean_local(&mut self) -> SyncResult<()> {
        if self.config.purge_archived_locally {
            self.local.purge_deleted(self.lh)?;
            return Ok(());
        }
        let tombstones: Vec<RecordId> = read_all(&*self.local, self.lh)?
            .into_iter()
            .filter(|r| r.attributes.deleted && !r.attributes.archived)
            .map(|r| r.id)
            .collect();
        for id in tombstones {
            ignore_missing(self.local.delete(self.lh, id))?;
        }
        Ok(())
    }

    /// Baseline after this sync: the desktop's live records, with skipped
    /// records keeping their previous entry.
    fn new_baseline(&self) -> SyncResult<(BTreeMap<RecordId, Fingerprint>, Option<Fingerprint>)> {
        let mut records: BTreeMap<RecordId, Fingerprint> = read_all(&*self.local, self.lh)?
            .iter()
            .filter(|r| !r.attributes.deleted)
            .map(|r| (r.id, Fingerprint::of_record(r)))
            .collect();
        for &id in &self.unsettled {
            match self.previous.baseline(id) {
                Some(fingerprint) => {
                    records.insert(id, fingerprint);
                }
                None => {
                    records.remove(&id);
                }
            }
        }
        let app_info = self
            .local
            .read_app_info(self.lh)?
            .as_deref()
            .map(Fingerprint::of_block);
        Ok((records, app_info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictPolicy;
    use crate::device::SimulatedDevice;
    use hotsync_storage::{CategoryId, InMemoryStore};

    const PC: u32 = 0xC0FFEE;

    fn memo_spec() -> CreateDatabase {
        CreateDatabase::record_db(
            "MemoDB",
            FourCc::from_bytes(*b"memo"),
            FourCc::from_bytes(*b"DATA"),
        )
    }

    fn device() -> SimulatedDevice {
        let mut store = InMemoryStore::new();
        store.ensure_database(&memo_spec()).unwrap();
        SimulatedDevice::new(store)
    }

    fn job() -> DbSyncJob {
        DbSyncJob::new(FourCc::from_bytes(*b"memo"), "MemoDB")
            .with_pairing(PC, true)
            .at(1_000)
    }

    fn text(s: &str) -> RecordWrite {
        RecordWrite::new(CategoryId::UNFILED, s.as_bytes().to_vec())
    }

    fn sync(
        device: &mut SimulatedDevice,
        local: &mut InMemoryStore,
        metadata: &mut DbSyncMetadata,
        config: &SyncConfig,
    ) -> DbSyncReport {
        let cancel = CancelToken::new();
        let mut slot = HandleSlot::new();
        let mut engine = DbSynchronizer::new(config, &cancel);
        let report = engine
            .run(device, &mut slot, local, metadata, &job())
            .unwrap();
        assert_eq!(engine.state(), DbSyncState::Done);
        assert!(!slot.is_open());
        report
    }

    fn payloads(store: &InMemoryStore) -> Vec<(RecordId, Vec<u8>)> {
        let mut records: Vec<_> = store
            .records("MemoDB")
            .unwrap()
            .into_iter()
            .filter(|r| !r.attributes.deleted)
            .map(|r| (r.id, r.data))
            .collect();
        records.sort();
        records
    }

    #[test]
    fn state_transitions() {
        use DbSyncState::*;
        assert!(Idle.can_transition_to(Opening));
        assert!(ModeSelection.can_transition_to(Closing));
        assert!(Reconciling.can_transition_to(Cancelled));
        assert!(!Idle.can_transition_to(Reconciling));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Opening));
        assert!(Reconciling.is_active());
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn mode_selection() {
        let config = SyncConfig::default();
        let never = DbSyncMetadata::new("MemoDB");
        let mut synced = DbSyncMetadata::new("MemoDB");
        synced.pc_identifier = PC;
        synced.last_sync = 10;

        assert_eq!(select_mode(&job(), &config, &never), SyncType::Slow);
        assert_eq!(select_mode(&job(), &config, &synced), SyncType::Fast);

        let other_pc = job().with_pairing(PC, false);
        assert_eq!(select_mode(&other_pc, &config, &synced), SyncType::Slow);

        let slow = job().with_requested(Some(SyncType::Slow));
        assert_eq!(select_mode(&slow, &config, &synced), SyncType::Slow);

        let backup = job().with_requested(Some(SyncType::Backup));
        assert_eq!(select_mode(&backup, &config, &never), SyncType::Backup);

        let forced = SyncConfig::new().with_force_slow(true);
        assert_eq!(select_mode(&job(), &forced, &synced), SyncType::Slow);
    }

    #[test]
    fn first_sync_creates_mirror_and_copies() {
        let mut device = device();
        device.store_mut().app_write("MemoDB", text("alpha")).unwrap();
        device.store_mut().app_write("MemoDB", text("beta")).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");

        let report = sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        assert_eq!(report.mode, SyncType::Slow);
        assert_eq!(report.stats.pulled, 2);
        assert_eq!(payloads(&local), payloads(device.store()));
        assert_eq!(metadata.records.len(), 2);
        assert_eq!(metadata.pc_identifier, PC);
        assert!(report.remote_flags_cleared);
        assert!(device
            .store()
            .records("MemoDB")
            .unwrap()
            .iter()
            .all(|r| !r.attributes.dirty));
    }

    #[test]
    fn new_desktop_records_take_handheld_ids() {
        let mut device = device();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());

        // Push a desktop record whose ID the handheld will not reuse.
        let local_id = local
            .app_write("MemoDB", text("from desktop").with_id(RecordId::new(500)))
            .unwrap();
        device.store_mut().app_write("MemoDB", text("from handheld")).unwrap();

        let report = sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        assert_eq!(report.mode, SyncType::Fast);
        assert_eq!(payloads(&local), payloads(device.store()));
        let ids: Vec<RecordId> = payloads(&local).into_iter().map(|(id, _)| id).collect();
        assert!(!ids.contains(&local_id));
    }

    #[test]
    fn same_id_created_on_both_sides_is_not_a_conflict() {
        let mut device = device();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());

        let id = device.store_mut().app_write("MemoDB", text("from handheld")).unwrap();
        local
            .app_write("MemoDB", text("from desktop").with_id(id))
            .unwrap();

        let report = sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        assert_eq!(report.mode, SyncType::Fast);
        assert_eq!(report.stats.conflicts, 0);
        assert_eq!(report.stats.pulled, 1);
        assert_eq!(report.stats.pushed, 1);
        assert_eq!(payloads(&local), payloads(device.store()));
        let notes: Vec<_> = payloads(&local).into_iter().map(|(_, data)| data).collect();
        assert_eq!(notes.len(), 2);
        assert!(notes.contains(&b"from handheld".to_vec()));
        assert!(notes.contains(&b"from desktop".to_vec()));
        let kept = payloads(&local).into_iter().find(|(i, _)| *i == id).unwrap();
        assert_eq!(kept.1, b"from handheld".to_vec());
    }

    #[test]
    fn category_only_change_uses_change_category() {
        let mut device = device();
        let id = device.store_mut().app_write("MemoDB", text("note")).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());

        let business = CategoryId::new(2).unwrap();
        device
            .store_mut()
            .app_set_category("MemoDB", id, business)
            .unwrap();
        local.reset_stats();
        let report = sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        assert_eq!(report.stats.category_changes, 1);
        assert_eq!(local.stats().writes, 0);
        assert_eq!(local.stats().category_changes, 1);
        let record = &local.records("MemoDB").unwrap()[0];
        assert_eq!(record.category, business);
    }

    #[test]
    fn deletion_loses_to_modification() {
        let mut device = device();
        let id = device.store_mut().app_write("MemoDB", text("v1")).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());

        device.store_mut().app_delete("MemoDB", id, false).unwrap();
        local
            .app_write("MemoDB", text("v2").with_id(id))
            .unwrap();

        let report = sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        assert_eq!(report.stats.conflicts, 0);
        assert_eq!(payloads(device.store()), vec![(id, b"v2".to_vec())]);
        assert_eq!(payloads(&local), vec![(id, b"v2".to_vec())]);
    }

    #[test]
    fn both_changed_keeps_loser_as_duplicate() {
        let mut device = device();
        let id = device.store_mut().app_write("MemoDB", text("v1")).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        let config = SyncConfig::new().with_conflict_resolver(ConflictPolicy::LocalWins);
        sync(&mut device, &mut local, &mut metadata, &config);

        device
            .store_mut()
            .app_write("MemoDB", text("handheld edit").with_id(id))
            .unwrap();
        local
            .app_write("MemoDB", text("desktop edit").with_id(id))
            .unwrap();

        let report = sync(&mut device, &mut local, &mut metadata, &config);
        assert_eq!(report.stats.conflicts, 1);
        let conflict = &report.conflicts[0];
        assert_eq!(conflict.resolution, Some(ConflictResolution::KeepLocal));
        let duplicate = conflict.duplicate.unwrap();

        let expected = {
            let mut v = vec![
                (id, b"desktop edit".to_vec()),
                (duplicate, b"handheld edit".to_vec()),
            ];
            v.sort();
            v
        };
        assert_eq!(payloads(&local), expected);
        assert_eq!(payloads(device.store()), expected);
    }

    #[test]
    fn busy_record_is_skipped_and_flags_kept() {
        let mut device = device();
        let busy = device.store_mut().app_write("MemoDB", text("editing")).unwrap();
        device.store_mut().app_write("MemoDB", text("done")).unwrap();
        device.store_mut().app_set_busy("MemoDB", busy, true).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");

        let report = sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        assert_eq!(report.stats.skipped, 1);
        assert!(!report.remote_flags_cleared);
        assert!(report.local_flags_cleared);
        assert_eq!(payloads(&local).len(), 1);
        assert!(!metadata.records.contains_key(&busy));

        device.store_mut().app_set_busy("MemoDB", busy, false).unwrap();
        let report = sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        assert_eq!(report.stats.skipped, 0);
        assert!(report.remote_flags_cleared);
        assert_eq!(payloads(&local), payloads(device.store()));
    }

    #[test]
    fn archived_deletion_is_kept_on_desktop() {
        let mut device = device();
        let id = device.store_mut().app_write("MemoDB", text("old")).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());

        device.store_mut().app_delete("MemoDB", id, true).unwrap();
        sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());

        assert!(device.store().records("MemoDB").unwrap().is_empty());
        let archived = &local.records("MemoDB").unwrap()[0];
        assert!(archived.attributes.deleted && archived.attributes.archived);
        assert_eq!(archived.data, b"old");
        assert!(!metadata.records.contains_key(&id));

        // A second sync leaves the archive alone.
        local.reset_stats();
        let report = sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        assert_eq!(report.stats.writes(), 0);
        assert_eq!(local.records("MemoDB").unwrap().len(), 1);

        let purge = SyncConfig::new().with_purge_archived_locally(true);
        sync(&mut device, &mut local, &mut metadata, &purge);
        assert!(local.records("MemoDB").unwrap().is_empty());
    }

    #[test]
    fn app_info_follows_changes() {
        let mut device = device();
        device
            .store_mut()
            .app_write_app_info("MemoDB", b"categories v1")
            .unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());

        let h = local.open("MemoDB", 0, OpenMode::READ).unwrap();
        assert_eq!(
            local.read_app_info(h).unwrap().as_deref(),
            Some(&b"categories v1"[..])
        );
        local.close(h, CloseOptions::PLAIN).unwrap();

        local.app_write_app_info("MemoDB", b"categories v2").unwrap();
        sync(&mut device, &mut local, &mut metadata, &SyncConfig::default());
        let h = device.store_mut().open("MemoDB", 0, OpenMode::READ).unwrap();
        assert_eq!(
            device.store().read_app_info(h).unwrap().as_deref(),
            Some(&b"categories v2"[..])
        );
    }

    #[test]
    fn handheld_to_pc_replaces_desktop() {
        let mut device = device();
        device.store_mut().app_write("MemoDB", text("keep")).unwrap();
        let mut local = InMemoryStore::new();
        local.ensure_database(&memo_spec()).unwrap();
        local.app_write("MemoDB", text("discard")).unwrap();
        let mut metadata = DbSyncMetadata::new("MemoDB");

        let cancel = CancelToken::new();
        let mut slot = HandleSlot::new();
        let config = SyncConfig::default();
        let mut engine = DbSynchronizer::new(&config, &cancel);
        let report = engine
            .run(
                &mut device,
                &mut slot,
                &mut local,
                &mut metadata,
                &job().with_requested(Some(SyncType::HandheldToPc)),
            )
            .unwrap();
        assert_eq!(report.mode, SyncType::HandheldToPc);
        assert_eq!(payloads(&local), payloads(device.store()));
    }

    #[test]
    fn backup_leaves_handheld_flags() {
        let mut device = device();
        device.store_mut().app_write("MemoDB", text("dirty")).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");

        let cancel = CancelToken::new();
        let mut slot = HandleSlot::new();
        let config = SyncConfig::default();
        let mut engine = DbSynchronizer::new(&config, &cancel);
        let report = engine
            .run(
                &mut device,
                &mut slot,
                &mut local,
                &mut metadata,
                &job().with_requested(Some(SyncType::Backup)),
            )
            .unwrap();
        assert!(!report.remote_flags_cleared);
        assert!(device.store().records("MemoDB").unwrap()[0].attributes.dirty);
        assert_eq!(payloads(&local), payloads(device.store()));
        assert!(!metadata.has_synced());
    }

    #[test]
    fn do_nothing_skips() {
        let mut device = device();
        device.store_mut().app_write("MemoDB", text("x")).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        let cancel = CancelToken::new();
        let mut slot = HandleSlot::new();
        let config = SyncConfig::default();
        let mut engine = DbSynchronizer::new(&config, &cancel);
        let report = engine
            .run(
                &mut device,
                &mut slot,
                &mut local,
                &mut metadata,
                &job().with_requested(Some(SyncType::DoNothing)),
            )
            .unwrap();
        assert!(report.skipped.is_some());
        assert!(payloads(&local).is_empty());
        assert_eq!(engine.state(), DbSyncState::Done);
    }

    #[test]
    fn cancellation_closes_without_stamping() {
        let mut device = device();
        for i in 0..5 {
            device
                .store_mut()
                .app_write("MemoDB", text(&format!("r{i}")))
                .unwrap();
        }
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut slot = HandleSlot::new();
        let config = SyncConfig::default();
        let mut engine = DbSynchronizer::new(&config, &cancel);
        let err = engine
            .run(&mut device, &mut slot, &mut local, &mut metadata, &job())
            .unwrap_err();
        assert!(err.is_cancel());
        assert_eq!(engine.state(), DbSyncState::Cancelled);
        assert!(!slot.is_open());
        assert!(!device.has_open_database());
        assert!(!metadata.has_synced());
        let info = device
            .store()
            .describe("MemoDB", 0, InfoOptions::ATTRIBUTES)
            .unwrap();
        assert_eq!(info.descriptor.backed_up_at, 0);
    }

    #[test]
    fn full_desktop_fails_database_and_keeps_handheld_flags() {
        let mut device = device();
        for i in 0..5 {
            device
                .store_mut()
                .app_write("MemoDB", text(&format!("r{i}")))
                .unwrap();
        }
        let mut local = InMemoryStore::new().with_max_records(3);
        let mut metadata = DbSyncMetadata::new("MemoDB");
        let cancel = CancelToken::new();
        let mut slot = HandleSlot::new();
        let config = SyncConfig::default();
        let mut engine = DbSynchronizer::new(&config, &cancel);
        let err = engine
            .run(&mut device, &mut slot, &mut local, &mut metadata, &job())
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::NoSpace { .. })));
        assert_eq!(engine.state(), DbSyncState::Failed);
        assert!(!slot.is_open());
        assert!(!metadata.has_synced());
        let remote = device.store().records("MemoDB").unwrap();
        assert_eq!(remote.len(), 5);
        assert!(remote.iter().all(|r| r.attributes.dirty));
    }

    #[test]
    fn rerun_is_rejected() {
        let mut device = device();
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        let cancel = CancelToken::new();
        let mut slot = HandleSlot::new();
        let config = SyncConfig::default();
        let mut engine = DbSynchronizer::new(&config, &cancel);
        engine
            .run(&mut device, &mut slot, &mut local, &mut metadata, &job())
            .unwrap();
        assert!(matches!(
            engine.run(&mut device, &mut slot, &mut local, &mut metadata, &job()),
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert_eq!(engine.state(), DbSyncState::Done);
    }

    #[test]
    fn yields_every_n_records() {
        let mut device = device();
        for i in 0..10 {
            device
                .store_mut()
                .app_write("MemoDB", text(&format!("r{i}")))
                .unwrap();
        }
        let mut local = InMemoryStore::new();
        let mut metadata = DbSyncMetadata::new("MemoDB");
        let config = SyncConfig::new().with_yield_every(3);
        let report = sync(&mut device, &mut local, &mut metadata, &config);
        assert_eq!(report.stats.yields, 3);
        assert_eq!(device.yield_count(), 3);
    }
}
