//! In-memory record store.

use crate::database::{
    CloseOptions, CreateDatabase, DatabaseDescriptor, DbFlags, DbHandle, DbInfo, DbSizeInfo,
    InfoOptions, MiscFlags, OpenMode, SyncCursor, MAX_DB_NAME_LEN, MAX_RECORDS,
};
use crate::error::{StoreError, StoreResult};
use crate::record::{
    CategoryId, Preference, PreferenceKey, Record, RecordAttributes, RecordId, RecordWrite,
};
use crate::store::RecordStore;
use crate::tag::FourCc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-record storage overhead counted in `total_bytes`.
const RECORD_OVERHEAD: u32 = 8;
/// Per-database header size counted in `total_bytes`.
const HEADER_SIZE: u32 = 78;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub(crate) id: RecordId,
    pub(crate) category: CategoryId,
    pub(crate) attributes: RecordAttributes,
    pub(crate) data: Vec<u8>,
    pub(crate) modified_at: Option<i64>,
}

impl StoredRecord {
    fn to_record(&self, index: usize) -> Record {
        Record {
            id: self.id,
            index: u16::try_from(index).unwrap_or(u16::MAX),
            category: self.category,
            attributes: self.attributes,
            data: self.data.clone(),
            modified_at: self.modified_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredDatabase {
    pub(crate) descriptor: DatabaseDescriptor,
    pub(crate) records: Vec<StoredRecord>,
    pub(crate) app_info: Option<Vec<u8>>,
    pub(crate) sort_info: Option<Vec<u8>>,
    pub(crate) next_id: u32,
}

impl StoredDatabase {
    fn position(&self, id: RecordId) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    fn data_bytes(&self) -> u32 {
        let bytes: usize = self.records.iter().map(|r| r.data.len()).sum();
        u32::try_from(bytes).unwrap_or(u32::MAX)
    }

    fn size_info(&self) -> DbSizeInfo {
        let num_records = u32::try_from(self.records.len()).unwrap_or(u32::MAX);
        let data_bytes = self.data_bytes();
        let block_len = |b: &Option<Vec<u8>>| {
            b.as_ref()
                .map_or(0, |b| u32::try_from(b.len()).unwrap_or(u32::MAX))
        };
        DbSizeInfo {
            num_records,
            total_bytes: HEADER_SIZE
                .saturating_add(data_bytes)
                .saturating_add(num_records.saturating_mul(RECORD_OVERHEAD)),
            data_bytes,
            app_info_size: block_len(&self.app_info),
            sort_info_size: block_len(&self.sort_info),
        }
    }

    fn allocate_id(&mut self) -> RecordId {
        loop {
            let id = RecordId::new(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1) & 0x00FF_FFFF;
            if id.as_u32() != 0 && self.position(id).is_none() {
                return id;
            }
        }
    }

    fn touch(&mut self, now: i64) {
        self.descriptor.mod_number = self.descriptor.mod_number.wrapping_add(1);
        self.descriptor.modified_at = now;
    }
}

/// Serializable contents of a record store.
///
/// Used by [`crate::FileStore`] to persist a mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreImage {
    pub(crate) databases: Vec<StoredDatabase>,
    pub(crate) preferences: Vec<Preference>,
}

impl StoreImage {
    /// Number of databases in the image.
    #[must_use]
    pub fn database_count(&self) -> usize {
        self.databases.len()
    }
}

/// Counters of mutating operations, used to observe what a sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    /// Record writes.
    pub writes: u64,
    /// Physical record deletions, purges included.
    pub deletes: u64,
    /// Category changes.
    pub category_changes: u64,
    /// Flag resets.
    pub flag_resets: u64,
}

#[derive(Debug, Clone)]
struct OpenDb {
    name: String,
    card: u8,
    mode: OpenMode,
}

/// An in-memory record store.
///
/// Suitable for:
/// - unit and integration tests
/// - the handheld side of a simulated device
/// - the working copy of a [`crate::FileStore`]
///
/// Besides the [`RecordStore`] operations it offers `app_*` methods that act
/// like the owning application editing its data: they set the dirty and
/// deleted bits the way the handheld does, so tests can stage local and
/// remote changes.
///
/// # Example
///
/// ```rust
/// use hotsync_storage::{
///     CategoryId, CloseOptions, CreateDatabase, FourCc, InMemoryStore, OpenMode, RecordStore,
///     RecordWrite,
/// };
///
/// let mut store = InMemoryStore::new();
/// let spec = CreateDatabase::record_db("MemoDB", FourCc::from_bytes(*b"memo"), FourCc::from_bytes(*b"DATA"));
/// let handle = store.create(&spec).unwrap();
/// let id = store.write(handle, RecordWrite::new(CategoryId::UNFILED, b"hello".to_vec())).unwrap();
/// assert_eq!(store.read_by_id(handle, id).unwrap().data, b"hello");
/// store.close(handle, CloseOptions::PLAIN).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    image: StoreImage,
    open: BTreeMap<u8, OpenDb>,
    next_handle: u8,
    max_open: Option<usize>,
    capacity: Option<usize>,
    max_records: Option<usize>,
    track_modified: bool,
    fixed_time: Option<i64>,
    stats: StoreStats,
}

impl InMemoryStore {
    /// Creates an empty store with no open-handle limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from a persisted image.
    #[must_use]
    pub fn from_image(image: StoreImage) -> Self {
        Self {
            image,
            ..Self::default()
        }
    }

    /// Returns the store contents.
    #[must_use]
    pub fn image(&self) -> &StoreImage {
        &self.image
    }

    /// Limits the number of concurrently open databases.
    #[must_use]
    pub fn with_max_open(mut self, max: usize) -> Self {
        self.max_open = Some(max);
        self
    }

    /// Limits the total bytes of record data.
    #[must_use]
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Limits the number of records per database, capped at
    /// [`MAX_RECORDS`].
    #[must_use]
    pub fn with_max_records(mut self, records: usize) -> Self {
        self.max_records = Some(records.min(MAX_RECORDS));
        self
    }

    fn record_limit(&self) -> usize {
        self.max_records.unwrap_or(MAX_RECORDS)
    }

    /// Stamps `modified_at` on every record write.
    #[must_use]
    pub fn with_record_timestamps(mut self) -> Self {
        self.track_modified = true;
        self
    }

    /// Pins the store clock, in seconds since the Unix epoch.
    pub fn set_time(&mut self, now: i64) {
        self.fixed_time = Some(now);
    }

    /// Current store time.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.fixed_time.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
                .unwrap_or_default()
        })
    }

    /// Returns the operation counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Resets the operation counters.
    pub fn reset_stats(&mut self) {
        self.stats = StoreStats::default();
    }

    /// Number of currently open databases.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Creates a database if it does not exist yet and leaves it closed.
    pub fn ensure_database(&mut self, spec: &CreateDatabase) -> StoreResult<()> {
        if self.find_db(&spec.name, spec.card).is_some() {
            return Ok(());
        }
        self.insert_database(spec);
        Ok(())
    }

    /// Snapshot of every record of a database on card 0, secret ones
    /// included, in index order.
    pub fn records(&self, db: &str) -> StoreResult<Vec<Record>> {
        let stored = self.db_by_name(db)?;
        Ok(stored
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| r.to_record(i))
            .collect())
    }

    /// Application-side write: stores the record and marks it dirty.
    pub fn app_write(&mut self, db: &str, write: RecordWrite) -> StoreResult<RecordId> {
        let now = self.now();
        let track = self.track_modified;
        let limit = self.record_limit();
        let stored = self.db_by_name_mut(db)?;
        let attributes = RecordAttributes {
            dirty: true,
            ..write.attributes.into_attributes()
        };
        let record = |id| StoredRecord {
            id,
            category: write.category,
            attributes,
            data: write.data.clone(),
            modified_at: track.then_some(now),
        };
        let id = match write.id.and_then(|id| stored.position(id).map(|p| (id, p))) {
            Some((id, pos)) => {
                if stored.records[pos].attributes.busy {
                    return Err(StoreError::RecordBusy(id.as_u32()));
                }
                stored.records[pos] = record(id);
                id
            }
            None => {
                if stored.records.len() >= limit {
                    return Err(StoreError::NoSpace {
                        needed: write.data.len(),
                    });
                }
                let id = match write.id {
                    Some(id) => id,
                    None => stored.allocate_id(),
                };
                stored.records.push(record(id));
                id
            }
        };
        stored.touch(now);
        Ok(id)
    }

    /// Application-side delete: marks the record deleted and dirty (and
    /// archived if requested) and keeps it as a tombstone until purged.
    pub fn app_delete(&mut self, db: &str, id: RecordId, archive: bool) -> StoreResult<()> {
        let now = self.now();
        let stored = self.db_by_name_mut(db)?;
        let pos = stored
            .position(id)
            .ok_or_else(|| StoreError::not_found(format!("record {id} in {db}")))?;
        let record = &mut stored.records[pos];
        record.attributes.deleted = true;
        record.attributes.dirty = true;
        record.attributes.archived = archive;
        if !archive {
            record.data.clear();
        }
        stored.touch(now);
        Ok(())
    }

    /// Application-side category change: moves the record and marks it dirty.
    pub fn app_set_category(
        &mut self,
        db: &str,
        id: RecordId,
        category: CategoryId,
    ) -> StoreResult<()> {
        let now = self.now();
        let stored = self.db_by_name_mut(db)?;
        let pos = stored
            .position(id)
            .ok_or_else(|| StoreError::not_found(format!("record {id} in {db}")))?;
        stored.records[pos].category = category;
        stored.records[pos].attributes.dirty = true;
        stored.touch(now);
        Ok(())
    }

    /// Sets or clears the busy bit, as the handheld does while a record is
    /// being edited.
    pub fn app_set_busy(&mut self, db: &str, id: RecordId, busy: bool) -> StoreResult<()> {
        let stored = self.db_by_name_mut(db)?;
        let pos = stored
            .position(id)
            .ok_or_else(|| StoreError::not_found(format!("record {id} in {db}")))?;
        stored.records[pos].attributes.busy = busy;
        Ok(())
    }

    /// Application-side app info write: stores the block and sets the
    /// app-info-dirty flag.
    pub fn app_write_app_info(&mut self, db: &str, block: &[u8]) -> StoreResult<()> {
        let now = self.now();
        let stored = self.db_by_name_mut(db)?;
        stored.app_info = Some(block.to_vec());
        stored.descriptor.flags.insert(DbFlags::APP_INFO_DIRTY);
        stored.touch(now);
        Ok(())
    }

    /// Marks a database as excluded from sync.
    pub fn set_excluded_from_sync(&mut self, db: &str, excluded: bool) -> StoreResult<()> {
        let stored = self.db_by_name_mut(db)?;
        if excluded {
            stored.descriptor.misc_flags.insert(MiscFlags::EXCLUDE_FROM_SYNC);
        } else {
            stored.descriptor.misc_flags.remove(MiscFlags::EXCLUDE_FROM_SYNC);
        }
        Ok(())
    }

    fn insert_database(&mut self, spec: &CreateDatabase) {
        let now = self.now();
        self.image.databases.push(StoredDatabase {
            descriptor: DatabaseDescriptor {
                name: spec.name.clone(),
                db_type: spec.db_type,
                creator: spec.creator,
                card: spec.card,
                version: spec.version,
                mod_number: 0,
                flags: spec.flags,
                misc_flags: MiscFlags::RAM_BASED,
                created_at: now,
                modified_at: now,
                backed_up_at: 0,
            },
            records: Vec::new(),
            app_info: None,
            sort_info: None,
            next_id: 1,
        });
    }

    fn find_db(&self, name: &str, card: u8) -> Option<usize> {
        self.image
            .databases
            .iter()
            .position(|db| db.descriptor.name == name && db.descriptor.card == card)
    }

    fn db_by_name(&self, name: &str) -> StoreResult<&StoredDatabase> {
        self.find_db(name, 0)
            .map(|i| &self.image.databases[i])
            .ok_or_else(|| StoreError::not_found(format!("database {name}")))
    }

    fn db_by_name_mut(&mut self, name: &str) -> StoreResult<&mut StoredDatabase> {
        let i = self
            .find_db(name, 0)
            .ok_or_else(|| StoreError::not_found(format!("database {name}")))?;
        Ok(&mut self.image.databases[i])
    }

    fn handle_entry(&self, handle: DbHandle) -> StoreResult<(&OpenDb, usize)> {
        let open = self
            .open
            .get(&handle.raw())
            .ok_or(StoreError::BadHandle(handle.raw()))?;
        let index = self
            .find_db(&open.name, open.card)
            .ok_or(StoreError::BadHandle(handle.raw()))?;
        Ok((open, index))
    }

    fn db(&self, handle: DbHandle) -> StoreResult<(&StoredDatabase, OpenMode)> {
        let (open, index) = self.handle_entry(handle)?;
        Ok((&self.image.databases[index], open.mode))
    }

    fn db_for_write(&mut self, handle: DbHandle) -> StoreResult<&mut StoredDatabase> {
        let (open, index) = self.handle_entry(handle)?;
        let stored = &self.image.databases[index];
        if !open.mode.contains(OpenMode::WRITE) || stored.descriptor.flags.contains(DbFlags::READ_ONLY)
        {
            return Err(StoreError::ReadOnly(stored.descriptor.name.clone()));
        }
        Ok(&mut self.image.databases[index])
    }

    fn visible(mode: OpenMode, record: &StoredRecord) -> bool {
        !record.attributes.secret || mode.contains(OpenMode::SHOW_SECRET)
    }

    fn allocate_handle(&mut self) -> u8 {
        loop {
            self.next_handle = self.next_handle.wrapping_add(1);
            if self.next_handle != 0 && !self.open.contains_key(&self.next_handle) {
                return self.next_handle;
            }
        }
    }

    fn check_open_allowed(&self, name: &str, card: u8, mode: OpenMode) -> StoreResult<()> {
        if let Some(limit) = self.max_open {
            if self.open.len() >= limit {
                return Err(StoreError::TooManyOpenFiles { limit });
            }
        }
        let conflict = self.open.values().any(|o| {
            o.name == name
                && o.card == card
                && (mode.contains(OpenMode::EXCLUSIVE) || o.mode.contains(OpenMode::EXCLUSIVE))
        });
        if conflict {
            return Err(StoreError::AlreadyOpen(name.to_string()));
        }
        Ok(())
    }

    fn register_open(&mut self, name: &str, card: u8, mode: OpenMode) -> DbHandle {
        let raw = self.allocate_handle();
        self.open.insert(
            raw,
            OpenDb {
                name: name.to_string(),
                card,
                mode,
            },
        );
        if let Some(i) = self.find_db(name, card) {
            self.image.databases[i].descriptor.flags.insert(DbFlags::OPEN);
        }
        DbHandle::from_raw(raw)
    }

    fn next_modified(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
        category: Option<CategoryId>,
    ) -> StoreResult<Option<Record>> {
        let (stored, mode) = self.db(handle)?;
        let found = stored
            .records
            .iter()
            .enumerate()
            .skip(cursor.position())
            .find(|(_, r)| {
                r.attributes.is_modified()
                    && Self::visible(mode, r)
                    && category.map_or(true, |c| r.category == c)
            });
        match found {
            Some((index, record)) => {
                cursor.advance_past(index);
                Ok(Some(record.to_record(index)))
            }
            None => Ok(None),
        }
    }

    fn purge_where(
        &mut self,
        handle: DbHandle,
        predicate: impl Fn(&StoredRecord) -> bool,
    ) -> StoreResult<u32> {
        let now = self.now();
        let stored = self.db_for_write(handle)?;
        let before = stored.records.len();
        stored.records.retain(|r| !predicate(r));
        let removed = before - stored.records.len();
        if removed > 0 {
            stored.touch(now);
        }
        self.stats.deletes += removed as u64;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }
}

impl RecordStore for InMemoryStore {
    fn open(&mut self, name: &str, card: u8, mode: OpenMode) -> StoreResult<DbHandle> {
        if self.find_db(name, card).is_none() {
            return Err(StoreError::not_found(format!("database {name} on card {card}")));
        }
        self.check_open_allowed(name, card, mode)?;
        Ok(self.register_open(name, card, mode))
    }

    fn create(&mut self, spec: &CreateDatabase) -> StoreResult<DbHandle> {
        if spec.name.is_empty() || spec.name.len() > MAX_DB_NAME_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "database name must be 1..={MAX_DB_NAME_LEN} bytes: {:?}",
                spec.name
            )));
        }
        if self.find_db(&spec.name, spec.card).is_some() {
            return Err(StoreError::FileAlreadyExists(spec.name.clone()));
        }
        let mode = OpenMode::READ | OpenMode::WRITE | OpenMode::EXCLUSIVE;
        self.check_open_allowed(&spec.name, spec.card, mode)?;
        self.insert_database(spec);
        Ok(self.register_open(&spec.name, spec.card, mode))
    }

    fn delete_database(&mut self, name: &str, card: u8) -> StoreResult<()> {
        let index = self
            .find_db(name, card)
            .ok_or_else(|| StoreError::not_found(format!("database {name} on card {card}")))?;
        if self.open.values().any(|o| o.name == name && o.card == card) {
            return Err(StoreError::AlreadyOpen(name.to_string()));
        }
        self.image.databases.remove(index);
        Ok(())
    }

    fn close(&mut self, handle: DbHandle, options: CloseOptions) -> StoreResult<()> {
        let now = self.now();
        let open = self
            .open
            .remove(&handle.raw())
            .ok_or(StoreError::BadHandle(handle.raw()))?;
        let still_open = self
            .open
            .values()
            .any(|o| o.name == open.name && o.card == open.card);
        if let Some(i) = self.find_db(&open.name, open.card) {
            let descriptor = &mut self.image.databases[i].descriptor;
            if options.update_backup_date {
                descriptor.backed_up_at = now;
            }
            if options.update_mod_date {
                descriptor.modified_at = now;
            }
            if !still_open {
                descriptor.flags.remove(DbFlags::OPEN);
            }
        }
        Ok(())
    }

    fn record_count(&self, handle: DbHandle) -> StoreResult<u32> {
        let (stored, _) = self.db(handle)?;
        Ok(u32::try_from(stored.records.len()).unwrap_or(u32::MAX))
    }

    fn read_by_id(&self, handle: DbHandle, id: RecordId) -> StoreResult<Record> {
        let (stored, mode) = self.db(handle)?;
        stored
            .position(id)
            .filter(|&i| Self::visible(mode, &stored.records[i]))
            .map(|i| stored.records[i].to_record(i))
            .ok_or_else(|| StoreError::not_found(format!("record {id}")))
    }

    fn read_by_index(&self, handle: DbHandle, index: u16) -> StoreResult<Record> {
        let (stored, mode) = self.db(handle)?;
        let i = usize::from(index);
        stored
            .records
            .get(i)
            .filter(|r| Self::visible(mode, r))
            .map(|r| r.to_record(i))
            .ok_or_else(|| StoreError::not_found(format!("record at index {index}")))
    }

    fn read_next_modified(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
    ) -> StoreResult<Option<Record>> {
        self.next_modified(handle, cursor, None)
    }

    fn read_next_modified_in_category(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
        category: CategoryId,
    ) -> StoreResult<Option<Record>> {
        self.next_modified(handle, cursor, Some(category))
    }

    fn write(&mut self, handle: DbHandle, record: RecordWrite) -> StoreResult<RecordId> {
        let now = self.now();
        let track = self.track_modified;
        let capacity = self.capacity;
        let limit = self.record_limit();
        let stored = self.db_for_write(handle)?;

        let existing = record.id.and_then(|id| stored.position(id));
        if let Some(pos) = existing {
            if stored.records[pos].attributes.busy {
                return Err(StoreError::RecordBusy(stored.records[pos].id.as_u32()));
            }
        }
        if existing.is_none() && stored.records.len() >= limit {
            return Err(StoreError::NoSpace {
                needed: record.data.len(),
            });
        }
        if let Some(capacity) = capacity {
            let old = existing.map_or(0, |pos| stored.records[pos].data.len());
            let used = stored.data_bytes() as usize - old;
            if used + record.data.len() > capacity {
                return Err(StoreError::NoSpace {
                    needed: record.data.len(),
                });
            }
        }

        let stored_record = |id| StoredRecord {
            id,
            category: record.category,
            attributes: record.attributes.into_attributes(),
            data: record.data.clone(),
            modified_at: track.then_some(now),
        };
        let id = match (existing, record.id) {
            (Some(pos), Some(id)) => {
                stored.records[pos] = stored_record(id);
                id
            }
            (_, Some(id)) if id.as_u32() != 0 => {
                if id.as_u32() >= stored.next_id {
                    stored.next_id = id.as_u32().wrapping_add(1);
                }
                stored.records.push(stored_record(id));
                id
            }
            _ => {
                let id = stored.allocate_id();
                stored.records.push(stored_record(id));
                id
            }
        };
        stored.touch(now);
        self.stats.writes += 1;
        Ok(id)
    }

    fn delete(&mut self, handle: DbHandle, id: RecordId) -> StoreResult<()> {
        let now = self.now();
        let stored = self.db_for_write(handle)?;
        let pos = stored
            .position(id)
            .ok_or_else(|| StoreError::not_found(format!("record {id}")))?;
        if stored.records[pos].attributes.busy {
            return Err(StoreError::RecordBusy(id.as_u32()));
        }
        stored.records.remove(pos);
        stored.touch(now);
        self.stats.deletes += 1;
        Ok(())
    }

    fn delete_by_index(&mut self, handle: DbHandle, index: u16) -> StoreResult<()> {
        let id = {
            let (stored, _) = self.db(handle)?;
            stored
                .records
                .get(usize::from(index))
                .map(|r| r.id)
                .ok_or_else(|| StoreError::not_found(format!("record at index {index}")))?
        };
        self.delete(handle, id)
    }

    fn change_category(
        &mut self,
        handle: DbHandle,
        id: RecordId,
        from: CategoryId,
        to: CategoryId,
    ) -> StoreResult<()> {
        let now = self.now();
        let stored = self.db_for_write(handle)?;
        let pos = stored
            .position(id)
            .filter(|&p| stored.records[p].category == from)
            .ok_or_else(|| {
                StoreError::not_found(format!("record {id} in category {}", from.as_u8()))
            })?;
        if stored.records[pos].attributes.busy {
            return Err(StoreError::RecordBusy(id.as_u32()));
        }
        stored.records[pos].category = to;
        stored.touch(now);
        self.stats.category_changes += 1;
        Ok(())
    }

    fn move_category(
        &mut self,
        handle: DbHandle,
        from: CategoryId,
        to: CategoryId,
    ) -> StoreResult<u32> {
        let now = self.now();
        let stored = self.db_for_write(handle)?;
        let mut moved = 0u32;
        for record in stored.records.iter_mut().filter(|r| r.category == from) {
            record.category = to;
            moved += 1;
        }
        if moved > 0 {
            stored.touch(now);
        }
        self.stats.category_changes += u64::from(moved);
        Ok(moved)
    }

    fn purge_deleted(&mut self, handle: DbHandle) -> StoreResult<u32> {
        self.purge_where(handle, |r| r.attributes.deleted && !r.attributes.busy)
    }

    fn purge_all(&mut self, handle: DbHandle) -> StoreResult<u32> {
        self.purge_where(handle, |r| !r.attributes.busy)
    }

    fn purge_all_in_category(
        &mut self,
        handle: DbHandle,
        category: CategoryId,
    ) -> StoreResult<u32> {
        self.purge_where(handle, |r| r.category == category && !r.attributes.busy)
    }

    fn reset_sync_flags(&mut self, handle: DbHandle) -> StoreResult<()> {
        let stored = self.db_for_write(handle)?;
        for record in &mut stored.records {
            record.attributes.dirty = false;
        }
        stored.descriptor.flags.remove(DbFlags::APP_INFO_DIRTY);
        self.stats.flag_resets += 1;
        Ok(())
    }

    fn read_app_info(&self, handle: DbHandle) -> StoreResult<Option<Vec<u8>>> {
        let (stored, _) = self.db(handle)?;
        Ok(stored.app_info.clone())
    }

    fn write_app_info(&mut self, handle: DbHandle, block: &[u8]) -> StoreResult<()> {
        let now = self.now();
        let stored = self.db_for_write(handle)?;
        stored.app_info = Some(block.to_vec());
        stored.touch(now);
        Ok(())
    }

    fn read_sort_info(&self, handle: DbHandle) -> StoreResult<Option<Vec<u8>>> {
        let (stored, _) = self.db(handle)?;
        Ok(stored.sort_info.clone())
    }

    fn write_sort_info(&mut self, handle: DbHandle, block: &[u8]) -> StoreResult<()> {
        let now = self.now();
        let stored = self.db_for_write(handle)?;
        stored.sort_info = Some(block.to_vec());
        stored.touch(now);
        Ok(())
    }

    fn read_preference(&self, creator: FourCc, key: PreferenceKey) -> StoreResult<Preference> {
        self.image
            .preferences
            .iter()
            .find(|p| p.creator == creator && p.id == key.id && p.backed_up == key.backed_up)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("preference {creator}/{}", key.id)))
    }

    fn write_preference(&mut self, preference: Preference) -> StoreResult<()> {
        let existing = self.image.preferences.iter_mut().find(|p| {
            p.creator == preference.creator
                && p.id == preference.id
                && p.backed_up == preference.backed_up
        });
        match existing {
            Some(slot) => *slot = preference,
            None => self.image.preferences.push(preference),
        }
        Ok(())
    }

    fn list_preferences(&self, creator: FourCc) -> StoreResult<Vec<PreferenceKey>> {
        let mut keys: Vec<PreferenceKey> = self
            .image
            .preferences
            .iter()
            .filter(|p| p.creator == creator)
            .map(|p| PreferenceKey {
                id: p.id,
                backed_up: p.backed_up,
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn list_databases(&self, card: u8) -> StoreResult<Vec<DatabaseDescriptor>> {
        Ok(self
            .image
            .databases
            .iter()
            .filter(|db| db.descriptor.card == card)
            .map(|db| db.descriptor.clone())
            .collect())
    }

    fn describe(&self, name: &str, card: u8, options: InfoOptions) -> StoreResult<DbInfo> {
        let stored = self
            .find_db(name, card)
            .map(|i| &self.image.databases[i])
            .ok_or_else(|| StoreError::not_found(format!("database {name} on card {card}")))?;
        Ok(DbInfo {
            descriptor: stored.descriptor.clone(),
            size: options
                .contains(InfoOptions::SIZE)
                .then(|| stored.size_info()),
            max_record_size: None,
        })
    }

    fn read_open_db_info(&self, handle: DbHandle, options: InfoOptions) -> StoreResult<DbInfo> {
        let (stored, _) = self.db(handle)?;
        let max_record_size = options.contains(InfoOptions::MAX_REC_SIZE).then(|| {
            let max = stored.records.iter().map(|r| r.data.len()).max().unwrap_or(0);
            u32::try_from(max).unwrap_or(u32::MAX)
        });
        Ok(DbInfo {
            descriptor: stored.descriptor.clone(),
            size: options
                .contains(InfoOptions::SIZE)
                .then(|| stored.size_info()),
            max_record_size,
        })
    }

    fn flush(&mut self) -> StoreResult<()> {
        // Nothing is buffered
        Ok(())
    }
}
