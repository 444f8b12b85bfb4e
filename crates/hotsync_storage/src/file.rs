//! Directory-backed record store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <dir>/
//! ├─ LOCK            # Advisory lock, one process at a time
//! └─ store.cbor      # Snapshot of every database and preference
//! ```
//!
//! The snapshot is rewritten with a write-then-rename on every flush and on
//! every close, so a crash leaves either the old or the new contents.

use crate::database::{
    CloseOptions, CreateDatabase, DatabaseDescriptor, DbHandle, DbInfo, InfoOptions, OpenMode,
    SyncCursor,
};
use crate::error::{StoreError, StoreResult};
use crate::memory::{InMemoryStore, StoreImage};
use crate::record::{CategoryId, Preference, PreferenceKey, Record, RecordId, RecordWrite};
use crate::store::RecordStore;
use crate::tag::FourCc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "store.cbor";
const SNAPSHOT_TEMP: &str = "store.cbor.tmp";

/// A record store persisted in a directory.
///
/// Used for desktop mirrors and for simulated devices driven from the
/// command line. All operations run against an in-memory working copy;
/// [`flush`](RecordStore::flush) and [`close`](RecordStore::close) write it
/// back.
///
/// # Example
///
/// ```no_run
/// use hotsync_storage::{FileStore, RecordStore};
/// use std::path::Path;
///
/// let mut store = FileStore::open(Path::new("mirror/memo"), true).unwrap();
/// let names: Vec<_> = store.list_databases(0).unwrap().into_iter().map(|d| d.name).collect();
/// store.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: InMemoryStore,
    changed: bool,
    _lock_file: File,
}

impl FileStore {
    /// Opens a store directory, loading the existing snapshot if any.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the directory is missing and `create_if_missing` is
    ///   false
    /// - `Locked` if another process holds the directory
    /// - `Codec` if the snapshot cannot be decoded
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StoreError::not_found(format!(
                    "store directory {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(StoreError::InvalidArgument(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        let image = load_image(&path.join(SNAPSHOT_FILE))?;
        tracing::debug!(
            path = %path.display(),
            databases = image.database_count(),
            "opened file store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            inner: InMemoryStore::from_image(image),
            changed: false,
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the working copy.
    #[must_use]
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Returns the working copy for application-side edits. Changes made
    /// through it are written by the next [`save`](Self::save).
    pub fn inner_mut(&mut self) -> &mut InMemoryStore {
        self.changed = true;
        &mut self.inner
    }

    /// Writes the snapshot atomically.
    pub fn save(&mut self) -> StoreResult<()> {
        let target = self.path.join(SNAPSHOT_FILE);
        let temp = self.path.join(SNAPSHOT_TEMP);

        let file = File::create(&temp)?;
        let mut writer = BufWriter::new(file);
        ciborium::into_writer(self.inner.image(), &mut writer)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &target)?;
        self.changed = false;
        tracing::trace!(path = %target.display(), "saved store snapshot");
        Ok(())
    }

    fn mutated<T>(&mut self, result: StoreResult<T>) -> StoreResult<T> {
        if result.is_ok() {
            self.changed = true;
        }
        result
    }
}

fn load_image(path: &Path) -> StoreResult<StoreImage> {
    if !path.exists() {
        return Ok(StoreImage::default());
    }
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(StoreImage::default());
    }
    ciborium::from_reader(BufReader::new(file)).map_err(|e| StoreError::Codec(e.to_string()))
}

impl RecordStore for FileStore {
    fn open(&mut self, name: &str, card: u8, mode: OpenMode) -> StoreResult<DbHandle> {
        let result = self.inner.open(name, card, mode);
        self.mutated(result)
    }

    fn create(&mut self, spec: &CreateDatabase) -> StoreResult<DbHandle> {
        let result = self.inner.create(spec);
        self.mutated(result)
    }

    fn delete_database(&mut self, name: &str, card: u8) -> StoreResult<()> {
        let result = self.inner.delete_database(name, card);
        self.mutated(result)
    }

    fn close(&mut self, handle: DbHandle, options: CloseOptions) -> StoreResult<()> {
        self.inner.close(handle, options)?;
        self.save()
    }

    fn record_count(&self, handle: DbHandle) -> StoreResult<u32> {
        self.inner.record_count(handle)
    }

    fn read_by_id(&self, handle: DbHandle, id: RecordId) -> StoreResult<Record> {
        self.inner.read_by_id(handle, id)
    }

    fn read_by_index(&self, handle: DbHandle, index: u16) -> StoreResult<Record> {
        self.inner.read_by_index(handle, index)
    }

    fn read_next_modified(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
    ) -> StoreResult<Option<Record>> {
        self.inner.read_next_modified(handle, cursor)
    }

    fn read_next_modified_in_category(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
        category: CategoryId,
    ) -> StoreResult<Option<Record>> {
        self.inner
            .read_next_modified_in_category(handle, cursor, category)
    }

    fn write(&mut self, handle: DbHandle, record: RecordWrite) -> StoreResult<RecordId> {
        let result = self.inner.write(handle, record);
        self.mutated(result)
    }

    fn delete(&mut self, handle: DbHandle, id: RecordId) -> StoreResult<()> {
        let result = self.inner.delete(handle, id);
        self.mutated(result)
    }

    fn delete_by_index(&mut self, handle: DbHandle, index: u16) -> StoreResult<()> {
        let result = self.inner.delete_by_index(handle, index);
        self.mutated(result)
    }

    fn change_category(
        &mut self,
        handle: DbHandle,
        id: RecordId,
        from: CategoryId,
        to: CategoryId,
    ) -> StoreResult<()> {
        let result = self.inner.change_category(handle, id, from, to);
        self.mutated(result)
    }

    fn move_category(
        &mut self,
        handle: DbHandle,
        from: CategoryId,
        to: CategoryId,
    ) -> StoreResult<u32> {
        let result = self.inner.move_category(handle, from, to);
        self.mutated(result)
    }

    fn purge_deleted(&mut self, handle: DbHandle) -> StoreResult<u32> {
        let result = self.inner.purge_deleted(handle);
        self.mutated(result)
    }

    fn purge_all(&mut self, handle: DbHandle) -> StoreResult<u32> {
        let result = self.inner.purge_all(handle);
        self.mutated(result)
    }

    fn purge_all_in_category(
        &mut self,
        handle: DbHandle,
        category: CategoryId,
    ) -> StoreResult<u32> {
        let result = self.inner.purge_all_in_category(handle, category);
        self.mutated(result)
    }

    fn reset_sync_flags(&mut self, handle: DbHandle) -> StoreResult<()> {
        let result = self.inner.reset_sync_flags(handle);
        self.mutated(result)
    }

    fn read_app_info(&self, handle: DbHandle) -> StoreResult<Option<Vec<u8>>> {
        self.inner.read_app_info(handle)
    }

    fn write_app_info(&mut self, handle: DbHandle, block: &[u8]) -> StoreResult<()> {
        let result = self.inner.write_app_info(handle, block);
        self.mutated(result)
    }

    fn read_sort_info(&self, handle: DbHandle) -> StoreResult<Option<Vec<u8>>> {
        self.inner.read_sort_info(handle)
    }

    fn write_sort_info(&mut self, handle: DbHandle, block: &[u8]) -> StoreResult<()> {
        let result = self.inner.write_sort_info(handle, block);
        self.mutated(result)
    }

    fn read_preference(&self, creator: FourCc, key: PreferenceKey) -> StoreResult<Preference> {
        self.inner.read_preference(creator, key)
    }

    fn write_preference(&mut self, preference: Preference) -> StoreResult<()> {
        let result = self.inner.write_preference(preference);
        self.mutated(result)
    }

    fn list_preferences(&self, creator: FourCc) -> StoreResult<Vec<PreferenceKey>> {
        self.inner.list_preferences(creator)
    }

    fn list_databases(&self, card: u8) -> StoreResult<Vec<DatabaseDescriptor>> {
        self.inner.list_databases(card)
    }

    fn describe(&self, name: &str, card: u8, options: InfoOptions) -> StoreResult<DbInfo> {
        self.inner.describe(name, card, options)
    }

    fn read_open_db_info(&self, handle: DbHandle, options: InfoOptions) -> StoreResult<DbInfo> {
        self.inner.read_open_db_info(handle, options)
    }

    fn flush(&mut self) -> StoreResult<()> {
        if self.changed {
            self.save()?;
        }
        Ok(())
    }
}
