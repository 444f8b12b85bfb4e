//! Record store trait definition.

use crate::database::{
    CloseOptions, CreateDatabase, DatabaseDescriptor, DbHandle, DbInfo, InfoOptions, OpenMode,
    SyncCursor,
};
use crate::error::StoreResult;
use crate::record::{CategoryId, Preference, PreferenceKey, Record, RecordId, RecordWrite};
use crate::tag::FourCc;

/// Uniform access to the databases of one store.
///
/// Both sides of a sync implement this trait: the handheld device and the
/// desktop mirror. All record operations address a database through
/// the handle returned by [`open`](RecordStore::open).
///
/// # Invariants
///
/// - `(name, card)` identifies a database on the store
/// - an exclusive open conflicts with any other open of the same database
///   (`AlreadyOpen`)
/// - opening more databases than the store supports fails with
///   `TooManyOpenFiles`
/// - `write` never sets the busy attribute
/// - records are enumerated in index order; indexes shift when records are
///   removed
pub trait RecordStore {
    /// Opens a database.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AlreadyOpen` or `TooManyOpenFiles`.
    fn open(&mut self, name: &str, card: u8, mode: OpenMode) -> StoreResult<DbHandle>;

    /// Creates a database and opens it for reading and writing.
    ///
    /// # Errors
    ///
    /// `FileAlreadyExists` if the name is taken on the card.
    fn create(&mut self, spec: &CreateDatabase) -> StoreResult<DbHandle>;

    /// Deletes a closed database.
    fn delete_database(&mut self, name: &str, card: u8) -> StoreResult<()>;

    /// Closes a database, optionally stamping its backup and modification
    /// dates as part of the close.
    fn close(&mut self, handle: DbHandle, options: CloseOptions) -> StoreResult<()>;

    /// Number of records, tombstones included.
    fn record_count(&self, handle: DbHandle) -> StoreResult<u32>;

    /// Reads a record by ID.
    fn read_by_id(&self, handle: DbHandle, id: RecordId) -> StoreResult<Record>;

    /// Reads the record at `index`.
    fn read_by_index(&self, handle: DbHandle, index: u16) -> StoreResult<Record>;

    /// Returns the next dirty or deleted record at or after the cursor, or
    /// `None` at the end of the data.
    fn read_next_modified(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
    ) -> StoreResult<Option<Record>>;

    /// Like [`read_next_modified`](RecordStore::read_next_modified),
    /// restricted to one category.
    fn read_next_modified_in_category(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
        category: CategoryId,
    ) -> StoreResult<Option<Record>>;

    /// Writes a record. With `id == None` a record is created and the store
    /// assigns its ID.
    ///
    /// # Errors
    ///
    /// `ReadOnly`, `NoSpace` or `RecordBusy`.
    fn write(&mut self, handle: DbHandle, record: RecordWrite) -> StoreResult<RecordId>;

    /// Physically removes a record.
    fn delete(&mut self, handle: DbHandle, id: RecordId) -> StoreResult<()>;

    /// Physically removes the record at `index`.
    fn delete_by_index(&mut self, handle: DbHandle, index: u16) -> StoreResult<()>;

    /// Moves one record from category `from` to `to` without touching its
    /// payload.
    ///
    /// # Errors
    ///
    /// `NotFound` if the record does not exist or is not in `from`.
    fn change_category(
        &mut self,
        handle: DbHandle,
        id: RecordId,
        from: CategoryId,
        to: CategoryId,
    ) -> StoreResult<()>;

    /// Moves every record in `from` to `to`. Returns the number moved.
    fn move_category(
        &mut self,
        handle: DbHandle,
        from: CategoryId,
        to: CategoryId,
    ) -> StoreResult<u32>;

    /// Removes every deleted record. Returns the number removed.
    fn purge_deleted(&mut self, handle: DbHandle) -> StoreResult<u32>;

    /// Removes every record.
    fn purge_all(&mut self, handle: DbHandle) -> StoreResult<u32>;

    /// Removes every record in a category.
    fn purge_all_in_category(&mut self, handle: DbHandle, category: CategoryId)
        -> StoreResult<u32>;

    /// Clears the dirty bit of every record and the app-info-dirty flag.
    fn reset_sync_flags(&mut self, handle: DbHandle) -> StoreResult<()>;

    /// Reads the application info block.
    fn read_app_info(&self, handle: DbHandle) -> StoreResult<Option<Vec<u8>>>;

    /// Writes the application info block.
    fn write_app_info(&mut self, handle: DbHandle, block: &[u8]) -> StoreResult<()>;

    /// Reads the sort info block.
    fn read_sort_info(&self, handle: DbHandle) -> StoreResult<Option<Vec<u8>>>;

    /// Writes the sort info block.
    fn write_sort_info(&mut self, handle: DbHandle, block: &[u8]) -> StoreResult<()>;

    /// Reads a preference block.
    fn read_preference(&self, creator: FourCc, key: PreferenceKey) -> StoreResult<Preference>;

    /// Writes a preference block.
    fn write_preference(&mut self, preference: Preference) -> StoreResult<()>;

    /// Lists the preference blocks of a creator.
    fn list_preferences(&self, creator: FourCc) -> StoreResult<Vec<PreferenceKey>>;

    /// Lists the databases on a card, in storage order.
    fn list_databases(&self, card: u8) -> StoreResult<Vec<DatabaseDescriptor>>;

    /// Describes a database by name, computing the requested fields.
    fn describe(&self, name: &str, card: u8, options: InfoOptions) -> StoreResult<DbInfo>;

    /// Describes an open database.
    fn read_open_db_info(&self, handle: DbHandle, options: InfoOptions) -> StoreResult<DbInfo>;

    /// Makes every prior change durable.
    fn flush(&mut self) -> StoreResult<()>;
}
