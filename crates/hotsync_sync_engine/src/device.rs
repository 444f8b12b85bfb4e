//! The handheld side of a session.

use crate::session::CancelToken;
use hotsync_storage::{
    CategoryId, CloseOptions, CreateDatabase, DatabaseDescriptor, DbHandle, DbInfo, FourCc,
    InMemoryStore, InfoOptions, OpenMode, Preference, PreferenceKey, Record, RecordId,
    RecordStore, RecordWrite, StoreError, StoreResult, SyncCursor,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Identity of the handheld's user and its last sync.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    /// User name.
    pub user_name: String,
    /// User ID.
    pub user_id: u32,
    /// Viewer ID.
    pub viewer_id: u32,
    /// PC identifier of the desktop of the last sync, zero if never synced.
    pub last_sync_pc: u32,
    /// Time of the last sync attempt.
    pub last_sync_date: i64,
    /// Time of the last successful sync.
    pub successful_sync_date: i64,
}

/// Handheld system information.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    /// ROM version.
    pub rom_version: u32,
    /// Locale.
    pub locale: u32,
    /// Product identifier.
    pub product_id: String,
}

/// Memory card information.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CardInfo {
    /// Card number.
    pub card: u8,
    /// Card version.
    pub version: u16,
    /// Creation time.
    pub created_at: i64,
    /// ROM size in bytes.
    pub rom_size: u32,
    /// RAM size in bytes.
    pub ram_size: u32,
    /// Free RAM in bytes.
    pub free_ram: u32,
    /// Card name.
    pub name: String,
    /// Manufacturer name.
    pub manufacturer: String,
}

/// Reply of a handheld application call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAppResult {
    /// Application result code.
    pub result_code: u32,
    /// Reply payload.
    pub data: Vec<u8>,
}

/// A connected handheld.
///
/// Record access goes through the [`RecordStore`] supertrait; this trait
/// adds the session-level calls. The device enforces its own limit on open
/// databases (usually one).
pub trait RemoteDevice: RecordStore {
    /// Reads the user identity and last-sync information.
    fn read_user_id(&self) -> StoreResult<UserInfo>;

    /// Records a completed sync with `pc_identifier` at `date`.
    fn record_sync(&mut self, pc_identifier: u32, date: i64) -> StoreResult<()>;

    /// Reads system information.
    fn read_system_info(&self) -> StoreResult<SystemInfo>;

    /// Reads information about a memory card.
    fn read_card_info(&self, card: u8) -> StoreResult<CardInfo>;

    /// Reads the handheld clock.
    fn read_sys_date_time(&self) -> StoreResult<i64>;

    /// Sets the handheld clock.
    fn write_sys_date_time(&mut self, time: i64) -> StoreResult<()>;

    /// Calls an application on the handheld.
    fn call_application(
        &mut self,
        creator: FourCc,
        action: u16,
        params: &[u8],
    ) -> StoreResult<CallAppResult>;

    /// Echoes `data` back.
    fn loopback(&mut self, data: &[u8]) -> StoreResult<Vec<u8>>;

    /// Appends a line to the handheld's sync log.
    fn add_log_entry(&mut self, text: &str) -> StoreResult<()>;

    /// Lets the handheld process events for up to `max_ms`.
    ///
    /// # Errors
    ///
    /// `RemoteCancel` if the handheld user cancelled the sync.
    fn yield_cycles(&mut self, max_ms: u32) -> StoreResult<()>;

    /// Returns true while the link is up.
    fn is_connected(&self) -> bool;
}

/// A handheld simulated on top of a record store.
///
/// Allows one open database at a time, like the real device. Link loss and
/// cancellation can be scripted for tests.
///
/// # Example
///
/// ```rust
/// use hotsync_storage::{InMemoryStore, OpenMode, RecordStore, StoreError};
/// use hotsync_sync_engine::{RemoteDevice, SimulatedDevice};
///
/// let mut device = SimulatedDevice::new(InMemoryStore::new());
/// assert!(device.is_connected());
/// device.disconnect();
/// assert!(matches!(
///     device.open("MemoDB", 0, OpenMode::SYNC),
///     Err(StoreError::LostConnection)
/// ));
/// ```
#[derive(Debug)]
pub struct SimulatedDevice<S = InMemoryStore> {
    store: S,
    user: UserInfo,
    system: SystemInfo,
    cards: Vec<CardInfo>,
    clock: i64,
    log: Vec<String>,
    open: Option<DbHandle>,
    open_name: Option<String>,
    connected: AtomicBool,
    operations: AtomicU64,
    disconnect_after: Option<u64>,
    cancel_requested: bool,
    remote_cancel_on_open: Option<String>,
    local_cancel_on_open: Option<(String, CancelToken)>,
    local_cancel_after_yields: Option<(String, u64, CancelToken)>,
    yields: u64,
    yields_while_open: u64,
    app_calls: Vec<(FourCc, u16)>,
}

impl<S: RecordStore> SimulatedDevice<S> {
    /// Wraps a store as a connected handheld with one RAM card.
    pub fn new(store: S) -> Self {
        Self {
            store,
            user: UserInfo {
                user_name: "Simulated User".to_string(),
                user_id: 1,
                ..UserInfo::default()
            },
            system: SystemInfo {
                rom_version: 0x0500_0000,
                locale: 0,
                product_id: "simulated".to_string(),
            },
            cards: vec![CardInfo {
                card: 0,
                version: 1,
                name: "RAM".to_string(),
                manufacturer: "hotsync".to_string(),
                ram_size: 16 * 1024 * 1024,
                free_ram: 8 * 1024 * 1024,
                ..CardInfo::default()
            }],
            clock: 0,
            log: Vec::new(),
            open: None,
            open_name: None,
            connected: AtomicBool::new(true),
            operations: AtomicU64::new(0),
            disconnect_after: None,
            cancel_requested: false,
            remote_cancel_on_open: None,
            local_cancel_on_open: None,
            local_cancel_after_yields: None,
            yields: 0,
            yields_while_open: 0,
            app_calls: Vec::new(),
        }
    }

    /// Sets the user information.
    #[must_use]
    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = user;
        self
    }

    /// Drops the link after `operations` more calls.
    #[must_use]
    pub fn with_disconnect_after(mut self, operations: u64) -> Self {
        self.disconnect_after = Some(self.operations.load(Ordering::SeqCst) + operations);
        self
    }

    /// Cancels from the handheld as soon as `name` is opened. The engine sees
    /// the cancellation at its next yield.
    #[must_use]
    pub fn with_remote_cancel_on_open(mut self, name: impl Into<String>) -> Self {
        self.remote_cancel_on_open = Some(name.into());
        self
    }

    /// Trips `token` as soon as `name` is opened.
    #[must_use]
    pub fn with_local_cancel_on_open(mut self, name: impl Into<String>, token: CancelToken) -> Self {
        self.local_cancel_on_open = Some((name.into(), token));
        self
    }

    /// Trips `token` once `name` has been open for `yields` yields, so the
    /// engine stops partway through that database.
    #[must_use]
    pub fn with_local_cancel_after_yields(
        mut self,
        name: impl Into<String>,
        yields: u64,
        token: CancelToken,
    ) -> Self {
        self.local_cancel_after_yields = Some((name.into(), yields, token));
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The underlying store, for scripting handheld-side edits.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Unwraps the store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Current user information.
    pub fn user_info(&self) -> &UserInfo {
        &self.user
    }

    /// Lines written to the handheld log.
    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// Number of yields received.
    pub fn yield_count(&self) -> u64 {
        self.yields
    }

    /// Applications called, in order.
    pub fn app_calls(&self) -> &[(FourCc, u16)] {
        &self.app_calls
    }

    /// Returns true if a database is open.
    pub fn has_open_database(&self) -> bool {
        self.open.is_some()
    }

    /// Drops the link.
    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Asks for cancellation from the handheld side.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    fn link(&self) -> StoreResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::LostConnection);
        }
        let done = self.operations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.disconnect_after.is_some_and(|limit| done > limit) {
            self.connected.store(false, Ordering::SeqCst);
            tracing::debug!(operations = done, "simulated link dropped");
            return Err(StoreError::LostConnection);
        }
        Ok(())
    }

    fn opened(&mut self, name: &str, handle: DbHandle) {
        self.open = Some(handle);
        self.open_name = Some(name.to_string());
        self.yields_while_open = 0;
        if self.remote_cancel_on_open.as_deref() == Some(name) {
            self.cancel_requested = true;
        }
        if let Some((target, token)) = &self.local_cancel_on_open {
            if target == name {
                token.cancel();
            }
        }
    }
}

impl<S: RecordStore> RecordStore for SimulatedDevice<S> {
    fn open(&mut self, name: &str, card: u8, mode: OpenMode) -> StoreResult<DbHandle> {
        self.link()?;
        if self.open.is_some() {
            return Err(StoreError::TooManyOpenFiles { limit: 1 });
        }
        let handle = self.store.open(name, card, mode)?;
        self.opened(name, handle);
        Ok(handle)
    }

    fn create(&mut self, spec: &CreateDatabase) -> StoreResult<DbHandle> {
        self.link()?;
        if self.open.is_some() {
            return Err(StoreError::TooManyOpenFiles { limit: 1 });
        }
        let handle = self.store.create(spec)?;
        self.opened(&spec.name, handle);
        Ok(handle)
    }

    fn delete_database(&mut self, name: &str, card: u8) -> StoreResult<()> {
        self.link()?;
        self.store.delete_database(name, card)
    }

    fn close(&mut self, handle: DbHandle, options: CloseOptions) -> StoreResult<()> {
        self.link()?;
        self.store.close(handle, options)?;
        if self.open == Some(handle) {
            self.open = None;
            self.open_name = None;
        }
        Ok(())
    }

    fn record_count(&self, handle: DbHandle) -> StoreResult<u32> {
        self.link()?;
        self.store.record_count(handle)
    }

    fn read_by_id(&self, handle: DbHandle, id: RecordId) -> StoreResult<Record> {
        self.link()?;
        self.store.read_by_id(handle, id)
    }

    fn read_by_index(&self, handle: DbHandle, index: u16) -> StoreResult<Record> {
        self.link()?;
        self.store.read_by_index(handle, index)
    }

    fn read_next_modified(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
    ) -> StoreResult<Option<Record>> {
        self.link()?;
        self.store.read_next_modified(handle, cursor)
    }

    fn read_next_modified_in_category(
        &self,
        handle: DbHandle,
        cursor: &mut SyncCursor,
        category: CategoryId,
    ) -> StoreResult<Option<Record>> {
        self.link()?;
        self.store
            .read_next_modified_in_category(handle, cursor, category)
    }

    fn write(&mut self, handle: DbHandle, record: RecordWrite) -> StoreResult<RecordId> {
        self.link()?;
        self.store.write(handle, record)
    }

    fn delete(&mut self, handle: DbHandle, id: RecordId) -> StoreResult<()> {
        self.link()?;
        self.store.delete(handle, id)
    }

    fn delete_by_index(&mut self, handle: DbHandle, index: u16) -> StoreResult<()> {
        self.link()?;
        self.store.delete_by_index(handle, index)
    }

    fn change_category(
        &mut self,
        handle: DbHandle,
        id: RecordId,
        from: CategoryId,
        to: CategoryId,
    ) -> StoreResult<()> {
        self.link()?;
        self.store.change_category(handle, id, from, to)
    }

    fn move_category(
        &mut self,
        handle: DbHandle,
        from: CategoryId,
        to: CategoryId,
    ) -> StoreResult<u32> {
        self.link()?;
        self.store.move_category(handle, from, to)
    }

    fn purge_deleted(&mut self, handle: DbHandle) -> StoreResult<u32> {
        self.link()?;
        self.store.purge_deleted(handle)
    }

    fn purge_all(&mut self, handle: DbHandle) -> StoreResult<u32> {
        self.link()?;
        self.store.purge_all(handle)
    }

    fn purge_all_in_category(
        &mut self,
        handle: DbHandle,
        category: CategoryId,
    ) -> StoreResult<u32> {
        self.link()?;
        self.store.purge_all_in_category(handle, category)
    }

    fn reset_sync_flags(&mut self, handle: DbHandle) -> StoreResult<()> {
        self.link()?;
        self.store.reset_sync_flags(handle)
    }

    fn read_app_info(&self, handle: DbHandle) -> StoreResult<Option<Vec<u8>>> {
        self.link()?;
        self.store.read_app_info(handle)
    }

    fn write_app_info(&mut self, handle: DbHandle, block: &[u8]) -> StoreResult<()> {
        self.link()?;
        self.store.write_app_info(handle, block)
    }

    fn read_sort_info(&self, handle: DbHandle) -> StoreResult<Option<Vec<u8>>> {
        self.link()?;
        self.store.read_sort_info(handle)
    }

    fn write_sort_info(&mut self, handle: DbHandle, block: &[u8]) -> StoreResult<()> {
        self.link()?;
        self.store.write_sort_info(handle, block)
    }

    fn read_preference(&self, creator: FourCc, key: PreferenceKey) -> StoreResult<Preference> {
        self.link()?;
        self.store.read_preference(creator, key)
    }

    fn write_preference(&mut self, preference: Preference) -> StoreResult<()> {
        self.link()?;
        self.store.write_preference(preference)
    }

    fn list_preferences(&self, creator: FourCc) -> StoreResult<Vec<PreferenceKey>> {
        self.link()?;
        self.store.list_preferences(creator)
    }

    fn list_databases(&self, card: u8) -> StoreResult<Vec<DatabaseDescriptor>> {
        self.link()?;
        self.store.list_databases(card)
    }

    fn describe(&self, name: &str, card: u8, options: InfoOptions) -> StoreResult<DbInfo> {
        self.link()?;
        self.store.describe(name, card, options)
    }

    fn read_open_db_info(&self, handle: DbHandle, options: InfoOptions) -> StoreResult<DbInfo> {
        self.link()?;
        self.store.read_open_db_info(handle, options)
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.link()?;
        self.store.flush()
    }
}

impl<S: RecordStore> RemoteDevice for SimulatedDevice<S> {
    fn read_user_id(&self) -> StoreResult<UserInfo> {
        self.link()?;
        Ok(self.user.clone())
    }

    fn record_sync(&mut self, pc_identifier: u32, date: i64) -> StoreResult<()> {
        self.link()?;
        self.user.last_sync_pc = pc_identifier;
        self.user.last_sync_date = date;
        self.user.successful_sync_date = date;
        Ok(())
    }

    fn read_system_info(&self) -> StoreResult<SystemInfo> {
        self.link()?;
        Ok(self.system.clone())
    }

    fn read_card_info(&self, card: u8) -> StoreResult<CardInfo> {
        self.link()?;
        self.cards
            .iter()
            .find(|c| c.card == card)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("card {card}")))
    }

    fn read_sys_date_time(&self) -> StoreResult<i64> {
        self.link()?;
        Ok(self.clock)
    }

    fn write_sys_date_time(&mut self, time: i64) -> StoreResult<()> {
        self.link()?;
        self.clock = time;
        Ok(())
    }

    fn call_application(
        &mut self,
        creator: FourCc,
        action: u16,
        params: &[u8],
    ) -> StoreResult<CallAppResult> {
        self.link()?;
        self.app_calls.push((creator, action));
        Ok(CallAppResult {
            result_code: 0,
            data: params.to_vec(),
        })
    }

    fn loopback(&mut self, data: &[u8]) -> StoreResult<Vec<u8>> {
        self.link()?;
        Ok(data.to_vec())
    }

    fn add_log_entry(&mut self, text: &str) -> StoreResult<()> {
        self.link()?;
        self.log.push(text.to_string());
        Ok(())
    }

    fn yield_cycles(&mut self, _max_ms: u32) -> StoreResult<()> {
        self.link()?;
        self.yields += 1;
        self.yields_while_open += 1;
        if let Some((target, after, token)) = &self.local_cancel_after_yields {
            if self.open_name.as_deref() == Some(target.as_str()) && self.yields_while_open >= *after
            {
                token.cancel();
            }
        }
        if self.cancel_requested {
            return Err(StoreError::RemoteCancel);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with(names: &[&str]) -> SimulatedDevice {
        let mut store = InMemoryStore::new();
        for name in names {
            store
                .ensure_database(&CreateDatabase::record_db(
                    *name,
                    FourCc::from_bytes(*b"test"),
                    FourCc::from_bytes(*b"DATA"),
                ))
                .unwrap();
        }
        SimulatedDevice::new(store)
    }

    #[test]
    fn one_open_database_at_a_time() {
        let mut device = device_with(&["A", "B"]);
        let a = device.open("A", 0, OpenMode::SYNC).unwrap();
        assert!(matches!(
            device.open("B", 0, OpenMode::SYNC),
            Err(StoreError::TooManyOpenFiles { limit: 1 })
        ));
        device.close(a, CloseOptions::PLAIN).unwrap();
        assert!(!device.has_open_database());
        device.open("B", 0, OpenMode::SYNC).unwrap();
    }

    #[test]
    fn scripted_disconnect() {
        let mut device = device_with(&["A"]).with_disconnect_after(2);
        device.read_user_id().unwrap();
        device.read_system_info().unwrap();
        assert!(matches!(
            device.read_user_id(),
            Err(StoreError::LostConnection)
        ));
        assert!(!device.is_connected());
    }

    #[test]
    fn remote_cancel_surfaces_at_yield() {
        let mut device = device_with(&["A"]).with_remote_cancel_on_open("A");
        device.yield_cycles(10).unwrap();
        device.open("A", 0, OpenMode::SYNC).unwrap();
        assert!(matches!(
            device.yield_cycles(10),
            Err(StoreError::RemoteCancel)
        ));
        assert_eq!(device.yield_count(), 2);
    }

    #[test]
    fn local_cancel_trips_token() {
        let token = CancelToken::new();
        let mut device = device_with(&["A"]).with_local_cancel_on_open("A", token.clone());
        assert!(!token.is_cancelled());
        device.open("A", 0, OpenMode::SYNC).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn local_cancel_after_yields_counts_only_while_open() {
        let token = CancelToken::new();
        let mut device =
            device_with(&["A", "B"]).with_local_cancel_after_yields("B", 2, token.clone());
        let a = device.open("A", 0, OpenMode::SYNC).unwrap();
        for _ in 0..3 {
            device.yield_cycles(10).unwrap();
        }
        device.close(a, CloseOptions::PLAIN).unwrap();
        assert!(!token.is_cancelled());

        device.open("B", 0, OpenMode::SYNC).unwrap();
        device.yield_cycles(10).unwrap();
        assert!(!token.is_cancelled());
        device.yield_cycles(10).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn session_calls() {
        let mut device = device_with(&[]);
        device.record_sync(77, 1_000).unwrap();
        let user = device.read_user_id().unwrap();
        assert_eq!(user.last_sync_pc, 77);
        assert_eq!(user.successful_sync_date, 1_000);

        device.write_sys_date_time(500).unwrap();
        assert_eq!(device.read_sys_date_time().unwrap(), 500);
        assert_eq!(device.loopback(b"ping").unwrap(), b"ping");
        assert_eq!(device.read_card_info(0).unwrap().name, "RAM");
        assert!(matches!(
            device.read_card_info(3),
            Err(StoreError::NotFound(_))
        ));

        let memo = FourCc::from_bytes(*b"memo");
        let reply = device.call_application(memo, 2, b"args").unwrap();
        assert_eq!(reply.data, b"args");
        assert_eq!(device.app_calls(), &[(memo, 2)]);

        device.add_log_entry("MemoDB: synced").unwrap();
        assert_eq!(device.log(), &["MemoDB: synced".to_string()]);
    }
}
