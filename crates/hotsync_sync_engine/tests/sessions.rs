//! Integration tests for full sync sessions.

use hotsync_conduit::{ConduitConfig, ConduitRegistry, PreferenceScope, SyncPreference, SyncType};
use hotsync_storage::{
    CategoryId, CreateDatabase, FourCc, InMemoryStore, Preference, PreferenceKey, RecordStore,
    RecordWrite,
};
use hotsync_sync_engine::{
    DbOutcome, DirectoryMirrors, JsonMetadataStore, MemoryMetadataStore, MemoryMirrors,
    MetadataStore, SessionLog, SessionOutcome, SimulatedDevice, SyncConfig, SyncManager,
};
use tempfile::tempdir;

const PC: u32 = 0x5EED_0001;

fn tag(bytes: &[u8; 4]) -> FourCc {
    FourCc::from_bytes(*bytes)
}

/// A handheld holding one database per entry, each with `count` records.
fn handheld(databases: &[(&str, &[u8; 4], usize)]) -> InMemoryStore {
    let mut store = InMemoryStore::new();
    for (name, creator, count) in databases {
        store
            .ensure_database(&CreateDatabase::record_db(*name, tag(creator), tag(b"DATA")))
            .unwrap();
        for i in 0..*count {
            store
                .app_write(
                    name,
                    RecordWrite::new(CategoryId::UNFILED, format!("{name}-{i}").into_bytes()),
                )
                .unwrap();
        }
    }
    store
}

fn registry(conduits: &[(&[u8; 4], &str, u32)]) -> ConduitRegistry {
    let mut registry = ConduitRegistry::with_pc_identifier(PC);
    for (creator, database, priority) in conduits {
        registry
            .register(
                ConduitConfig::new(tag(creator), format!("{database} conduit"))
                    .with_remote(*database)
                    .with_priority(*priority),
            )
            .unwrap();
    }
    registry
}

fn three_databases() -> (InMemoryStore, ConduitRegistry) {
    let store = handheld(&[("ADB", b"aaaa", 3), ("BDB", b"bbbb", 3), ("CDB", b"cccc", 3)]);
    // Registered out of priority order on purpose.
    let registry = registry(&[(b"cccc", "CDB", 30), (b"aaaa", "ADB", 10), (b"bbbb", "BDB", 20)]);
    (store, registry)
}

fn run_session(
    device: &mut SimulatedDevice,
    registry: &mut ConduitRegistry,
    mirrors: &mut MemoryMirrors,
    metadata: &mut MemoryMetadataStore,
    config: SyncConfig,
) -> SessionLog {
    let manager = SyncManager::new();
    let mut session = manager.begin_session(PC, config).unwrap().with_time(1_000);
    session.run(device, registry, mirrors, metadata)
}

fn order(log: &SessionLog) -> Vec<&str> {
    log.entries.iter().map(|e| e.database.as_str()).collect()
}

#[test]
fn databases_sync_in_priority_order() {
    let (store, mut registry) = three_databases();
    let mut device = SimulatedDevice::new(store);
    let mut mirrors = MemoryMirrors::new();
    let mut metadata = MemoryMetadataStore::new();

    let log = run_session(
        &mut device,
        &mut registry,
        &mut mirrors,
        &mut metadata,
        SyncConfig::default(),
    );
    assert_eq!(log.outcome, SessionOutcome::Completed);
    assert_eq!(order(&log), ["ADB", "BDB", "CDB"]);
    for entry in &log.entries {
        assert_eq!(entry.outcome, DbOutcome::Synced(SyncType::Slow));
    }
    assert_eq!(device.user_info().last_sync_pc, PC);
    assert_eq!(device.user_info().last_sync_date, 1_000);
    assert!(device.log().iter().any(|line| line.contains("ADB")));

    let mirror = mirrors.store(tag(b"bbbb")).unwrap();
    assert_eq!(mirror.records("BDB").unwrap().len(), 3);
}

#[test]
fn equal_priorities_keep_registration_order() {
    let store = handheld(&[("ZDB", b"zzzz", 1), ("YDB", b"yyyy", 1)]);
    let mut registry = registry(&[(b"zzzz", "ZDB", 5), (b"yyyy", "YDB", 5)]);
    let mut device = SimulatedDevice::new(store);
    let log = run_session(
        &mut device,
        &mut registry,
        &mut MemoryMirrors::new(),
        &mut MemoryMetadataStore::new(),
        SyncConfig::default(),
    );
    assert_eq!(order(&log), ["ZDB", "YDB"]);
}

#[test]
fn second_session_is_fast_and_writes_nothing() {
    let (store, mut registry) = three_databases();
    let mut device = SimulatedDevice::new(store);
    let mut mirrors = MemoryMirrors::new();
    let mut metadata = MemoryMetadataStore::new();
    run_session(
        &mut device,
        &mut registry,
        &mut mirrors,
        &mut metadata,
        SyncConfig::default(),
    );

    device.store_mut().reset_stats();
    for creator in [b"aaaa", b"bbbb", b"cccc"] {
        mirrors.store_mut(tag(creator)).unwrap().reset_stats();
    }

    let log = run_session(
        &mut device,
        &mut registry,
        &mut mirrors,
        &mut metadata,
        SyncConfig::default(),
    );
    assert_eq!(log.outcome, SessionOutcome::Completed);
    for entry in &log.entries {
        assert_eq!(entry.outcome, DbOutcome::Synced(SyncType::Fast));
        assert_eq!(entry.report.as_ref().unwrap().stats.writes(), 0);
    }
    assert_eq!(device.store().stats().writes, 0);
    for creator in [b"aaaa", b"bbbb", b"cccc"] {
        assert_eq!(mirrors.store(tag(creator)).unwrap().stats().writes, 0);
    }
}

#[test]
fn local_cancel_aborts_current_and_skips_rest() {
    let (store, mut registry) = three_databases();
    let manager = SyncManager::new();
    let mut session = manager
        .begin_session(PC, SyncConfig::default())
        .unwrap()
        .with_time(1_000);
    let mut device =
        SimulatedDevice::new(store).with_local_cancel_on_open("BDB", session.cancel_token());
    let before = device.user_info().clone();

    let log = session.run(
        &mut device,
        &mut registry,
        &mut MemoryMirrors::new(),
        &mut MemoryMetadataStore::new(),
    );
    assert_eq!(log.outcome, SessionOutcome::Cancelled);
    assert_eq!(
        log.entry("ADB").unwrap().outcome,
        DbOutcome::Synced(SyncType::Slow)
    );
    assert!(matches!(log.entry("BDB").unwrap().outcome, DbOutcome::Aborted(_)));
    assert_eq!(log.entry("CDB").unwrap().outcome, DbOutcome::NotAttempted);
    assert!(!device.has_open_database());
    assert!(session.open_handle().is_none());
    assert_eq!(device.user_info(), &before);

    // Dates on the aborted database stay untouched.
    let info = device
        .store()
        .describe("BDB", 0, hotsync_storage::InfoOptions::ATTRIBUTES)
        .unwrap();
    assert_eq!(info.descriptor.backed_up_at, 0);
}

#[test]
fn handheld_cancel_is_observed_at_yield() {
    let (store, mut registry) = three_databases();
    let mut device = SimulatedDevice::new(store).with_remote_cancel_on_open("BDB");
    let log = run_session(
        &mut device,
        &mut registry,
        &mut MemoryMirrors::new(),
        &mut MemoryMetadataStore::new(),
        SyncConfig::new().with_yield_every(1),
    );
    assert_eq!(log.outcome, SessionOutcome::Cancelled);
    assert!(matches!(log.entry("ADB").unwrap().outcome, DbOutcome::Synced(_)));
    assert!(matches!(log.entry("BDB").unwrap().outcome, DbOutcome::Aborted(_)));
    assert_eq!(log.entry("CDB").unwrap().outcome, DbOutcome::NotAttempted);
    assert!(!device.has_open_database());
}

fn live_payloads(store: &InMemoryStore, database: &str) -> Vec<Vec<u8>> {
    let mut data: Vec<_> = store
        .records(database)
        .unwrap()
        .into_iter()
        .filter(|r| !r.attributes.deleted)
        .map(|r| r.data)
        .collect();
    data.sort();
    data
}

#[test]
fn cancel_partway_through_database_keeps_it_retryable() {
    let store = handheld(&[("ADB", b"aaaa", 3), ("BDB", b"bbbb", 6), ("CDB", b"cccc", 3)]);
    let mut registry =
        registry(&[(b"cccc", "CDB", 30), (b"aaaa", "ADB", 10), (b"bbbb", "BDB", 20)]);
    let mut mirrors = MemoryMirrors::new();
    let mut metadata = MemoryMetadataStore::new();

    let manager = SyncManager::new();
    let mut session = manager
        .begin_session(PC, SyncConfig::new().with_yield_every(1))
        .unwrap()
        .with_time(1_000);
    let mut device = SimulatedDevice::new(store).with_local_cancel_after_yields(
        "BDB",
        3,
        session.cancel_token(),
    );
    let log = session.run(&mut device, &mut registry, &mut mirrors, &mut metadata);
    drop(session);

    assert_eq!(log.outcome, SessionOutcome::Cancelled);
    assert!(matches!(log.entry("ADB").unwrap().outcome, DbOutcome::Synced(_)));
    assert!(matches!(log.entry("BDB").unwrap().outcome, DbOutcome::Aborted(_)));
    assert_eq!(log.entry("CDB").unwrap().outcome, DbOutcome::NotAttempted);
    assert!(!device.has_open_database());

    // Some of BDB reached the desktop before the cancel, not all of it.
    let partial = live_payloads(mirrors.store(tag(b"bbbb")).unwrap(), "BDB").len();
    assert!((1..6).contains(&partial), "pulled {partial} of 6");
    let remote = device.store().records("BDB").unwrap();
    assert!(remote.iter().all(|r| r.attributes.dirty));
    assert!(metadata.load(tag(b"bbbb")).unwrap().database("BDB").is_none());
    assert!(metadata.load(tag(b"aaaa")).unwrap().database("ADB").is_some());

    let mut device = SimulatedDevice::new(device.into_store());
    let log = run_session(
        &mut device,
        &mut registry,
        &mut mirrors,
        &mut metadata,
        SyncConfig::default(),
    );
    assert_eq!(log.outcome, SessionOutcome::Completed);
    for database in ["ADB", "BDB", "CDB"] {
        assert!(matches!(
            log.entry(database).unwrap().outcome,
            DbOutcome::Synced(_)
        ));
    }
    let mirror = live_payloads(mirrors.store(tag(b"bbbb")).unwrap(), "BDB");
    assert_eq!(mirror.len(), 6);
    assert_eq!(mirror, live_payloads(device.store(), "BDB"));
    assert!(device
        .store()
        .records("BDB")
        .unwrap()
        .iter()
        .all(|r| !r.attributes.dirty));
}

#[test]
fn lost_connection_fails_session() {
    let (store, mut registry) = three_databases();
    let mut device = SimulatedDevice::new(store);
    device.disconnect();
    let log = run_session(
        &mut device,
        &mut registry,
        &mut MemoryMirrors::new(),
        &mut MemoryMetadataStore::new(),
        SyncConfig::default(),
    );
    assert_eq!(log.outcome, SessionOutcome::Failed);
    assert!(log.entries.is_empty());
    assert_ne!(device.user_info().last_sync_pc, PC);
}

#[test]
fn disabled_excluded_and_missing_databases_are_skipped() {
    let mut store = handheld(&[("ADB", b"aaaa", 1), ("BDB", b"bbbb", 1)]);
    store.set_excluded_from_sync("BDB", true).unwrap();
    let mut registry = registry(&[
        (b"aaaa", "ADB", 1),
        (b"bbbb", "BDB", 2),
        (b"cccc", "CDB", 3),
        (b"dddd", "DDB", 4),
    ]);
    registry.set_enabled(tag(b"aaaa"), false).unwrap();
    let mut device = SimulatedDevice::new(store);

    let log = run_session(
        &mut device,
        &mut registry,
        &mut MemoryMirrors::new(),
        &mut MemoryMetadataStore::new(),
        SyncConfig::default(),
    );
    assert_eq!(log.outcome, SessionOutcome::Completed);
    assert_eq!(log.entries.len(), 4);
    for entry in &log.entries {
        assert!(
            matches!(entry.outcome, DbOutcome::Skipped(_)),
            "{}: {}",
            entry.database,
            entry.outcome
        );
    }
}

#[test]
fn temporary_preference_is_used_once() {
    let store = handheld(&[("ADB", b"aaaa", 2)]);
    let mut registry = registry(&[(b"aaaa", "ADB", 1)]);
    let mut device = SimulatedDevice::new(store);
    let mut mirrors = MemoryMirrors::new();
    let mut metadata = MemoryMetadataStore::new();
    run_session(
        &mut device,
        &mut registry,
        &mut mirrors,
        &mut metadata,
        SyncConfig::default(),
    );

    registry
        .set_sync_preference(tag(b"aaaa"), SyncPreference::temporary(SyncType::Slow))
        .unwrap();
    let log = run_session(
        &mut device,
        &mut registry,
        &mut mirrors,
        &mut metadata,
        SyncConfig::default(),
    );
    assert_eq!(log.entry("ADB").unwrap().outcome, DbOutcome::Synced(SyncType::Slow));
    assert_eq!(
        registry.sync_preference(tag(b"aaaa")).unwrap().scope,
        PreferenceScope::None
    );

    let log = run_session(
        &mut device,
        &mut registry,
        &mut mirrors,
        &mut metadata,
        SyncConfig::default(),
    );
    assert_eq!(log.entry("ADB").unwrap().outcome, DbOutcome::Synced(SyncType::Fast));
}

#[test]
fn preferences_travel_with_their_conduit() {
    let mut store = handheld(&[("ADB", b"aaaa", 1)]);
    store
        .write_preference(Preference {
            creator: tag(b"aaaa"),
            id: 1,
            version: 2,
            backed_up: true,
            data: b"font=large".to_vec(),
        })
        .unwrap();
    let mut registry = registry(&[(b"aaaa", "ADB", 1)]);
    let mut device = SimulatedDevice::new(store);
    let mut mirrors = MemoryMirrors::new();
    let mut metadata = MemoryMetadataStore::new();
    run_session(
        &mut device,
        &mut registry,
        &mut mirrors,
        &mut metadata,
        SyncConfig::default(),
    );

    let mirror = mirrors.store(tag(b"aaaa")).unwrap();
    let key = PreferenceKey {
        id: 1,
        backed_up: true,
    };
    assert_eq!(
        mirror.read_preference(tag(b"aaaa"), key).unwrap().data,
        b"font=large"
    );
    assert!(metadata
        .load(tag(b"aaaa"))
        .unwrap()
        .preference_baseline(key)
        .is_some());
}

#[test]
fn mirrors_and_metadata_persist_between_sessions() {
    let dir = tempdir().unwrap();
    let store = handheld(&[("MemoDB", b"memo", 4)]);
    let mut registry = ConduitRegistry::with_pc_identifier(PC);
    registry
        .register(
            ConduitConfig::new(tag(b"memo"), "memo conduit")
                .with_remote("MemoDB")
                .with_directory("Memo"),
        )
        .unwrap();
    let mut device = SimulatedDevice::new(store);
    let manager = SyncManager::new();

    {
        let mut mirrors = DirectoryMirrors::new(dir.path().join("mirrors"));
        let mut metadata = JsonMetadataStore::new(dir.path().join("meta"));
        let mut session = manager.begin_session(PC, SyncConfig::default()).unwrap();
        let log = session.run(&mut device, &mut registry, &mut mirrors, &mut metadata);
        assert_eq!(log.outcome, SessionOutcome::Completed);
    }
    assert!(dir.path().join("mirrors").join("Memo").exists());

    let mut mirrors = DirectoryMirrors::new(dir.path().join("mirrors"));
    let mut metadata = JsonMetadataStore::new(dir.path().join("meta"));
    let mut session = manager.begin_session(PC, SyncConfig::default()).unwrap();
    let log = session.run(&mut device, &mut registry, &mut mirrors, &mut metadata);
    let entry = log.entry("MemoDB").unwrap();
    assert_eq!(entry.outcome, DbOutcome::Synced(SyncType::Fast));
    assert_eq!(entry.report.as_ref().unwrap().stats.writes(), 0);
}

#[test]
fn session_log_serializes() {
    let (store, mut registry) = three_databases();
    let mut device = SimulatedDevice::new(store);
    let log = run_session(
        &mut device,
        &mut registry,
        &mut MemoryMirrors::new(),
        &mut MemoryMetadataStore::new(),
        SyncConfig::default(),
    );
    let json = serde_json::to_value(&log).unwrap();
    assert_eq!(json["outcome"], "completed");
    assert_eq!(json["entries"][0]["outcome"]["status"], "synced");
    assert_eq!(json["entries"][0]["outcome"]["detail"], "slow");
}
