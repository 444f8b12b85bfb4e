//! Sync command implementation.
//!
//! The handheld is simulated by a [`FileStore`] directory; its user record
//! lives next to the store in `device.json` so pairing survives between
//! runs.

use super::{CommandError, DEVICE_USER_FILE, METADATA_DIR, MIRRORS_DIR, REGISTRY_FILE};
use hotsync_conduit::ConduitRegistry;
use hotsync_storage::{FileStore, RecordStore};
use hotsync_sync_engine::{
    DbOutcome, DirectoryMirrors, JsonMetadataStore, SessionLog, SessionOutcome, SimulatedDevice,
    SyncConfig, SyncManager, UserInfo,
};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::{debug, warn};

fn load_user(device: &Path) -> Result<Option<UserInfo>, Box<dyn std::error::Error>> {
    let path = device.join(DEVICE_USER_FILE);
    match fs::read(&path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn save_user(device: &Path, user: &UserInfo) -> Result<(), Box<dyn std::error::Error>> {
    let path = device.join(DEVICE_USER_FILE);
    let data = serde_json::to_vec_pretty(user)?;
    let temp = path.with_extension("json.tmp");
    let mut out = File::create(&temp)?;
    out.write_all(&data)?;
    out.sync_all()?;
    drop(out);
    fs::rename(&temp, &path)?;
    debug!(path = %path.display(), "saved handheld user");
    Ok(())
}

/// Runs one session and returns its log.
///
/// The registry is written back afterwards since a one-time preference
/// may have been used up.
pub fn sync_once(
    root: &Path,
    device_dir: &Path,
    slow: bool,
) -> Result<SessionLog, Box<dyn std::error::Error>> {
    let registry_path = root.join(REGISTRY_FILE);
    let mut registry = ConduitRegistry::load(&registry_path)?;
    if registry.is_empty() {
        warn!("no conduits registered");
    }

    let store = FileStore::open(device_dir, false)?;
    let mut device = SimulatedDevice::new(store);
    if let Some(user) = load_user(device_dir)? {
        device = device.with_user(user);
    }

    let mut mirrors = DirectoryMirrors::new(root.join(MIRRORS_DIR));
    let mut metadata = JsonMetadataStore::new(root.join(METADATA_DIR));
    let manager = SyncManager::new();
    let config = SyncConfig::new().with_force_slow(slow);

    let log = {
        let mut session = manager.begin_session(registry.pc_identifier(), config)?;
        session.run(&mut device, &mut registry, &mut mirrors, &mut metadata)
    };

    registry.save(&registry_path)?;
    save_user(device_dir, device.user_info())?;
    device.into_store().flush()?;
    Ok(log)
}

/// Runs the sync command.
pub fn run(
    root: &Path,
    device_dir: &Path,
    slow: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let log = sync_once(root, device_dir, slow)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&log)?);
        }
        _ => print_text_output(&log),
    }

    match log.outcome {
        SessionOutcome::Completed | SessionOutcome::CompletedWithErrors => Ok(()),
        outcome => Err(CommandError::SessionStopped(outcome).into()),
    }
}

fn print_text_output(log: &SessionLog) {
    for entry in &log.entries {
        println!("{} {}: {}", entry.creator, entry.database, entry.outcome);
        if let (DbOutcome::Synced(_), Some(report)) = (&entry.outcome, &entry.report) {
            let stats = &report.stats;
            println!(
                "    pulled {}, pushed {}, moved {}, conflicts {}, skipped {}",
                stats.pulled, stats.pushed, stats.category_changes, stats.conflicts, stats.skipped
            );
        }
    }
    println!("HotSync {}", log.outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotsync_conduit::ConduitConfig;
    use hotsync_storage::{CategoryId, CreateDatabase, FourCc, RecordWrite};
    use tempfile::tempdir;

    const MEMO: FourCc = FourCc::from_bytes(*b"memo");

    fn seed_device(dir: &Path, notes: &[&[u8]]) {
        let mut store = FileStore::open(dir, true).unwrap();
        let memo = CreateDatabase::record_db("MemoDB", MEMO, FourCc::from_bytes(*b"DATA"));
        store.inner_mut().ensure_database(&memo).unwrap();
        for note in notes {
            store
                .inner_mut()
                .app_write("MemoDB", RecordWrite::new(CategoryId::UNFILED, note.to_vec()))
                .unwrap();
        }
        store.save().unwrap();
    }

    fn register_memo(root: &Path) {
        let mut registry = ConduitRegistry::new();
        registry
            .register(ConduitConfig::new(MEMO, "Memo").with_directory("Memo"))
            .unwrap();
        registry.save(&root.join(REGISTRY_FILE)).unwrap();
    }

    #[test]
    fn sync_copies_handheld_records_to_the_mirror() {
        let desktop = tempdir().unwrap();
        let handheld = tempdir().unwrap();
        seed_device(handheld.path(), &[b"groceries", b"call back"]);
        register_memo(desktop.path());

        let log = sync_once(desktop.path(), handheld.path(), false).unwrap();
        assert_eq!(log.outcome, SessionOutcome::Completed);
        assert!(matches!(
            log.entry("MemoDB").unwrap().outcome,
            DbOutcome::Synced(_)
        ));

        let mirror = FileStore::open(&desktop.path().join(MIRRORS_DIR).join("Memo"), false).unwrap();
        let mut notes: Vec<_> = mirror
            .inner()
            .records("MemoDB")
            .unwrap()
            .into_iter()
            .map(|r| r.data)
            .collect();
        notes.sort();
        assert_eq!(notes, vec![b"call back".to_vec(), b"groceries".to_vec()]);
    }

    #[test]
    fn pairing_survives_between_runs() {
        let desktop = tempdir().unwrap();
        let handheld = tempdir().unwrap();
        seed_device(handheld.path(), &[b"note"]);
        register_memo(desktop.path());

        sync_once(desktop.path(), handheld.path(), false).unwrap();
        let user = load_user(handheld.path()).unwrap().unwrap();
        let registry = ConduitRegistry::load(&desktop.path().join(REGISTRY_FILE)).unwrap();
        assert_eq!(user.last_sync_pc, registry.pc_identifier());

        let log = sync_once(desktop.path(), handheld.path(), false).unwrap();
        let report = log.entry("MemoDB").unwrap().report.as_ref().unwrap();
        assert_eq!(report.stats.writes(), 0);
    }

    #[test]
    fn user_save_replaces_file_without_leftovers() {
        let handheld = tempdir().unwrap();
        let path = handheld.path().join(DEVICE_USER_FILE);
        fs::write(&path, b"{ truncated").unwrap();

        let user = UserInfo {
            user_name: "Pat".to_string(),
            last_sync_pc: 0xC0FFEE,
            ..UserInfo::default()
        };
        save_user(handheld.path(), &user).unwrap();

        assert_eq!(load_user(handheld.path()).unwrap(), Some(user));
        assert!(!path.with_extension("json.tmp").exists());
        let names: Vec<_> = fs::read_dir(handheld.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(DEVICE_USER_FILE)]);
    }

    #[test]
    fn missing_device_directory_is_an_error() {
        let desktop = tempdir().unwrap();
        register_memo(desktop.path());
        let missing = desktop.path().join("no-such-handheld");
        assert!(sync_once(desktop.path(), &missing, false).is_err());
    }
}
