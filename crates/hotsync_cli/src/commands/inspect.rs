//! Inspect command implementation.

use super::{CommandError, MIRRORS_DIR, REGISTRY_FILE};
use hotsync_conduit::ConduitRegistry;
use hotsync_storage::{FileStore, FourCc, InfoOptions, Record, RecordStore};
use hotsync_sync_engine::DirectoryMirrors;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store directory.
    pub store: String,
    /// Database name.
    pub name: String,
    /// Creator ID.
    pub creator: FourCc,
    /// Database type.
    pub db_type: FourCc,
    /// Database version.
    pub version: u16,
    /// Modification number.
    pub mod_number: u32,
    /// Raw database flags.
    pub flags: u16,
    /// Last modification time.
    pub modified_at: i64,
    /// Last backup time.
    pub backed_up_at: i64,
    /// Application info block size in bytes.
    pub app_info_size: u32,
    /// Records that are not deleted.
    pub live_count: usize,
    /// Deleted records still awaiting a sync.
    pub deleted_count: usize,
    /// Every record in index order.
    pub records: Vec<RecordRow>,
}

/// One record of the dump.
#[derive(Debug, Serialize)]
pub struct RecordRow {
    /// Record ID in hex.
    pub id: String,
    /// Category index.
    pub category: u8,
    /// Attribute letters: deleted, modified, busy, secret, archived.
    pub attributes: String,
    /// Payload size in bytes.
    pub size: usize,
    /// Printable start of the payload.
    pub preview: String,
}

const PREVIEW_LEN: usize = 32;

impl From<&Record> for RecordRow {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.to_string(),
            category: record.category.as_u8(),
            attributes: attribute_letters(record),
            size: record.data.len(),
            preview: preview(&record.data),
        }
    }
}

fn attribute_letters(record: &Record) -> String {
    let a = &record.attributes;
    [
        (a.deleted, 'D'),
        (a.dirty, 'M'),
        (a.busy, 'B'),
        (a.secret, 'S'),
        (a.archived, 'A'),
    ]
    .into_iter()
    .map(|(set, letter)| if set { letter } else { '-' })
    .collect()
}

fn preview(data: &[u8]) -> String {
    data.iter()
        .take(PREVIEW_LEN)
        .map(|&b| {
            if (0x20..0x7F).contains(&b) {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Finds the mirror store holding `database`.
fn find_mirror(root: &Path, database: &str) -> Result<FileStore, Box<dyn std::error::Error>> {
    let registry = ConduitRegistry::load(&root.join(REGISTRY_FILE))?;
    let mirrors = DirectoryMirrors::new(root.join(MIRRORS_DIR));
    let mut candidates: Vec<PathBuf> = registry
        .conduits()
        .into_iter()
        .map(|conduit| mirrors.path_for(conduit))
        .collect();
    candidates.dedup();

    for path in candidates.iter().filter(|p| p.is_dir()) {
        let store = FileStore::open(path, false)?;
        if store.describe(database, 0, InfoOptions::ATTRIBUTES).is_ok() {
            debug!(path = %path.display(), database, "found mirror");
            return Ok(store);
        }
    }
    Err(CommandError::DatabaseNotFound(database.to_string()).into())
}

/// Collects the dump of `database` from `store`.
pub fn inspect(store: &FileStore, database: &str) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let info = store.describe(database, 0, InfoOptions::ATTRIBUTES | InfoOptions::SIZE)?;
    let records = store.inner().records(database)?;
    let deleted_count = records.iter().filter(|r| r.attributes.deleted).count();
    let descriptor = info.descriptor;

    Ok(InspectResult {
        store: store.path().display().to_string(),
        name: descriptor.name,
        creator: descriptor.creator,
        db_type: descriptor.db_type,
        version: descriptor.version,
        mod_number: descriptor.mod_number,
        flags: descriptor.flags.bits(),
        modified_at: descriptor.modified_at,
        backed_up_at: descriptor.backed_up_at,
        app_info_size: info.size.map_or(0, |s| s.app_info_size),
        live_count: records.len() - deleted_count,
        deleted_count,
        records: records.iter().map(RecordRow::from).collect(),
    })
}

/// Runs the inspect command.
pub fn run(
    root: Option<&Path>,
    device: Option<&Path>,
    database: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = match (device, root) {
        (Some(device), _) => FileStore::open(device, false)?,
        (None, Some(root)) => find_mirror(root, database)?,
        (None, None) => return Err(CommandError::NoStore.into()),
    };
    let result = inspect(&store, database)?;

    // Output
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text_output(&result),
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("HotSync Database Inspection");
    println!("===========================");
    println!("Store:       {}", result.store);
    println!("Name:        {}", result.name);
    println!("Creator:     {}", result.creator);
    println!("Type:        {}", result.db_type);
    println!("Version:     {}", result.version);
    println!("Mod number:  {}", result.mod_number);
    println!("Flags:       {:#06x}", result.flags);
    println!("App info:    {} bytes", result.app_info_size);
    println!(
        "Records:     {} live, {} deleted",
        result.live_count, result.deleted_count
    );
    if result.records.is_empty() {
        return;
    }
    println!();
    println!("{:<10} {:<4} {:<6} {:>6}  DATA", "ID", "CAT", "ATTR", "SIZE");
    for row in &result.records {
        println!(
            "{:<10} {:<4} {:<6} {:>6}  {}",
            row.id, row.category, row.attributes, row.size, row.preview
        );
    }
}
