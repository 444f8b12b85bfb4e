//! Conduit registry commands.

use super::REGISTRY_FILE;
use hotsync_conduit::{
    ConduitConfig, ConduitRegistry, PreferenceScope, SyncPreference, SyncType,
};
use hotsync_storage::FourCc;
use serde::Serialize;
use std::path::Path;

/// Fields of `conduit install`.
#[derive(Debug, Default)]
pub struct InstallOptions {
    /// Conduit name.
    pub name: String,
    /// Display title.
    pub title: Option<String>,
    /// Mirror directory.
    pub directory: Option<String>,
    /// Single handheld database to sync.
    pub remote: Option<String>,
    /// Sync priority.
    pub priority: Option<u32>,
    /// Permanent sync type.
    pub sync_type: Option<SyncType>,
    /// Replace an existing registration.
    pub force: bool,
}

/// One line of `conduit list`.
#[derive(Debug, Serialize)]
pub struct ConduitRow {
    /// Sync priority.
    pub priority: u32,
    /// Creator ID.
    pub creator: FourCc,
    /// Conduit name.
    pub name: String,
    /// Handheld database, if restricted to one.
    pub remote: Option<String>,
    /// Included in syncs.
    pub enabled: bool,
    /// Requested sync type, if any.
    pub preference: String,
}

impl From<&ConduitConfig> for ConduitRow {
    fn from(config: &ConduitConfig) -> Self {
        Self {
            priority: config.priority,
            creator: config.creator,
            name: config.name.clone(),
            remote: config.remote.clone(),
            enabled: config.enabled,
            preference: describe_preference(config.sync_preference),
        }
    }
}

fn describe_preference(preference: SyncPreference) -> String {
    match preference.scope {
        PreferenceScope::None => "none".to_string(),
        PreferenceScope::Permanent => preference.sync_type.to_string(),
        PreferenceScope::Temporary => format!("{} (next sync)", preference.sync_type),
    }
}

fn load(root: &Path) -> Result<ConduitRegistry, Box<dyn std::error::Error>> {
    Ok(ConduitRegistry::load(&root.join(REGISTRY_FILE))?)
}

fn save(root: &Path, registry: &ConduitRegistry) -> Result<(), Box<dyn std::error::Error>> {
    registry.save(&root.join(REGISTRY_FILE))?;
    Ok(())
}

/// Rows for every conduit in sync order.
pub fn rows(registry: &ConduitRegistry) -> Vec<ConduitRow> {
    registry.conduits().into_iter().map(ConduitRow::from).collect()
}

/// Runs `conduit list`.
pub fn list(root: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let registry = load(root)?;
    let rows = rows(&registry);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => {
            if rows.is_empty() {
                println!("No conduits registered.");
                return Ok(());
            }
            println!(
                "{:<4} {:<6} {:<20} {:<20} {:<8} PREFERENCE",
                "PRI", "CRID", "NAME", "REMOTE", "ENABLED"
            );
            for row in &rows {
                println!(
                    "{:<4} {:<6} {:<20} {:<20} {:<8} {}",
                    row.priority,
                    row.creator.to_string(),
                    row.name,
                    row.remote.as_deref().unwrap_or("*"),
                    if row.enabled { "yes" } else { "no" },
                    row.preference
                );
            }
        }
    }
    Ok(())
}

/// Runs `conduit show`.
pub fn show(root: &Path, creator: FourCc, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let registry = load(root)?;
    let config = registry.get(creator)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        _ => {
            println!("Creator:     {}", config.creator);
            println!("Name:        {}", config.name);
            println!("Title:       {}", config.title());
            println!("Kind:        {:?}", config.kind);
            println!("Priority:    {}", config.priority);
            println!("Enabled:     {}", config.enabled);
            println!("Preference:  {}", describe_preference(config.sync_preference));
            let optional = [
                ("Directory", &config.directory),
                ("File", &config.file),
                ("Remote", &config.remote),
                ("User", &config.user),
                ("Module", &config.module),
                ("Argument", &config.argument),
                ("Info", &config.info),
            ];
            for (label, value) in optional {
                if let Some(value) = value {
                    println!("{:<12} {value}", format!("{label}:"));
                }
            }
        }
    }
    Ok(())
}

/// Builds the configuration described by `options`.
pub fn build_config(creator: FourCc, options: InstallOptions) -> ConduitConfig {
    let mut config = ConduitConfig::new(creator, options.name);
    if let Some(title) = options.title {
        config = config.with_title(title);
    }
    if let Some(directory) = options.directory {
        config = config.with_directory(directory);
    }
    if let Some(remote) = options.remote {
        config = config.with_remote(remote);
    }
    if let Some(priority) = options.priority {
        config = config.with_priority(priority);
    }
    if let Some(sync_type) = options.sync_type {
        config = config.with_sync_preference(SyncPreference::permanent(sync_type));
    }
    config
}

/// Runs `conduit install`.
pub fn install(
    root: &Path,
    creator: FourCc,
    options: InstallOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = load(root)?;
    let force = options.force;
    let config = build_config(creator, options);
    let name = config.name.clone();
    if force {
        registry.reinstall(config)?;
    } else {
        registry.register(config)?;
    }
    save(root, &registry)?;
    println!("Installed conduit {creator} ({name})");
    Ok(())
}

/// Runs `conduit remove`.
pub fn remove(root: &Path, creator: FourCc) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = load(root)?;
    registry.unregister(creator)?;
    save(root, &registry)?;
    println!("Removed conduit {creator}");
    Ok(())
}

/// Runs `conduit priority`.
pub fn set_priority(
    root: &Path,
    creator: FourCc,
    priority: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = load(root)?;
    registry.set_priority(creator, priority)?;
    save(root, &registry)?;
    println!("Conduit {creator} priority set to {priority}");
    Ok(())
}

/// Runs `conduit prefer`.
pub fn prefer(
    root: &Path,
    creator: FourCc,
    sync_type: Option<SyncType>,
    once: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let preference = match sync_type {
        None => SyncPreference::NONE,
        Some(sync_type) if once => SyncPreference::temporary(sync_type),
        Some(sync_type) => SyncPreference::permanent(sync_type),
    };
    let mut registry = load(root)?;
    registry.set_sync_preference(creator, preference)?;
    save(root, &registry)?;
    println!(
        "Conduit {creator} preference set to {}",
        describe_preference(preference)
    );
    Ok(())
}

/// Runs `conduit enable` and `conduit disable`.
pub fn set_enabled(
    root: &Path,
    creator: FourCc,
    enabled: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = load(root)?;
    registry.set_enabled(creator, enabled)?;
    save(root, &registry)?;
    println!(
        "Conduit {creator} {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
