//! CLI command implementations.

pub mod conduit;
pub mod inspect;
pub mod sync;

use hotsync_sync_engine::SessionOutcome;
use thiserror::Error;

/// Registry file inside the desktop directory.
pub const REGISTRY_FILE: &str = "registry.json";
/// Root of the per-conduit mirror stores.
pub const MIRRORS_DIR: &str = "mirrors";
/// Directory of the per-creator sync metadata.
pub const METADATA_DIR: &str = "metadata";
/// Handheld user record, stored next to the handheld's store.
pub const DEVICE_USER_FILE: &str = "device.json";

/// Command failures that do not come from a library crate.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No store holds the named database.
    #[error("database {0:?} not found")]
    DatabaseNotFound(String),

    /// Neither a desktop nor a handheld directory was given.
    #[error("either --path or --device is required")]
    NoStore,

    /// The session stopped before reaching every database.
    #[error("HotSync {0}")]
    SessionStopped(SessionOutcome),
}
