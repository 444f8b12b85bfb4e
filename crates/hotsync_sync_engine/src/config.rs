//! Configuration for the sync engine.

use crate::conflict::{ConflictPolicy, ConflictResolver};
use std::sync::Arc;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Records processed between two calls to the device's yield hook.
    /// Zero disables yielding; cancellation is still checked per record.
    pub yield_every: u32,
    /// Time budget handed to each yield, in milliseconds.
    pub yield_max_ms: u32,
    /// Picks the winner when a record changed on both sides.
    pub conflict_resolver: Arc<dyn ConflictResolver>,
    /// Slow-sync every database regardless of pairing.
    pub force_slow: bool,
    /// Stamp the backup date on the handheld database after a sync.
    pub update_backup_date: bool,
    /// Delete archived records locally instead of keeping them as archive
    /// tombstones.
    pub purge_archived_locally: bool,
}

impl SyncConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            yield_every: 32,
            yield_max_ms: 10,
            conflict_resolver: Arc::new(ConflictPolicy::default()),
            force_slow: false,
            update_backup_date: true,
            purge_archived_locally: false,
        }
    }

    /// Sets how many records pass between yields.
    #[must_use]
    pub fn with_yield_every(mut self, records: u32) -> Self {
        self.yield_every = records;
        self
    }

    /// Sets the yield time budget.
    #[must_use]
    pub fn with_yield_max_ms(mut self, max_ms: u32) -> Self {
        self.yield_max_ms = max_ms;
        self
    }

    /// Sets the conflict resolver.
    #[must_use]
    pub fn with_conflict_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.conflict_resolver = Arc::new(resolver);
        self
    }

    /// Forces slow sync.
    #[must_use]
    pub fn with_force_slow(mut self, force: bool) -> Self {
        self.force_slow = force;
        self
    }

    /// Enables or disables backup date stamping.
    #[must_use]
    pub fn with_update_backup_date(mut self, update: bool) -> Self {
        self.update_backup_date = update;
        self
    }

    /// Enables or disables local purging of archived records.
    #[must_use]
    pub fn with_purge_archived_locally(mut self, purge: bool) -> Self {
        self.purge_archived_locally = purge;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
