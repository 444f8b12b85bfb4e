//! Conflict detection and resolution.

use hotsync_storage::{Record, RecordId};
use serde::Serialize;
use std::fmt;

/// Resolution for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the desktop version.
    KeepLocal,
    /// Accept the handheld version.
    AcceptRemote,
}

/// A record modified on both sides since the last sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    /// Record both versions share.
    pub id: RecordId,
    /// Desktop version.
    pub local: Record,
    /// Handheld version.
    pub remote: Record,
    /// Resolution (if any).
    pub resolution: Option<ConflictResolution>,
    /// ID under which the losing version was kept.
    pub duplicate: Option<RecordId>,
}

impl Conflict {
    /// Creates an unresolved conflict.
    pub fn new(local: Record, remote: Record) -> Self {
        Self {
            id: remote.id,
            local,
            remote,
            resolution: None,
            duplicate: None,
        }
    }

    /// Returns true if both sides only disagree about the category.
    pub fn is_category_only(&self) -> bool {
        self.local.data == self.remote.data
            && self.local.attributes.secret == self.remote.attributes.secret
            && self.local.category != self.remote.category
    }

    /// Resolves the conflict with the given resolution.
    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolution = Some(resolution);
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// The winning and losing versions, once resolved.
    pub fn outcome(&self) -> Option<(&Record, &Record)> {
        match self.resolution? {
            ConflictResolution::KeepLocal => Some((&self.local, &self.remote)),
            ConflictResolution::AcceptRemote => Some((&self.remote, &self.local)),
        }
    }
}

/// Picks the winner of a conflict.
///
/// Implementations must be deterministic: the same pair of records always
/// yields the same resolution.
pub trait ConflictResolver: fmt::Debug + Send + Sync {
    /// Decides which version wins.
    fn resolve(&self, local: &Record, remote: &Record) -> ConflictResolution;
}

/// How [`ConflictPolicy::LastWriterWins`] decides when timestamps cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// The handheld wins if its dirty bit is set, otherwise the desktop.
    #[default]
    RemoteModified,
    /// The desktop wins.
    PreferLocal,
}

/// Built-in conflict policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// The handheld always wins.
    RemoteWins,
    /// The desktop always wins.
    LocalWins,
    /// The most recently modified version wins.
    LastWriterWins {
        /// Applied when either side has no modification time, or both are
        /// equal.
        tie_break: TieBreak,
    },
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::LastWriterWins {
            tie_break: TieBreak::RemoteModified,
        }
    }
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, local: &Record, remote: &Record) -> ConflictResolution {
        match self {
            ConflictPolicy::RemoteWins => ConflictResolution::AcceptRemote,
            ConflictPolicy::LocalWins => ConflictResolution::KeepLocal,
            ConflictPolicy::LastWriterWins { tie_break } => {
                match (local.modified_at, remote.modified_at) {
                    (Some(l), Some(r)) if l > r => ConflictResolution::KeepLocal,
                    (Some(l), Some(r)) if r > l => ConflictResolution::AcceptRemote,
                    _ => match tie_break {
                        TieBreak::RemoteModified if remote.attributes.dirty => {
                            ConflictResolution::AcceptRemote
                        }
                        TieBreak::RemoteModified | TieBreak::PreferLocal => {
                            ConflictResolution::KeepLocal
                        }
                    },
                }
            }
        }
    }
}

/// Applies a resolver to a conflict.
pub fn resolve_conflict(resolver: &dyn ConflictResolver, conflict: &mut Conflict) {
    let resolution = resolver.resolve(&conflict.local, &conflict.remote);
    conflict.resolve(resolution);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotsync_storage::{CategoryId, RecordAttributes};

    fn record(data: &str, dirty: bool, modified_at: Option<i64>) -> Record {
        Record {
            id: RecordId::new(1),
            index: 0,
            category: CategoryId::UNFILED,
            attributes: RecordAttributes {
                dirty,
                ..RecordAttributes::default()
            },
            data: data.as_bytes().to_vec(),
            modified_at,
        }
    }

    #[test]
    fn fixed_policies() {
        let local = record("l", true, None);
        let remote = record("r", true, None);
        assert_eq!(
            ConflictPolicy::RemoteWins.resolve(&local, &remote),
            ConflictResolution::AcceptRemote
        );
        assert_eq!(
            ConflictPolicy::LocalWins.resolve(&local, &remote),
            ConflictResolution::KeepLocal
        );
    }

    #[test]
    fn last_writer_compares_timestamps() {
        let policy = ConflictPolicy::LastWriterWins {
            tie_break: TieBreak::PreferLocal,
        };
        let local = record("l", true, Some(100));
        let remote = record("r", true, Some(200));
        assert_eq!(
            policy.resolve(&local, &remote),
            ConflictResolution::AcceptRemote
        );
        let local = record("l", true, Some(300));
        assert_eq!(policy.resolve(&local, &remote), ConflictResolution::KeepLocal);
    }

    #[test]
    fn tie_breaks() {
        let local = record("l", true, None);
        let dirty_remote = record("r", true, Some(5));
        let clean_remote = record("r", false, None);

        let remote_modified = ConflictPolicy::default();
        assert_eq!(
            remote_modified.resolve(&local, &dirty_remote),
            ConflictResolution::AcceptRemote
        );
        assert_eq!(
            remote_modified.resolve(&local, &clean_remote),
            ConflictResolution::KeepLocal
        );

        let prefer_local = ConflictPolicy::LastWriterWins {
            tie_break: TieBreak::PreferLocal,
        };
        assert_eq!(
            prefer_local.resolve(&local, &dirty_remote),
            ConflictResolution::KeepLocal
        );
    }

    #[test]
    fn conflict_outcome() {
        let mut conflict = Conflict::new(record("l", true, None), record("r", true, None));
        assert!(!conflict.is_resolved());
        assert!(conflict.outcome().is_none());
        resolve_conflict(&ConflictPolicy::RemoteWins, &mut conflict);
        let (winner, loser) = conflict.outcome().unwrap();
        assert_eq!(winner.data, b"r");
        assert_eq!(loser.data, b"l");
    }

    #[test]
    fn category_only_conflicts() {
        let local = record("same", true, None);
        let mut remote = record("same", true, None);
        remote.category = CategoryId::new(3).unwrap();
        assert!(Conflict::new(local.clone(), remote).is_category_only());
        assert!(!Conflict::new(local, record("other", true, None)).is_category_only());
    }
}
