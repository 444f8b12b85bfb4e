//! Preference block exchange.
//!
//! Blocks are keyed by ID and backed-up designation and always transferred
//! whole.

use crate::conflict::ConflictResolution;
use crate::device::RemoteDevice;
use crate::error::SyncResult;
use crate::metadata::{CreatorMetadata, Fingerprint};
use hotsync_storage::{FourCc, Preference, PreferenceKey, RecordStore, StoreError};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Counters for one creator's preferences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreferenceReport {
    /// Blocks copied to the desktop.
    pub pulled: u32,
    /// Blocks copied to the handheld.
    pub pushed: u32,
}

/// Picks the surviving block when both sides changed.
///
/// The side holding the backed-up designation wins; if both or neither do,
/// the handheld wins.
pub fn preference_winner(local: &Preference, remote: &Preference) -> ConflictResolution {
    if local.backed_up && !remote.backed_up {
        ConflictResolution::KeepLocal
    } else {
        ConflictResolution::AcceptRemote
    }
}

fn read_optional<S: RecordStore + ?Sized>(
    store: &S,
    creator: FourCc,
    key: PreferenceKey,
) -> SyncResult<Option<Preference>> {
    match store.read_preference(creator, key) {
        Ok(preference) => Ok(Some(preference)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Exchanges the preference blocks of `creator`.
///
/// A slow sync treats every differing block as changed on both sides; a
/// fast sync compares each side against the baseline in `metadata`, which
/// is updated to the agreed blocks.
pub fn sync_preferences<R, L>(
    remote: &mut R,
    local: &mut L,
    creator: FourCc,
    metadata: &mut CreatorMetadata,
    slow: bool,
) -> SyncResult<PreferenceReport>
where
    R: RemoteDevice + ?Sized,
    L: RecordStore + ?Sized,
{
    let mut keys: BTreeSet<PreferenceKey> = remote.list_preferences(creator)?.into_iter().collect();
    keys.extend(local.list_preferences(creator)?);

    let mut report = PreferenceReport::default();
    for key in keys {
        let remote_pref = read_optional(&*remote, creator, key)?;
        let local_pref = read_optional(&*local, creator, key)?;
        let remote_fp = remote_pref.as_ref().map(Fingerprint::of_preference);
        let local_fp = local_pref.as_ref().map(Fingerprint::of_preference);

        let winner = match (&remote_pref, &local_pref) {
            (None, None) => None,
            (Some(_), None) => Some(ConflictResolution::AcceptRemote),
            (None, Some(_)) => Some(ConflictResolution::KeepLocal),
            (Some(_), Some(_)) if remote_fp == local_fp => None,
            (Some(r), Some(l)) => {
                let base = metadata.preference_baseline(key);
                let fast = !slow && base.is_some();
                let remote_changed = !fast || remote_fp != base;
                let local_changed = !fast || local_fp != base;
                Some(match (remote_changed, local_changed) {
                    (false, true) => ConflictResolution::KeepLocal,
                    (true, false) => ConflictResolution::AcceptRemote,
                    _ => preference_winner(l, r),
                })
            }
        };

        match (winner, remote_pref, local_pref) {
            (Some(ConflictResolution::AcceptRemote), Some(preference), _) => {
                local.write_preference(preference)?;
                report.pulled += 1;
                metadata.set_preference_baseline(key, remote_fp);
                debug!(%creator, id = key.id, backed_up = key.backed_up, "preference pulled");
            }
            (Some(ConflictResolution::KeepLocal), _, Some(preference)) => {
                remote.write_preference(preference)?;
                report.pushed += 1;
                metadata.set_preference_baseline(key, local_fp);
                debug!(%creator, id = key.id, backed_up = key.backed_up, "preference pushed");
            }
            _ => metadata.set_preference_baseline(key, remote_fp),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use hotsync_storage::InMemoryStore;

    const MEMO: FourCc = FourCc::from_bytes(*b"memo");

    fn pref(id: u16, backed_up: bool, data: &[u8]) -> Preference {
        Preference {
            creator: MEMO,
            id,
            version: 1,
            backed_up,
            data: data.to_vec(),
        }
    }

    fn key(id: u16, backed_up: bool) -> PreferenceKey {
        PreferenceKey { id, backed_up }
    }

    #[test]
    fn winner_follows_backed_up_designation() {
        let saved = pref(1, true, b"a");
        let unsaved = pref(1, false, b"b");
        assert_eq!(preference_winner(&saved, &unsaved), ConflictResolution::KeepLocal);
        assert_eq!(preference_winner(&unsaved, &saved), ConflictResolution::AcceptRemote);
        assert_eq!(preference_winner(&saved, &saved), ConflictResolution::AcceptRemote);
    }

    #[test]
    fn missing_blocks_are_copied_both_ways() {
        let mut device = SimulatedDevice::new(InMemoryStore::new());
        device.store_mut().write_preference(pref(1, true, b"remote")).unwrap();
        let mut local = InMemoryStore::new();
        local.write_preference(pref(2, false, b"local")).unwrap();
        let mut metadata = CreatorMetadata::new(MEMO);

        let report = sync_preferences(&mut device, &mut local, MEMO, &mut metadata, true).unwrap();
        assert_eq!(report, PreferenceReport { pulled: 1, pushed: 1 });
        assert_eq!(local.read_preference(MEMO, key(1, true)).unwrap().data, b"remote");
        assert_eq!(
            device.store().read_preference(MEMO, key(2, false)).unwrap().data,
            b"local"
        );
        assert!(metadata.preference_baseline(key(1, true)).is_some());
    }

    #[test]
    fn fast_sync_pushes_only_local_change() {
        let mut device = SimulatedDevice::new(InMemoryStore::new());
        device.store_mut().write_preference(pref(1, true, b"v1")).unwrap();
        let mut local = InMemoryStore::new();
        let mut metadata = CreatorMetadata::new(MEMO);
        sync_preferences(&mut device, &mut local, MEMO, &mut metadata, true).unwrap();

        local.write_preference(pref(1, true, b"v2")).unwrap();
        let report = sync_preferences(&mut device, &mut local, MEMO, &mut metadata, false).unwrap();
        assert_eq!(report, PreferenceReport { pulled: 0, pushed: 1 });
        assert_eq!(device.store().read_preference(MEMO, key(1, true)).unwrap().data, b"v2");

        let report = sync_preferences(&mut device, &mut local, MEMO, &mut metadata, false).unwrap();
        assert_eq!(report, PreferenceReport::default());
    }

    #[test]
    fn slow_sync_prefers_handheld() {
        let mut device = SimulatedDevice::new(InMemoryStore::new());
        device.store_mut().write_preference(pref(1, true, b"handheld")).unwrap();
        let mut local = InMemoryStore::new();
        local.write_preference(pref(1, true, b"desktop")).unwrap();
        let mut metadata = CreatorMetadata::new(MEMO);

        let report = sync_preferences(&mut device, &mut local, MEMO, &mut metadata, true).unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(local.read_preference(MEMO, key(1, true)).unwrap().data, b"handheld");
    }
}
