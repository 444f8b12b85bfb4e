//! Database discovery.
//!
//! Lookups by name and resumable searches by (type, creator).

use crate::database::{DbInfo, InfoOptions};
use crate::error::{StoreError, StoreResult};
use crate::store::RecordStore;
use crate::tag::FourCc;
use std::collections::{BTreeMap, VecDeque};

/// Looks up a database by name.
///
/// # Errors
///
/// `NotFound` if no database of that name exists on the card.
pub fn find_by_name<S: RecordStore + ?Sized>(
    store: &S,
    name: &str,
    card: u8,
    options: InfoOptions,
) -> StoreResult<DbInfo> {
    store.describe(name, card, options)
}

/// Search filtering options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchOptions {
    /// Only return the highest version of each database name.
    pub only_latest: bool,
}

impl SearchOptions {
    /// Return every matching version.
    pub const ALL: Self = Self { only_latest: false };
    /// Return the latest version per name.
    pub const LATEST: Self = Self { only_latest: true };
}

/// A resumable catalog search.
///
/// Creating a search starts a fresh enumeration; each [`next`](Self::next)
/// call continues it. The set of matching databases is captured on the
/// first call, so no database is returned twice and none present at the
/// start is skipped. Databases deleted while the search is in progress are
/// not returned.
///
/// # Example
///
/// ```rust
/// use hotsync_storage::{
///     CreateDatabase, DbSearch, FourCc, InMemoryStore, InfoOptions, SearchOptions,
/// };
///
/// let mut store = InMemoryStore::new();
/// let data = FourCc::from_bytes(*b"DATA");
/// store.ensure_database(&CreateDatabase::record_db("MemoDB", FourCc::from_bytes(*b"memo"), data)).unwrap();
/// store.ensure_database(&CreateDatabase::record_db("ToDoDB", FourCc::from_bytes(*b"todo"), data)).unwrap();
///
/// let mut search = DbSearch::new(data, FourCc::WILDCARD, SearchOptions::ALL, InfoOptions::ATTRIBUTES);
/// let mut names = Vec::new();
/// while let Some(info) = search.next(&store).unwrap() {
///     names.push(info.descriptor.name);
/// }
/// assert_eq!(names, ["MemoDB", "ToDoDB"]);
/// ```
#[derive(Debug, Clone)]
pub struct DbSearch {
    db_type: FourCc,
    creator: FourCc,
    cards: Vec<u8>,
    search: SearchOptions,
    info: InfoOptions,
    pending: Option<VecDeque<(String, u8)>>,
}

impl DbSearch {
    /// Starts a search on card 0. Zero tags are wildcards.
    #[must_use]
    pub fn new(db_type: FourCc, creator: FourCc, search: SearchOptions, info: InfoOptions) -> Self {
        Self {
            db_type,
            creator,
            cards: vec![0],
            search,
            info,
            pending: None,
        }
    }

    /// Searches another card.
    #[must_use]
    pub fn on_card(mut self, card: u8) -> Self {
        self.cards = vec![card];
        self
    }

    /// Searches several cards in order. With
    /// [`SearchOptions::only_latest`] a name present on more than one card
    /// is returned once, from the card holding its highest version.
    #[must_use]
    pub fn on_cards(mut self, cards: impl IntoIterator<Item = u8>) -> Self {
        self.cards = cards.into_iter().collect();
        self
    }

    /// Returns the next matching database, or `None` when the search is
    /// exhausted.
    pub fn next<S: RecordStore + ?Sized>(&mut self, store: &S) -> StoreResult<Option<DbInfo>> {
        if self.pending.is_none() {
            self.pending = Some(self.snapshot(store)?);
        }
        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };
        while let Some((name, card)) = pending.pop_front() {
            match store.describe(&name, card, self.info) {
                Ok(info) => return Ok(Some(info)),
                Err(StoreError::NotFound(_)) => {
                    tracing::trace!(name = %name, "database vanished during search");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Collects every remaining result.
    pub fn collect<S: RecordStore + ?Sized>(mut self, store: &S) -> StoreResult<Vec<DbInfo>> {
        let mut out = Vec::new();
        while let Some(info) = self.next(store)? {
            out.push(info);
        }
        Ok(out)
    }

    fn snapshot<S: RecordStore + ?Sized>(
        &self,
        store: &S,
    ) -> StoreResult<VecDeque<(String, u8)>> {
        let mut matching = Vec::new();
        for &card in &self.cards {
            matching.extend(
                store
                    .list_databases(card)?
                    .into_iter()
                    .filter(|d| self.db_type.matches(d.db_type) && self.creator.matches(d.creator)),
            );
        }

        if !self.search.only_latest {
            return Ok(matching.into_iter().map(|d| (d.name, d.card)).collect());
        }

        // Highest version per name, first-seen order.
        let mut order = Vec::new();
        let mut best: BTreeMap<String, (u16, u8)> = BTreeMap::new();
        for d in matching {
            match best.get_mut(&d.name) {
                Some(slot) => {
                    if d.version > slot.0 {
                        *slot = (d.version, d.card);
                    }
                }
                None => {
                    order.push(d.name.clone());
                    best.insert(d.name, (d.version, d.card));
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|name| best.get(&name).map(|&(_, card)| (name.clone(), card)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{CreateDatabase, DbFlags};
    use crate::memory::InMemoryStore;

    fn tag(s: &[u8; 4]) -> FourCc {
        FourCc::from_bytes(*s)
    }

    fn store() -> InMemoryStore {
        let mut store = InMemoryStore::new();
        for (name, creator, db_type) in [
            ("MemoDB", b"memo", b"DATA"),
            ("AddressDB", b"addr", b"DATA"),
            ("MemoApp", b"memo", b"appl"),
        ] {
            store
                .ensure_database(&CreateDatabase::record_db(name, tag(creator), tag(db_type)))
                .unwrap();
        }
        store
    }

    #[test]
    fn find_by_name_reports_not_found() {
        let store = store();
        assert!(find_by_name(&store, "MemoDB", 0, InfoOptions::ATTRIBUTES).is_ok());
        assert!(matches!(
            find_by_name(&store, "Nope", 0, InfoOptions::ATTRIBUTES),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn search_by_creator() {
        let store = store();
        let found = DbSearch::new(
            FourCc::WILDCARD,
            tag(b"memo"),
            SearchOptions::ALL,
            InfoOptions::ATTRIBUTES,
        )
        .collect(&store)
        .unwrap();
        let names: Vec<_> = found.into_iter().map(|i| i.descriptor.name).collect();
        assert_eq!(names, ["MemoDB", "MemoApp"]);
    }

    #[test]
    fn search_is_exhausted_once() {
        let store = store();
        let mut search = DbSearch::new(
            tag(b"appl"),
            FourCc::WILDCARD,
            SearchOptions::ALL,
            InfoOptions::ATTRIBUTES,
        );
        assert!(search.next(&store).unwrap().is_some());
        assert!(search.next(&store).unwrap().is_none());
        assert!(search.next(&store).unwrap().is_none());
    }

    #[test]
    fn deleted_database_is_skipped() {
        let mut store = store();
        let mut search = DbSearch::new(
            tag(b"DATA"),
            FourCc::WILDCARD,
            SearchOptions::ALL,
            InfoOptions::ATTRIBUTES,
        );
        let first = search.next(&store).unwrap().unwrap();
        assert_eq!(first.descriptor.name, "MemoDB");
        store.delete_database("AddressDB", 0).unwrap();
        assert!(search.next(&store).unwrap().is_none());
    }

    #[test]
    fn databases_created_mid_search_are_not_returned() {
        let mut store = store();
        let mut search = DbSearch::new(
            tag(b"DATA"),
            FourCc::WILDCARD,
            SearchOptions::ALL,
            InfoOptions::ATTRIBUTES,
        );
        search.next(&store).unwrap();
        store
            .ensure_database(&CreateDatabase::record_db("ToDoDB", tag(b"todo"), tag(b"DATA")))
            .unwrap();
        assert_eq!(
            search.next(&store).unwrap().unwrap().descriptor.name,
            "AddressDB"
        );
        assert!(search.next(&store).unwrap().is_none());
    }

    #[test]
    fn only_latest_keeps_highest_version_across_cards() {
        let mut store = InMemoryStore::new();
        for (card, version) in [(0u8, 1u16), (1, 3)] {
            store
                .ensure_database(
                    &CreateDatabase::record_db("Prefs", tag(b"psys"), tag(b"sprf"))
                        .with_version(version)
                        .on_card(card),
                )
                .unwrap();
        }
        store
            .ensure_database(&CreateDatabase::record_db("Saved", tag(b"psys"), tag(b"sprf")))
            .unwrap();

        let latest = DbSearch::new(
            tag(b"sprf"),
            FourCc::WILDCARD,
            SearchOptions::LATEST,
            InfoOptions::ATTRIBUTES,
        )
        .on_cards([0, 1])
        .collect(&store)
        .unwrap();
        let found: Vec<_> = latest
            .iter()
            .map(|i| (i.descriptor.name.as_str(), i.descriptor.card, i.descriptor.version))
            .collect();
        assert_eq!(found, [("Prefs", 1, 3), ("Saved", 0, 0)]);

        let all = DbSearch::new(
            tag(b"sprf"),
            FourCc::WILDCARD,
            SearchOptions::ALL,
            InfoOptions::ATTRIBUTES,
        )
        .on_cards([0, 1])
        .collect(&store)
        .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn size_only_when_requested() {
        let store = store();
        let info = find_by_name(&store, "MemoDB", 0, InfoOptions::ATTRIBUTES | InfoOptions::SIZE)
            .unwrap();
        assert_eq!(info.size.unwrap().num_records, 0);
        assert!(info.descriptor.flags.contains(DbFlags::BACKUP));
    }
}
