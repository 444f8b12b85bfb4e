//! Record, attribute and preference types.

use crate::tag::FourCc;
use serde::{Deserialize, Serialize};

/// Opaque record identifier, stable for the lifetime of a record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(u32);

impl RecordId {
    /// Creates a record ID. IDs are 24-bit on the handheld; the upper byte is
    /// masked off.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id & 0x00FF_FFFF)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#08x}", self.0)
    }
}

/// Category index (0..=15). Category 0 is "Unfiled".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CategoryId(u8);

impl CategoryId {
    /// The "Unfiled" category.
    pub const UNFILED: Self = Self(0);
    /// Number of categories per database.
    pub const COUNT: u8 = 16;

    /// Creates a category, returning `None` if out of range.
    #[must_use]
    pub const fn new(id: u8) -> Option<Self> {
        if id < Self::COUNT {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Returns the raw index.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

/// Record attribute bits as reported by a store.
///
/// Bit layout: deleted `0x80`, dirty `0x40`, busy `0x20`, secret `0x10`,
/// archived `0x08`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordAttributes {
    /// Deleted on the owning side, kept as a tombstone until purged.
    pub deleted: bool,
    /// Modified since the last sync.
    pub dirty: bool,
    /// In use on the handheld. Read-only.
    pub busy: bool,
    /// Private record.
    pub secret: bool,
    /// Marked for archival on deletion.
    pub archived: bool,
}

impl RecordAttributes {
    /// Deleted bit.
    pub const DELETED: u8 = 0x80;
    /// Dirty bit.
    pub const DIRTY: u8 = 0x40;
    /// Busy bit.
    pub const BUSY: u8 = 0x20;
    /// Secret bit.
    pub const SECRET: u8 = 0x10;
    /// Archived bit.
    pub const ARCHIVED: u8 = 0x08;

    /// Decodes attribute bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            deleted: bits & Self::DELETED != 0,
            dirty: bits & Self::DIRTY != 0,
            busy: bits & Self::BUSY != 0,
            secret: bits & Self::SECRET != 0,
            archived: bits & Self::ARCHIVED != 0,
        }
    }

    /// Encodes attribute bits.
    #[must_use]
    pub const fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.deleted {
            bits |= Self::DELETED;
        }
        if self.dirty {
            bits |= Self::DIRTY;
        }
        if self.busy {
            bits |= Self::BUSY;
        }
        if self.secret {
            bits |= Self::SECRET;
        }
        if self.archived {
            bits |= Self::ARCHIVED;
        }
        bits
    }

    /// Returns true if the record changed since the last sync.
    #[must_use]
    pub const fn is_modified(self) -> bool {
        self.dirty || self.deleted
    }

    /// Returns the attributes a writer may set.
    #[must_use]
    pub const fn writable(self) -> WritableAttributes {
        WritableAttributes {
            deleted: self.deleted,
            dirty: self.dirty,
            secret: self.secret,
            archived: self.archived,
        }
    }
}

/// Attributes accepted by a write. There is no busy bit: busy is owned by
/// the handheld and can never be set by a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WritableAttributes {
    /// Deleted.
    pub deleted: bool,
    /// Dirty.
    pub dirty: bool,
    /// Secret.
    pub secret: bool,
    /// Archived.
    pub archived: bool,
}

impl WritableAttributes {
    /// Clean attributes keeping only the secret bit.
    #[must_use]
    pub const fn clean(secret: bool) -> Self {
        Self {
            deleted: false,
            dirty: false,
            secret,
            archived: false,
        }
    }

    /// Tombstone attributes for an archived deletion.
    #[must_use]
    pub const fn archived_tombstone(secret: bool) -> Self {
        Self {
            deleted: true,
            dirty: false,
            secret,
            archived: true,
        }
    }

    /// Converts into full attributes with `busy` cleared.
    #[must_use]
    pub const fn into_attributes(self) -> RecordAttributes {
        RecordAttributes {
            deleted: self.deleted,
            dirty: self.dirty,
            busy: false,
            secret: self.secret,
            archived: self.archived,
        }
    }
}

/// A record as read from a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier.
    pub id: RecordId,
    /// Position in the store at read time.
    pub index: u16,
    /// Category.
    pub category: CategoryId,
    /// Attribute bits.
    pub attributes: RecordAttributes,
    /// Payload.
    pub data: Vec<u8>,
    /// Modification time in seconds since the Unix epoch, if the store
    /// tracks one. Handheld stores usually do not.
    #[serde(default)]
    pub modified_at: Option<i64>,
}

impl Record {
    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Builds a write that stores this record's content under the same ID
    /// with the given attributes.
    #[must_use]
    pub fn to_write(&self, attributes: WritableAttributes) -> RecordWrite {
        RecordWrite {
            id: Some(self.id),
            category: self.category,
            attributes,
            data: self.data.clone(),
        }
    }

    /// Returns true if both records carry the same payload and category.
    #[must_use]
    pub fn same_content(&self, other: &Record) -> bool {
        self.category == other.category
            && self.data == other.data
            && self.attributes.secret == other.attributes.secret
    }
}

/// Input for a record write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite {
    /// Target record, or `None` to create a record with a store-assigned ID.
    pub id: Option<RecordId>,
    /// Category.
    pub category: CategoryId,
    /// Attributes to store.
    pub attributes: WritableAttributes,
    /// Payload.
    pub data: Vec<u8>,
}

impl RecordWrite {
    /// Creates a write for a new record with clean attributes.
    #[must_use]
    pub fn new(category: CategoryId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: None,
            category,
            attributes: WritableAttributes::default(),
            data: data.into(),
        }
    }

    /// Targets an existing (or specific) record ID.
    #[must_use]
    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: WritableAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// An application preference block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preference {
    /// Owning application.
    pub creator: FourCc,
    /// Preference ID within the application.
    pub id: u16,
    /// Preference format version.
    pub version: u16,
    /// True for the backed-up preference database, false for the unsaved one.
    pub backed_up: bool,
    /// Opaque data block.
    pub data: Vec<u8>,
}

/// Key of a preference block within a creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PreferenceKey {
    /// Preference ID.
    pub id: u16,
    /// Backed-up designation.
    pub backed_up: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_bits() {
        let attrs = RecordAttributes::from_bits(0x80 | 0x08);
        assert!(attrs.deleted);
        assert!(attrs.archived);
        assert!(!attrs.dirty);
        assert_eq!(attrs.to_bits(), 0x88);
        assert_eq!(RecordAttributes::from_bits(0xF8).to_bits(), 0xF8);
    }

    #[test]
    fn writable_attributes_drop_busy() {
        let attrs = RecordAttributes::from_bits(0x20 | 0x40);
        let writable = attrs.writable();
        assert!(writable.dirty);
        assert!(!writable.into_attributes().busy);
    }

    #[test]
    fn record_id_is_24_bit() {
        assert_eq!(RecordId::new(0xFF12_3456).as_u32(), 0x12_3456);
    }

    #[test]
    fn category_range() {
        assert!(CategoryId::new(15).is_some());
        assert!(CategoryId::new(16).is_none());
    }
}
