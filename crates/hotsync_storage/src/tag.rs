//! Four-character application and database tags.

use crate::error::StoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A four-character code such as a creator ID (`"memo"`) or a database
/// type (`"DATA"`).
///
/// The tag is an opaque 32-bit key packed big-endian from four bytes. Text
/// conversion is explicit: [`FourCc::from_str`] accepts exactly four
/// printable ASCII characters. The zero tag is the wildcard used by
/// catalog searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FourCc(u32);

impl FourCc {
    /// The wildcard tag.
    pub const WILDCARD: Self = Self(0);

    /// Creates a tag from four bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    /// Creates a tag from its packed integer form.
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// Returns the packed integer form.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the four bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Returns true for the wildcard tag.
    #[must_use]
    pub const fn is_wildcard(self) -> bool {
        self.0 == 0
    }

    /// Returns true if `self` is the wildcard or equal to `other`.
    #[must_use]
    pub fn matches(self, other: FourCc) -> bool {
        self.is_wildcard() || self == other
    }

    /// Renders the tag as text, replacing non-printable bytes with `.`.
    #[must_use]
    pub fn to_string_lossy(self) -> String {
        self.to_bytes()
            .iter()
            .map(|&b| if is_printable(b) { b as char } else { '.' })
            .collect()
    }
}

fn is_printable(b: u8) -> bool {
    (0x20..0x7F).contains(&b)
}

impl FromStr for FourCc {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|&b| is_printable(b)) {
            return Err(StoreError::InvalidArgument(format!(
                "four-character code must be 4 printable ASCII characters, got {s:?}"
            )));
        }
        Ok(Self::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl From<[u8; 4]> for FourCc {
    fn from(bytes: [u8; 4]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl Serialize for FourCc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.to_bytes().iter().all(|&b| is_printable(b)) {
            serializer.serialize_str(&self.to_string_lossy())
        } else {
            serializer.serialize_u32(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for FourCc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Packed(u32),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Packed(v) => Ok(Self(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_big_endian() {
        let tag: FourCc = "MEMO".parse().unwrap();
        assert_eq!(tag.as_u32(), 0x4D45_4D4F);
        assert_eq!(tag.to_bytes(), *b"MEMO");
        assert_eq!(tag.to_string(), "MEMO");
    }

    #[test]
    fn rejects_bad_text() {
        assert!("MEM".parse::<FourCc>().is_err());
        assert!("MEMOS".parse::<FourCc>().is_err());
        assert!("ME\u{7}O".parse::<FourCc>().is_err());
    }

    #[test]
    fn wildcard_matching() {
        let memo = FourCc::from_bytes(*b"memo");
        assert!(FourCc::WILDCARD.matches(memo));
        assert!(memo.matches(memo));
        assert!(!memo.matches(FourCc::from_bytes(*b"addr")));
    }

    #[test]
    fn lossy_rendering() {
        assert_eq!(FourCc::from_u32(0x4142_0043).to_string_lossy(), "AB.C");
    }

    #[test]
    fn cbor_keeps_tag() {
        let tag = FourCc::from_bytes(*b"DATA");
        let mut buf = Vec::new();
        ciborium::into_writer(&tag, &mut buf).unwrap();
        let back: FourCc = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, tag);

        let odd = FourCc::from_u32(7);
        buf.clear();
        ciborium::into_writer(&odd, &mut buf).unwrap();
        let back: FourCc = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, odd);
    }
}
