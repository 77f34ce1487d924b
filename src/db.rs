//! Read-only views over the database's on-disk state: ids, permissions,
//! collections and documents, and their binary record codecs.

pub(crate) mod collection;
pub(crate) mod document;

use binrw::binrw;
use chrono::{DateTime, TimeZone, Utc};

/// Numeric id of a collection.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
)]
pub struct CollectionId(pub u32);

/// Numeric id of a document.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
)]
pub struct DocId(pub u32);

/// [`RecordErrorKind`] describes the errors that can be returned when decoding stored records
#[derive(thiserror::Error, Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum RecordErrorKind {
    /// reading record stream failed: `{0:?}`
    ReadingRecordFailed(std::io::Error),
    /// decoding collection record failed: `{0:?}`
    DecodingCollectionFailed(binrw::Error),
    /// decoding document record failed: `{0:?}`
    DecodingDocumentFailed(binrw::Error),
    /// encoding record failed: `{0:?}`
    EncodingRecordFailed(binrw::Error),
}

pub(crate) type RecordResult<T> = Result<T, RecordErrorKind>;

/// Ownership and access mode of a collection or document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permission {
    /// Name of the owning user.
    pub owner: String,
    /// Name of the owning group.
    pub group: String,
    /// Unix-style permission bits.
    pub mode: u32,
}

impl Permission {
    /// Create a new permission record.
    pub fn new(owner: impl Into<String>, group: impl Into<String>, mode: u32) -> Self {
        Self {
            owner: owner.into(),
            group: group.into(),
            mode,
        }
    }

    /// The permission used for synthetic engine-owned collections.
    #[must_use]
    pub fn dba() -> Self {
        Self::new("DBA", "DBA", 0o771)
    }

    /// The mode bits rendered in octal, as stored in manifests.
    #[must_use]
    pub fn mode_octal(&self) -> String {
        format!("{:o}", self.mode)
    }
}

/// Convert an epoch-millisecond record timestamp into a date, falling back to
/// "now" when the stored value is out of range.
pub(crate) fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(|| {
        log::warn!("record timestamp {millis} out of range, using current time");
        Utc::now()
    })
}

/// A length-prefixed UTF-8 string as stored inside index records.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct PackedStr {
    #[br(temp)]
    #[bw(try_calc = u16::try_from(value.len()))]
    len: u16,
    #[br(count = len, try_map = String::from_utf8)]
    #[bw(map = |value: &String| value.as_bytes().to_vec())]
    pub(crate) value: String,
}

impl From<&str> for PackedStr {
    fn from(value: &str) -> Self {
        Self {
            value: value.to_string(),
        }
    }
}

impl From<String> for PackedStr {
    fn from(value: String) -> Self {
        Self { value }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use binrw::{BinRead, BinWrite};

    use super::*;

    #[test]
    fn test_packed_str_roundtrips() {
        let input = PackedStr::from("hello ü");
        let mut buf = Cursor::new(Vec::new());
        input.write(&mut buf).unwrap();
        buf.set_position(0);
        let output = PackedStr::read(&mut buf).unwrap();
        assert_eq!(input, output);
    }

    #[test]
    fn test_datetime_from_millis_falls_back_on_overflow() {
        let date = datetime_from_millis(1_700_000_000_000);
        assert_eq!(date.timestamp_millis(), 1_700_000_000_000);
        // out of chrono's range: must not panic
        let _ = datetime_from_millis(i64::MAX);
    }

    #[test]
    fn test_mode_octal() {
        assert_eq!(Permission::new("admin", "dba", 0o755).mode_octal(), "755");
        assert_eq!(Permission::dba().mode_octal(), "771");
    }
}
