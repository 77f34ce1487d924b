//! Database URIs and the reversible safe encoding used for archive entry names.

use std::fmt::Write as _;

use serde_derive::{Deserialize, Serialize};

/// URI of the database root collection.
pub const ROOT_COLLECTION: &str = "/db";

/// Name of the synthetic collection receiving rescued orphan documents.
pub const LOST_AND_FOUND_NAME: &str = "__lost_and_found__";

/// URI of the synthetic collection receiving rescued orphan documents.
pub const LOST_AND_FOUND: &str = "/db/__lost_and_found__";

/// URI of the temporary collection, never part of an export.
pub const TEMP_COLLECTION: &str = "/db/system/temp";

/// Name of the per-collection manifest file.
pub const CONTENTS_NAME: &str = "__contents__.xml";

/// [`UriErrorKind`] describes the errors that can be returned when decoding names
#[derive(thiserror::Error, Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum UriErrorKind {
    /// invalid percent escape in `{0}`
    InvalidPercentEscape(String),
    /// decoded name is not valid UTF-8: `{0:?}`
    NonUtf8Name(std::string::FromUtf8Error),
    /// collection key does not contain a UTF-8 uri: `{0:?}`
    NonUtf8Key(std::str::Utf8Error),
}

pub(crate) type UriResult<T> = Result<T, UriErrorKind>;

/// A hierarchical database URI, e.g. `/db/shelf/a.xml`.
///
/// Segments are separated by `/`; the root collection is [`ROOT_COLLECTION`].
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct DbUri(String);

impl DbUri {
    /// Create a new `DbUri` from a path string.
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// The root collection `/db`.
    #[must_use]
    pub fn root() -> Self {
        Self(ROOT_COLLECTION.to_string())
    }

    /// The lost-and-found collection.
    #[must_use]
    pub fn lost_and_found() -> Self {
        Self(LOST_AND_FOUND.to_string())
    }

    /// The uri as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this uri is the database root collection.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_COLLECTION
    }

    /// Append one path segment.
    #[must_use]
    pub fn append(&self, segment: &str) -> Self {
        let mut uri = self.0.clone();
        if !uri.ends_with('/') {
            uri.push('/');
        }
        uri.push_str(segment);
        Self(uri)
    }

    /// The last path segment, e.g. `a.xml` for `/db/shelf/a.xml`.
    #[must_use]
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// The parent uri, or `None` for the root collection.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit_once('/').map(|(parent, _)| {
            if parent.is_empty() {
                Self::root()
            } else {
                Self(parent.to_string())
            }
        })
    }

    /// Whether this uri lies at or below the given prefix uri.
    #[must_use]
    pub fn starts_with(&self, prefix: &DbUri) -> bool {
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0)
                && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }
}

impl From<&str> for DbUri {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for DbUri {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

impl AsRef<str> for DbUri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether a file name is reserved for the engine itself and must never be
/// exported as a resource or subcollection.
#[must_use]
pub fn is_reserved_name(name: &str) -> bool {
    name == CONTENTS_NAME || name == LOST_AND_FOUND_NAME
}

const fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

/// Encode a collection or file name into a form safe as an archive entry name.
///
/// Every byte outside `[A-Za-z0-9._~-]` is percent-encoded; `/` is kept as the
/// segment separator. The encoding is reversible via [`safe_decode`].
#[must_use]
pub fn safe_encode(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for &byte in name.as_bytes() {
        if byte == b'/' || is_unreserved(byte) {
            encoded.push(byte as char);
        } else {
            // infallible: writing to a String cannot fail
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

/// Decode a name encoded by [`safe_encode`].
///
/// # Errors
///
/// * [`UriErrorKind::InvalidPercentEscape`] - If a `%` is not followed by two hex digits.
/// * [`UriErrorKind::NonUtf8Name`] - If the decoded bytes are not valid UTF-8.
pub fn safe_decode(encoded: &str) -> UriResult<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b'%' {
            let digits = bytes
                .get(pos + 1..pos + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| UriErrorKind::InvalidPercentEscape(encoded.to_string()))?;
            decoded.push(digits);
            pos += 3;
        } else {
            decoded.push(bytes[pos]);
            pos += 1;
        }
    }
    String::from_utf8(decoded).map_err(UriErrorKind::NonUtf8Name)
}
