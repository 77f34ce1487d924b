//! Contracts of the storage broker, the engine's window onto the raw
//! collection and document indices and the node/blob stores.
//!
//! The engine never goes through the transactional read path: it consumes the
//! broker's failsafe scans, which hand raw index keys and record streams to a
//! visitor and tolerate per-key decoding failures.

pub(crate) mod memory;

use std::io::{Read, Write};

use crate::db::{document::DocumentMeta, CollectionId, DocId};

/// [`BrokerErrorKind`] describes the errors a storage broker can return
#[derive(thiserror::Error, Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum BrokerErrorKind {
    /// reading stored blob failed: `{0:?}`
    ReadingBlobFailed(std::io::Error),
    /// copying blob to sink failed: `{0:?}`
    CopyingBlobFailed(std::io::Error),
    /// document `{0}` has no stored payload
    MissingPayload(DocId),
    /// scanning the index failed: `{0}`
    ScanFailed(String),
}

pub(crate) type BrokerResult<T> = Result<T, BrokerErrorKind>;

/// Decision returned by a scan visitor after each index key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanControl {
    /// Keep scanning.
    Continue,
    /// Stop the scan; the broker returns immediately.
    Stop,
}

/// Per-call read settings, threaded through each scan instead of flipping
/// process-wide state.
#[derive(Clone, Copy, Debug)]
pub struct ReadContext {
    /// Whether permission checks apply to this traversal.
    pub verify_permissions: bool,
    /// Whether to bypass caches and read pages directly.
    pub direct_access: bool,
}

impl ReadContext {
    /// Context of the counting pass: no permission checks, cached reads.
    #[must_use]
    pub fn counting() -> Self {
        Self {
            verify_permissions: false,
            direct_access: false,
        }
    }

    /// Context of the export pass.
    #[must_use]
    pub fn export() -> Self {
        Self {
            verify_permissions: true,
            direct_access: false,
        }
    }

    /// Context of the orphan scan: direct page access, bypassing caches.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            verify_permissions: true,
            direct_access: true,
        }
    }
}

/// Layout of the raw index keys handed to scan visitors.
pub mod keys {
    use super::{CollectionId, DocId};

    /// Lead byte of ordinary collection keys.
    pub const COLLECTION_KEY_LEAD: u8 = 0x01;
    /// Offset at which the UTF-8 collection uri starts within a collection key.
    pub const COLLECTION_URI_OFFSET: usize = 2;
    /// Lead byte of the reserved id-allocator keys.
    pub const RESERVED_KEY_LEAD: u8 = 0xFF;
    /// Key holding the next collection id to allocate.
    pub const NEXT_COLLECTION_ID_KEY: [u8; 2] = [RESERVED_KEY_LEAD, 0x01];
    /// Key holding the next document id to allocate.
    pub const NEXT_DOC_ID_KEY: [u8; 2] = [RESERVED_KEY_LEAD, 0x02];
    /// Key holding the freed collection id list.
    pub const FREE_COLLECTION_ID_KEY: [u8; 2] = [RESERVED_KEY_LEAD, 0x03];
    /// Key holding the freed document id list.
    pub const FREE_DOC_ID_KEY: [u8; 2] = [RESERVED_KEY_LEAD, 0x04];
    /// Lead byte of document keys.
    pub const DOCUMENT_KEY_LEAD: u8 = 0x02;
    /// Offset of the document id within a document key.
    pub const DOC_ID_OFFSET: usize = 5;
    /// Offset of the XML/binary type byte within a document key.
    pub const DOC_TYPE_OFFSET: usize = 9;
    /// Total length of a document key.
    pub const DOCUMENT_KEY_LEN: usize = 10;

    /// Whether the key is one of the reserved id-allocator keys.
    #[must_use]
    pub fn is_reserved(key: &[u8]) -> bool {
        key.first() == Some(&RESERVED_KEY_LEAD)
    }

    /// Build a collection key from its uri.
    #[must_use]
    pub fn collection_key(uri: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(COLLECTION_URI_OFFSET + uri.len());
        key.push(COLLECTION_KEY_LEAD);
        key.push(0);
        key.extend_from_slice(uri.as_bytes());
        key
    }

    /// Extract the collection uri from a collection key.
    #[must_use]
    pub fn collection_uri(key: &[u8]) -> Option<&[u8]> {
        if key.first() != Some(&COLLECTION_KEY_LEAD) {
            return None;
        }
        key.get(COLLECTION_URI_OFFSET..)
    }

    /// Build a document key from its ids and type byte.
    #[must_use]
    pub fn document_key(collection_id: CollectionId, doc_id: DocId, type_byte: u8) -> Vec<u8> {
        let mut key = Vec::with_capacity(DOCUMENT_KEY_LEN);
        key.push(DOCUMENT_KEY_LEAD);
        key.extend_from_slice(&collection_id.0.to_be_bytes());
        key.extend_from_slice(&doc_id.0.to_be_bytes());
        key.push(type_byte);
        key
    }

    /// Split a document key into collection id, document id and type byte.
    #[must_use]
    pub fn parse_document_key(key: &[u8]) -> Option<(CollectionId, DocId, u8)> {
        if key.len() != DOCUMENT_KEY_LEN || key[0] != DOCUMENT_KEY_LEAD {
            return None;
        }
        let collection_id = u32::from_be_bytes(key[1..DOC_ID_OFFSET].try_into().ok()?);
        let doc_id = u32::from_be_bytes(key[DOC_ID_OFFSET..DOC_TYPE_OFFSET].try_into().ok()?);
        Some((
            CollectionId(collection_id),
            DocId(doc_id),
            key[DOC_TYPE_OFFSET],
        ))
    }
}

/// Qualified name of an element or attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QName {
    /// Namespace prefix, if any.
    pub prefix: Option<String>,
    /// Local part of the name.
    pub local: String,
    /// Namespace uri the name is bound to, if any.
    pub namespace: Option<String>,
}

impl QName {
    /// A name without prefix or namespace.
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            local: local.into(),
            namespace: None,
        }
    }

    /// A namespace-bound, prefixed name.
    pub fn with_prefix(
        prefix: impl Into<String>,
        local: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            prefix: Some(prefix.into()),
            local: local.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// The lexical form, `prefix:local` or plain `local`.
    #[must_use]
    pub fn qualified(&self) -> String {
        match &self.prefix {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", self.local),
            _ => self.local.clone(),
        }
    }
}

/// One attribute of an element event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    /// The attribute name.
    pub name: QName,
    /// The attribute value, unescaped.
    pub value: String,
}

/// A namespace declaration attached to an element event. The default
/// namespace is represented by an empty prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixMapping {
    /// The declared prefix, empty for the default namespace.
    pub prefix: String,
    /// The namespace uri.
    pub uri: String,
}

/// One event pulled from an index-backed XML stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Document start. Suppressed by the renderer; the caller frames documents.
    StartDocument,
    /// Document end. Suppressed by the renderer.
    EndDocument,
    /// Element start with its attributes and newly declared namespaces.
    StartElement {
        /// The element name.
        name: QName,
        /// Attributes, excluding namespace declarations.
        attributes: Vec<Attribute>,
        /// Namespaces declared at this element.
        namespaces: Vec<PrefixMapping>,
    },
    /// Element end.
    EndElement {
        /// The element name.
        name: QName,
    },
    /// Character data.
    Characters(String),
    /// A CDATA section.
    CData(String),
    /// A comment.
    Comment(String),
    /// A processing instruction.
    ProcessingInstruction {
        /// The PI target.
        target: String,
        /// The PI data, possibly empty.
        data: String,
    },
}

/// Handle to one top-level child node of a stored XML document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHandle {
    /// The owning document.
    pub doc: DocId,
    /// Index of the child under the document node.
    pub child: usize,
}

/// A forward-only pull reader over a stored node subtree.
pub trait XmlStreamReader {
    /// Pull the next event, or `None` at the end of the subtree.
    ///
    /// # Errors
    ///
    /// * If the underlying node pages cannot be read.
    fn next_event(&mut self) -> BrokerResult<Option<StreamEvent>>;
}

/// Raw access to the database's indices and stores.
///
/// Implementations must honor the failsafe contract: a scan reports per-key
/// problems to its caller (by handing over whatever bytes it has) rather than
/// aborting, and returns early when the visitor answers [`ScanControl::Stop`].
pub trait StorageBroker {
    /// Walk the collection index, invoking `visitor` once per key with the raw
    /// key bytes and a stream over the serialized collection record.
    ///
    /// # Errors
    ///
    /// * If the index itself cannot be traversed.
    fn scan_collections_failsafe(
        &self,
        ctx: &ReadContext,
        visitor: &mut dyn FnMut(&[u8], &mut dyn Read) -> ScanControl,
    ) -> BrokerResult<()>;

    /// Walk the document index, invoking `visitor` once per key with the raw
    /// key bytes and a stream over the serialized document record.
    ///
    /// # Errors
    ///
    /// * If the index itself cannot be traversed.
    fn scan_documents_failsafe(
        &self,
        ctx: &ReadContext,
        visitor: &mut dyn FnMut(&[u8], &mut dyn Read) -> ScanControl,
    ) -> BrokerResult<()>;

    /// Copy the blob payload of a binary document into `sink`, returning the
    /// number of bytes copied.
    ///
    /// # Errors
    ///
    /// * [`BrokerErrorKind::MissingPayload`] - If no blob is stored for the document.
    /// * [`BrokerErrorKind::CopyingBlobFailed`] - If writing to the sink fails.
    fn read_binary_resource(&self, doc: &DocumentMeta, sink: &mut dyn Write) -> BrokerResult<u64>;

    /// Handles to the top-level children of a stored XML document, in document
    /// order.
    ///
    /// # Errors
    ///
    /// * [`BrokerErrorKind::MissingPayload`] - If no node tree is stored for the document.
    fn top_level_children(&self, doc: DocId) -> BrokerResult<Vec<NodeHandle>>;

    /// A pull reader over the subtree rooted at `node`.
    ///
    /// # Errors
    ///
    /// * [`BrokerErrorKind::MissingPayload`] - If the node does not exist.
    fn xml_stream_reader(
        &self,
        node: NodeHandle,
        recursive: bool,
    ) -> BrokerResult<Box<dyn XmlStreamReader + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_roundtrips() {
        let key = keys::document_key(CollectionId(5), DocId(42), 1);
        assert_eq!(key.len(), keys::DOCUMENT_KEY_LEN);
        assert_eq!(
            keys::parse_document_key(&key),
            Some((CollectionId(5), DocId(42), 1))
        );
    }

    #[test]
    fn test_collection_key_roundtrips() {
        let key = keys::collection_key("/db/shelf");
        assert_eq!(keys::collection_uri(&key), Some("/db/shelf".as_bytes()));
        assert!(!keys::is_reserved(&key));
    }

    #[test]
    fn test_reserved_keys_are_recognized() {
        for key in [
            keys::NEXT_COLLECTION_ID_KEY,
            keys::NEXT_DOC_ID_KEY,
            keys::FREE_COLLECTION_ID_KEY,
            keys::FREE_DOC_ID_KEY,
        ] {
            assert!(keys::is_reserved(&key));
            assert_eq!(keys::collection_uri(&key), None);
        }
    }

    #[test]
    fn test_malformed_document_keys_are_rejected() {
        assert_eq!(keys::parse_document_key(&[1, 2, 3]), None);
        assert_eq!(keys::parse_document_key(&keys::NEXT_DOC_ID_KEY), None);
    }
}
