//! In-memory storage broker to be used for testing.

use std::{
    collections::{BTreeMap, HashMap},
    io::{Cursor, Read, Write},
};

use binrw::BinWrite;
use bytes::Bytes;
use log::trace;

use crate::{
    broker::{
        keys, BrokerErrorKind, BrokerResult, NodeHandle, ReadContext, ScanControl, StorageBroker,
        StreamEvent, XmlStreamReader,
    },
    db::{
        collection::{Collection, CollectionRecord},
        document::{Document, DocumentMeta, DocumentRecord},
        CollectionId, DocId, RecordErrorKind, RecordResult,
    },
};

/// In-memory storage broker to be used for testing.
///
/// Holds the collection and document indices as plain ordered maps, node
/// streams as pre-built event sequences, and blobs as byte buffers. All data
/// is non-persistent.
///
/// Do not use this broker in production.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    collections: BTreeMap<Vec<u8>, Bytes>,
    documents: BTreeMap<Vec<u8>, Bytes>,
    nodes: HashMap<DocId, Vec<Vec<StreamEvent>>>,
    blobs: HashMap<DocId, Bytes>,
}

impl MemoryBroker {
    /// Create a new (empty) `MemoryBroker`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a collection record and index entries for all of its documents.
    ///
    /// # Errors
    ///
    /// * [`RecordErrorKind::EncodingRecordFailed`] - If a record cannot be encoded.
    pub fn insert_collection(&mut self, collection: &Collection) -> RecordResult<()> {
        let record = CollectionRecord::from_collection(collection);
        let mut buf = Cursor::new(Vec::new());
        record
            .write(&mut buf)
            .map_err(RecordErrorKind::EncodingRecordFailed)?;
        let _ = self.collections.insert(
            keys::collection_key(collection.uri.as_str()),
            buf.into_inner().into(),
        );
        for doc in &collection.documents {
            self.insert_document(collection.id, doc)?;
        }
        Ok(())
    }

    /// Store one document-index entry.
    ///
    /// # Errors
    ///
    /// * [`RecordErrorKind::EncodingRecordFailed`] - If the record cannot be encoded.
    pub fn insert_document(
        &mut self,
        collection_id: CollectionId,
        doc: &Document,
    ) -> RecordResult<()> {
        let record = DocumentRecord::from_document(doc);
        let mut buf = Cursor::new(Vec::new());
        record
            .write(&mut buf)
            .map_err(RecordErrorKind::EncodingRecordFailed)?;
        let _ = self.documents.insert(
            keys::document_key(collection_id, doc.doc_id(), doc.type_byte()),
            buf.into_inner().into(),
        );
        Ok(())
    }

    /// Store the node streams of an XML document, one event sequence per
    /// top-level child.
    pub fn insert_xml_content(&mut self, doc: DocId, children: Vec<Vec<StreamEvent>>) {
        let _ = self.nodes.insert(doc, children);
    }

    /// Store the blob payload of a binary document.
    pub fn insert_binary_content(&mut self, doc: DocId, bytes: impl Into<Bytes>) {
        let _ = self.blobs.insert(doc, bytes.into());
    }

    /// Store the reserved id-allocator keys, as a live database would have.
    pub fn insert_reserved_keys(&mut self) {
        for key in [
            keys::NEXT_COLLECTION_ID_KEY,
            keys::FREE_COLLECTION_ID_KEY,
        ] {
            let _ = self
                .collections
                .insert(key.to_vec(), Bytes::from_static(&[0, 0, 0, 0]));
        }
        for key in [keys::NEXT_DOC_ID_KEY, keys::FREE_DOC_ID_KEY] {
            let _ = self
                .documents
                .insert(key.to_vec(), Bytes::from_static(&[0, 0, 0, 0]));
        }
    }

    /// Store a raw collection-index entry. Used to inject corrupted records.
    pub fn insert_raw_collection(&mut self, key: Vec<u8>, record: impl Into<Bytes>) {
        let _ = self.collections.insert(key, record.into());
    }

    /// Store a raw document-index entry. Used to inject corrupted records.
    pub fn insert_raw_document(&mut self, key: Vec<u8>, record: impl Into<Bytes>) {
        let _ = self.documents.insert(key, record.into());
    }

    /// Drop a collection record, leaving its document-index entries behind:
    /// the state a destroyed collection leaves in the database.
    pub fn remove_collection(&mut self, uri: &str) {
        let _ = self.collections.remove(&keys::collection_key(uri));
    }
}

struct MemoryStreamReader {
    events: std::vec::IntoIter<StreamEvent>,
}

impl XmlStreamReader for MemoryStreamReader {
    fn next_event(&mut self) -> BrokerResult<Option<StreamEvent>> {
        Ok(self.events.next())
    }
}

impl StorageBroker for MemoryBroker {
    fn scan_collections_failsafe(
        &self,
        ctx: &ReadContext,
        visitor: &mut dyn FnMut(&[u8], &mut dyn Read) -> ScanControl,
    ) -> BrokerResult<()> {
        trace!(
            "scanning {} collection keys (verify_permissions={})",
            self.collections.len(),
            ctx.verify_permissions
        );
        for (key, record) in &self.collections {
            let mut stream: &[u8] = record.as_ref();
            if visitor(key, &mut stream) == ScanControl::Stop {
                return Ok(());
            }
        }
        Ok(())
    }

    fn scan_documents_failsafe(
        &self,
        ctx: &ReadContext,
        visitor: &mut dyn FnMut(&[u8], &mut dyn Read) -> ScanControl,
    ) -> BrokerResult<()> {
        trace!(
            "scanning {} document keys (direct_access={})",
            self.documents.len(),
            ctx.direct_access
        );
        for (key, record) in &self.documents {
            let mut stream: &[u8] = record.as_ref();
            if visitor(key, &mut stream) == ScanControl::Stop {
                return Ok(());
            }
        }
        Ok(())
    }

    fn read_binary_resource(&self, doc: &DocumentMeta, sink: &mut dyn Write) -> BrokerResult<u64> {
        let blob = self
            .blobs
            .get(&doc.id)
            .ok_or(BrokerErrorKind::MissingPayload(doc.id))?;
        sink.write_all(blob)
            .map_err(BrokerErrorKind::CopyingBlobFailed)?;
        Ok(blob.len() as u64)
    }

    fn top_level_children(&self, doc: DocId) -> BrokerResult<Vec<NodeHandle>> {
        let children = self
            .nodes
            .get(&doc)
            .ok_or(BrokerErrorKind::MissingPayload(doc))?;
        Ok((0..children.len())
            .map(|child| NodeHandle { doc, child })
            .collect())
    }

    fn xml_stream_reader(
        &self,
        node: NodeHandle,
        recursive: bool,
    ) -> BrokerResult<Box<dyn XmlStreamReader + '_>> {
        let children = self
            .nodes
            .get(&node.doc)
            .ok_or(BrokerErrorKind::MissingPayload(node.doc))?;
        let events = children
            .get(node.child)
            .ok_or(BrokerErrorKind::MissingPayload(node.doc))?;
        let events = if recursive {
            events.clone()
        } else {
            events.iter().take(1).cloned().collect()
        };
        Ok(Box::new(MemoryStreamReader {
            events: events.into_iter(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::db::{
        document::{BinaryDocument, DocumentMeta},
        Permission,
    };
    use crate::uri::DbUri;

    use super::*;

    fn binary_doc(id: u32, name: &str) -> Document {
        Document::Binary(BinaryDocument {
            meta: DocumentMeta {
                id: DocId(id),
                name: name.to_string(),
                permission: Permission::new("admin", "dba", 0o644),
                created: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
                modified: Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
                mime_type: "application/octet-stream".to_string(),
            },
        })
    }

    #[test]
    fn test_scan_visits_keys_in_order_and_honors_stop() {
        let mut broker = MemoryBroker::new();
        let root = Collection {
            uri: DbUri::root(),
            id: CollectionId(1),
            permission: Permission::new("admin", "dba", 0o755),
            created: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            children: vec![],
            documents: vec![binary_doc(1, "a.bin"), binary_doc(2, "b.bin")],
        };
        broker.insert_collection(&root).unwrap();

        let mut seen = 0;
        broker
            .scan_documents_failsafe(&ReadContext::direct(), &mut |_, _| {
                seen += 1;
                ScanControl::Stop
            })
            .unwrap();
        assert_eq!(seen, 1);

        seen = 0;
        broker
            .scan_documents_failsafe(&ReadContext::direct(), &mut |_, _| {
                seen += 1;
                ScanControl::Continue
            })
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_read_binary_resource_copies_blob() {
        let mut broker = MemoryBroker::new();
        let doc = binary_doc(9, "blob.bin");
        broker.insert_binary_content(DocId(9), &b"payload"[..]);

        let mut sink = Vec::new();
        let copied = broker.read_binary_resource(doc.meta(), &mut sink).unwrap();
        assert_eq!(copied, 7);
        assert_eq!(sink, b"payload");
    }

    #[test]
    fn test_missing_payload_is_an_error() {
        let broker = MemoryBroker::new();
        assert!(broker.top_level_children(DocId(1)).is_err());
    }
}
