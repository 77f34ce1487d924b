//! Collections and their on-disk record codec.

use std::io::{Cursor, Read};

use binrw::{binrw, BinRead};
use chrono::{DateTime, Utc};

use crate::{
    db::{
        datetime_from_millis,
        document::{Document, DocumentRecord},
        CollectionId, PackedStr, Permission, RecordErrorKind, RecordResult,
    },
    uri::DbUri,
};

/// A collection as reconstructed from the collection index.
#[derive(Clone, Debug)]
pub struct Collection {
    /// The collection uri.
    pub uri: DbUri,
    /// The collection id.
    pub id: CollectionId,
    /// Ownership and mode bits.
    pub permission: Permission,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Uris of child collections, in iteration order.
    pub children: Vec<DbUri>,
    /// Contained documents, in iteration order.
    pub documents: Vec<Document>,
}

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub(crate) struct CollectionRecord {
    pub(crate) id: u32,
    pub(crate) created: i64,
    pub(crate) owner: PackedStr,
    pub(crate) group: PackedStr,
    pub(crate) mode: u32,
    #[br(temp)]
    #[bw(try_calc = u32::try_from(children.len()))]
    child_count: u32,
    #[br(count = child_count)]
    pub(crate) children: Vec<PackedStr>,
    #[br(temp)]
    #[bw(try_calc = u32::try_from(documents.len()))]
    doc_count: u32,
    #[br(count = doc_count)]
    pub(crate) documents: Vec<DocumentRecord>,
}

impl CollectionRecord {
    pub(crate) fn from_collection(collection: &Collection) -> Self {
        Self {
            id: collection.id.0,
            created: collection.created.timestamp_millis(),
            owner: collection.permission.owner.as_str().into(),
            group: collection.permission.group.as_str().into(),
            mode: collection.permission.mode,
            children: collection
                .children
                .iter()
                .map(|child| child.as_str().into())
                .collect(),
            documents: collection
                .documents
                .iter()
                .map(DocumentRecord::from_document)
                .collect(),
        }
    }

    pub(crate) fn into_collection(self, uri: DbUri) -> Collection {
        Collection {
            uri,
            id: CollectionId(self.id),
            permission: Permission::new(self.owner.value, self.group.value, self.mode),
            created: datetime_from_millis(self.created),
            children: self
                .children
                .into_iter()
                .map(|child| DbUri::new(child.value))
                .collect(),
            documents: self
                .documents
                .into_iter()
                .map(DocumentRecord::into_document)
                .collect(),
        }
    }
}

/// Read one collection from a collection-index record stream.
///
/// # Errors
///
/// * [`RecordErrorKind::ReadingRecordFailed`] - If the stream cannot be read.
/// * [`RecordErrorKind::DecodingCollectionFailed`] - If the record is undecodable.
pub(crate) fn read_collection(uri: DbUri, stream: &mut dyn Read) -> RecordResult<Collection> {
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .map_err(RecordErrorKind::ReadingRecordFailed)?;
    let mut cursor = Cursor::new(buf);
    let record =
        CollectionRecord::read(&mut cursor).map_err(RecordErrorKind::DecodingCollectionFailed)?;
    Ok(record.into_collection(uri))
}
