//! Documents and their on-disk record codec.
//!
//! A document record is a strict header (id, type byte, file name) followed
//! by a metadata tail. The tail is read defensively: a corrupted tail yields
//! placeholder metadata instead of failing the whole document.

use std::io::{Cursor, Read};

use binrw::{binrw, BinRead};
use chrono::{DateTime, Utc};
use log::warn;

use crate::db::{datetime_from_millis, DocId, PackedStr, Permission, RecordErrorKind, RecordResult};

/// Type byte of an XML document, as stored in document keys and records.
pub const DOC_TYPE_XML: u8 = 0;
/// Type byte of a binary document.
pub const DOC_TYPE_BINARY: u8 = 1;

/// Metadata shared by XML and binary documents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentMeta {
    /// The document id.
    pub id: DocId,
    /// The file name (last path segment of the document uri).
    pub name: String,
    /// Ownership and mode bits.
    pub permission: Permission,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Last-modified timestamp.
    pub modified: DateTime<Utc>,
    /// The document's mime type.
    pub mime_type: String,
}

/// The DOCTYPE declaration of an XML document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Doctype {
    /// Name of the root element.
    pub name: String,
    /// Public identifier, if declared.
    pub public_id: Option<String>,
    /// System identifier, if declared.
    pub system_id: Option<String>,
}

/// An XML document backed by the node store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlDocument {
    /// Shared document metadata.
    pub meta: DocumentMeta,
    /// DOCTYPE declaration, if the document has one.
    pub doctype: Option<Doctype>,
}

/// A binary document backed by the blob store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryDocument {
    /// Shared document metadata.
    pub meta: DocumentMeta,
}

/// A stored document, discriminated by the on-disk type byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Document {
    /// An XML document.
    Xml(XmlDocument),
    /// A binary document.
    Binary(BinaryDocument),
}

impl Document {
    /// Shared metadata of either variant.
    #[must_use]
    pub fn meta(&self) -> &DocumentMeta {
        match self {
            Self::Xml(doc) => &doc.meta,
            Self::Binary(doc) => &doc.meta,
        }
    }

    /// The document id.
    #[must_use]
    pub fn doc_id(&self) -> DocId {
        self.meta().id
    }

    /// The file name (last path segment).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta().name
    }

    /// Whether this is a binary document.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// The manifest `type` attribute value for this document.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Xml(_) => "XMLResource",
            Self::Binary(_) => "BinaryResource",
        }
    }

    /// The on-disk type byte for this document.
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::Xml(_) => DOC_TYPE_XML,
            Self::Binary(_) => DOC_TYPE_BINARY,
        }
    }

    /// This document under a different file name. Used when rescuing orphans
    /// whose names collide inside the lost-and-found collection.
    #[must_use]
    pub(crate) fn with_name(mut self, name: String) -> Self {
        match &mut self {
            Self::Xml(doc) => doc.meta.name = name,
            Self::Binary(doc) => doc.meta.name = name,
        }
        self
    }
}

/// Strict leading part of a document record.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocumentHeader {
    pub(crate) doc_id: u32,
    pub(crate) kind: u8,
    pub(crate) name: PackedStr,
}

#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DoctypeRecord {
    pub(crate) name: PackedStr,
    #[br(temp)]
    #[bw(calc = u8::from(public_id.is_some()))]
    has_public_id: u8,
    #[br(if(has_public_id != 0))]
    pub(crate) public_id: Option<PackedStr>,
    #[br(temp)]
    #[bw(calc = u8::from(system_id.is_some()))]
    has_system_id: u8,
    #[br(if(has_system_id != 0))]
    pub(crate) system_id: Option<PackedStr>,
}

/// Metadata tail of a document record.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocumentMetaRecord {
    pub(crate) owner: PackedStr,
    pub(crate) group: PackedStr,
    pub(crate) mode: u32,
    pub(crate) created: i64,
    pub(crate) modified: i64,
    pub(crate) mime: PackedStr,
    #[br(temp)]
    #[bw(calc = u8::from(doctype.is_some()))]
    has_doctype: u8,
    #[br(if(has_doctype != 0))]
    pub(crate) doctype: Option<DoctypeRecord>,
}

impl DocumentMetaRecord {
    /// Placeholder used when the metadata tail cannot be decoded.
    fn fallback() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            owner: "SYSTEM".into(),
            group: "DBA".into(),
            mode: 0o644,
            created: now,
            modified: now,
            mime: "text/xml".into(),
            doctype: None,
        }
    }
}

/// A complete document record, as embedded in collection records.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocumentRecord {
    pub(crate) header: DocumentHeader,
    pub(crate) meta: DocumentMetaRecord,
}

impl DocumentRecord {
    pub(crate) fn from_document(doc: &Document) -> Self {
        let meta = doc.meta();
        let doctype = match doc {
            Document::Xml(xml) => xml.doctype.as_ref().map(|dt| DoctypeRecord {
                name: dt.name.as_str().into(),
                public_id: dt.public_id.as_deref().map(Into::into),
                system_id: dt.system_id.as_deref().map(Into::into),
            }),
            Document::Binary(_) => None,
        };
        Self {
            header: DocumentHeader {
                doc_id: meta.id.0,
                kind: doc.type_byte(),
                name: meta.name.as_str().into(),
            },
            meta: DocumentMetaRecord {
                owner: meta.permission.owner.as_str().into(),
                group: meta.permission.group.as_str().into(),
                mode: meta.permission.mode,
                created: meta.created.timestamp_millis(),
                modified: meta.modified.timestamp_millis(),
                mime: meta.mime_type.as_str().into(),
                doctype,
            },
        }
    }

    pub(crate) fn into_document(self) -> Document {
        build_document(self.header, self.meta)
    }
}

fn build_document(header: DocumentHeader, meta: DocumentMetaRecord) -> Document {
    let shared = DocumentMeta {
        id: DocId(header.doc_id),
        name: header.name.value,
        permission: Permission::new(meta.owner.value, meta.group.value, meta.mode),
        created: datetime_from_millis(meta.created),
        modified: datetime_from_millis(meta.modified),
        mime_type: meta.mime.value,
    };
    match header.kind {
        DOC_TYPE_BINARY => Document::Binary(BinaryDocument { meta: shared }),
        DOC_TYPE_XML => Document::Xml(XmlDocument {
            meta: shared,
            doctype: meta.doctype.map(|dt| Doctype {
                name: dt.name.value,
                public_id: dt.public_id.map(|id| id.value),
                system_id: dt.system_id.map(|id| id.value),
            }),
        }),
        kind => {
            warn!(
                "document {} has unknown type byte {kind}, treating as binary",
                shared.id
            );
            Document::Binary(BinaryDocument { meta: shared })
        }
    }
}

/// Read one document from a document-index record stream.
///
/// The header is read strictly; the metadata tail is read defensively and
/// replaced with placeholder values when undecodable. `kind_from_key` is the
/// type byte taken from the index key and wins over the record's own byte.
///
/// # Errors
///
/// * [`RecordErrorKind::ReadingRecordFailed`] - If the stream cannot be read.
/// * [`RecordErrorKind::DecodingDocumentFailed`] - If the header is undecodable.
pub(crate) fn read_document(stream: &mut dyn Read, kind_from_key: u8) -> RecordResult<Document> {
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .map_err(RecordErrorKind::ReadingRecordFailed)?;
    let mut cursor = Cursor::new(buf);
    let mut header =
        DocumentHeader::read(&mut cursor).map_err(RecordErrorKind::DecodingDocumentFailed)?;
    if header.kind != kind_from_key {
        warn!(
            "document {} record type byte {} disagrees with its key, using the key's {}",
            header.doc_id, header.kind, kind_from_key
        );
        header.kind = kind_from_key;
    }
    let meta = DocumentMetaRecord::read(&mut cursor).unwrap_or_else(|err| {
        warn!(
            "unreadable metadata for document {}, substituting defaults: {err}",
            header.doc_id
        );
        DocumentMetaRecord::fallback()
    });
    Ok(build_document(header, meta))
}

#[cfg(test)]
mod tests {
    use binrw::BinWrite;
    use chrono::TimeZone;

    use super::*;

    fn sample_xml_document() -> Document {
        Document::Xml(XmlDocument {
            meta: DocumentMeta {
                id: DocId(7),
                name: "a.xml".to_string(),
                permission: Permission::new("admin", "dba", 0o644),
                created: Utc.with_ymd_and_hms(2023, 4, 1, 12, 0, 0).unwrap(),
                modified: Utc.with_ymd_and_hms(2023, 4, 2, 12, 0, 0).unwrap(),
                mime_type: "application/xml".to_string(),
            },
            doctype: Some(Doctype {
                name: "html".to_string(),
                public_id: None,
                system_id: Some("about:legacy-compat".to_string()),
            }),
        })
    }

    #[test]
    fn test_document_record_roundtrips() {
        let doc = sample_xml_document();
        let record = DocumentRecord::from_document(&doc);
        let mut buf = Cursor::new(Vec::new());
        record.write(&mut buf).unwrap();
        let bytes = buf.into_inner();

        let decoded = read_document(&mut bytes.as_slice(), DOC_TYPE_XML).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn test_truncated_metadata_yields_defaults() {
        let doc = sample_xml_document();
        let record = DocumentRecord::from_document(&doc);
        let mut buf = Cursor::new(Vec::new());
        record.write(&mut buf).unwrap();
        let mut bytes = buf.into_inner();
        // keep the header (4 + 1 + 2 + "a.xml") and two metadata bytes
        bytes.truncate(4 + 1 + 2 + 5 + 2);

        let decoded = read_document(&mut bytes.as_slice(), DOC_TYPE_XML).unwrap();
        assert_eq!(decoded.doc_id(), DocId(7));
        assert_eq!(decoded.name(), "a.xml");
        assert_eq!(decoded.meta().mime_type, "text/xml");
    }

    #[test]
    fn test_truncated_header_is_an_error() {
        let bytes = [0u8, 0, 0];
        assert!(read_document(&mut bytes.as_ref(), DOC_TYPE_XML).is_err());
    }

    #[test]
    fn test_key_type_byte_wins() {
        let doc = sample_xml_document();
        let record = DocumentRecord::from_document(&doc);
        let mut buf = Cursor::new(Vec::new());
        record.write(&mut buf).unwrap();
        let bytes = buf.into_inner();

        let decoded = read_document(&mut bytes.as_slice(), DOC_TYPE_BINARY).unwrap();
        assert!(decoded.is_binary());
    }
}
