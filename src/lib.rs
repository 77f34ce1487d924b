/*!
A library implementing the failsafe system export engine of the xylo native
XML database.

# Overview

The engine walks the database's on-disk collection and document indices
directly, bypassing the normal transactional read path, reconstructs a
logical tree of collections and resources, and streams it into a
self-describing, restorable backup archive (a directory tree or a zip file).
It is built for the situation where the database can no longer be trusted:

- corrupted index entries are reported and skipped, never fatal;
- documents whose parent collection was destroyed are rescued into the
  synthetic `/db/__lost_and_found__` collection;
- incremental exports diff against the most recent prior archive, skipping
  unchanged payloads and recording deletions.

The main type is [`SystemExport`], driven by an [`ExportOptions`] value. The
database side is reached through the [`StorageBroker`] trait; archive output
goes through the [`ArchiveSink`] backends. Progress and problems surface via
an [`ExportStatus`] callback, with an optional [`PercentMonitor`] receiving
percent-complete updates. Prior archives are located and read back through
[`BackupDirectory`] and [`BackupDescriptor`].

The engine only ever reads from the database.

# Example - export an in-memory database into a fresh archive

```rust
use chrono::Utc;
use xylo_export::{
    Collection, CollectionId, DbUri, ExportOptions, LogStatus, MemoryBroker, Permission,
    SystemExport,
};

let mut broker = MemoryBroker::new();
broker
    .insert_collection(&Collection {
        uri: DbUri::root(),
        id: CollectionId(1),
        permission: Permission::new("admin", "dba", 0o755),
        created: Utc::now(),
        children: vec![],
        documents: vec![],
    })
    .unwrap();

let target = tempfile::tempdir().unwrap();
let status = LogStatus;
let mut export = SystemExport::new(&broker, &status, None, &[]);

let options = ExportOptions::default()
    .target_dir(target.path().join("backups").display().to_string());
let archive = export.export(&options);
assert!(archive.is_some());
```
*/

pub(crate) mod archive;
pub(crate) mod backup;
pub(crate) mod broker;
pub(crate) mod check;
pub(crate) mod db;
pub(crate) mod error;
pub(crate) mod export;
/// The collection manifest `__contents__.xml`: writing and parsing
pub mod manifest;
pub(crate) mod progress;
pub(crate) mod render;
/// Database uris and the safe encoding of archive entry names
pub mod uri;

// xylo_export Public API
pub use crate::{
    archive::{filetree::FileTreeSink, zip::ZipSink, ArchiveErrorKind, ArchiveSink},
    backup::{
        BackupDescriptor, BackupDirectory, BackupErrorKind, BackupPlan, BackupProperties,
        PROPERTIES_NAME,
    },
    broker::{
        keys, memory::MemoryBroker, Attribute, BrokerErrorKind, NodeHandle, PrefixMapping, QName,
        ReadContext, ScanControl, StorageBroker, StreamEvent, XmlStreamReader,
    },
    check::ConsistencyError,
    db::{
        collection::Collection,
        document::{
            BinaryDocument, Doctype, Document, DocumentMeta, XmlDocument, DOC_TYPE_BINARY,
            DOC_TYPE_XML,
        },
        CollectionId, DocId, Permission, RecordErrorKind,
    },
    error::{ExportError, ExportResult},
    export::{ExportOptions, SystemExport},
    manifest::{Manifest, ManifestEntry, ManifestErrorKind, ManifestWriter},
    progress::{ExportStatus, LogStatus, NoPercent, NoStatus, PercentMonitor},
    render::{Receiver, RenderErrorKind, XmlSerializer, XmlStreamRenderer},
    uri::{safe_decode, safe_encode, DbUri, UriErrorKind},
};
