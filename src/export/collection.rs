//! Exporting one collection: manifest, documents, children, deletions.

use std::{collections::BTreeSet, io::Write};

use itertools::Itertools;
use log::debug;

use crate::{
    archive::{with_collection, ArchiveSink},
    db::{collection::Collection, document::Document, DocId},
    error::{ExportError, ExportResult},
    export::{document::export_document, ExportContext},
    manifest::{
        CollectionAttributes, DeletedKind, Manifest, ManifestEntry, ManifestWriter,
    },
    uri::{is_reserved_name, safe_encode, DbUri, TEMP_COLLECTION},
};

/// Export one collection into the archive.
///
/// The database root is represented by the archive root itself and opens no
/// scope of its own; every other collection is written inside its own scope,
/// which is guaranteed to close on all exit paths.
pub(crate) fn export_collection(
    ctx: &ExportContext<'_>,
    sink: &mut dyn ArchiveSink,
    collection: &Collection,
    exported: &mut BTreeSet<DocId>,
) -> ExportResult<()> {
    let scope = (!collection.uri.is_root()).then(|| safe_encode(collection.uri.as_str()));
    with_collection(sink, scope.as_deref(), |sink| {
        write_collection(ctx, sink, collection, exported)
    })
}

fn write_collection(
    ctx: &ExportContext<'_>,
    sink: &mut dyn ArchiveSink,
    collection: &Collection,
    exported: &mut BTreeSet<DocId>,
) -> ExportResult<()> {
    let mut manifest = ManifestWriter::new(Vec::new());
    manifest.start_collection(&CollectionAttributes::from_collection(collection))?;

    // documents only count as exported once their manifest is on disk;
    // a collection that fails before that hands them to the orphan scan
    let mut seen = Vec::new();
    let total = collection.documents.len() as u64;
    for (index, doc) in collection.documents.iter().enumerate() {
        if is_reserved_name(doc.name()) {
            debug!("skipping reserved resource name {}", doc.name());
            continue;
        }
        if ctx.errors.is_doc_failed(doc.doc_id()) {
            ctx.status.error(
                &format!(
                    "skipping resource {} flagged by the consistency check",
                    doc.name()
                ),
                None,
            );
            continue;
        }
        if ctx.status.should_terminate() {
            return Err(ExportError::Terminated);
        }
        ctx.status.start_document(doc.name(), index as u64, total);
        export_document(ctx, sink, doc, &mut manifest)?;
        seen.push(doc.doc_id());
    }

    for child in &collection.children {
        let name = child.last_segment();
        if child.as_str() == TEMP_COLLECTION || is_reserved_name(name) {
            debug!("skipping reserved subcollection {child}");
            continue;
        }
        if ctx.errors.is_collection_damaged(child) {
            ctx.status
                .error(&format!("skipping damaged subcollection {child}"), None);
            continue;
        }
        manifest.subcollection(name, &safe_encode(name))?;
    }

    if let Some(prev) = ctx.prev {
        match prev.backup_descriptor_for(&collection.uri) {
            Ok(Some(prev_manifest)) => {
                append_deleted(collection, &prev_manifest, &mut manifest)?;
            }
            Ok(None) => {}
            Err(err) => ctx.status.error(
                &format!(
                    "failed to read the predecessor manifest of {}",
                    collection.uri
                ),
                Some(&err),
            ),
        }
    }

    let bytes = manifest.finish()?;
    sink.write_contents(&bytes)?;
    exported.extend(seen);
    Ok(())
}

/// Record every subcollection and resource the predecessor knew which no
/// longer exists. Deleted entries follow all live entries, deduplicated and
/// in name order.
fn append_deleted<W: Write>(
    collection: &Collection,
    prev: &Manifest,
    manifest: &mut ManifestWriter<W>,
) -> ExportResult<()> {
    let live_children: BTreeSet<&str> = collection
        .children
        .iter()
        .map(DbUri::last_segment)
        .collect();
    let live_docs: BTreeSet<&str> = collection.documents.iter().map(Document::name).collect();

    let mut deleted: BTreeSet<(&str, DeletedKind)> = BTreeSet::new();
    for entry in &prev.entries {
        match entry {
            ManifestEntry::Subcollection { name, .. } if !live_children.contains(name.as_str()) => {
                let _ = deleted.insert((name, DeletedKind::Collection));
            }
            ManifestEntry::Resource { name, .. } if !live_docs.contains(name.as_str()) => {
                let _ = deleted.insert((name, DeletedKind::Resource));
            }
            _ => {}
        }
    }
    if !deleted.is_empty() {
        debug!(
            "recording deleted entries for {}: {}",
            collection.uri,
            deleted.iter().map(|(name, _)| *name).join(", ")
        );
    }
    for (name, kind) in deleted {
        manifest.deleted(name, kind)?;
    }
    Ok(())
}
