//! Rescuing orphan documents into the lost-and-found collection.
//!
//! After the collection pass, every document-index entry whose id was not
//! exported belongs to a skipped or destroyed collection. Those documents
//! are reconstructed straight from the index and written into the synthetic
//! `/db/__lost_and_found__` collection, with colliding file names suffixed
//! `.1`, `.2`, … until unique.

use std::{collections::BTreeSet, io::Read};

use log::{debug, trace};

use crate::{
    archive::{with_collection, ArchiveSink},
    broker::{keys, ReadContext, ScanControl},
    db::{document::read_document, DocId},
    error::{ExportError, ExportResult},
    export::{document::export_document, ExportContext},
    manifest::{CollectionAttributes, ManifestWriter},
    uri::{safe_encode, LOST_AND_FOUND},
};

pub(crate) fn rescue_orphans(
    ctx: &ExportContext<'_>,
    sink: &mut dyn ArchiveSink,
    exported: &BTreeSet<DocId>,
) -> ExportResult<()> {
    let scope = safe_encode(LOST_AND_FOUND);
    with_collection(sink, Some(&scope), |sink| {
        let mut manifest = ManifestWriter::new(Vec::new());
        manifest.start_collection(&CollectionAttributes::lost_and_found())?;

        let mut used: BTreeSet<String> = BTreeSet::new();
        let mut terminated = false;
        let mut poisoned: Option<ExportError> = None;

        ctx.broker.scan_documents_failsafe(
            &ReadContext::direct(),
            &mut |key: &[u8], stream: &mut dyn Read| {
                orphan_pass(
                    ctx,
                    sink,
                    key,
                    stream,
                    exported,
                    &mut manifest,
                    &mut used,
                    &mut terminated,
                    &mut poisoned,
                )
            },
        )?;
        if let Some(err) = poisoned {
            return Err(err);
        }
        if terminated {
            return Err(ExportError::Terminated);
        }

        let bytes = manifest.finish()?;
        sink.write_contents(&bytes)?;
        Ok(())
    })
}

/// One step of the orphan pass. Decoding failures are reported and skipped;
/// only archive-structure failures stop the scan.
#[allow(clippy::too_many_arguments)]
fn orphan_pass(
    ctx: &ExportContext<'_>,
    sink: &mut dyn ArchiveSink,
    key: &[u8],
    stream: &mut dyn Read,
    exported: &BTreeSet<DocId>,
    manifest: &mut ManifestWriter<Vec<u8>>,
    used: &mut BTreeSet<String>,
    terminated: &mut bool,
    poisoned: &mut Option<ExportError>,
) -> ScanControl {
    if ctx.status.should_terminate() {
        *terminated = true;
        return ScanControl::Stop;
    }
    if keys::is_reserved(key) {
        return ScanControl::Continue;
    }
    let Some((collection_id, doc_id, type_byte)) = keys::parse_document_key(key) else {
        trace!("skipping unrecognized document index key");
        return ScanControl::Continue;
    };
    if exported.contains(&doc_id) {
        return ScanControl::Continue;
    }
    if ctx.errors.is_doc_failed(doc_id) {
        debug!("not rescuing document {doc_id} flagged by the consistency check");
        return ScanControl::Continue;
    }
    let doc = match read_document(stream, type_byte) {
        Ok(doc) => doc,
        Err(err) => {
            ctx.status.error(
                &format!("failed to decode orphaned document {doc_id}"),
                Some(&err),
            );
            return ScanControl::Continue;
        }
    };
    ctx.status.error(
        &format!(
            "found orphaned document {} (id {doc_id}, collection id {collection_id}), rescuing it into {LOST_AND_FOUND}",
            doc.name()
        ),
        None,
    );
    let new_name = unique_name(doc.name(), used);
    let doc = doc.with_name(new_name);
    match export_document(ctx, sink, &doc, manifest) {
        Ok(()) => ScanControl::Continue,
        Err(err) => {
            *poisoned = Some(err);
            ScanControl::Stop
        }
    }
}

/// Disambiguate colliding file names inside the lost-and-found collection.
fn unique_name(name: &str, used: &mut BTreeSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{name}.{suffix}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}
