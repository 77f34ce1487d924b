//! Exporting one document: payload entry and manifest record.

use std::io::{BufWriter, Write};

use chrono::{DateTime, Utc};
use log::debug;

use crate::{
    archive::{with_entry, ArchiveSink},
    broker::StorageBroker,
    db::document::{Document, XmlDocument},
    error::{ExportError, ExportResult},
    export::ExportContext,
    manifest::{ManifestWriter, ResourceAttributes},
    render::{Receiver, RenderErrorKind, XmlSerializer, XmlStreamRenderer},
    uri::safe_encode,
};

/// Whether the incremental rule requires this document's payload.
///
/// The comparison is strictly against the immediate predecessor's archive
/// date. If that predecessor itself recorded `skip=yes` for the resource,
/// the last captured payload lives further up the chain; the chain is not
/// chased here, consumers must fall back predecessor by predecessor.
pub(crate) fn needs_backup(prev_date: Option<DateTime<Utc>>, modified: DateTime<Utc>) -> bool {
    prev_date.map_or(true, |date| {
        date.timestamp_millis() < modified.timestamp_millis()
    })
}

/// Export one document.
///
/// The payload entry is written unless the incremental rule skips it; the
/// manifest `resource` record is emitted in every case where the document's
/// identity is known, so a payload failure never loses the metadata. Payload
/// failures are reported and contained here; only archive-structure and
/// manifest failures propagate and poison the enclosing collection.
pub(crate) fn export_document<W: Write>(
    ctx: &ExportContext<'_>,
    sink: &mut dyn ArchiveSink,
    doc: &Document,
    manifest: &mut ManifestWriter<W>,
) -> ExportResult<()> {
    let write_payload = needs_backup(ctx.prev_date, doc.meta().modified);
    if write_payload {
        let filename = safe_encode(doc.name());
        let result = with_entry(sink, &filename, |writer| match doc {
            Document::Binary(binary) => {
                let copied = ctx.broker.read_binary_resource(&binary.meta, writer)?;
                debug!("copied {copied} blob bytes for {}", binary.meta.name);
                Ok(())
            }
            Document::Xml(xml) => render_xml(ctx.broker, xml, writer),
        });
        if let Err(err) = result {
            match err {
                ExportError::Archive(archive_err) => return Err(archive_err.into()),
                err => ctx.status.error(
                    &format!("failed to write the payload of {}", doc.name()),
                    Some(&err),
                ),
            }
        }
    } else {
        debug!(
            "{} unchanged since the previous backup, omitting payload",
            doc.name()
        );
    }
    manifest.resource(&ResourceAttributes::from_document(doc, !write_payload))?;
    Ok(())
}

/// Stream an XML document's node store through the serializer into the open
/// archive entry.
fn render_xml(
    broker: &dyn StorageBroker,
    doc: &XmlDocument,
    writer: &mut dyn Write,
) -> ExportResult<()> {
    let mut serializer = XmlSerializer::new(BufWriter::new(writer));
    serializer.start_document()?;
    let children = broker.top_level_children(doc.meta.id)?;
    let mut renderer = XmlStreamRenderer::new();
    for child in children {
        let mut reader = broker.xml_stream_reader(child, true)?;
        renderer.render_child(reader.as_mut(), &mut serializer)?;
    }
    serializer.end_document()?;
    serializer
        .into_inner()
        .flush()
        .map_err(RenderErrorKind::FlushingXmlFailed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_needs_backup_without_predecessor() {
        let modified = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        assert!(needs_backup(None, modified));
    }

    #[test]
    fn test_needs_backup_compares_strictly() {
        let modified = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2023, 4, 30, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 1).unwrap();
        assert!(needs_backup(Some(before), modified));
        assert!(!needs_backup(Some(after), modified));
        // equal timestamps count as already captured
        assert!(!needs_backup(Some(modified), modified));
    }
}
