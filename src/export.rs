//! The failsafe system export operation.
//!
//! The engine walks the collection index directly, bypassing the
//! transactional read path, and streams everything it can still decode into
//! a self-describing backup archive. Faults are contained per collection and
//! per document; documents whose parent collection is gone are rescued into
//! the lost-and-found collection by a second pass over the document index.

mod collection;
mod document;
mod orphan;

use std::{
    collections::BTreeSet,
    io::Read,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use derive_setters::Setters;
use log::{info, trace};
use serde_derive::{Deserialize, Serialize};

use crate::{
    archive::{filetree::FileTreeSink, zip::ZipSink, ArchiveSink},
    backup::{BackupDescriptor, BackupDirectory, BackupPlan, BackupProperties},
    broker::{keys, ReadContext, ScanControl, StorageBroker},
    check::{ConsistencyError, ErrorIndex},
    db::{collection::read_collection, DocId},
    error::{ExportError, ExportResult},
    export::{collection::export_collection, orphan::rescue_orphans},
    progress::{ExportStatus, PercentMonitor, PercentTracker},
    uri::{DbUri, TEMP_COLLECTION},
};

/// Whether a collection key names the temporary collection or one below it.
fn is_temp_key(key: &[u8]) -> bool {
    keys::collection_uri(key)
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .map_or(false, |uri| {
            DbUri::new(uri).starts_with(&DbUri::new(TEMP_COLLECTION))
        })
}

/// Options for the `export` operation.
#[derive(Clone, Debug, Deserialize, Serialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct ExportOptions {
    /// Directory receiving the archives. A path ending in `.zip` is used
    /// directly as the archive file and selects the zip backend.
    pub target_dir: String,

    /// Back up incrementally against the most recent prior archive.
    pub incremental: bool,

    /// Length cap of an incremental chain; reaching it forces a fresh full
    /// backup. `None` leaves the chain uncapped.
    pub max_incremental: Option<u32>,

    /// Write a zip archive instead of a directory tree.
    pub zip: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            target_dir: "export".to_string(),
            incremental: false,
            max_incremental: None,
            zip: false,
        }
    }
}

/// Context values shared by the traversal visitors. The engine owns all
/// state; visitors only borrow it.
pub(crate) struct ExportContext<'a> {
    pub(crate) broker: &'a dyn StorageBroker,
    pub(crate) status: &'a dyn ExportStatus,
    pub(crate) errors: &'a ErrorIndex,
    /// Archive date of the immediate predecessor, `None` for full backups.
    pub(crate) prev_date: Option<DateTime<Utc>>,
    pub(crate) prev: Option<&'a BackupDescriptor>,
}

/// The failsafe system export engine.
///
/// One instance performs one or more [`export`](Self::export) calls against a
/// fixed broker, status callback and consistency error list. The engine only
/// reads; the database is never mutated.
pub struct SystemExport<'a> {
    broker: &'a dyn StorageBroker,
    status: &'a dyn ExportStatus,
    monitor: Option<&'a dyn PercentMonitor>,
    errors: ErrorIndex,
    collection_count: Option<u64>,
}

impl<'a> SystemExport<'a> {
    /// Create an export engine.
    ///
    /// # Arguments
    ///
    /// * `broker` - Raw index and store access
    /// * `status` - Status callback for progress and problem reports
    /// * `monitor` - Optional management agent receiving percent updates
    /// * `errors` - Error list of a prior consistency check, may be empty
    pub fn new(
        broker: &'a dyn StorageBroker,
        status: &'a dyn ExportStatus,
        monitor: Option<&'a dyn PercentMonitor>,
        errors: &[ConsistencyError],
    ) -> Self {
        Self {
            broker,
            status,
            monitor,
            errors: ErrorIndex::new(errors),
            collection_count: None,
        }
    }

    /// Run one export.
    ///
    /// Returns the path of the written archive, or `None` when a fatal
    /// failure prevented the archive from being produced. Fatal failures are
    /// reported through the status callback with the `EXPORT:` prefix; all
    /// recoverable problems are reported and degrade in place.
    pub fn export(&mut self, options: &ExportOptions) -> Option<PathBuf> {
        match self.run(options) {
            Ok(path) => Some(path),
            Err(err) => {
                self.status
                    .error(&format!("EXPORT: system export failed: {err}"), Some(&err));
                None
            }
        }
    }

    fn run(&mut self, options: &ExportOptions) -> ExportResult<PathBuf> {
        let direct_zip_target = options.target_dir.ends_with(".zip");
        let use_zip = options.zip || direct_zip_target;
        let (plan, path) = if direct_zip_target {
            let target = Path::new(&options.target_dir);
            let parent = target.parent().unwrap_or_else(|| Path::new("."));
            let plan = BackupDirectory::new(parent)
                .plan(options.incremental, options.max_incremental);
            (plan, target.to_path_buf())
        } else {
            let directory = BackupDirectory::new(&options.target_dir);
            let plan = directory.plan(options.incremental, options.max_incremental);
            let path = directory.create_backup(plan.incremental, plan.seq, use_zip)?;
            (plan, path)
        };

        match &plan.previous {
            Some(previous) => info!(
                "starting incremental export against {} into {}",
                previous.name(),
                path.display()
            ),
            None => info!("starting full export into {}", path.display()),
        }

        let mut sink: Box<dyn ArchiveSink> = if use_zip {
            Box::new(ZipSink::create(&path)?)
        } else {
            Box::new(FileTreeSink::create(&path)?)
        };
        sink.set_properties(&BackupProperties {
            date: Utc::now(),
            incremental: plan.incremental,
            previous: plan
                .previous
                .as_ref()
                .map(|previous| previous.name().to_string())
                .unwrap_or_default(),
            nr_in_sequence: plan.seq,
        })?;

        let total = self.count_collections()?;
        let result = self.export_all(sink.as_mut(), &plan, total);
        // structural teardown must run even after traversal failures
        let finish_result = sink.finish();
        result?;
        finish_result?;
        info!("export finished: {}", path.display());
        Ok(path)
    }

    /// Count the collection-index keys to obtain an accurate denominator for
    /// percent reporting. The counting pass runs without permission checks
    /// and its result is cached.
    fn count_collections(&mut self) -> ExportResult<u64> {
        if let Some(count) = self.collection_count {
            return Ok(count);
        }
        let mut count: u64 = 0;
        self.broker.scan_collections_failsafe(
            &ReadContext::counting(),
            &mut |key: &[u8], _stream: &mut dyn Read| {
                if !keys::is_reserved(key) && !is_temp_key(key) {
                    count += 1;
                }
                ScanControl::Continue
            },
        )?;
        trace!("counted {count} collections");
        self.collection_count = Some(count);
        Ok(count)
    }

    fn export_all(
        &self,
        sink: &mut dyn ArchiveSink,
        plan: &BackupPlan,
        total: u64,
    ) -> ExportResult<()> {
        let ctx = ExportContext {
            broker: self.broker,
            status: self.status,
            errors: &self.errors,
            prev_date: plan.previous.as_ref().and_then(BackupDescriptor::date),
            prev: plan.previous.as_ref(),
        };
        let monitor = self.monitor;
        let mut exported: BTreeSet<DocId> = BTreeSet::new();
        let mut tracker = PercentTracker::new(total);
        let mut terminated = false;

        self.broker.scan_collections_failsafe(
            &ReadContext::export(),
            &mut |key: &[u8], stream: &mut dyn Read| {
                collection_pass(
                    &ctx,
                    sink,
                    key,
                    stream,
                    &mut exported,
                    &mut tracker,
                    monitor,
                    &mut terminated,
                )
            },
        )?;
        if terminated {
            return Err(ExportError::Terminated);
        }

        rescue_orphans(&ctx, sink, &exported)
    }
}

/// One step of the collection pass. Anything that fails for a single key is
/// reported and skipped; the traversal always moves on to the next key.
#[allow(clippy::too_many_arguments)]
fn collection_pass(
    ctx: &ExportContext<'_>,
    sink: &mut dyn ArchiveSink,
    key: &[u8],
    stream: &mut dyn Read,
    exported: &mut BTreeSet<DocId>,
    tracker: &mut PercentTracker,
    monitor: Option<&dyn PercentMonitor>,
    terminated: &mut bool,
) -> ScanControl {
    if ctx.status.should_terminate() {
        *terminated = true;
        return ScanControl::Stop;
    }
    if keys::is_reserved(key) {
        trace!("skipping reserved index key");
        return ScanControl::Continue;
    }
    let uri = match keys::collection_uri(key) {
        Some(bytes) => match std::str::from_utf8(bytes) {
            Ok(uri) => DbUri::new(uri),
            Err(err) => {
                ctx.status
                    .error("collection key does not decode as UTF-8", Some(&err));
                return ScanControl::Continue;
            }
        },
        None => {
            ctx.status.error("unrecognized collection index key", None);
            return ScanControl::Continue;
        }
    };
    if uri.starts_with(&DbUri::new(TEMP_COLLECTION)) {
        trace!("skipping temporary collection {uri}");
        return ScanControl::Continue;
    }
    tracker.advance(monitor);
    if ctx.errors.is_collection_damaged(&uri) {
        ctx.status.error(
            &format!("skipping damaged collection {uri}; its documents will be rescued"),
            None,
        );
        return ScanControl::Continue;
    }
    let collection = match read_collection(uri.clone(), stream) {
        Ok(collection) => collection,
        Err(err) => {
            ctx.status
                .error(&format!("failed to decode collection {uri}"), Some(&err));
            return ScanControl::Continue;
        }
    };
    ctx.status.start_collection(uri.as_str());
    match export_collection(ctx, sink, &collection, exported) {
        Ok(()) => ScanControl::Continue,
        Err(ExportError::Terminated) => {
            *terminated = true;
            ScanControl::Stop
        }
        Err(err) => {
            ctx.status
                .error(&format!("failed to export collection {uri}"), Some(&err));
            ScanControl::Continue
        }
    }
}
