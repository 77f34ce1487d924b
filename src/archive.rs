//! The uniform scoped write surface over archive containers.
//!
//! Two interchangeable backends exist: a real directory tree and a zip file.
//! Both place everything under the database-root segment `db/`. Collection
//! paths and entry names handed to a sink are already safe-encoded.

pub(crate) mod filetree;
pub(crate) mod zip;

use std::{io::Write, path::Path};

use log::warn;

use crate::{backup::BackupProperties, error::ExportResult};

/// [`ArchiveErrorKind`] describes the errors that can be returned by an archive backend
#[derive(thiserror::Error, Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum ArchiveErrorKind {
    /// creating archive directory failed: `{0:?}`
    DirectoryCreationFailed(std::io::Error),
    /// creating archive file failed: `{0:?}`
    FileCreationFailed(std::io::Error),
    /// writing archive entry failed: `{0:?}`
    WritingEntryFailed(std::io::Error),
    /// closing archive entry failed: `{0:?}`
    ClosingEntryFailed(std::io::Error),
    /// zip container error: `{0:?}`
    Zip(#[from] ::zip::result::ZipError),
    /// no collection scope is open
    NoOpenCollection,
    /// no entry is open
    NoOpenEntry,
    /// archive was already finished
    AlreadyFinished,
}

pub(crate) type ArchiveResult<T> = Result<T, ArchiveErrorKind>;

/// Scoped writer for one backup archive.
///
/// Scopes must be balanced: a collection opened with [`new_collection`] is
/// the implicit target of entries and contents until [`close_collection`];
/// outside any collection scope, writes target the database root. Every
/// entry opened with [`new_entry`] must be closed with [`close_entry`],
/// including on failure paths; the scope-guard helpers below take care of
/// that.
///
/// [`new_collection`]: ArchiveSink::new_collection
/// [`close_collection`]: ArchiveSink::close_collection
/// [`new_entry`]: ArchiveSink::new_entry
/// [`close_entry`]: ArchiveSink::close_entry
pub trait ArchiveSink {
    /// Write the root `backup.properties` sidecar. Called once per archive.
    fn set_properties(&mut self, properties: &BackupProperties) -> ArchiveResult<()>;

    /// Open the scope of one collection, given its safe-encoded database path
    /// (e.g. `/db/my%20coll`).
    fn new_collection(&mut self, path: &str) -> ArchiveResult<()>;

    /// Write the manifest of the current collection scope.
    fn write_contents(&mut self, manifest: &[u8]) -> ArchiveResult<()>;

    /// Open one resource payload entry in the current collection scope and
    /// return its writer.
    fn new_entry(&mut self, name: &str) -> ArchiveResult<&mut dyn Write>;

    /// Flush and close the currently open entry.
    fn close_entry(&mut self) -> ArchiveResult<()>;

    /// Close the current collection scope.
    fn close_collection(&mut self) -> ArchiveResult<()>;

    /// Finalize the archive. No writes are accepted afterwards.
    fn finish(&mut self) -> ArchiveResult<()>;

    /// The path of the archive being written.
    fn archive_path(&self) -> &Path;
}

/// Run `body` inside a collection scope, guaranteeing the scope is closed on
/// every exit path. `path` is `None` for the database root, which has no
/// scope of its own.
pub(crate) fn with_collection<T>(
    sink: &mut dyn ArchiveSink,
    path: Option<&str>,
    body: impl FnOnce(&mut dyn ArchiveSink) -> ExportResult<T>,
) -> ExportResult<T> {
    if let Some(path) = path {
        sink.new_collection(path)?;
    }
    let result = body(sink);
    if path.is_some() {
        if let Err(close_err) = sink.close_collection() {
            if result.is_ok() {
                return Err(close_err.into());
            }
            warn!("closing collection scope also failed: {close_err}");
        }
    }
    result
}

/// Run `body` against an open entry writer, guaranteeing the entry is closed
/// on every exit path.
pub(crate) fn with_entry(
    sink: &mut dyn ArchiveSink,
    name: &str,
    body: impl FnOnce(&mut dyn Write) -> ExportResult<()>,
) -> ExportResult<()> {
    let writer = sink.new_entry(name)?;
    let result = body(writer);
    match sink.close_entry() {
        Ok(()) => result,
        Err(close_err) => {
            if result.is_ok() {
                return Err(close_err.into());
            }
            warn!("closing entry also failed: {close_err}");
            result
        }
    }
}

/// Strip the leading `/` so `/db/x` becomes the in-archive path `db/x`.
pub(crate) fn relative_path(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::error::ExportError;

    use super::*;

    /// Sink recording the call sequence, for scope-guard tests.
    #[derive(Debug, Default)]
    struct RecordingSink {
        calls: Vec<String>,
        path: PathBuf,
        fail_close_collection: bool,
        sink: Vec<u8>,
    }

    impl ArchiveSink for RecordingSink {
        fn set_properties(&mut self, _properties: &BackupProperties) -> ArchiveResult<()> {
            self.calls.push("set_properties".into());
            Ok(())
        }

        fn new_collection(&mut self, path: &str) -> ArchiveResult<()> {
            self.calls.push(format!("new_collection {path}"));
            Ok(())
        }

        fn write_contents(&mut self, _manifest: &[u8]) -> ArchiveResult<()> {
            self.calls.push("write_contents".into());
            Ok(())
        }

        fn new_entry(&mut self, name: &str) -> ArchiveResult<&mut dyn Write> {
            self.calls.push(format!("new_entry {name}"));
            Ok(&mut self.sink)
        }

        fn close_entry(&mut self) -> ArchiveResult<()> {
            self.calls.push("close_entry".into());
            Ok(())
        }

        fn close_collection(&mut self) -> ArchiveResult<()> {
            self.calls.push("close_collection".into());
            if self.fail_close_collection {
                Err(ArchiveErrorKind::NoOpenCollection)
            } else {
                Ok(())
            }
        }

        fn finish(&mut self) -> ArchiveResult<()> {
            self.calls.push("finish".into());
            Ok(())
        }

        fn archive_path(&self) -> &Path {
            &self.path
        }
    }

    #[test]
    fn test_with_collection_closes_on_failure() {
        let mut sink = RecordingSink::default();
        let result = with_collection(&mut sink, Some("/db/x"), |_| {
            Err::<(), _>(ExportError::Terminated)
        });
        assert!(result.is_err());
        assert_eq!(
            sink.calls,
            vec!["new_collection /db/x".to_string(), "close_collection".to_string()]
        );
    }

    #[test]
    fn test_with_collection_skips_scope_for_root() {
        let mut sink = RecordingSink::default();
        with_collection(&mut sink, None, |_| Ok(())).unwrap();
        assert!(sink.calls.is_empty());
    }

    #[test]
    fn test_with_collection_reports_close_failure() {
        let mut sink = RecordingSink {
            fail_close_collection: true,
            ..RecordingSink::default()
        };
        let result = with_collection(&mut sink, Some("/db/x"), |_| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn test_with_entry_closes_on_failure() {
        let mut sink = RecordingSink::default();
        let result = with_entry(&mut sink, "a.xml", |_| Err(ExportError::Terminated));
        assert!(result.is_err());
        assert_eq!(
            sink.calls,
            vec!["new_entry a.xml".to_string(), "close_entry".to_string()]
        );
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path("/db/x"), "db/x");
        assert_eq!(relative_path("db/x"), "db/x");
    }
}
