//! Archive backend writing a plain directory tree.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::trace;

use crate::{
    archive::{relative_path, ArchiveErrorKind, ArchiveResult, ArchiveSink},
    backup::{BackupProperties, PROPERTIES_NAME},
    uri::{CONTENTS_NAME, ROOT_COLLECTION},
};

/// Archive backend mirroring the collection tree into real directories under
/// `<archive>/db/`.
#[derive(Debug)]
pub struct FileTreeSink {
    base: PathBuf,
    db_root: PathBuf,
    current: Option<PathBuf>,
    entry: Option<BufWriter<File>>,
    finished: bool,
}

impl FileTreeSink {
    /// Create the archive directory (and its `db/` root) at the given path.
    ///
    /// # Errors
    ///
    /// * [`ArchiveErrorKind::DirectoryCreationFailed`] - If the directories cannot be created.
    pub fn create(path: impl Into<PathBuf>) -> ArchiveResult<Self> {
        let base = path.into();
        let db_root = base.join(relative_path(ROOT_COLLECTION));
        fs::create_dir_all(&db_root).map_err(ArchiveErrorKind::DirectoryCreationFailed)?;
        Ok(Self {
            base,
            db_root,
            current: None,
            entry: None,
            finished: false,
        })
    }

    fn collection_dir(&self) -> &Path {
        self.current.as_deref().unwrap_or(&self.db_root)
    }

    fn check_open(&self) -> ArchiveResult<()> {
        if self.finished {
            return Err(ArchiveErrorKind::AlreadyFinished);
        }
        Ok(())
    }
}

impl ArchiveSink for FileTreeSink {
    fn set_properties(&mut self, properties: &BackupProperties) -> ArchiveResult<()> {
        self.check_open()?;
        fs::write(self.base.join(PROPERTIES_NAME), properties.to_lines())
            .map_err(ArchiveErrorKind::WritingEntryFailed)
    }

    fn new_collection(&mut self, path: &str) -> ArchiveResult<()> {
        self.check_open()?;
        let dir = self.base.join(relative_path(path));
        trace!("creating collection directory {}", dir.display());
        fs::create_dir_all(&dir).map_err(ArchiveErrorKind::DirectoryCreationFailed)?;
        self.current = Some(dir);
        Ok(())
    }

    fn write_contents(&mut self, manifest: &[u8]) -> ArchiveResult<()> {
        self.check_open()?;
        fs::write(self.collection_dir().join(CONTENTS_NAME), manifest)
            .map_err(ArchiveErrorKind::WritingEntryFailed)
    }

    fn new_entry(&mut self, name: &str) -> ArchiveResult<&mut dyn Write> {
        self.check_open()?;
        if self.entry.is_some() {
            // an entry left open by a faulted caller; close it first
            self.close_entry()?;
        }
        let file = File::create(self.collection_dir().join(name))
            .map_err(ArchiveErrorKind::FileCreationFailed)?;
        Ok(self.entry.insert(BufWriter::new(file)))
    }

    fn close_entry(&mut self) -> ArchiveResult<()> {
        let mut entry = self.entry.take().ok_or(ArchiveErrorKind::NoOpenEntry)?;
        entry.flush().map_err(ArchiveErrorKind::ClosingEntryFailed)
    }

    fn close_collection(&mut self) -> ArchiveResult<()> {
        self.current.take().ok_or(ArchiveErrorKind::NoOpenCollection)?;
        Ok(())
    }

    fn finish(&mut self) -> ArchiveResult<()> {
        self.check_open()?;
        self.finished = true;
        Ok(())
    }

    fn archive_path(&self) -> &Path {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn properties() -> BackupProperties {
        BackupProperties {
            date: Utc.with_ymd_and_hms(2023, 5, 1, 10, 30, 0).unwrap(),
            incremental: false,
            previous: String::new(),
            nr_in_sequence: 1,
        }
    }

    #[test]
    fn test_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("backup-20230501-1030");
        let mut sink = FileTreeSink::create(&base).unwrap();

        sink.set_properties(&properties()).unwrap();
        sink.new_collection("/db/shelf").unwrap();
        {
            let writer = sink.new_entry("a.xml").unwrap();
            writer.write_all(b"<r/>").unwrap();
        }
        sink.close_entry().unwrap();
        sink.write_contents(b"<collection/>").unwrap();
        sink.close_collection().unwrap();
        sink.write_contents(b"<root/>").unwrap();
        sink.finish().unwrap();

        assert!(base.join("backup.properties").is_file());
        assert_eq!(
            fs::read(base.join("db/shelf/a.xml")).unwrap(),
            b"<r/>".to_vec()
        );
        assert_eq!(
            fs::read(base.join("db/shelf/__contents__.xml")).unwrap(),
            b"<collection/>".to_vec()
        );
        assert_eq!(fs::read(base.join("db/__contents__.xml")).unwrap(), b"<root/>");
    }

    #[test]
    fn test_no_writes_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileTreeSink::create(dir.path().join("b")).unwrap();
        sink.finish().unwrap();
        assert!(sink.new_collection("/db/x").is_err());
    }

    #[test]
    fn test_unbalanced_close_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileTreeSink::create(dir.path().join("b")).unwrap();
        assert!(sink.close_collection().is_err());
        assert!(sink.close_entry().is_err());
    }
}
