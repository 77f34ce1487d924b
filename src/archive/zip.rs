//! Archive backend writing a zip container.
//!
//! The zip format admits only one open entry at a time, which is why the
//! sink takes per-collection manifests as ready-made buffers.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use log::trace;
use zip::{write::SimpleFileOptions, ZipWriter};

use crate::{
    archive::{relative_path, ArchiveErrorKind, ArchiveResult, ArchiveSink},
    backup::{BackupProperties, PROPERTIES_NAME},
    uri::{CONTENTS_NAME, ROOT_COLLECTION},
};

/// Archive backend writing all entries into one zip file, prefixed with the
/// database-root segment `db/`.
pub struct ZipSink {
    path: PathBuf,
    zip: Option<ZipWriter<File>>,
    current: Option<String>,
    in_entry: bool,
}

impl std::fmt::Debug for ZipSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipSink")
            .field("path", &self.path)
            .field("current", &self.current)
            .field("in_entry", &self.in_entry)
            .finish()
    }
}

impl ZipSink {
    /// Create the zip archive at the given path.
    ///
    /// # Errors
    ///
    /// * [`ArchiveErrorKind::FileCreationFailed`] - If the file cannot be created.
    /// * [`ArchiveErrorKind::Zip`] - If the root directory entry cannot be written.
    pub fn create(path: impl Into<PathBuf>) -> ArchiveResult<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(ArchiveErrorKind::FileCreationFailed)?;
        let mut zip = ZipWriter::new(file);
        zip.add_directory(
            format!("{}/", relative_path(ROOT_COLLECTION)),
            SimpleFileOptions::default(),
        )?;
        Ok(Self {
            path,
            zip: Some(zip),
            current: None,
            in_entry: false,
        })
    }

    fn zip_mut(&mut self) -> ArchiveResult<&mut ZipWriter<File>> {
        self.zip.as_mut().ok_or(ArchiveErrorKind::AlreadyFinished)
    }

    fn entry_name(&self, name: &str) -> String {
        match &self.current {
            Some(dir) => format!("{dir}/{name}"),
            None => format!("{}/{name}", relative_path(ROOT_COLLECTION)),
        }
    }
}

impl ArchiveSink for ZipSink {
    fn set_properties(&mut self, properties: &BackupProperties) -> ArchiveResult<()> {
        let lines = properties.to_lines();
        let zip = self.zip_mut()?;
        zip.start_file(PROPERTIES_NAME, SimpleFileOptions::default())?;
        zip.write_all(lines.as_bytes())
            .map_err(ArchiveErrorKind::WritingEntryFailed)
    }

    fn new_collection(&mut self, path: &str) -> ArchiveResult<()> {
        let dir = relative_path(path).to_string();
        trace!("adding collection directory entry {dir}/");
        self.zip_mut()?
            .add_directory(format!("{dir}/"), SimpleFileOptions::default())?;
        self.current = Some(dir);
        Ok(())
    }

    fn write_contents(&mut self, manifest: &[u8]) -> ArchiveResult<()> {
        let name = self.entry_name(CONTENTS_NAME);
        let zip = self.zip_mut()?;
        zip.start_file(name, SimpleFileOptions::default())?;
        zip.write_all(manifest)
            .map_err(ArchiveErrorKind::WritingEntryFailed)
    }

    fn new_entry(&mut self, name: &str) -> ArchiveResult<&mut dyn Write> {
        let name = self.entry_name(name);
        let zip = self.zip_mut()?;
        zip.start_file(name, SimpleFileOptions::default())?;
        self.in_entry = true;
        Ok(self.zip.as_mut().ok_or(ArchiveErrorKind::AlreadyFinished)?)
    }

    fn close_entry(&mut self) -> ArchiveResult<()> {
        if !self.in_entry {
            return Err(ArchiveErrorKind::NoOpenEntry);
        }
        // the writer finalizes the entry when the next one starts
        self.in_entry = false;
        Ok(())
    }

    fn close_collection(&mut self) -> ArchiveResult<()> {
        self.current.take().ok_or(ArchiveErrorKind::NoOpenCollection)?;
        Ok(())
    }

    fn finish(&mut self) -> ArchiveResult<()> {
        let zip = self.zip.take().ok_or(ArchiveErrorKind::AlreadyFinished)?;
        let _ = zip.finish()?;
        Ok(())
    }

    fn archive_path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use chrono::{TimeZone, Utc};
    use zip::ZipArchive;

    use super::*;

    fn read_entry(path: &Path, name: &str) -> Vec<u8> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_zip_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup-20230501-1030.zip");
        let mut sink = ZipSink::create(&path).unwrap();

        sink.set_properties(&BackupProperties {
            date: Utc.with_ymd_and_hms(2023, 5, 1, 10, 30, 0).unwrap(),
            incremental: false,
            previous: String::new(),
            nr_in_sequence: 1,
        })
        .unwrap();
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

        assert_eq!(read_entry(&path, "db/shelf/a.xml"), b"<r/>".to_vec());
        assert_eq!(
            read_entry(&path, "db/shelf/__contents__.xml"),
            b"<collection/>".to_vec()
        );
        assert_eq!(read_entry(&path, "db/__contents__.xml"), b"<root/>".to_vec());
        assert!(String::from_utf8(read_entry(&path, "backup.properties"))
            .unwrap()
            .contains("incremental=no"));
    }

    #[test]
    fn test_no_writes_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ZipSink::create(dir.path().join("b.zip")).unwrap();
        sink.finish().unwrap();
        assert!(sink.new_collection("/db/x").is_err());
        assert!(sink.finish().is_err());
    }
}
