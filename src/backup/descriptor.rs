//! Read access to a prior backup archive's structure and properties.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::warn;
use zip::{result::ZipError, ZipArchive};

use crate::{
    backup::{
        parse_archive_name, parse_properties, BackupErrorKind, BackupResult, PROPERTIES_NAME,
        PROP_DATE, PROP_INCREMENTAL, PROP_NR_IN_SEQUENCE, PROP_PREVIOUS,
    },
    manifest::{read_manifest, Manifest},
    uri::{safe_encode, DbUri, CONTENTS_NAME},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContainerKind {
    Zip,
    FileTree,
}

/// A readable handle to a prior archive: its properties and its per-collection
/// manifests, independent of the container in use.
#[derive(Clone, Debug)]
pub struct BackupDescriptor {
    path: PathBuf,
    name: String,
    kind: ContainerKind,
    properties: BTreeMap<String, String>,
}

impl BackupDescriptor {
    /// Open an archive produced by this engine.
    ///
    /// A missing properties sidecar is tolerated with a warning, so that
    /// partially written predecessors can still serve manifests.
    ///
    /// # Errors
    ///
    /// * [`BackupErrorKind::NotAnArchive`] - If the path is neither a directory nor a zip file.
    /// * [`BackupErrorKind::NonUnicodePath`] - If the archive name is not unicode.
    pub fn open(path: &Path) -> BackupResult<Self> {
        let kind = if path.is_dir() {
            ContainerKind::FileTree
        } else if path.extension().is_some_and(|ext| ext == "zip") && path.is_file() {
            ContainerKind::Zip
        } else {
            return Err(BackupErrorKind::NotAnArchive(path.to_path_buf()));
        };
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| BackupErrorKind::NonUnicodePath(path.to_path_buf()))?
            .to_string();
        let mut descriptor = Self {
            path: path.to_path_buf(),
            name,
            kind,
            properties: BTreeMap::new(),
        };
        match descriptor.read_file(PROPERTIES_NAME)? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                descriptor.properties = parse_properties(&text).into_iter().collect();
            }
            None => warn!(
                "archive {} has no {PROPERTIES_NAME} sidecar",
                descriptor.name
            ),
        }
        Ok(descriptor)
    }

    fn read_file(&self, inner: &str) -> BackupResult<Option<Vec<u8>>> {
        match self.kind {
            ContainerKind::FileTree => {
                let path = self.path.join(inner);
                if !path.is_file() {
                    return Ok(None);
                }
                fs::read(path)
                    .map(Some)
                    .map_err(BackupErrorKind::ReadingArchiveFailed)
            }
            ContainerKind::Zip => {
                let file =
                    File::open(&self.path).map_err(BackupErrorKind::OpeningArchiveFailed)?;
                let mut archive = ZipArchive::new(file)?;
                let mut entry = match archive.by_name(inner) {
                    Ok(entry) => entry,
                    Err(ZipError::FileNotFound) => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                let mut buf = Vec::new();
                entry
                    .read_to_end(&mut buf)
                    .map_err(BackupErrorKind::ReadingArchiveFailed)?;
                Ok(Some(buf))
            }
        }
    }

    /// The archive's file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The archive's location on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A displayable identification of this archive.
    #[must_use]
    pub fn symbolic_path(&self) -> String {
        self.path.display().to_string()
    }

    /// The raw properties read from the sidecar.
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// The archive date: the recorded property if parseable, the date encoded
    /// in the archive name otherwise.
    #[must_use]
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.properties
            .get(PROP_DATE)
            .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
            .map(|date| date.with_timezone(&Utc))
            .or_else(|| parse_archive_name(&self.name).map(|(date, _)| date))
    }

    /// Whether this archive was recorded as incremental.
    #[must_use]
    pub fn incremental(&self) -> bool {
        self.properties
            .get(PROP_INCREMENTAL)
            .is_some_and(|value| value == "yes")
    }

    /// Name of the predecessor archive, empty for full backups.
    #[must_use]
    pub fn previous(&self) -> &str {
        self.properties
            .get(PROP_PREVIOUS)
            .map_or("", String::as_str)
    }

    /// The archive's position in its incremental chain, `None` when missing
    /// or malformed.
    #[must_use]
    pub fn nr_in_sequence(&self) -> Option<u32> {
        self.properties
            .get(PROP_NR_IN_SEQUENCE)
            .and_then(|value| value.parse().ok())
    }

    /// The manifest this archive holds for the given collection, if any.
    ///
    /// # Errors
    ///
    /// * If the archive or the manifest inside it cannot be read or parsed.
    pub fn backup_descriptor_for(&self, uri: &DbUri) -> BackupResult<Option<Manifest>> {
        let encoded = safe_encode(uri.as_str());
        let inner = format!(
            "{}/{CONTENTS_NAME}",
            crate::archive::relative_path(&encoded)
        );
        match self.read_file(&inner)? {
            Some(bytes) => Ok(Some(read_manifest(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stream every collection manifest in this archive to `visitor`, handing
    /// over the in-archive collection path (e.g. `db/my%20coll`) and the
    /// parsed manifest.
    ///
    /// # Errors
    ///
    /// * If the archive cannot be walked or a manifest cannot be parsed.
    pub fn parse(&self, visitor: &mut dyn FnMut(&str, &Manifest)) -> BackupResult<()> {
        match self.kind {
            ContainerKind::FileTree => {
                for entry in walkdir::WalkDir::new(&self.path)
                    .min_depth(2)
                    .sort_by_file_name()
                {
                    let entry = entry.map_err(|err| {
                        BackupErrorKind::ReadingArchiveFailed(err.into())
                    })?;
                    if entry.file_name().to_str() != Some(CONTENTS_NAME) {
                        continue;
                    }
                    let Some(parent) = entry.path().parent() else {
                        continue;
                    };
                    let Ok(collection) = parent.strip_prefix(&self.path) else {
                        continue;
                    };
                    let collection = collection
                        .to_str()
                        .ok_or_else(|| BackupErrorKind::NonUnicodePath(parent.to_path_buf()))?
                        .replace('\\', "/");
                    let bytes = fs::read(entry.path())
                        .map_err(BackupErrorKind::ReadingArchiveFailed)?;
                    let manifest = read_manifest(&bytes)?;
                    visitor(&collection, &manifest);
                }
                Ok(())
            }
            ContainerKind::Zip => {
                let file =
                    File::open(&self.path).map_err(BackupErrorKind::OpeningArchiveFailed)?;
                let mut archive = ZipArchive::new(file)?;
                let names: Vec<String> = archive
                    .file_names()
                    .filter(|name| {
                        name.ends_with(CONTENTS_NAME)
                            && name.trim_end_matches(CONTENTS_NAME).ends_with('/')
                    })
                    .map(ToString::to_string)
                    .collect();
                for name in names {
                    let mut entry = archive.by_name(&name)?;
                    let mut bytes = Vec::new();
                    entry
                        .read_to_end(&mut bytes)
                        .map_err(BackupErrorKind::ReadingArchiveFailed)?;
                    drop(entry);
                    let manifest = read_manifest(&bytes)?;
                    let collection = name
                        .trim_end_matches(CONTENTS_NAME)
                        .trim_end_matches('/');
                    visitor(collection, &manifest);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_non_archives() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        fs::write(&file, "hello").unwrap();
        assert!(BackupDescriptor::open(&file).is_err());
        assert!(BackupDescriptor::open(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_file_tree_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("backup-20230501-1030");
        fs::create_dir_all(base.join("db/shelf")).unwrap();
        fs::write(
            base.join(PROPERTIES_NAME),
            "date=2023-05-01T10:30:00.000Z\nincremental=yes\nprevious=backup-20230430-1030\nnr-in-sequence=2\n",
        )
        .unwrap();
        fs::write(
            base.join("db/shelf").join(CONTENTS_NAME),
            br#"<?xml version="1.0" encoding="UTF-8"?><collection name="/db/shelf" version="1" owner="admin" group="dba" mode="755" created="2023-05-01T10:00:00.000Z"/>"#,
        )
        .unwrap();

        let descriptor = BackupDescriptor::open(&base).unwrap();
        assert_eq!(descriptor.name(), "backup-20230501-1030");
        assert!(descriptor.incremental());
        assert_eq!(descriptor.previous(), "backup-20230430-1030");
        assert_eq!(descriptor.nr_in_sequence(), Some(2));
        assert_eq!(
            descriptor.date().unwrap(),
            DateTime::parse_from_rfc3339("2023-05-01T10:30:00Z").unwrap()
        );

        let manifest = descriptor
            .backup_descriptor_for(&DbUri::new("/db/shelf"))
            .unwrap()
            .unwrap();
        assert_eq!(
            manifest.attributes.get("name").map(String::as_str),
            Some("/db/shelf")
        );
        assert!(descriptor
            .backup_descriptor_for(&DbUri::new("/db/missing"))
            .unwrap()
            .is_none());

        let mut seen = Vec::new();
        descriptor
            .parse(&mut |collection, _| seen.push(collection.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["db/shelf".to_string()]);
    }

    #[test]
    fn test_malformed_sequence_number_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("backup-20230501-1030");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join(PROPERTIES_NAME), "nr-in-sequence=three\n").unwrap();
        let descriptor = BackupDescriptor::open(&base).unwrap();
        assert_eq!(descriptor.nr_in_sequence(), None);
        // date falls back to the archive name
        assert!(descriptor.date().is_some());
    }
}
