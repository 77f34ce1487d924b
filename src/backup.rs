//! Locating prior backups, naming new archives, and sequence planning.

mod descriptor;

pub use descriptor::BackupDescriptor;

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::warn;
use walkdir::WalkDir;

/// Name of the sidecar written at the archive root.
pub const PROPERTIES_NAME: &str = "backup.properties";

/// First segment of every archive name produced by this engine.
const BACKUP_FILE_PREFIX: &str = "backup";

/// Timestamp segment of archive names.
const DATE_FORMAT: &str = "%Y%m%d-%H%M";

pub(crate) const PROP_DATE: &str = "date";
pub(crate) const PROP_INCREMENTAL: &str = "incremental";
pub(crate) const PROP_PREVIOUS: &str = "previous";
pub(crate) const PROP_NR_IN_SEQUENCE: &str = "nr-in-sequence";

/// [`BackupErrorKind`] describes the errors that can occur around backup archives
#[derive(thiserror::Error, Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum BackupErrorKind {
    /// creating backup target failed: `{0:?}`
    CreatingTargetFailed(std::io::Error),
    /// opening archive failed: `{0:?}`
    OpeningArchiveFailed(std::io::Error),
    /// reading from archive failed: `{0:?}`
    ReadingArchiveFailed(std::io::Error),
    /// zip container error: `{0:?}`
    Zip(#[from] zip::result::ZipError),
    /// [`crate::manifest::ManifestErrorKind`]
    #[error(transparent)]
    Manifest(#[from] crate::manifest::ManifestErrorKind),
    /// archive path is not valid unicode: `{0:?}`
    NonUnicodePath(PathBuf),
    /// `{0:?}` is neither a zip archive nor a backup directory
    NotAnArchive(PathBuf),
}

pub(crate) type BackupResult<T> = Result<T, BackupErrorKind>;

/// The typed contents of the `backup.properties` sidecar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupProperties {
    /// Archive creation date.
    pub date: DateTime<Utc>,
    /// Whether this archive is an incremental backup.
    pub incremental: bool,
    /// Name of the predecessor archive, empty for full backups.
    pub previous: String,
    /// Position in the incremental chain, starting at 1.
    pub nr_in_sequence: u32,
}

impl BackupProperties {
    /// Render as `key=value` lines.
    #[must_use]
    pub fn to_lines(&self) -> String {
        format!(
            "{PROP_DATE}={}\n{PROP_INCREMENTAL}={}\n{PROP_PREVIOUS}={}\n{PROP_NR_IN_SEQUENCE}={}\n",
            self.date.to_rfc3339_opts(SecondsFormat::Millis, true),
            if self.incremental { "yes" } else { "no" },
            self.previous,
            self.nr_in_sequence,
        )
    }
}

/// Parse `key=value` property lines into pairs, ignoring blanks and comments.
pub(crate) fn parse_properties(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            line.split_once('=')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Split an archive file name into its date and sequence number.
///
/// Full archives are `backup-YYYYMMDD-HHMM[.zip]`, incrementals carry a
/// `_<seq>` suffix before the extension. Returns `None` for names this
/// engine did not produce.
pub(crate) fn parse_archive_name(name: &str) -> Option<(DateTime<Utc>, u32)> {
    let rest = name.strip_prefix(BACKUP_FILE_PREFIX)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".zip").unwrap_or(rest);
    let (stamp, seq) = match rest.split_once('_') {
        Some((stamp, seq)) => (stamp, seq.parse().ok()?),
        None => (rest, 0),
    };
    let naive = NaiveDateTime::parse_from_str(stamp, DATE_FORMAT).ok()?;
    Some((Utc.from_utc_datetime(&naive), seq))
}

/// The resolved shape of the next backup: its predecessor (if the diff logic
/// applies), its effective incremental flag, and its sequence number.
#[derive(Debug)]
pub struct BackupPlan {
    /// Predecessor archive used for skip and deletion detection.
    pub previous: Option<BackupDescriptor>,
    /// Whether the new archive is incremental. A reached sequence cap turns
    /// a requested incremental into a full backup.
    pub incremental: bool,
    /// Sequence number of the new archive.
    pub seq: u32,
}

/// A directory holding the archives of one backup chain.
#[derive(Clone, Debug)]
pub struct BackupDirectory {
    dir: PathBuf,
}

impl BackupDirectory {
    /// Create a view over the given target directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The target directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The most recent archive produced by this engine, if any.
    ///
    /// Unreadable candidates are logged and skipped; this never fails.
    #[must_use]
    pub fn last_backup(&self) -> Option<BackupDescriptor> {
        let mut best: Option<(DateTime<Utc>, u32, BackupDescriptor)> = None;
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable directory entry: {err}");
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Some((date, seq)) = parse_archive_name(name) else {
                continue;
            };
            let descriptor = match BackupDescriptor::open(entry.path()) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!("skipping unreadable archive {name}: {err}");
                    continue;
                }
            };
            // prefer the recorded date over the one encoded in the name
            let date = descriptor.date().unwrap_or(date);
            if best
                .as_ref()
                .map_or(true, |(best_date, best_seq, _)| (date, seq) > (*best_date, *best_seq))
            {
                best = Some((date, seq, descriptor));
            }
        }
        best.map(|(_, _, descriptor)| descriptor)
    }

    /// Allocate a fresh, unique archive path.
    ///
    /// # Arguments
    ///
    /// * `incremental` - Whether the name carries the sequence suffix
    /// * `seq` - Sequence number of the new archive
    /// * `zip` - Whether a `.zip` file name is wanted
    ///
    /// # Errors
    ///
    /// * [`BackupErrorKind::CreatingTargetFailed`] - If the target directory cannot be created.
    pub fn create_backup(&self, incremental: bool, seq: u32, zip: bool) -> BackupResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(BackupErrorKind::CreatingTargetFailed)?;
        let stamp = Utc::now().format(DATE_FORMAT).to_string();
        let mut suffix = incremental.then_some(seq);
        loop {
            let mut name = format!("{BACKUP_FILE_PREFIX}-{stamp}");
            if let Some(suffix) = suffix {
                name.push('_');
                name.push_str(&suffix.to_string());
            }
            if zip {
                name.push_str(".zip");
            }
            let path = self.dir.join(name);
            if !path.exists() {
                return Ok(path);
            }
            suffix = Some(suffix.map_or(1, |n| n + 1));
        }
    }

    /// Resolve predecessor, sequence number and effective incremental flag
    /// for the next backup.
    ///
    /// Reaching `max_incremental` silently promotes the backup to a full one
    /// and restarts the sequence; a malformed predecessor sequence number is
    /// logged and restarts the sequence without leaving incremental mode.
    #[must_use]
    pub fn plan(&self, incremental: bool, max_incremental: Option<u32>) -> BackupPlan {
        if !incremental {
            return BackupPlan {
                previous: None,
                incremental: false,
                seq: 1,
            };
        }
        let Some(previous) = self.last_backup() else {
            return BackupPlan {
                previous: None,
                incremental: false,
                seq: 1,
            };
        };
        let seq = match previous.nr_in_sequence() {
            Some(prev_seq) => {
                if max_incremental.map_or(false, |max| prev_seq >= max) {
                    return BackupPlan {
                        previous: None,
                        incremental: false,
                        seq: 1,
                    };
                }
                prev_seq + 1
            }
            None => {
                warn!(
                    "previous backup {} has a missing or malformed {PROP_NR_IN_SEQUENCE}, restarting sequence at 1",
                    previous.name()
                );
                1
            }
        };
        BackupPlan {
            previous: Some(previous),
            incremental: true,
            seq,
        }
    }
}
