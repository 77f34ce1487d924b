//! Error types and Result module.

use displaydoc::Display;
use thiserror::Error;

use crate::{
    archive::ArchiveErrorKind, backup::BackupErrorKind, broker::BrokerErrorKind,
    db::RecordErrorKind, manifest::ManifestErrorKind, render::RenderErrorKind, uri::UriErrorKind,
};

/// Result type often returned from methods that can have [`ExportError`]s.
pub type ExportResult<T> = Result<T, ExportError>;

/// Errors that can result from the export engine.
#[derive(Error, Debug, Display)]
#[non_exhaustive]
pub enum ExportError {
    /// [`ArchiveErrorKind`] describes the errors that can be returned by an archive backend
    #[error(transparent)]
    Archive(#[from] ArchiveErrorKind),

    /// [`BackupErrorKind`] describes the errors that can occur around backup archives
    #[error(transparent)]
    Backup(#[from] BackupErrorKind),

    /// [`BrokerErrorKind`] describes the errors a storage broker can return
    #[error(transparent)]
    Broker(#[from] BrokerErrorKind),

    /// [`ManifestErrorKind`] describes the errors that can occur around manifests
    #[error(transparent)]
    Manifest(#[from] ManifestErrorKind),

    /// [`RecordErrorKind`] describes the errors that can be returned when decoding stored records
    #[error(transparent)]
    Record(#[from] RecordErrorKind),

    /// [`RenderErrorKind`] describes the errors that can occur while rendering XML
    #[error(transparent)]
    Render(#[from] RenderErrorKind),

    /// [`UriErrorKind`] describes the errors that can be returned when decoding names
    #[error(transparent)]
    Uri(#[from] UriErrorKind),

    /// export was terminated by the status callback
    Terminated,
}
