//! Error taxonomy for the backup pipeline
//!
//! [`BackupError`] is what every pipeline stage returns. Configuration and
//! authentication errors are fatal for a whole run; everything else is turned
//! into an [`UploadOutcome::Failure`](crate::s3::report::UploadOutcome) for a
//! single file.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::s3::store::StoreError;

/// Result alias used across the pipeline
pub type BackupResult<T> = Result<T, BackupError>;

/// Errors that can occur while backing up a file
#[derive(Debug, Error)]
pub enum BackupError {
    /// Role assumption failed or the temporary credentials are unusable
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Missing or invalid tunable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout or connection failure after the retry budget was spent
    #[error("Transport error: {0}")]
    Transport(String),

    /// The storage service rejected the request
    #[error("Service error ({code}): {message}")]
    Service {
        code: String,
        status: Option<u16>,
        message: String,
    },

    /// A part of a multipart upload failed permanently
    #[error("Part {part_number} failed: {source}")]
    PartialUpload {
        part_number: i32,
        #[source]
        source: Box<BackupError>,
    },

    /// The caller's deadline for the whole upload expired
    #[error("Upload deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Local file could not be read
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Unknown(String),
}

impl BackupError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should abort the whole run instead of one file
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackupError::Auth(_) | BackupError::Config(_))
    }
}

impl From<StoreError> for BackupError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transport(msg) => BackupError::Transport(msg),
            StoreError::Service {
                code,
                status,
                message,
            } => BackupError::Service {
                code,
                status,
                message,
            },
            StoreError::Unknown(msg) => BackupError::Unknown(msg),
        }
    }
}
