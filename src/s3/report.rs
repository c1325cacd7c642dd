//! Upload outcomes and error classification
//!
//! Every upload ends in an [`UploadOutcome`]. Failures are logged with the
//! file, folder and key they concern and handed back to the caller, which
//! decides whether to retry the file or stop the batch.

use tracing::{error, info};

use crate::error::{BackupError, BackupResult};
use crate::s3::types::{size_string, S3Url};

/// Coarse failure category
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and connection failures
    Transport,
    /// The service rejected a request with this code
    Service(String),
    Unknown,
}

/// Map a pipeline error to its category
pub fn classify(err: &BackupError) -> ErrorClass {
    match err {
        BackupError::Transport(_) | BackupError::DeadlineExceeded(_) => ErrorClass::Transport,
        BackupError::Service { code, .. } => ErrorClass::Service(code.clone()),
        BackupError::PartialUpload { source, .. } => classify(source),
        BackupError::Auth(_)
        | BackupError::Config(_)
        | BackupError::Io { .. }
        | BackupError::Unknown(_) => ErrorClass::Unknown,
    }
}

/// What a successful upload produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub bytes: u64,
    /// Number of parts (1 for a single put)
    pub parts: usize,
}

/// Terminal result of one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success(UploadReceipt),
    Failure { reason: String, class: ErrorClass },
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success(_))
    }

    pub fn receipt(&self) -> Option<&UploadReceipt> {
        match self {
            UploadOutcome::Success(receipt) => Some(receipt),
            UploadOutcome::Failure { .. } => None,
        }
    }
}

/// Where an upload was headed, for log lines
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub bucket: &'a str,
    pub folder: &'a str,
    pub file_name: &'a str,
    /// Destination key when it was resolved
    pub key: Option<&'a str>,
}

/// Log the result of an upload and turn it into an [`UploadOutcome`]
pub fn finish(result: BackupResult<UploadReceipt>, ctx: &ReportContext<'_>) -> UploadOutcome {
    match result {
        Ok(receipt) => {
            info!(
                file = ctx.file_name,
                folder = ctx.folder,
                parts = receipt.parts,
                size = %size_string(receipt.bytes),
                "Successfully uploaded {} to {}",
                ctx.file_name,
                S3Url::new(ctx.bucket, receipt.key.as_str())
            );
            UploadOutcome::Success(receipt)
        }
        Err(err) => {
            let class = classify(&err);
            let destination = ctx.key.unwrap_or(ctx.folder);
            error!(
                file = ctx.file_name,
                folder = ctx.folder,
                key = destination,
                class = ?class,
                error = %err,
                "Failed to upload {} to {}",
                ctx.file_name,
                destination
            );
            UploadOutcome::Failure {
                reason: format!(
                    "Failed to upload {} to {}: {}",
                    ctx.file_name, destination, err
                ),
                class,
            }
        }
    }
}
