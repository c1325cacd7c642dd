//! One backup run: credentials, session, folder and upload

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument};

use crate::error::BackupResult;
use crate::s3::credentials::assume_role;
use crate::s3::keys::resolve_and_ensure_folder;
use crate::s3::report::{self, ReportContext, UploadOutcome};
use crate::s3::session::TransferSession;
use crate::s3::upload::{ChunkedUploader, TransferSpec};
use crate::settings::Settings;

/// A local file and where it should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub local_dir: PathBuf,
    pub file_name: String,
    pub folder_name: String,
    /// Object name in the bucket, defaults to `file_name`
    pub object_name: Option<String>,
    /// Upper bound for the transfer itself
    pub deadline: Option<Duration>,
}

impl UploadRequest {
    pub fn new(
        local_dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
        folder_name: impl Into<String>,
    ) -> Self {
        Self {
            local_dir: local_dir.into(),
            file_name: file_name.into(),
            folder_name: folder_name.into(),
            object_name: None,
            deadline: None,
        }
    }

    pub fn with_object_name(mut self, name: impl Into<String>) -> Self {
        self.object_name = Some(name.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn local_path(&self) -> PathBuf {
        self.local_dir.join(&self.file_name)
    }
}

/// Drives uploads into one bucket through an open session
#[derive(Clone)]
pub struct BackupRunner {
    session: TransferSession,
    bucket: String,
    spec: TransferSpec,
}

impl BackupRunner {
    /// Assume the configured role and open a session with it.
    /// Errors here are fatal for the run.
    pub async fn connect(settings: &Settings) -> BackupResult<Self> {
        let config = &settings.config;
        let policy = config.retry_policy()?;
        let spec = config.transfer_spec()?;

        let credentials = assume_role(
            &settings.secrets.sts_role,
            config.role_session_name(),
            &settings.secrets.base_credentials(),
            &config.aws_region,
        )
        .await?;

        let session = TransferSession::open_with_endpoint(
            &config.aws_region,
            config.endpoint_url.as_deref(),
            credentials,
            policy,
        )
        .await?;

        Ok(Self::new(session, settings.bucket(), spec))
    }

    pub fn new(session: TransferSession, bucket: impl Into<String>, spec: TransferSpec) -> Self {
        Self {
            session,
            bucket: bucket.into(),
            spec,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Upload one file. Never panics; every failure is reported and
    /// returned as [`UploadOutcome::Failure`].
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn upload_file(&self, request: &UploadRequest) -> UploadOutcome {
        let ctx = ReportContext {
            bucket: &self.bucket,
            folder: &request.folder_name,
            file_name: &request.file_name,
            key: None,
        };

        if let Err(err) = self.session.ensure_credentials_valid() {
            return report::finish(Err(err), &ctx);
        }

        let key = match resolve_and_ensure_folder(
            &self.session,
            &self.bucket,
            &request.folder_name,
            &request.file_name,
            request.object_name.as_deref(),
        )
        .await
        {
            Ok(key) => key,
            Err(err) => return report::finish(Err(err), &ctx),
        };

        let mut uploader = ChunkedUploader::new(self.session.clone(), self.spec);
        if let Some(deadline) = request.deadline {
            uploader = uploader.with_deadline(deadline);
        }

        info!(key = %key, "Uploading {}", request.local_path().display());
        uploader
            .upload(&self.bucket, &request.local_path(), &key)
            .await
    }
}
