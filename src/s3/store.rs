//! Narrow storage interface used by the upload pipeline
//!
//! The pipeline only needs six calls from the backend. Keeping them behind
//! [`ObjectStore`] lets the retry layer and the chunked uploader run against
//! an in-memory store in tests.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::s3::types::S3Object;

/// Service error codes that signal throttling
const THROTTLE_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ProvisionedThroughputExceededException",
    "BandwidthLimitExceeded",
];

/// Service error codes that are transient but not throttling
const TRANSIENT_CODES: &[&str] = &[
    "RequestTimeout",
    "RequestTimeoutException",
    "InternalError",
    "ServiceUnavailable",
    "PriorRequestNotComplete",
];

/// How a failed call should be treated by the retry layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient failure, retry with backoff
    Retry,
    /// Server asked us to slow down
    Throttled,
    /// Permanent failure
    NoRetry,
}

/// Failure of a single storage call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection, timeout or response-read failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// The service answered with an error
    #[error("service error {code} (status {status:?}): {message}")]
    Service {
        code: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{0}")]
    Unknown(String),
}

impl StoreError {
    /// Build a service error from a code and HTTP status
    pub fn service(
        code: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        StoreError::Service {
            code: code.into(),
            status,
            message: message.into(),
        }
    }

    /// Classify this error for the retry layer
    pub fn retry_decision(&self) -> RetryDecision {
        match self {
            StoreError::Transport(_) => RetryDecision::Retry,
            StoreError::Service { code, status, .. } => {
                if THROTTLE_CODES.contains(&code.as_str()) || *status == Some(429) {
                    RetryDecision::Throttled
                } else if TRANSIENT_CODES.contains(&code.as_str())
                    || matches!(status, Some(500 | 502 | 503 | 504))
                {
                    RetryDecision::Retry
                } else {
                    RetryDecision::NoRetry
                }
            }
            StoreError::Unknown(_) => RetryDecision::NoRetry,
        }
    }
}

/// A part accepted by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    /// 1-based part index
    pub part_number: i32,
    pub e_tag: String,
}

/// Object storage operations the backup pipeline depends on
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List at most `max_keys` objects whose key starts with `prefix`
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: i32,
    ) -> Result<Vec<S3Object>, StoreError>;

    /// Store `body` under `key` in one request
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// Start a multipart upload and return its upload id
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError>;

    /// Upload one part of a multipart upload
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError>;

    /// Assemble `parts` (sorted by part number) into the final object
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError>;

    /// Cancel a multipart upload and release its parts
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError>;
}
