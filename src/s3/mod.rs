//! S3 upload pipeline
//!
//! This module provides the storage side of a backup run:
//! - [`credentials::CredentialBroker`] - assume-role credential exchange
//! - [`session::TransferSession`] - shared client, retry policy and credentials
//! - [`keys`] - destination keys and folder markers
//! - [`upload::ChunkedUploader`] - single-put and parallel multipart upload
//! - [`report`] - outcomes and error classification
//! - [`client::S3Client`] - aws-sdk-s3 implementation of [`store::ObjectStore`]

pub mod client;
pub mod credentials;
pub mod keys;
pub mod report;
pub mod retry;
pub mod session;
pub mod store;
pub mod types;
pub mod upload;

// Re-export commonly used types
pub use client::{S3Client, S3ClientConfig};
pub use credentials::{BaseCredentials, CredentialBroker, TemporaryCredentials, TokenService};
pub use keys::{resolve_and_ensure_folder, FolderMarker, ObjectKey};
pub use report::{classify, ErrorClass, UploadOutcome, UploadReceipt};
pub use retry::{AdaptiveRetry, RetryMode, RetryPolicy};
pub use session::TransferSession;
pub use store::{ObjectStore, RetryDecision, StoreError, UploadedPart};
pub use types::{S3Object, S3Url};
pub use upload::{ChunkedUploader, PartRange, TransferSpec};
