//! Transfer session shared by every storage call of a run

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::error::{BackupError, BackupResult};
use crate::s3::client::{S3Client, S3ClientConfig};
use crate::s3::credentials::TemporaryCredentials;
use crate::s3::retry::{AdaptiveRetry, RetryPolicy};
use crate::s3::store::{ObjectStore, StoreError};

/// Storage handle bound to a region, a retry policy and temporary
/// credentials. Cloning is cheap; clones share the same client and
/// throttle state.
#[derive(Clone)]
pub struct TransferSession {
    store: Arc<dyn ObjectStore>,
    retry: Arc<AdaptiveRetry>,
    credentials: Arc<TemporaryCredentials>,
    region: String,
}

impl TransferSession {
    /// Open a session against AWS S3 in `region`
    pub async fn open(
        region: &str,
        credentials: TemporaryCredentials,
        policy: RetryPolicy,
    ) -> BackupResult<Self> {
        Self::open_with_endpoint(region, None, credentials, policy).await
    }

    /// Open a session, optionally against an S3-compatible endpoint
    /// (path-style addressing is used when an endpoint is given)
    pub async fn open_with_endpoint(
        region: &str,
        endpoint_url: Option<&str>,
        credentials: TemporaryCredentials,
        policy: RetryPolicy,
    ) -> BackupResult<Self> {
        credentials.ensure_valid()?;

        let config = S3ClientConfig {
            endpoint_url: endpoint_url.map(str::to_string),
            force_path_style: endpoint_url.is_some(),
            region: Some(region.to_string()),
            access_key_id: Some(credentials.access_key_id().to_string()),
            secret_access_key: Some(credentials.secret_access_key().to_string()),
            session_token: Some(credentials.session_token().to_string()).filter(|t| !t.is_empty()),
            connect_timeout: Some(policy.connect_timeout()),
            read_timeout: Some(policy.read_timeout()),
        };
        let client = S3Client::with_config(config)
            .await
            .map_err(|e| BackupError::Config(format!("failed to build S3 client: {:#}", e)))?;

        let region = client.region().to_string();
        info!(
            region = %region,
            endpoint = endpoint_url.unwrap_or("aws"),
            max_attempts = policy.max_attempts(),
            mode = ?policy.mode(),
            "Opened transfer session"
        );

        Ok(Self::with_store(Arc::new(client), &region, credentials, policy))
    }

    /// Build a session around any [`ObjectStore`]
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        region: &str,
        credentials: TemporaryCredentials,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            retry: Arc::new(AdaptiveRetry::new(policy)),
            credentials: Arc::new(credentials),
            region: region.to_string(),
        }
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn retry(&self) -> &AdaptiveRetry {
        &self.retry
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    pub fn credentials(&self) -> &TemporaryCredentials {
        &self.credentials
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Fail if the session's credentials have expired
    pub fn ensure_credentials_valid(&self) -> BackupResult<()> {
        self.credentials.ensure_valid()
    }

    /// Run one storage call under the session's retry policy
    pub async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.retry.attempt(operation, call).await
    }
}
