//! Credential exchange (assume-role)
//!
//! Long-lived base credentials are exchanged once per run for a short-lived,
//! role-scoped credential set through STS. The run is assumed to finish
//! before the temporary credentials expire; there is no mid-run refresh, but
//! [`TemporaryCredentials::ensure_valid`] is checked before every upload so
//! an expired set fails loudly instead of producing signature errors.

use std::fmt;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sts::config::{Credentials, Region};
use aws_sdk_sts::error::DisplayErrorContext;
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::error::{BackupError, BackupResult};

/// Role session name used when none is configured
pub const DEFAULT_SESSION_NAME: &str = "AssumeRoleSession1";

/// Long-lived access key pair used only to call STS
#[derive(Clone)]
pub struct BaseCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl BaseCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    fn validate(&self) -> BackupResult<()> {
        if self.access_key_id.trim().is_empty() || self.secret_access_key.trim().is_empty() {
            return Err(BackupError::Auth(
                "base access key id and secret key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Time-bounded credential set issued by the token service
#[derive(Clone, PartialEq, Eq)]
pub struct TemporaryCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expires_at: DateTime<Utc>,
}

impl TemporaryCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
            expires_at,
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Fail with [`BackupError::Auth`] once the credentials have expired
    pub fn ensure_valid(&self) -> BackupResult<()> {
        if self.is_expired() {
            return Err(BackupError::Auth(format!(
                "temporary credentials expired at {}",
                self.expires_at.to_rfc3339()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Identity service able to exchange credentials for a role
#[async_trait]
pub trait TokenService: Send + Sync {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> BackupResult<TemporaryCredentials>;
}

/// [`TokenService`] backed by AWS STS
pub struct StsTokenService {
    client: aws_sdk_sts::Client,
}

impl StsTokenService {
    /// Build an STS client signed with the base credentials. STS calls are
    /// not retried: the run cannot proceed without them.
    pub async fn new(base: &BaseCredentials, region: &str) -> BackupResult<Self> {
        base.validate()?;
        if region.trim().is_empty() {
            return Err(BackupError::Config("region must not be empty".to_string()));
        }

        let credentials = Credentials::new(
            base.access_key_id.clone(),
            base.secret_access_key.clone(),
            None,
            None,
            "s3-backup-base",
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .load()
            .await;

        Ok(Self {
            client: aws_sdk_sts::Client::new(&config),
        })
    }
}

#[async_trait]
impl TokenService for StsTokenService {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> BackupResult<TemporaryCredentials> {
        let response = self
            .client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .send()
            .await
            .map_err(|e| BackupError::Auth(format!("{}", DisplayErrorContext(&e))))?;

        let c = response
            .credentials()
            .ok_or_else(|| BackupError::Auth("no credentials in AssumeRole response".to_string()))?;

        let expiration = c.expiration();
        let expires_at = DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| BackupError::Auth("invalid credential expiration".to_string()))?;

        Ok(TemporaryCredentials::new(
            c.access_key_id(),
            c.secret_access_key(),
            c.session_token(),
            expires_at,
        ))
    }
}

/// Exchanges base credentials for role-scoped temporary credentials
pub struct CredentialBroker<S> {
    service: S,
}

impl CredentialBroker<StsTokenService> {
    /// Broker talking to STS in `region`
    pub async fn sts(base: &BaseCredentials, region: &str) -> BackupResult<Self> {
        Ok(Self::new(StsTokenService::new(base, region).await?))
    }
}

impl<S: TokenService> CredentialBroker<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Assume `role_arn`. One round-trip, no retry.
    #[instrument(skip(self))]
    pub async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> BackupResult<TemporaryCredentials> {
        if role_arn.trim().is_empty() {
            return Err(BackupError::Auth("role ARN must not be empty".to_string()));
        }

        let credentials = self.service.assume_role(role_arn, session_name).await?;
        credentials.ensure_valid()?;

        info!(
            expires_at = %credentials.expires_at().to_rfc3339(),
            "Assumed role"
        );
        Ok(credentials)
    }
}

/// Assume `role_arn` through STS using `base` credentials
pub async fn assume_role(
    role_arn: &str,
    session_name: &str,
    base: &BaseCredentials,
    region: &str,
) -> BackupResult<TemporaryCredentials> {
    CredentialBroker::sts(base, region)
        .await?
        .assume_role(role_arn, session_name)
        .await
}
