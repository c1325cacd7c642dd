//! Retry policy and adaptive retrier
//!
//! SDK-level retries are disabled; every storage call goes through
//! [`AdaptiveRetry::attempt`] instead. In adaptive mode the retrier keeps a
//! throttle level shared by all calls of a session: each throttling response
//! raises it (longer pauses), any success resets it. While the level is
//! raised, new calls are paced before their first attempt too, so parallel
//! part uploads back off together during a throttling storm.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{BackupError, BackupResult};
use crate::s3::store::{RetryDecision, StoreError};

/// Base delay for exponential backoff on transient failures
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Base delay applied after a throttling response
pub const DEFAULT_THROTTLE_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for any single pause
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(20);

/// Throttle level cap (pause doubles per level)
const MAX_THROTTLE_LEVEL: u32 = 6;

/// How attempts are paced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Plain exponential backoff
    Standard,
    /// Backoff that reacts to throttling signals
    #[default]
    Adaptive,
}

/// Immutable retry and timeout settings for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    mode: RetryMode,
    connect_timeout: Duration,
    read_timeout: Duration,
    base_backoff: Duration,
    throttle_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Create an adaptive policy with default backoff settings
    pub fn new(
        max_attempts: u32,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> BackupResult<Self> {
        if max_attempts == 0 {
            return Err(BackupError::Config(
                "max retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            mode: RetryMode::Adaptive,
            connect_timeout,
            read_timeout,
            base_backoff: DEFAULT_BASE_BACKOFF,
            throttle_backoff: DEFAULT_THROTTLE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        })
    }

    pub fn with_mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the backoff timings
    pub fn with_backoff(mut self, base: Duration, throttle: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.throttle_backoff = throttle;
        self.max_backoff = max;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn mode(&self) -> RetryMode {
        self.mode
    }

    /// Bound on the TCP/TLS handshake of one attempt
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Bound on waiting for response bytes in one attempt
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Exponential backoff before retry number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Pause for a given throttle level (zero when not throttled)
    pub fn throttle_delay(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }
        let exponent = level.min(MAX_THROTTLE_LEVEL) - 1;
        self.throttle_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Runs storage calls under a [`RetryPolicy`]
#[derive(Debug)]
pub struct AdaptiveRetry {
    policy: RetryPolicy,
    throttle_level: AtomicU32,
}

impl AdaptiveRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            throttle_level: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current throttle level (0 = not throttled)
    pub fn throttle_level(&self) -> u32 {
        self.throttle_level.load(Ordering::SeqCst)
    }

    /// Pause applied before new calls while throttled
    pub fn pacing_delay(&self) -> Duration {
        match self.policy.mode {
            RetryMode::Adaptive => self.policy.throttle_delay(self.throttle_level()),
            RetryMode::Standard => Duration::ZERO,
        }
    }

    fn record_throttle(&self) {
        let _ = self
            .throttle_level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |level| {
                Some((level + 1).min(MAX_THROTTLE_LEVEL))
            });
    }

    fn record_success(&self) {
        self.throttle_level.store(0, Ordering::SeqCst);
    }

    fn retry_delay(&self, decision: RetryDecision, attempt: u32) -> Duration {
        let backoff = self.policy.backoff_delay(attempt);
        match (decision, self.policy.mode) {
            (RetryDecision::Throttled, RetryMode::Adaptive) => backoff.max(self.pacing_delay()),
            _ => backoff,
        }
    }

    /// Run `call` until it succeeds, fails permanently or the attempt
    /// budget is spent. The last error is returned unchanged.
    pub async fn attempt<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;

        let pacing = self.pacing_delay();
        if !pacing.is_zero() {
            debug!(
                operation,
                delay_ms = pacing.as_millis() as u64,
                "Pacing request while throttled"
            );
            sleep(pacing).await;
        }

        loop {
            match call().await {
                Ok(value) => {
                    self.record_success();
                    if attempt > 1 {
                        info!(operation, attempt, "Storage call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let decision = err.retry_decision();
                    if decision == RetryDecision::NoRetry {
                        warn!(operation, attempt, error = %err, "Storage call failed permanently");
                        return Err(err);
                    }
                    if decision == RetryDecision::Throttled
                        && self.policy.mode == RetryMode::Adaptive
                    {
                        self.record_throttle();
                    }
                    if attempt >= max_attempts {
                        warn!(
                            operation,
                            attempt,
                            max_attempts,
                            error = %err,
                            "Storage call failed, retry budget exhausted"
                        );
                        return Err(err);
                    }

                    let delay = self.retry_delay(decision, attempt);
                    debug!(
                        operation,
                        attempt,
                        max_attempts,
                        throttled = decision == RetryDecision::Throttled,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Storage call failed, will retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(5), Duration::from_secs(30)).unwrap()
    }

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "expected ~{:?}, got {:?}",
            expected,
            elapsed
        );
    }

    fn slow_down() -> StoreError {
        StoreError::service("SlowDown", Some(503), "Please reduce your request rate")
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(30), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn test_throttle_delay_grows_with_level() {
        let policy = policy(10);
        assert_eq!(policy.throttle_delay(0), Duration::ZERO);
        assert_eq!(policy.throttle_delay(1), Duration::from_millis(500));
        assert_eq!(policy.throttle_delay(2), Duration::from_secs(1));
        assert_eq!(policy.throttle_delay(3), Duration::from_secs(2));
        assert_eq!(policy.throttle_delay(100), DEFAULT_MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_then_success() {
        let retry = AdaptiveRetry::new(policy(3));
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result = retry
            .attempt("put_object", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StoreError::Transport("connection reset".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of exponential backoff
        assert_elapsed(start, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_returns_last_error() {
        let retry = AdaptiveRetry::new(policy(3));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = retry
            .attempt("upload_part", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Transport("read timeout".to_string())) }
            })
            .await;

        assert_eq!(result, Err(StoreError::Transport("read timeout".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let retry = AdaptiveRetry::new(policy(5));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = retry
            .attempt("put_object", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::service("AccessDenied", Some(403), "denied")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_mode_backs_off_longer_on_repeated_throttles() {
        let retry = AdaptiveRetry::new(policy(5));
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result = retry
            .attempt("upload_part", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(slow_down())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        // 500ms after the first throttle, 1s after the second
        assert_elapsed(start, Duration::from_millis(1500));
        assert_eq!(retry.throttle_level(), 0, "success resets pacing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_mode_ignores_throttle_signal() {
        let retry = AdaptiveRetry::new(policy(5).with_mode(RetryMode::Standard));
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result = retry
            .attempt("upload_part", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(slow_down())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_elapsed(start, Duration::from_millis(300));
        assert_eq!(retry.throttle_level(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_paces_subsequent_calls() {
        let retry = AdaptiveRetry::new(policy(1));

        let throttled: Result<(), _> = retry
            .attempt("list_objects", || async { Err(slow_down()) })
            .await;
        assert!(throttled.is_err());
        assert_eq!(retry.throttle_level(), 1);
        assert_eq!(retry.pacing_delay(), Duration::from_millis(500));

        let start = Instant::now();
        let ok = retry.attempt("put_object", || async { Ok(()) }).await;
        assert!(ok.is_ok());
        assert_elapsed(start, Duration::from_millis(500));
        assert_eq!(retry.pacing_delay(), Duration::ZERO);
    }
}
