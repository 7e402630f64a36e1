// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policy, backoff, and timeout budgeting for backend adapter calls.
//!
//! Every backend invocation is a suspension point (see the supervisor's
//! write/audit/stamp loop); only [`ErrorCategory::Transient`](pe_error::ErrorCategory::Transient)
//! failures (timeout, context overflow, backend 5xx) are eligible for retry
//! here. Contract and structural failures are handed to the escalator
//! instead of being retried blindly.

use pe_error::{ErrorCategory, PeError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-call and overall wall-clock timeout budget for a backend invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Timeout applied to a single backend call attempt.
    #[serde(with = "duration_secs")]
    pub per_call: Duration,
    /// Wall-clock timeout spanning all retry attempts for one invocation.
    #[serde(with = "duration_secs")]
    pub overall: Duration,
}

impl Default for TimeoutConfig {
    /// `BACKEND_TIMEOUT` default of 5 minutes applied to both bounds.
    fn default() -> Self {
        Self {
            per_call: Duration::from_secs(300),
            overall: Duration::from_secs(300),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_secs().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs: u64 = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Exponential backoff policy with jitter, bounded by a maximum attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. `MAX_ATTEMPTS` default is 3.
    pub max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Returns `true` when `category` is eligible for retry under this policy.
    #[must_use]
    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        matches!(category, ErrorCategory::Transient)
    }

    /// Compute the backoff delay for a zero-indexed attempt, applying
    /// bounded jitter seeded from the attempt index and elapsed time so
    /// the computation stays deterministic given its inputs.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, elapsed_nanos_seed: u64) -> Duration {
        let exp = 2u64.saturating_pow(attempt);
        let nominal = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        if jitter_factor <= 0.0 || nominal == 0 {
            return Duration::from_millis(nominal);
        }
        let jitter_range = (nominal as f64 * jitter_factor) as u64;
        let pseudo = elapsed_nanos_seed.wrapping_mul(attempt as u64 + 1);
        let jitter = if jitter_range > 0 { pseudo % jitter_range } else { 0 };
        Duration::from_millis(nominal.saturating_sub(jitter))
    }
}

/// Fluent constructor for [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicyBuilder {
    policy: Option<RetryPolicy>,
}

impl RetryPolicyBuilder {
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy_mut().max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy_mut().base_delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy_mut().max_delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.policy_mut().jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy.unwrap_or_default()
    }

    fn policy_mut(&mut self) -> &mut RetryPolicy {
        self.policy.get_or_insert_with(RetryPolicy::default)
    }
}

/// Record of one failed attempt, kept for event-log metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error_code: String,
    #[serde(with = "duration_secs")]
    pub delay: Duration,
}

/// Metadata captured across all attempts of one retried invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetadata {
    pub total_attempts: u32,
    pub failed_attempts: Vec<RetryAttempt>,
}

/// Outcome of a retry-wrapped invocation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub metadata: RetryMetadata,
}

/// Run `op` under `policy`/`timeouts`, retrying transient [`PeError`]s with
/// exponential backoff until `policy.max_attempts` is reached or the
/// overall timeout budget is exhausted.
///
/// Non-transient errors are returned immediately without consuming a retry.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    timeouts: &TimeoutConfig,
    mut op: F,
) -> Result<RetryOutcome<T>, PeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PeError>>,
{
    let start = Instant::now();
    let mut failed_attempts = Vec::new();

    for attempt in 0..policy.max_attempts {
        if start.elapsed() >= timeouts.overall {
            warn!(target: "pe.retry", attempt, "overall timeout budget exhausted");
            return Err(PeError::new(
                pe_error::ErrorCode::Timeout,
                "overall retry timeout exceeded",
            ));
        }

        debug!(target: "pe.retry", attempt, max_attempts = policy.max_attempts, "attempting call");

        let call = tokio::time::timeout(timeouts.per_call, op());
        let outcome = call.await;

        let err = match outcome {
            Ok(Ok(value)) => {
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt + 1,
                        failed_attempts,
                    },
                });
            }
            Ok(Err(err)) => err,
            Err(_elapsed) => PeError::new(pe_error::ErrorCode::Timeout, "per-call timeout exceeded"),
        };

        let is_last = attempt + 1 >= policy.max_attempts;
        if !policy.is_retryable(err.category()) || is_last {
            warn!(target: "pe.retry", error = %err, attempt, is_last, "giving up");
            return Err(err);
        }

        let nanos = start.elapsed().subsec_nanos() as u64;
        let delay = policy.delay_for_attempt(attempt, nanos.max(1));
        let remaining = timeouts.overall.saturating_sub(start.elapsed());
        if delay > remaining {
            return Err(PeError::new(
                pe_error::ErrorCode::Timeout,
                "overall retry timeout would be exceeded by next backoff",
            ));
        }

        warn!(target: "pe.retry", error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
        failed_attempts.push(RetryAttempt {
            attempt,
            error_code: err.code.as_str().to_string(),
            delay,
        });
        tokio::time::sleep(delay).await;
    }

    Err(PeError::new(pe_error::ErrorCode::Timeout, "retry attempts exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pe_error::ErrorCode;

    #[test]
    fn default_timeout_matches_backend_timeout_default() {
        let t = TimeoutConfig::default();
        assert_eq!(t.per_call, Duration::from_secs(300));
        assert_eq!(t.overall, Duration::from_secs(300));
    }

    #[test]
    fn builder_overrides_defaults() {
        let policy = RetryPolicy::builder().max_attempts(5).jitter_factor(0.0).build();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(0, 12345), Duration::from_millis(200));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(ErrorCategory::Transient));
        assert!(!policy.is_retryable(ErrorCategory::Contract));
        assert!(!policy.is_retryable(ErrorCategory::Structural));
        assert!(!policy.is_retryable(ErrorCategory::Fatal));
    }

    #[tokio::test]
    async fn retry_async_succeeds_after_transient_failures() {
        let policy = RetryPolicy::builder().max_attempts(3).base_delay(Duration::from_millis(1)).build();
        let timeouts = TimeoutConfig {
            per_call: Duration::from_secs(1),
            overall: Duration::from_secs(1),
        };
        let mut calls = 0u32;
        let outcome = retry_async(&policy, &timeouts, || {
            calls += 1;
            let this_call = calls;
            async move {
                if this_call < 3 {
                    Err(PeError::new(ErrorCode::Timeout, "transient"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .expect("should eventually succeed");
        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.metadata.total_attempts, 3);
        assert_eq!(outcome.metadata.failed_attempts.len(), 2);
    }

    #[tokio::test]
    async fn retry_async_stops_immediately_on_non_transient_error() {
        let policy = RetryPolicy::default();
        let timeouts = TimeoutConfig::default();
        let mut calls = 0u32;
        let result = retry_async::<(), _, _>(&policy, &timeouts, || {
            calls += 1;
            async { Err(PeError::new(ErrorCode::InvalidValue, "contract failure")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
