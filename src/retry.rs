//! Retry policy: exponential backoff with jitter, driven as an explicit
//! state machine so it can be exercised without any I/O.

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ClientError;

/// Default maximum number of attempts per call (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt, in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;

/// Default upper bound for any computed delay, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

/// Default jitter fraction (±20%).
pub const DEFAULT_JITTER: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.max_attempts == 0 {
            return Err(ClientError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ClientError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ClientError::Config(format!(
                "retry.jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// Bookkeeping for one logical call. Lives only as long as the call.
#[derive(Debug, Default)]
pub struct RetryState {
    attempts: u32,
    last_error: Option<ClientError>,
    total_delay: Duration,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of an attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    pub fn total_delay(&self) -> Duration {
        self.total_delay
    }
}

/// Result of feeding an attempt's outcome to the policy.
#[derive(Debug)]
pub enum Step<T> {
    Success(T),
    RetryAfter(Duration),
    Terminal(ClientError),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(mut config: RetryConfig) -> Self {
        config.max_attempts = config.max_attempts.max(1);
        config.jitter = if config.jitter.is_finite() {
            config.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.config.max_delay_ms)
    }

    /// Un-jittered delay before the attempt following `attempt`:
    /// `min(max_delay, base_delay * 2^(attempt - 1))`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let delay = self
            .config
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        Duration::from_millis(delay.min(self.config.max_delay_ms))
    }

    /// Nominal delay randomized within the jitter fraction, never above `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.config.jitter;
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor).min(self.max_delay())
    }

    /// Decides what happens after an attempt.
    ///
    /// `retry_safe` is false for non-idempotent requests without an
    /// idempotency key; those stop on ambiguous failures.
    pub fn next<T>(
        &self,
        state: &mut RetryState,
        outcome: Result<T, ClientError>,
        retry_safe: bool,
    ) -> Step<T> {
        let error = match outcome {
            Ok(value) => return Step::Success(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            debug!("Attempt {}: non-retryable error: {}", state.attempts, error);
            return Step::Terminal(error);
        }

        if error.is_ambiguous() && !retry_safe {
            debug!(
                "Attempt {}: not retrying non-idempotent request after ambiguous failure: {}",
                state.attempts, error
            );
            return Step::Terminal(error);
        }

        if state.attempts >= self.config.max_attempts {
            return Step::Terminal(ClientError::RetriesExhausted {
                attempts: state.attempts,
                last: Box::new(error),
            });
        }

        let delay = error
            .retry_after()
            .unwrap_or_else(|| self.backoff(state.attempts));
        state.total_delay += delay;
        state.last_error = Some(error);
        Step::RetryAfter(delay)
    }
}
