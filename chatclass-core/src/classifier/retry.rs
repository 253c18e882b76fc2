//! Retry contract around a [`Classifier`], plus the same backoff for store calls.
//!
//! - transient failure: exponential backoff with jitter, up to `max_attempts`
//! - schema violation: one re-prompt with strict output instructions
//! - fatal failure: returned immediately

use super::{Classifier, ClassifierOutput, ClassifyRequest};
use crate::config::RetryConfig;
use crate::{Error, Result};
use rand::Rng;
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, 0..=1
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy for classifier calls
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Policy for store reads and writes
    pub fn for_store(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.store_max_attempts.max(1),
            ..Self::from_config(config)
        }
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Delay before retry number `retry`, with jitter applied
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts run out.
pub fn retry_transient<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= policy.max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Transient failure, retrying in {:?}",
                    delay
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Applies [`RetryPolicy`] and the strict re-prompt to an inner classifier.
pub struct ResilientClassifier<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: Classifier> ResilientClassifier<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Classifier> Classifier for ResilientClassifier<C> {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<ClassifierOutput> {
        let mut current = *request;
        let mut calls = 0u32;
        let mut transient_failures = 0u32;

        loop {
            calls += 1;
            let err = match self.inner.classify(&current) {
                Ok(output) => {
                    if calls > 1 {
                        tracing::debug!(kind = %request.kind(), calls, "Classification succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(e) => e,
            };

            if err.is_fatal() {
                return Err(err);
            }

            if err.is_schema_violation() {
                if current.strict {
                    return Err(err);
                }
                tracing::warn!(kind = %request.kind(), error = %err, "Schema violation, re-prompting with strict output");
                current.strict = true;
                continue;
            }

            if err.is_transient() {
                transient_failures += 1;
                if transient_failures >= self.policy.max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: calls,
                        last: Box::new(err),
                    });
                }
                let delay = self.policy.delay_for(transient_failures);
                tracing::warn!(
                    kind = %request.kind(),
                    attempt = transient_failures,
                    max_attempts = self.policy.max_attempts,
                    error = %err,
                    "Transient classifier failure, retrying in {:?}",
                    delay
                );
                std::thread::sleep(delay);
                continue;
            }

            return Err(err);
        }
    }
}
