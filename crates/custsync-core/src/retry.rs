use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::events::ChangeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `step * attempt`: 1 step after the first failure, 2 after the second.
    Linear { step_ms: u64 },
    /// `base * 2^(attempt - 1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    fn delay_ms(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        match *self {
            Self::Fixed { delay_ms } => delay_ms,
            Self::Linear { step_ms } => step_ms.saturating_mul(u64::from(attempt)),
            Self::Exponential { base_ms, max_ms } => {
                let shift = (attempt - 1).min(63);
                let ms = u128::from(base_ms).saturating_mul(1u128 << shift);
                u64::try_from(ms.min(u128::from(max_ms))).unwrap_or(max_ms)
            }
        }
    }
}

/// How many times an operation may run and how long to wait between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Adds up to 10% random delay.
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: duration_ms(delay),
            },
            jitter: false,
        }
    }

    #[must_use]
    pub const fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear {
                step_ms: duration_ms(step),
            },
            jitter: false,
        }
    }

    #[must_use]
    pub const fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base_ms: duration_ms(base),
                max_ms: duration_ms(max),
            },
            jitter: false,
        }
    }

    /// Policy for whole-run source fetches.
    #[must_use]
    pub const fn source_fetch(max_attempts: u32) -> Self {
        Self::exponential(max_attempts, Duration::from_secs(1), Duration::from_secs(30))
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Wait before the next attempt, given `attempts` failures so far.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let mut ms = self.backoff.delay_ms(attempts);
        if self.jitter && ms >= 10 {
            ms += rand::rng().random_range(0..=ms / 10);
        }
        Duration::from_millis(ms)
    }

    pub const fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::NoAttempts);
        }
        if let Backoff::Exponential { base_ms, max_ms } = self.backoff {
            if base_ms == 0 {
                return Err(RetryPolicyError::ZeroBase);
            }
            if max_ms < base_ms {
                return Err(RetryPolicyError::MaxBelowBase);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("max attempts must be greater than zero")]
    NoAttempts,
    #[error("exponential base delay must be greater than zero")]
    ZeroBase,
    #[error("maximum delay is shorter than the base delay")]
    MaxBelowBase,
}

const fn duration_ms(duration: Duration) -> u64 {
    let ms = duration.as_millis();
    if ms > u64::MAX as u128 {
        u64::MAX
    } else {
        ms as u64
    }
}

/// Per-kind reindex policies consulted by the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicies {
    pub create: RetryPolicy,
    pub update: RetryPolicy,
    pub delete: RetryPolicy,
    pub bulk: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            create: RetryPolicy::linear(4, Duration::from_secs(60)),
            update: RetryPolicy::linear(3, Duration::from_secs(60)),
            delete: RetryPolicy::fixed(2, Duration::from_secs(30)),
            bulk: RetryPolicy::fixed(2, Duration::from_secs(300)),
        }
    }
}

impl RetryPolicies {
    /// Same attempt ceilings with a single uniform delay. Used by tests and
    /// local runs where minute-scale waits are impractical.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        let defaults = Self::default();
        Self {
            create: RetryPolicy::fixed(defaults.create.max_attempts, delay),
            update: RetryPolicy::fixed(defaults.update.max_attempts, delay),
            delete: RetryPolicy::fixed(defaults.delete.max_attempts, delay),
            bulk: RetryPolicy::fixed(defaults.bulk.max_attempts, delay),
        }
    }

    #[must_use]
    pub const fn for_kind(&self, kind: ChangeKind) -> RetryPolicy {
        match kind {
            ChangeKind::Created => self.create,
            ChangeKind::Updated => self.update,
            ChangeKind::Deleted => self.delete,
        }
    }

    /// Overrides the attempt ceiling of every kind.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.create.max_attempts = max_attempts;
        self.update.max_attempts = max_attempts;
        self.delete.max_attempts = max_attempts;
        self.bulk.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, policy) in [
            ("create", self.create),
            ("update", self.update),
            ("delete", self.delete),
            ("bulk", self.bulk),
        ] {
            policy
                .validate()
                .map_err(|source| ConfigError::InvalidRetryPolicy { kind, source })?;
        }
        Ok(())
    }
}
