//! Retry accounting and delay policies.
//!
//! A job's `retry` field persists alongside the record, so every policy here
//! is serializable. The delay is either a fixed number of milliseconds or a
//! growth policy evaluated against the attempt number, optionally clamped and
//! jittered:
//!
//! ```
//! # use quenda::retry::{Backoff, RetryDelay, RetrySpec};
//! # use chrono::TimeDelta;
//! let spec = RetrySpec {
//!     max_attempts: 5,
//!     delay: RetryDelay::Backoff(Backoff::Exponential {
//!         base_ms: 1_000,
//!         max_ms: Some(60_000),
//!         jitter_ms: None,
//!     }),
//! };
//!
//! assert!(spec.should_retry(4));
//! assert!(!spec.should_retry(5));
//! assert_eq!(spec.delay_for(1), TimeDelta::seconds(1));
//! assert_eq!(spec.delay_for(3), TimeDelta::seconds(4));
//! ```
//!
//! A bare integer deserializes as `{maxAttempts: n, delay: 0}`, so
//! `"retry": 3` in a submitted document means three attempts back to back.

use chrono::TimeDelta;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Decides whether a failed job runs again and how long it waits first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RetrySpecRepr")]
pub struct RetrySpec {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    #[serde(default)]
    pub delay: RetryDelay,
}

impl RetrySpec {
    /// Fixed-delay policy: `max_attempts` tries, `delay_ms` apart.
    pub fn fixed(max_attempts: u32, delay_ms: i64) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::Fixed(delay_ms),
        }
    }

    /// True when another attempt is allowed after `attempts` have happened
    /// (the count includes the attempt that just failed).
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the given attempt number runs.
    pub fn delay_for(&self, attempt: u32) -> TimeDelta {
        self.delay.delay_for(attempt)
    }
}

impl From<u32> for RetrySpec {
    fn from(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::default(),
        }
    }
}

/// Accepts both the record form and a bare attempt count.
#[derive(Deserialize)]
#[serde(untagged)]
enum RetrySpecRepr {
    Limit(u32),
    Policy {
        #[serde(rename = "maxAttempts")]
        max_attempts: u32,
        #[serde(default)]
        delay: RetryDelay,
    },
}

impl From<RetrySpecRepr> for RetrySpec {
    fn from(repr: RetrySpecRepr) -> Self {
        match repr {
            RetrySpecRepr::Limit(max_attempts) => max_attempts.into(),
            RetrySpecRepr::Policy {
                max_attempts,
                delay,
            } => Self {
                max_attempts,
                delay,
            },
        }
    }
}

/// The wait between a failure and the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryDelay {
    /// Fixed delay in milliseconds, independent of the attempt number.
    Fixed(i64),
    /// Delay computed from the attempt number.
    Backoff(Backoff),
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Fixed(0)
    }
}

impl RetryDelay {
    fn delay_for(&self, attempt: u32) -> TimeDelta {
        match self {
            Self::Fixed(ms) => TimeDelta::milliseconds((*ms).max(0)),
            Self::Backoff(backoff) => backoff.delay_for(attempt),
        }
    }
}

/// Growing backoff between attempts.
///
/// `max_ms` clamps the computed delay; `jitter_ms` adds a uniform random
/// offset in `[-jitter_ms, jitter_ms]` to spread a thundering herd of
/// retries. The result never goes below zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Backoff {
    /// `factor_ms * attempt`.
    #[serde(rename_all = "camelCase")]
    Linear {
        factor_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_ms: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter_ms: Option<i64>,
    },
    /// `base_ms * 2^(attempt - 1)`.
    #[serde(rename_all = "camelCase")]
    Exponential {
        base_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_ms: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter_ms: Option<i64>,
    },
}

impl Backoff {
    fn delay_for(&self, attempt: u32) -> TimeDelta {
        let (raw, max_ms, jitter_ms) = match self {
            Self::Linear {
                factor_ms,
                max_ms,
                jitter_ms,
            } => (
                factor_ms.saturating_mul(i64::from(attempt)),
                *max_ms,
                *jitter_ms,
            ),
            Self::Exponential {
                base_ms,
                max_ms,
                jitter_ms,
            } => (
                2i64.checked_pow(attempt.saturating_sub(1))
                    .and_then(|factor| base_ms.checked_mul(factor))
                    .unwrap_or(i64::MAX),
                *max_ms,
                *jitter_ms,
            ),
        };
        let mut ms = raw;
        if let Some(max) = max_ms {
            ms = ms.min(max);
        }
        if let Some(jitter) = jitter_ms.filter(|jitter| *jitter > 0) {
            ms = ms.saturating_add(rand::thread_rng().gen_range(-jitter..=jitter));
        }
        TimeDelta::milliseconds(ms.max(0))
    }
}
