//! Retry policy with exponential backoff.
//!
//! Classification and delay computation live here; the attempt loop
//! itself is driven by the orchestrator in [`crate::client`].

use std::time::Duration;

use http::{Method, StatusCode};
use rand::Rng;

use crate::http::body::Body;

/// Header reporting the 1-based attempt count on every response.
pub const ATTEMPTS_HEADER: &str = "x-fetch-attempts";

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of retries after the first attempt (default: 3).
    pub retries: u32,
    /// Backoff multiplier per retry (default: 2.0).
    pub factor: f64,
    /// Delay before the first retry (default: 100ms).
    pub min_timeout: Duration,
    /// Delay cap (default: 5s).
    pub max_timeout: Duration,
    /// Randomize each delay by a factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            factor: 2.0,
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(5),
            randomize: false,
        }
    }
}

impl RetryConfig {
    /// A config that disables retries entirely.
    pub fn disabled() -> Self {
        Self {
            retries: 0,
            ..Default::default()
        }
    }

    /// Total number of attempts this config allows.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Whether a response status warrants another attempt.
///
/// Covers the rate-limit family (408, 420, 429) and every 5xx. All other
/// 4xx statuses are final outcomes, not failures.
pub fn retriable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 420 | 429) || status.is_server_error()
}

/// Whether a request may be reissued at all.
///
/// POST is never retried, and a streamed body cannot be replayed
/// regardless of method.
pub fn request_retryable(method: &Method, body: &Body) -> bool {
    *method != Method::POST && body.is_rewindable()
}

/// Backoff delay before retry number `retry` (1-based).
///
/// Exponential: `min_timeout * factor^(retry-1)`, capped at
/// `max_timeout`, optionally randomized by a factor in `[1, 2)`.
pub fn backoff_delay(retry: u32, config: &RetryConfig) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }
    let exp = (retry - 1).min(32);
    let base_ms = config.min_timeout.as_millis() as f64 * config.factor.powi(exp as i32);
    let capped_ms = base_ms.min(config.max_timeout.as_millis() as f64);
    let delayed_ms = if config.randomize {
        capped_ms * rand::thread_rng().gen_range(1.0..2.0)
    } else {
        capped_ms
    };
    Duration::from_millis(delayed_ms.min(u64::MAX as f64) as u64)
}
