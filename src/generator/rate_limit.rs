//! GitHub API rate-limit tracking.
//!
//! Reads `X-RateLimit-Remaining` / `X-RateLimit-Reset` (or the standardised
//! `RateLimit-Remaining` / `RateLimit-Reset`) from API responses and refuses
//! further calls while the remaining budget is below a reserve.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::CardError;

/// Shared rate-limit state updated after every API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Remaining API calls before the rate limit resets.
    remaining: Arc<AtomicU64>,
    /// Unix timestamp at which the rate limit window resets.
    reset_at: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    pub fn reset_at(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Update state from HTTP response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let remaining = header_u64(headers, "X-RateLimit-Remaining", "RateLimit-Remaining");
        let reset = header_u64(headers, "X-RateLimit-Reset", "RateLimit-Reset");

        if let Some(r) = remaining {
            self.remaining.store(r, Ordering::Relaxed);
        }
        if let Some(r) = reset {
            self.reset_at.store(r, Ordering::Relaxed);
        }
    }

    /// Fail with a transient error while fewer than `buffer` calls remain and
    /// the window has not reset yet.
    pub fn check(&self, buffer: u32) -> Result<(), CardError> {
        let remaining = self.remaining();
        if remaining == u64::MAX || remaining >= u64::from(buffer) {
            debug!(remaining, buffer, "rate limit OK");
            return Ok(());
        }
        let retry_after = self.retry_after_secs();
        if retry_after == 0 {
            return Ok(());
        }
        info!(remaining, reset_in_secs = retry_after, buffer, "refusing upstream call: rate limit reserve reached");
        Err(CardError::UpstreamTransient {
            message: format!("GitHub API rate limit nearly exhausted ({remaining} calls left)"),
            retry_after_secs: Some(retry_after),
        })
    }

    /// Seconds until the rate-limit window resets, or 0 if already reset.
    /// Used for `Retry-After` HTTP response headers.
    pub fn retry_after_secs(&self) -> u64 {
        let reset = self.reset_at();
        let now = chrono::Utc::now().timestamp() as u64;
        reset.saturating_sub(now)
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, primary: &str, fallback: &str) -> Option<u64> {
    headers
        .get(primary)
        .or_else(|| headers.get(fallback))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}
