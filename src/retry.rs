//! Backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. [`BackoffPolicy`] drives
//! the subscription's reconnect schedule; [`with_timeout`] bounds individual
//! transport requests.

use std::future::Future;
use std::time::Duration;

/// Default ceiling on consecutive scheduled reconnects.
pub const DEFAULT_RECONNECT_LIMIT: u32 = 10;
/// Default delay before the first scheduled reconnect.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1_000);
/// Default upper bound for backoff growth.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(30_000);

/// Policy controlling scheduled reconnect attempts and exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum number of scheduled reconnects before the subscription locks
    /// out.
    pub reconnect_limit: u32,
    /// Delay used before the first scheduled reconnect.
    pub base: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Returns the policy used by browser-hosted subscriptions: ten attempts,
    /// one second base, thirty second cap.
    pub fn standard() -> Self {
        Self {
            reconnect_limit: DEFAULT_RECONNECT_LIMIT,
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }

    /// Computes the delay for the given zero-based attempt index.
    ///
    /// The result is `min(base * 2^attempt, cap)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        std::cmp::min(self.base.saturating_mul(factor), self.cap)
    }

    /// Returns true when `attempts` scheduled reconnects have used up the
    /// budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.reconnect_limit
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
