// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded retry for read-modify-write loops.
//!
//! A writer that loses a compare-and-swap race re-reads and tries again. The
//! loop is capped and backs off exponentially, so heavy contention surfaces
//! `PreconditionFailed` instead of spinning forever.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::StoreError;

/// Errors that can report an optimistic-concurrency conflict.
pub trait Retryable {
    /// True if the failed attempt lost a version-token race.
    fn is_precondition_failed(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_precondition_failed(&self) -> bool {
        StoreError::is_precondition_failed(self)
    }
}

/// Retry policy for precondition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second retry. The first retry is immediate.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    ///
    /// Retry 1 is immediate; retry n waits `initial_backoff * 2^(n-2)`, capped
    /// at `max_backoff`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(retry - 2);
        self.initial_backoff
            .saturating_mul(multiplier)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or the
/// policy's attempts are used up. The last error is returned on exhaustion.
pub async fn retry_on_precondition_failed<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_precondition_failed() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_retry(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Precondition failed, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            result => return result,
        }
    }
}
