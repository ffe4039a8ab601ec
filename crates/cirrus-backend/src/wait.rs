// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Evaluate `condition` every `interval` until it holds, it errors, or
/// `timeout` elapses.
pub async fn poll_until<F, Fut>(
    what: &'static str,
    interval: Duration,
    timeout: Duration,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout { what, timeout });
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        poll_until("third call", Duration::from_millis(500), Duration::from_secs(60), || {
            let calls = calls.clone();
            async move { Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let err = poll_until("never", Duration::from_millis(500), Duration::from_secs(2), || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { what: "never", .. }));
    }

    #[tokio::test]
    async fn test_condition_error_aborts() {
        let err = poll_until("error", Duration::from_millis(1), Duration::from_secs(1), || async {
            Err(Error::LeaseLost)
        })
        .await
        .unwrap_err();
        assert!(err.is_lease_lost());
    }
}
