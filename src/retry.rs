// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Bounded retry with exponential backoff for external model calls
//!
//! Every attempt runs under the configured call timeout. An elapsed timeout is
//! treated like any other transient failure. Backoff sleeps end early when the
//! run is cancelled; an attempt already in flight is allowed to finish.

use crate::errors::{CurationError, CurationResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): 1s, 2s, 4s ... capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_factor.powi(retry as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

async fn timed<T>(
    call_timeout: Duration,
    fut: impl Future<Output = CurationResult<T>>,
) -> CurationResult<T> {
    match timeout(call_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CurationError::Timeout {
            duration_secs: call_timeout.as_secs(),
        }),
    }
}

/// Run `attempt_fn` until it succeeds, fails permanently, or attempts run out
///
/// Non-transient errors are returned immediately. After the last failed
/// attempt the final transient error is returned.
async fn retry_loop<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut attempt_fn: F,
) -> CurationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CurationResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = CurationError::Cancelled;

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(CurationError::Cancelled);
        }

        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(
                    call = what,
                    attempt = attempt + 1,
                    max_attempts,
                    error = %e,
                    "Transient failure"
                );
                last_error = e;
                if attempt + 1 < max_attempts {
                    let delay = policy.delay_for(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CurationError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }

    error!(
        call = what,
        max_attempts,
        error = %last_error,
        "Giving up after exhausting retries"
    );
    Err(last_error)
}

/// Shared entry point for every external model call of a run
///
/// Holds the retry policy, the per-call timeout, the run's cancellation token
/// and the semaphore bounding concurrent model calls. A call slot is taken
/// per attempt and released during backoff; the timeout starts once the slot
/// is held.
#[derive(Clone)]
pub struct ModelGate {
    policy: RetryPolicy,
    call_timeout: Duration,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl ModelGate {
    pub fn new(
        policy: RetryPolicy,
        call_timeout: Duration,
        max_concurrent_calls: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            policy,
            call_timeout,
            slots: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> CurationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CurationResult<T>>,
    {
        let call_timeout = self.call_timeout;
        retry_loop(&self.policy, &self.cancel, what, || {
            let fut = op();
            let slots = self.slots.clone();
            let cancel = self.cancel.clone();
            async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return Err(CurationError::Cancelled),
                    permit = slots.acquire_owned() => {
                        permit.map_err(|_| CurationError::Cancelled)?
                    }
                };
                timed(call_timeout, fut).await
            }
        })
        .await
    }
}
