// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backoff-driven retry on top of the supervision tree.
//!
//! [`run_with_retry`] runs a fallible attempt repeatedly as a child of a
//! [`Scope`]. Cooldowns come from an ordered ladder (the last entry is reused
//! once exhausted); an attempt that ran longer than the reset threshold is
//! treated as a fresh run, so a connection that was healthy for a long time
//! before failing retries immediately instead of inheriting old backoff.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

use super::scope::{Outcome, Scope};

/// Cooldown ladder and reset threshold for [`run_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Cooldown periods for consecutive failed attempts.
    ///
    /// When attempts fail more times than the ladder is long, the last
    /// entry is reused.
    pub cooldown: Vec<Duration>,
    /// An attempt that ran longer than this counts as a first failure.
    pub reset_threshold: Duration,
}

impl RetryPolicy {
    /// Creates a policy from a cooldown ladder and reset threshold.
    #[must_use]
    pub fn new(cooldown: Vec<Duration>, reset_threshold: Duration) -> Self {
        Self {
            cooldown,
            reset_threshold,
        }
    }

    /// Cooldown for the given attempt number (1-based).
    #[must_use]
    fn cooldown_for(&self, try_number: u32) -> Duration {
        let idx = (try_number as usize).min(self.cooldown.len()).saturating_sub(1);
        self.cooldown.get(idx).copied().unwrap_or_default()
    }
}

/// Context handed to each attempt.
///
/// Wraps the attempt's own supervision [`Scope`] together with the assigned
/// try number, so the attempt can reauthorize or warm caches differently on
/// retries.
#[derive(Debug, Clone)]
pub struct Attempt {
    scope: Scope,
    try_number: u32,
}

impl Attempt {
    /// The attempt's supervision scope.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The assigned try number, starting at 1.
    #[must_use]
    pub fn try_number(&self) -> u32 {
        self.try_number
    }

    /// Blocks until the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.scope.cancelled().await;
    }

    /// Returns `true` once the attempt has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Fails the attempt's subtree; idempotent.
    pub fn fail(&self, err: Error) {
        self.scope.fail(err);
    }
}

/// Runs `attempt_fn` repeatedly as a child of `scope` until it succeeds or
/// the scope is cancelled.
///
/// Each attempt is a supervised child task, so cancelling `scope` interrupts
/// an in-flight attempt and blocks until its subtree has torn down. Failed
/// attempts wait out the remainder of the ladder cooldown (cooldown minus
/// the time the attempt already spent, clamped to zero).
pub async fn run_with_retry<F, Fut>(scope: &Scope, runner: &str, policy: &RetryPolicy, attempt_fn: F)
where
    F: Fn(Attempt) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut try_number: u32 = 1;

    loop {
        if scope.is_cancelled() {
            tracing::trace!(runner, "retry run cancelled, there will be no further attempts");
            return;
        }

        tracing::trace!(runner, try_number, "starting attempt");
        let started = Instant::now();
        let handle = scope.spawn(|child| {
            attempt_fn(Attempt {
                scope: child,
                try_number,
            })
        });

        let outcome = handle.wait().await;
        let elapsed = started.elapsed();

        match outcome {
            Outcome::Cancelled => {
                tracing::trace!(
                    runner,
                    "retry run cancelled in the middle of execution, there will be no further attempts"
                );
                return;
            }
            Outcome::Completed => {
                tracing::trace!(runner, "attempt finished without an error");
                return;
            }
            Outcome::Failed(err) => {
                tracing::trace!(runner, error = %err, "attempt finished with error");

                if !policy.reset_threshold.is_zero() && elapsed > policy.reset_threshold {
                    tracing::trace!(runner, ?elapsed, "attempt ran past reset threshold, resetting tries");
                    try_number = 1;
                    continue;
                }

                let cooldown = policy.cooldown_for(try_number);
                try_number += 1;

                let remaining = cooldown.saturating_sub(elapsed);
                if remaining.is_zero() {
                    tracing::trace!(runner, "no cooldown necessary, performing next attempt");
                    continue;
                }

                tracing::trace!(runner, ?cooldown, ?remaining, "cooling down before the next attempt");
                tokio::select! {
                    () = scope.cancelled() => {
                        tracing::trace!(runner, "retry run cancelled during cooldown");
                        return;
                    }
                    () = tokio::time::sleep(remaining) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::ProtocolError;

    fn failure() -> Error {
        ProtocolError::ConnectionFailed("simulated failure".to_string()).into()
    }

    #[test]
    fn ladder_reuses_last_entry() {
        let policy = RetryPolicy::new(
            vec![Duration::from_secs(1), Duration::from_secs(5)],
            Duration::from_secs(2),
        );
        assert_eq!(policy.cooldown_for(1), Duration::from_secs(1));
        assert_eq!(policy.cooldown_for(2), Duration::from_secs(5));
        assert_eq!(policy.cooldown_for(7), Duration::from_secs(5));
    }

    #[test]
    fn empty_ladder_means_no_cooldown() {
        let policy = RetryPolicy::new(vec![], Duration::from_secs(2));
        assert_eq!(policy.cooldown_for(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_failure_waits_out_cooldown_remainder() {
        let policy = RetryPolicy::new(
            vec![Duration::from_secs(30), Duration::from_secs(120)],
            Duration::from_secs(2),
        );
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let starts_clone = Arc::clone(&starts);

        let root = Scope::root();
        run_with_retry(&root, "test", &policy, move |attempt| {
            let starts = Arc::clone(&starts_clone);
            async move {
                starts.lock().push(Instant::now());
                if attempt.try_number() >= 3 {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                Err(failure())
            }
        })
        .await;

        let starts = starts.lock();
        assert_eq!(starts.len(), 3);
        // First attempt failed after 1s; cooldown 30s minus 1s elapsed = 29s.
        let gap1 = starts[1] - starts[0];
        assert_eq!(gap1, Duration::from_secs(30));
        // Second attempt also ran 1s before failing; ladder entry two is
        // 120s, so the next attempt starts 120s after the second began.
        let gap2 = starts[2] - starts[1];
        assert_eq!(gap2, Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn long_run_resets_counter_and_retries_immediately() {
        let policy = RetryPolicy::new(
            vec![Duration::from_secs(30), Duration::from_secs(120)],
            Duration::from_secs(2),
        );
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let tries: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let starts_clone = Arc::clone(&starts);
        let tries_clone = Arc::clone(&tries);
        let count = Arc::new(AtomicU32::new(0));

        let root = Scope::root();
        run_with_retry(&root, "test", &policy, move |attempt| {
            let starts = Arc::clone(&starts_clone);
            let tries = Arc::clone(&tries_clone);
            let count = Arc::clone(&count);
            async move {
                starts.lock().push(Instant::now());
                tries.lock().push(attempt.try_number());
                let n = count.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // Ran healthy well past the reset threshold, then failed.
                    tokio::time::sleep(Duration::from_secs(40)).await;
                    Err(failure())
                } else {
                    Ok(())
                }
            }
        })
        .await;

        let starts = starts.lock();
        assert_eq!(starts.len(), 2);
        // Past the reset threshold: counter back to 1, retry immediate.
        assert_eq!(starts[1] - starts[0], Duration::from_secs(40));
        assert_eq!(*tries.lock(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn success_stops_retrying() {
        let policy = RetryPolicy::new(vec![Duration::from_secs(1)], Duration::from_secs(2));
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);

        let root = Scope::root();
        run_with_retry(&root, "test", &policy, move |_| {
            let count = Arc::clone(&count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_further_attempts() {
        let policy = RetryPolicy::new(vec![Duration::from_secs(30)], Duration::from_secs(2));
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);

        let root = Scope::root();
        let handle = root.spawn(move |scope| async move {
            run_with_retry(&scope, "test", &policy, move |_| {
                let count = Arc::clone(&count_clone);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(failure())
                }
            })
            .await;
            Ok(())
        });

        // Let the first attempt fail and enter cooldown, then cancel.
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
