// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Deadline-bounded polling.
//!
//! Everything in the harness that waits for the cluster or the manager to
//! converge goes through [`wait_until`] or one of its shapes. Bounded retries
//! of a single fallible operation go through [`retry::retry_future`].

pub mod retry;

pub use retry::{retry_future, BoundedPolicy, FutureFactory, RetryAction, RetryPolicy};

use futures::Future;
use std::{fmt::Debug, time::Duration};
use tokio::time::{sleep, Instant};

/// The default budget for a wait, matching `TEST_TIMEOUT`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum WaitError {
    #[error("Timed out after {waited:?}: {last}")]
    Timeout { waited: Duration, last: String },
}

/// How long to sleep between evaluations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitStrategy {
    /// Sleep the same interval every time.
    Fixed(Duration),
    /// Start at `start` and double each time, never exceeding `max`.
    Ramp { start: Duration, max: Duration },
}

impl WaitStrategy {
    /// 1 Hz polling.
    pub fn per_second() -> Self {
        WaitStrategy::Fixed(Duration::from_secs(1))
    }

    /// 10 ms doubling up to 1 s.
    pub fn ramp() -> Self {
        WaitStrategy::Ramp {
            start: Duration::from_millis(10),
            max: Duration::from_secs(1),
        }
    }

    fn first(&self) -> Duration {
        match self {
            WaitStrategy::Fixed(x) => *x,
            WaitStrategy::Ramp { start, .. } => *start,
        }
    }

    fn next(&self, current: Duration) -> Duration {
        match self {
            WaitStrategy::Fixed(x) => *x,
            WaitStrategy::Ramp { max, .. } => std::cmp::min(current * 2, *max),
        }
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::ramp()
    }
}

/// Sleeps according to `strategy` until `deadline`, never oversleeping it.
struct Pacer {
    strategy: WaitStrategy,
    delay: Duration,
    started: Instant,
    deadline: Instant,
}

impl Pacer {
    fn new(strategy: WaitStrategy, timeout: Duration) -> Self {
        let started = Instant::now();

        Self {
            strategy,
            delay: strategy.first(),
            started,
            deadline: started + timeout,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn waited(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started)
    }

    async fn pause(&mut self) {
        let remaining = self.deadline.saturating_duration_since(Instant::now());

        sleep(std::cmp::min(self.delay, remaining)).await;

        self.delay = self.strategy.next(self.delay);
    }
}

/// Evaluates `pred` until it yields `true` or `timeout` elapses.
///
/// `pred` is always evaluated at least once, and once more at the deadline,
/// so a condition that becomes true right before the deadline is not missed.
/// `error_message` is only called on timeout.
pub async fn wait_until<P, Fut, M>(
    mut pred: P,
    timeout: Duration,
    strategy: WaitStrategy,
    error_message: M,
) -> Result<(), WaitError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    M: FnOnce() -> String,
{
    let mut pacer = Pacer::new(strategy, timeout);

    loop {
        let expired = pacer.expired();

        if pred().await {
            return Ok(());
        }

        if expired {
            let last = error_message();

            tracing::warn!("wait_until timed out after {:?}: {}", pacer.waited(), last);

            return Err(WaitError::Timeout {
                waited: pacer.waited(),
                last,
            });
        }

        pacer.pause().await;
    }
}

/// [`wait_until`] with the adaptive 10 ms to 1 s ramp.
pub async fn wait_until_true<P, Fut, M>(
    pred: P,
    error_message: M,
    timeout: Duration,
) -> Result<(), WaitError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    M: FnOnce() -> String,
{
    wait_until(pred, timeout, WaitStrategy::ramp(), error_message).await
}

/// Calls `f` at 1 Hz until it returns `Ok`.
///
/// Errors are treated as failed assertions and retried. On timeout the last
/// error is returned unchanged.
pub async fn wait_for_assert<T, E, F, Fut>(f: F, timeout: Duration) -> Result<T, E>
where
    E: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    wait_for_assert_with(f, timeout, WaitStrategy::per_second()).await
}

pub async fn wait_for_assert_with<T, E, F, Fut>(
    mut f: F,
    timeout: Duration,
    strategy: WaitStrategy,
) -> Result<T, E>
where
    E: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut pacer = Pacer::new(strategy, timeout);

    loop {
        let expired = pacer.expired();

        match f().await {
            Ok(x) => return Ok(x),
            Err(e) if expired => {
                tracing::warn!("wait_for_assert gave up after {:?}", pacer.waited());

                return Err(e);
            }
            Err(e) => {
                tracing::trace!("wait_for_assert retrying: {:?}", e);
            }
        }

        pacer.pause().await;
    }
}

/// Polls `fetch` at 1 Hz until it returns exactly `expected_len` items.
pub async fn wait_for_items_length<T, E, F, Fut>(
    mut fetch: F,
    expected_len: usize,
    timeout: Duration,
) -> Result<Vec<T>, E>
where
    E: From<WaitError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    let mut pacer = Pacer::new(WaitStrategy::per_second(), timeout);

    loop {
        let expired = pacer.expired();

        let xs = fetch().await?;

        if xs.len() == expected_len {
            return Ok(xs);
        }

        if expired {
            return Err(WaitError::Timeout {
                waited: pacer.waited(),
                last: format!("expected {} items, found {}", expected_len, xs.len()),
            }
            .into());
        }

        pacer.pause().await;
    }
}

/// Polls `fetch` at 1 Hz until `pred` accepts its value, returning that value.
///
/// `fetch` errors propagate immediately. On timeout the last value is
/// described with `Debug`.
pub async fn wait_for_value<T, E, F, Fut, P>(
    mut fetch: F,
    mut pred: P,
    timeout: Duration,
) -> Result<T, E>
where
    T: Debug,
    E: From<WaitError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
{
    let mut pacer = Pacer::new(WaitStrategy::per_second(), timeout);

    loop {
        let expired = pacer.expired();

        let x = fetch().await?;

        if pred(&x) {
            return Ok(x);
        }

        if expired {
            return Err(WaitError::Timeout {
                waited: pacer.waited(),
                last: format!("{:?}", x),
            }
            .into());
        }

        pacer.pause().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn test_ramp_doubles_to_max() {
        let s = WaitStrategy::ramp();

        let mut d = s.first();
        let mut seen = vec![d];

        for _ in 0..8 {
            d = s.next(d);
            seen.push(d);
        }

        assert_eq!(seen[0], Duration::from_millis(10));
        assert_eq!(seen[1], Duration::from_millis(20));
        assert_eq!(seen[7], Duration::from_secs(1));
        assert_eq!(seen[8], Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_true_succeeds() {
        let count = Arc::new(AtomicU32::new(0));

        let r = wait_until_true(
            || {
                let count = Arc::clone(&count);
                async move { count.fetch_add(1, Ordering::SeqCst) >= 3 }
            },
            || "never".into(),
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(r, Ok(()));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out_with_message() {
        let r = wait_until_true(
            || async { false },
            || "host never came up".into(),
            Duration::from_secs(5),
        )
        .await;

        match r {
            Err(WaitError::Timeout { last, waited }) => {
                assert_eq!(last, "host never came up");
                assert!(waited >= Duration::from_secs(5));
            }
            Ok(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_assert_returns_last_error() {
        let count = Arc::new(AtomicU32::new(0));

        let r: Result<(), String> = wait_for_assert(
            || {
                let count = Arc::clone(&count);
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    Err(format!("attempt {}", n))
                }
            },
            Duration::from_secs(3),
        )
        .await;

        let n = count.load(Ordering::SeqCst);

        assert!(n >= 4);
        assert_eq!(r, Err(format!("attempt {}", n - 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_assert_succeeds_eventually() {
        let count = Arc::new(AtomicU32::new(0));

        let r: Result<u32, String> = wait_for_assert(
            || {
                let count = Arc::clone(&count);
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(r, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_items_length() {
        let count = Arc::new(AtomicU32::new(0));

        let r: Result<Vec<u32>, WaitError> = wait_for_items_length(
            || {
                let count = Arc::clone(&count);
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    Ok((0..n).collect())
                }
            },
            3,
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(r, Ok(vec![0, 1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_items_length_timeout() {
        let r: Result<Vec<u32>, WaitError> =
            wait_for_items_length(|| async { Ok(vec![1]) }, 3, Duration::from_secs(2)).await;

        assert!(matches!(r, Err(WaitError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_true_at_deadline() {
        let start = Instant::now();

        let r = wait_until(
            || async move { Instant::now() >= start + Duration::from_secs(4) },
            Duration::from_secs(4),
            WaitStrategy::Fixed(Duration::from_secs(3)),
            || "missed".into(),
        )
        .await;

        assert_eq!(r, Ok(()));
    }
}
