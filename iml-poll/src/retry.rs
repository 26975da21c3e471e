// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use futures::Future;
use std::{fmt::Debug, time::Duration};
use tokio::time::sleep;

/// Once a future has finished it must not be polled again, so a retry needs
/// to _recreate_ the future. `FutureFactory` abstracts over the thunk that
/// builds one for attempt number `n`.
pub trait FutureFactory<T, E, F>
where
    F: Future<Output = Result<T, E>>,
{
    fn build_future(&self, _: u32) -> F;
}

impl<T, E, F, FF> FutureFactory<T, E, F> for FF
where
    F: Future<Output = Result<T, E>>,
    FF: Fn(u32) -> F,
{
    fn build_future(&self, c: u32) -> F {
        (*self)(c)
    }
}

/// Decides, for every failed attempt, whether to
/// - retry immediately
/// - wait and then retry
/// - give up and return the error
pub trait RetryPolicy<E: Debug> {
    fn on_ok(&mut self, _: u32) {}
    fn on_err(&mut self, _: u32, _: E) -> RetryAction<E>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction<E: Debug> {
    RetryNow,
    WaitFor(Duration),
    ReturnError(E),
}

impl<P, E: Debug> RetryPolicy<E> for P
where
    P: FnMut(u32, E) -> RetryAction<E>,
{
    fn on_err(&mut self, k: u32, e: E) -> RetryAction<E> {
        (*self)(k, e)
    }
}

/// Retries errors accepted by `is_transient` up to `max_attempts` total
/// attempts, sleeping `delay` between them.
pub struct BoundedPolicy<F> {
    pub max_attempts: u32,
    pub delay: Duration,
    pub is_transient: F,
}

impl<F> BoundedPolicy<F> {
    pub fn new(max_attempts: u32, delay: Duration, is_transient: F) -> Self {
        Self {
            max_attempts,
            delay,
            is_transient,
        }
    }
}

impl<E: Debug, F: Fn(&E) -> bool> RetryPolicy<E> for BoundedPolicy<F> {
    fn on_err(&mut self, k: u32, e: E) -> RetryAction<E> {
        if k + 1 >= self.max_attempts || !(self.is_transient)(&e) {
            return RetryAction::ReturnError(e);
        }

        if self.delay == Duration::from_secs(0) {
            RetryAction::RetryNow
        } else {
            RetryAction::WaitFor(self.delay)
        }
    }
}

pub async fn retry_future<T, E, F, FF>(factory: FF, mut policy: impl RetryPolicy<E>) -> Result<T, E>
where
    E: Debug,
    F: Future<Output = Result<T, E>>,
    FF: FutureFactory<T, E, F>,
{
    let mut request_no = 0u32;

    loop {
        let future = factory.build_future(request_no);

        match future.await {
            Ok(x) => {
                policy.on_ok(request_no);
                return Ok(x);
            }
            Err(e) => {
                let action = policy.on_err(request_no, e);
                tracing::debug!("on attempt: {} => action: {:?}", request_no, action);

                match action {
                    RetryAction::RetryNow => {}
                    RetryAction::WaitFor(duration) => sleep(duration).await,
                    RetryAction::ReturnError(err) => return Err(err),
                }
            }
        }

        request_no += 1
    }
}
