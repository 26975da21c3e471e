// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! A [`RemoteExecutor`] that answers from a script instead of a network.
//!
//! Rules are matched in insertion order against the unwrapped command by
//! substring. Commands matching no rule succeed with empty output.

use crate::{ImlSshError, RemoteExecutor, RunOptions, RunResult};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

#[derive(Debug, Clone)]
enum Response {
    Result(RunResult),
    Unreachable,
}

#[derive(Debug, Clone)]
struct Rule {
    address: Option<String>,
    pattern: String,
    response: Response,
    times: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, String)>>,
    delays: Mutex<HashMap<String, Duration>>,
    stdins: Mutex<Vec<(String, Vec<u8>)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, address: Option<&str>, pattern: &str, response: Response, times: Option<usize>) {
        lock(&self.rules).push(Rule {
            address: address.map(String::from),
            pattern: pattern.to_string(),
            response,
            times,
        });
    }

    /// Any host running a command containing `pattern` gets `rc` and `stdout`.
    pub fn on(&self, pattern: &str, rc: i32, stdout: &str) -> &Self {
        self.push(
            None,
            pattern,
            Response::Result(RunResult::new(rc, stdout, "")),
            None,
        );
        self
    }

    /// Like [`on`](Self::on), restricted to `address`.
    pub fn on_host(&self, address: &str, pattern: &str, rc: i32, stdout: &str) -> &Self {
        self.push(
            Some(address),
            pattern,
            Response::Result(RunResult::new(rc, stdout, "")),
            None,
        );
        self
    }

    /// A rule used for `times` matches and then skipped.
    pub fn on_host_times(
        &self,
        address: &str,
        pattern: &str,
        times: usize,
        result: RunResult,
    ) -> &Self {
        self.push(Some(address), pattern, Response::Result(result), Some(times));
        self
    }

    /// Commands to `address` containing `pattern` fail at the transport.
    pub fn unreachable_on(&self, address: &str, pattern: &str) -> &Self {
        self.push(Some(address), pattern, Response::Unreachable, None);
        self
    }

    /// Every command sent to `address` fails at the transport.
    pub fn unreachable(&self, address: &str) -> &Self {
        self.push(Some(address), "", Response::Unreachable, None);
        self
    }

    /// Every command sent to `address` takes `delay` before answering. The
    /// call is recorded once the delay has passed.
    pub fn delay_host(&self, address: &str, delay: Duration) -> &Self {
        lock(&self.delays).insert(address.to_string(), delay);
        self
    }

    /// Every `(address, command)` seen, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }

    /// What was piped to the most recent command containing `pattern`.
    pub fn stdin_for(&self, pattern: &str) -> Option<String> {
        lock(&self.stdins)
            .iter()
            .rev()
            .find(|(c, _)| c.contains(pattern))
            .map(|(_, x)| String::from_utf8_lossy(x).into_owned())
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, c)| c).collect()
    }

    pub fn commands_for(&self, address: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c)
            .collect()
    }

    fn respond(&self, address: &str, command: &str) -> Response {
        let mut rules = lock(&self.rules);

        let rule = rules.iter_mut().find(|r| {
            r.times != Some(0)
                && r.address.as_deref().map(|a| a == address).unwrap_or(true)
                && command.contains(&r.pattern)
        });

        match rule {
            Some(r) => {
                if let Some(n) = r.times.as_mut() {
                    *n -= 1;
                }

                r.response.clone()
            }
            None => Response::Result(RunResult::default()),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(
        &self,
        address: &str,
        command: &str,
        opts: RunOptions,
    ) -> Result<RunResult, ImlSshError> {
        let delay = lock(&self.delays).get(address).copied();

        if let Some(x) = delay {
            tokio::time::sleep(x).await;
        }

        lock(&self.calls).push((address.to_string(), command.to_string()));

        if let Some(x) = &opts.stdin {
            lock(&self.stdins).push((command.to_string(), x.clone()));
        }

        match self.respond(address, command) {
            Response::Result(x) => x.check(address, command, opts.expected_rc),
            Response::Unreachable => Err(ImlSshError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} is unreachable", address),
            ))),
        }
    }
}
