// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Runs shell commands on cluster hosts.
//!
//! Every call opens its own SSH connection and drops it once the command's
//! output and exit status have been read. Callers that need ordering between
//! calls must sequence them.

mod client;
pub mod config;
mod error;
mod executor;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;

pub use client::{connect, Auth, Client};
pub use config::{HostConfig, SshConfig};
pub use error::{ClientError, ImlSshError};
pub use executor::{escape_double_quoted, wrap_command, SshExecutor};

use async_trait::async_trait;
use std::time::Duration;

/// Default channel timeout for a single call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Exit code reported when the connection dropped before an exit status
/// arrived.
pub const RC_CONNECTION_LOST: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Fail with `UnexpectedExitCode` when the rc differs. `None` accepts any rc.
    pub expected_rc: Option<i32>,
    pub timeout: Duration,
    pub stdin: Option<Vec<u8>>,
    /// Elevate with `sudo` when the login user is not root.
    pub as_root: bool,
    /// Keep stdout and stderr in the `RunResult`. When off, output is only
    /// logged as it arrives.
    pub buffer_output: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            expected_rc: Some(0),
            timeout: DEFAULT_TIMEOUT,
            stdin: None,
            as_root: true,
            buffer_output: true,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept any exit code.
    pub fn unchecked() -> Self {
        Self::default().expected_rc(None)
    }

    pub fn expected_rc(mut self, rc: impl Into<Option<i32>>) -> Self {
        self.expected_rc = rc.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn as_root(mut self, as_root: bool) -> Self {
        self.as_root = as_root;
        self
    }

    pub fn buffer_output(mut self, buffer_output: bool) -> Self {
        self.buffer_output = buffer_output;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunResult {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunResult {
    pub fn new(rc: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            rc,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        self.rc == 0 && !self.timed_out
    }

    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }

    /// Asserts `expected_rc` against this result.
    pub fn check(
        self,
        address: &str,
        command: &str,
        expected_rc: Option<i32>,
    ) -> Result<Self, ImlSshError> {
        match expected_rc {
            Some(expected) if expected != self.rc => Err(ImlSshError::UnexpectedExitCode {
                address: address.to_string(),
                command: command.to_string(),
                expected,
                rc: self.rc,
                stdout: self.stdout,
                stderr: self.stderr,
            }),
            _ => Ok(self),
        }
    }
}

/// Something that can run a shell command on a named host.
///
/// The production implementation is [`SshExecutor`]; everything above the
/// transport only sees this trait.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        address: &str,
        command: &str,
        opts: RunOptions,
    ) -> Result<RunResult, ImlSshError>;

    /// Runs `command` expecting rc 0.
    async fn run_ok(&self, address: &str, command: &str) -> Result<RunResult, ImlSshError> {
        self.run(address, command, RunOptions::default()).await
    }

    /// Runs `command` accepting any rc.
    async fn run_unchecked(&self, address: &str, command: &str) -> Result<RunResult, ImlSshError> {
        self.run(address, command, RunOptions::unchecked()).await
    }
}
