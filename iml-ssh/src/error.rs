// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use std::{io, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    SshError(#[from] thrussh::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ImlSshError {
    #[error(transparent)]
    ClientError(#[from] ClientError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    SshError(#[from] thrussh::Error),
    #[error(transparent)]
    SshKeyError(#[from] thrussh_keys::Error),
    #[error("SSH Authentication Failed for {0}")]
    AuthenticationFailed(String),
    #[error("No home directory found")]
    NoHomeDir,
    #[error("Could not parse ssh config line {line}: {reason}")]
    ConfigParse { line: usize, reason: String },
    #[error("Command `{command}` on {address} timed out after {timeout:?}")]
    Timeout {
        address: String,
        command: String,
        timeout: Duration,
    },
    #[error(
        "Command `{command}` on {address} returned {rc}, expected {expected}.\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    UnexpectedExitCode {
        address: String,
        command: String,
        expected: i32,
        rc: i32,
        stdout: String,
        stderr: String,
    },
}

impl ImlSshError {
    /// Errors from the connection itself rather than from the remote command.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            ImlSshError::UnexpectedExitCode { .. } | ImlSshError::ConfigParse { .. }
        )
    }

    /// The exit code of the remote command, if it ran to completion.
    pub fn rc(&self) -> Option<i32> {
        match self {
            ImlSshError::UnexpectedExitCode { rc, .. } => Some(*rc),
            _ => None,
        }
    }
}
