// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use iml_firewall::FirewallError;
use iml_poll::WaitError;
use iml_ssh::ImlSshError;
use iml_test_config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum RemoteOpsError {
    #[error(transparent)]
    ImlSshError(#[from] ImlSshError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
    #[error(transparent)]
    FirewallError(#[from] FirewallError),
    #[error(transparent)]
    WaitError(#[from] WaitError),
    #[error(transparent)]
    XmlError(#[from] elementtree::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0} is not implemented for real hardware")]
    NotImplemented(&'static str),
    #[error("Unknown device type {0}")]
    UnknownDeviceType(String),
    #[error("Could not parse output of `{command}` on {address}: {output}")]
    Parse {
        address: String,
        command: String,
        output: String,
    },
    #[error("Assertion failed: {0}")]
    Assert(String),
}

impl RemoteOpsError {
    pub fn assert(msg: impl Into<String>) -> Self {
        RemoteOpsError::Assert(msg.into())
    }
}
