// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use iml_manager_api::ApiError;
use iml_manager_client::ImlManagerClientError;
use iml_poll::WaitError;
use iml_remote_ops::RemoteOpsError;
use iml_ssh::ImlSshError;
use iml_test_config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error(transparent)]
    ApiError(#[from] ApiError),
    #[error(transparent)]
    ImlManagerClientError(#[from] ImlManagerClientError),
    #[error(transparent)]
    RemoteOpsError(#[from] RemoteOpsError),
    #[error(transparent)]
    ImlSshError(#[from] ImlSshError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    WaitError(#[from] WaitError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Servers not contactable after test: {0:?}")]
    ServersDown(Vec<String>),
    #[error("Assertion failed: {0}")]
    Assert(String),
}

impl TestError {
    pub fn assert(msg: impl Into<String>) -> Self {
        TestError::Assert(msg.into())
    }
}
