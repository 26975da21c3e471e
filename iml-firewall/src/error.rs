// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use iml_ssh::ImlSshError;

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error(transparent)]
    ImlSshError(#[from] ImlSshError),
    #[error("Neither firewall-cmd nor lokkit is installed on {0}")]
    NoBackend(String),
    #[error("Could not parse firewall listing: {0}")]
    Parse(String),
}
