// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

mod assertions;
mod error;
mod health;
pub mod help;
mod test_case;

pub use assertions::assert_filesystem_available_consistent;
pub use error::TestError;
pub use health::ClusterHealthHook;
pub use help::{HelpCallback, HelpGate};
pub use test_case::{TestCase, TestCaseBuilder, TestFlags};

use iml_test_config::ClusterConfig;
use std::path::{Path, PathBuf};

/// Writes `config` as json to `path`.
pub async fn write_cluster_config_to(config: &ClusterConfig, path: &Path) -> Result<(), TestError> {
    let s = config.to_json_string()?;

    tokio::fs::write(path, s).await?;

    Ok(())
}

/// Persists `config` to `LUSTRE_FILESYSTEM_CONFIGFILE`, returning where it
/// went. Does nothing when the variable is unset.
pub async fn write_cluster_config(config: &ClusterConfig) -> Result<Option<PathBuf>, TestError> {
    let path = match iml_test_env::get_lustre_filesystem_configfile() {
        Some(x) => x,
        None => return Ok(None),
    };

    tracing::info!("Writing cluster config to {}", path.display());

    write_cluster_config_to(config, &path).await?;

    Ok(Some(path))
}

/// Sends logs to stderr and to `test.log` in the working directory.
pub fn init_logging() -> Result<(), TestError> {
    iml_tracing::init_with_log_file("test.log")?;

    Ok(())
}
