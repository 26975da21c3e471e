// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Cluster level verbs.
//!
//! Everything here is expressed as shell commands sent through a
//! [`RemoteExecutor`], addressed by the fqdns found in the
//! [`ClusterConfig`]. Nothing in this crate talks to the manager.

mod agent;
pub mod cib;
mod commands;
pub mod devices;
mod error;
mod filesystem;
mod ha;
mod health;
mod server;

pub use cib::{AgentInfo, Cib, ResourceAgentType, RscLocation};
pub use devices::{helper_for, DeviceHelper};
pub use error::RemoteOpsError;
pub use filesystem::LustreMount;

use iml_ssh::{escape_double_quoted, RemoteExecutor, RunOptions, RunResult};
use iml_test_config::{ClusterConfig, HostSpec};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Budget for the check made by [`RemoteOperations::host_contactable`].
const CONTACT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RemoteOperations {
    executor: Arc<dyn RemoteExecutor>,
    config: Arc<ClusterConfig>,
    backup_dir: PathBuf,
}

impl RemoteOperations {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: Arc<ClusterConfig>) -> Self {
        Self {
            executor,
            config,
            backup_dir: PathBuf::from("/tmp"),
        }
    }

    /// Where CIB backups are written. Defaults to `/tmp`.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn executor(&self) -> &dyn RemoteExecutor {
        self.executor.as_ref()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub(crate) fn server(&self, fqdn: &str) -> Result<&HostSpec, RemoteOpsError> {
        Ok(self.config.server_by_fqdn(fqdn)?)
    }

    pub(crate) fn address_of(&self, fqdn: &str) -> Result<String, RemoteOpsError> {
        Ok(self.server(fqdn)?.address.clone())
    }

    /// Runs `command` on `address`. `None` accepts any exit code.
    pub async fn remote_command(
        &self,
        address: &str,
        command: &str,
        expected_rc: Option<i32>,
    ) -> Result<RunResult, RemoteOpsError> {
        let x = self
            .executor
            .run(address, command, RunOptions::new().expected_rc(expected_rc))
            .await?;

        Ok(x)
    }

    /// Runs `command` on the server named `fqdn`, expecting rc 0.
    pub async fn run_on(&self, fqdn: &str, command: &str) -> Result<RunResult, RemoteOpsError> {
        let address = self.address_of(fqdn)?;

        self.remote_command(&address, command, Some(0)).await
    }

    pub(crate) async fn run_on_unchecked(
        &self,
        fqdn: &str,
        command: &str,
    ) -> Result<RunResult, RemoteOpsError> {
        let address = self.address_of(fqdn)?;

        self.remote_command(&address, command, None).await
    }

    /// Whether `address` answers a trivial command.
    ///
    /// Transport failures of any kind read as `false`.
    pub async fn host_contactable(&self, address: &str) -> bool {
        let opts = RunOptions::unchecked().timeout(CONTACT_TIMEOUT);

        match self
            .executor
            .run(address, "echo 'Checking if node is ready'", opts)
            .await
        {
            Ok(x) => x.success(),
            Err(e) => {
                tracing::debug!("{} is not contactable: {}", address, e);

                false
            }
        }
    }

    /// Seconds since `address` booted.
    pub async fn host_up_secs(&self, address: &str) -> Result<f64, RemoteOpsError> {
        let cmd = "cat /proc/uptime";

        let x = self.remote_command(address, cmd, Some(0)).await?;

        parse_uptime(&x.stdout).ok_or_else(|| RemoteOpsError::Parse {
            address: address.to_string(),
            command: cmd.to_string(),
            output: x.stdout,
        })
    }

    /// Writes `message` to the syslog of `fqdn`, marking a point in the logs.
    pub async fn inject_log_message(
        &self,
        fqdn: &str,
        message: &str,
    ) -> Result<(), RemoteOpsError> {
        self.run_on(fqdn, &format!("logger \"{}\"", escape_double_quoted(message)))
            .await?;

        Ok(())
    }

    /// `version-release` of `package`, `None` when it is not installed.
    pub async fn get_rpm_version(
        &self,
        fqdn: &str,
        package: &str,
    ) -> Result<Option<String>, RemoteOpsError> {
        let x = self
            .run_on_unchecked(
                fqdn,
                &format!("rpm -q --queryformat \"%{{VERSION}}-%{{RELEASE}}\" {}", package),
            )
            .await?;

        if x.rc != 0 {
            return Ok(None);
        }

        Ok(Some(x.stdout.trim().to_string()))
    }

    pub async fn default_boot_kernel_path(&self, fqdn: &str) -> Result<String, RemoteOpsError> {
        let x = self.run_on(fqdn, "grubby --default-kernel").await?;

        Ok(x.stdout.trim().to_string())
    }

    pub async fn running_kernel(&self, fqdn: &str) -> Result<String, RemoteOpsError> {
        let x = self.run_on(fqdn, "uname -r").await?;

        Ok(x.stdout.trim().to_string())
    }

    pub async fn module_loaded(&self, fqdn: &str, module: &str) -> Result<bool, RemoteOpsError> {
        let x = self
            .run_on_unchecked(fqdn, &format!("grep -q '^{} ' /proc/modules", module))
            .await?;

        Ok(x.rc == 0)
    }

    /// LNet is up when the module is loaded and at least one nid is configured.
    pub async fn lnet_is_up(&self, fqdn: &str) -> Result<bool, RemoteOpsError> {
        if !self.module_loaded(fqdn, "lnet").await? {
            return Ok(false);
        }

        let x = self.run_on_unchecked(fqdn, "lctl list_nids").await?;

        Ok(x.rc == 0 && !x.stdout.trim().is_empty())
    }

    /// Whether the pacemaker packages are present.
    pub async fn pacemaker_installed(&self, fqdn: &str) -> Result<bool, RemoteOpsError> {
        let x = self.run_on_unchecked(fqdn, "which crmadmin").await?;

        Ok(x.rc == 0)
    }

    /// Whether pacemaker is installed and a cluster is configured on `fqdn`.
    pub async fn has_pacemaker(&self, fqdn: &str) -> Result<bool, RemoteOpsError> {
        let x = self
            .run_on_unchecked(fqdn, "which crmadmin && test -f /etc/corosync/corosync.conf")
            .await?;

        Ok(x.rc == 0)
    }

    pub fn is_worker(&self, fqdn: &str) -> Result<bool, RemoteOpsError> {
        Ok(self.server(fqdn)?.is_worker())
    }

    /// Fault injection of dropped connections.
    ///
    /// Only the simulator could do this. A real cluster would need firewall
    /// or proxy rules inserted here.
    pub async fn fail_connections(&self, _fail: bool) -> Result<(), RemoteOpsError> {
        Err(RemoteOpsError::NotImplemented("fail_connections"))
    }

    /// Fault injection of dropped responses. See [`Self::fail_connections`].
    pub async fn drop_responses(&self, _drop: bool) -> Result<(), RemoteOpsError> {
        Err(RemoteOpsError::NotImplemented("drop_responses"))
    }
}

fn parse_uptime(x: &str) -> Option<f64> {
    x.split_whitespace().next().and_then(|x| x.parse().ok())
}
