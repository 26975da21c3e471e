// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Per-test lifecycle: put the cluster into a known state before a test
//! and check it was left in a sane one afterwards.

use crate::{
    health::ClusterHealthHook,
    help::{HelpCallback, HelpGate},
    TestError,
};
use futures::{
    future::{join_all, try_join_all},
    Future,
};
use iml_manager_api::ManagerApi;
use iml_manager_client::ManagerClient;
use iml_poll::wait_until_true;
use iml_remote_ops::RemoteOperations;
use iml_ssh::{escape_double_quoted, SshExecutor};
use iml_test_config::{timeouts::TEST_TIMEOUT, ClusterConfig, HostSpec};
use iml_test_env::quick_test_setup;
use std::sync::Arc;

pub const AGENT_DEBUG_PATH: &str = "/tmp/chroma-agent-debug";

pub const CHROMA_CFG_PATH: &str = "/etc/chroma.cfg";

/// Flags controlling [`TestCase::setup`] and [`TestCase::teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TestFlags {
    /// Recreate the manager database and strip HA and Lustre state from
    /// every server.
    pub reset: bool,
    /// Forget every host through the API instead of recreating the
    /// database, then strip HA and Lustre state.
    pub soft_reset: bool,
    /// The manager configures the servers, so their devices and
    /// `/etc/chroma.cfg` are reset too.
    pub managed: bool,
    /// The test takes a server down on purpose.
    pub down_node_expected: bool,
    /// Skip all cluster preparation.
    pub quick_setup: bool,
}

/// Builds a [`TestCase`]. Flags left unset come from the cluster config,
/// and `quick_setup` from `IML_QUICK_TEST_SETUP`.
#[derive(Debug, Clone, Default)]
pub struct TestCaseBuilder {
    name: String,
    reset: Option<bool>,
    soft_reset: Option<bool>,
    managed: Option<bool>,
    down_node_expected: bool,
    quick_setup: Option<bool>,
}

impl TestCaseBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = Some(reset);
        self
    }

    pub fn soft_reset(mut self, soft_reset: bool) -> Self {
        self.soft_reset = Some(soft_reset);
        self
    }

    pub fn managed(mut self, managed: bool) -> Self {
        self.managed = Some(managed);
        self
    }

    pub fn down_node_expected(mut self, down_node_expected: bool) -> Self {
        self.down_node_expected = down_node_expected;
        self
    }

    pub fn quick_setup(mut self, quick_setup: bool) -> Self {
        self.quick_setup = Some(quick_setup);
        self
    }

    fn flags(&self, config: &ClusterConfig) -> TestFlags {
        TestFlags {
            reset: self.reset.unwrap_or(config.reset),
            soft_reset: self.soft_reset.unwrap_or(config.soft_reset),
            managed: self.managed.unwrap_or(config.managed),
            down_node_expected: self.down_node_expected,
            quick_setup: self.quick_setup.unwrap_or_else(quick_test_setup),
        }
    }

    /// A test case over `ops`, talking to the manager through `client`.
    ///
    /// Connection failures on `client` dump the health of the cluster.
    pub fn build(self, ops: RemoteOperations, client: ManagerClient) -> TestCase {
        let flags = self.flags(ops.config());
        let help = HelpGate::new(&ops.config().fetch_help_recipients);

        let client = client.with_health_hook(Arc::new(ClusterHealthHook::new(ops.clone())));

        TestCase {
            name: self.name,
            flags,
            help,
            api: ManagerApi::new(client, ops),
        }
    }

    /// A test case over ssh, using the ssh config named by `SSH_CONFIG`.
    pub async fn connect(self, config: ClusterConfig) -> Result<TestCase, TestError> {
        let executor = SshExecutor::from_env().await?;
        let client = ManagerClient::new(&config.manager()?.server_http_url)?;

        let ops = RemoteOperations::new(Arc::new(executor), Arc::new(config));

        Ok(self.build(ops, client))
    }
}

#[derive(Debug)]
pub struct TestCase {
    name: String,
    flags: TestFlags,
    help: Option<HelpGate>,
    api: ManagerApi,
}

impl TestCase {
    pub fn builder() -> TestCaseBuilder {
        TestCaseBuilder::default()
    }

    /// Runs `callback` whenever this test case asks for help. Does nothing
    /// without help recipients.
    pub fn with_help_callback(mut self, callback: HelpCallback) -> Self {
        self.help = self.help.map(|x| x.with_callback(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> &TestFlags {
        &self.flags
    }

    pub fn api(&self) -> &ManagerApi {
        &self.api
    }

    pub fn ops(&self) -> &RemoteOperations {
        self.api.ops()
    }

    pub fn config(&self) -> &ClusterConfig {
        self.api.config()
    }

    /// Runs `f`, pausing for a person to look at the cluster the first time
    /// it fails under `key`. Without help recipients this is just `f`.
    pub async fn fetch_help<T, E, F, Fut>(&self, key: &str, message: &str, f: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match &self.help {
            Some(x) => x.fetch_help(key, message, f).await,
            None => f().await,
        }
    }

    async fn login(&self) -> Result<(), TestError> {
        let user = self.config().superuser()?;

        self.api
            .client()
            .login(&user.username, &user.password)
            .await?;

        Ok(())
    }

    fn servers(&self) -> Vec<&HostSpec> {
        self.config().non_worker_servers().collect()
    }

    /// Brings the cluster to a known state and logs in to the manager.
    pub async fn setup(&self) -> Result<(), TestError> {
        if self.flags.quick_setup {
            tracing::info!("Quick setup for {}, leaving the cluster as is", self.name);

            return self.login().await;
        }

        tracing::info!("Setting up {} with {:?}", self.name, self.flags);

        let servers = self.servers();
        let fqdns: Vec<&str> = servers.iter().map(|x| x.fqdn.as_str()).collect();

        self.await_servers(&fqdns).await?;

        if self.flags.reset {
            self.reset_manager().await?;
            self.clean_servers(&fqdns).await?;
        } else if self.flags.soft_reset {
            self.remove_all_hosts().await?;
            self.clean_servers(&fqdns).await?;
        }

        if self.flags.managed {
            try_join_all(servers.iter().map(|x| self.write_chroma_cfg(x))).await?;

            self.ops().reset_lustre_devices(&fqdns).await?;
        }

        let addresses: Vec<&str> = self
            .config()
            .lustre_servers
            .iter()
            .map(|x| x.address.as_str())
            .collect();

        self.ops()
            .execute_simultaneous_commands(
                &[format!("touch {}", AGENT_DEBUG_PATH)],
                &addresses,
                "Enabling agent debug",
            )
            .await?;

        self.login().await
    }

    async fn await_servers(&self, fqdns: &[&str]) -> Result<(), TestError> {
        let marker = format!("==== Starting test {} ====", self.name);

        try_join_all(fqdns.iter().map(|fqdn| {
            let marker = &marker;

            async move {
                self.ops().await_server_boot(fqdn, None, true).await?;
                self.ops().inject_log_message(fqdn, marker).await
            }
        }))
        .await?;

        Ok(())
    }

    /// Drops and recreates the manager database.
    async fn reset_manager(&self) -> Result<(), TestError> {
        let manager = self.config().manager()?;
        let user = self.config().superuser()?;

        tracing::info!("Resetting manager {}", manager.address);

        let cmds = vec![
            "chroma-config stop".to_string(),
            "su - postgres -c \"dropdb --if-exists chroma\"".to_string(),
            format!(
                "chroma-config setup {} {} localhost --no-dbspace-check",
                user.username, user.password
            ),
        ];

        self.ops()
            .execute_commands(&cmds, &manager.address, "Resetting manager")
            .await?;

        Ok(())
    }

    /// Forgets every host the manager knows, leaving the servers untouched.
    async fn remove_all_hosts(&self) -> Result<(), TestError> {
        let client = self.api.client();

        wait_until_true(
            || client.api_contactable(),
            || "Manager API never became contactable".to_string(),
            TEST_TIMEOUT,
        )
        .await?;

        self.login().await?;

        for host in self.api.get_hosts().await? {
            tracing::info!("Force removing {}", host.fqdn);

            self.api.force_remove_host(&host).await?;
        }

        Ok(())
    }

    /// Strips HA config, mounted targets and LNet config from `fqdns`.
    async fn clean_servers(&self, fqdns: &[&str]) -> Result<(), TestError> {
        self.ops().clear_ha(fqdns).await?;

        try_join_all(fqdns.iter().map(|fqdn| async move {
            self.ops().unmount_lustre_targets(fqdn).await?;
            self.ops().clear_lnet_config(fqdn).await
        }))
        .await?;

        Ok(())
    }

    async fn write_chroma_cfg(&self, spec: &HostSpec) -> Result<(), TestError> {
        let mut cmds = vec![format!("rm -f {}", CHROMA_CFG_PATH)];

        if let Some(x) = &spec.corosync_config {
            cmds.push(format!(
                "echo \"{}\" > {}",
                escape_double_quoted(&x.to_chroma_cfg()),
                CHROMA_CFG_PATH
            ));
        }

        self.ops()
            .execute_commands(&cmds, &spec.address, "Writing chroma.cfg")
            .await?;

        Ok(())
    }

    /// Unmounts clients and stops running filesystems on a managed cluster.
    /// Otherwise checks every server is still up.
    pub async fn teardown(&self) -> Result<(), TestError> {
        tracing::info!("Tearing down {}", self.name);

        if self.flags.managed {
            self.unmount_clients().await?;

            for fs in self.api.get_filesystems().await? {
                if fs.state == "available" {
                    tracing::info!("Stopping filesystem {}", fs.name);

                    self.api.stop_filesystem(&fs).await?;
                }
            }

            return Ok(());
        }

        let servers = self.servers();

        let contactable =
            join_all(servers.iter().map(|x| self.ops().host_contactable(&x.address))).await;

        let down: Vec<String> = servers
            .iter()
            .zip(contactable)
            .filter(|(_, up)| !up)
            .map(|(x, _)| x.fqdn.clone())
            .collect();

        if down.is_empty() {
            return Ok(());
        }

        if self.flags.down_node_expected {
            tracing::info!("Servers {:?} are down, as expected", down);

            return Ok(());
        }

        Err(TestError::ServersDown(down))
    }

    async fn unmount_clients(&self) -> Result<(), TestError> {
        for client in &self.config().lustre_clients {
            for x in self.ops().get_lustre_mounts(&client.address).await? {
                tracing::debug!("Unmounting {} on {}", x.mountpoint, client.fqdn);

                self.ops()
                    .remote_command(&client.address, &format!("umount {}", x.mountpoint), Some(0))
                    .await?;
            }
        }

        Ok(())
    }
}
