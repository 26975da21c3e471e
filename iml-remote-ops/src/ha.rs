// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Pacemaker and corosync: target placement, CIB backup and teardown.

use crate::{
    cib::{target_agents, Cib, ResourceAgentType},
    RemoteOperations, RemoteOpsError,
};
use iml_firewall::Protocol;
use iml_poll::{retry_future, wait_until_true, BoundedPolicy};
use iml_ssh::{ImlSshError, RunOptions, RunResult};
use iml_test_config::timeouts::TEST_TIMEOUT;
use std::{path::PathBuf, time::Duration};

/// cibadmin exit codes that mean "try again": pacemaker is busy, the
/// connection is not up yet, or the update raced another one.
const CIBADMIN_TRANSIENT_RCS: [i32; 4] = [10, 41, 62, 107];

const CIBADMIN_ATTEMPTS: u32 = 300;

/// Ports that have to stay open once HA is torn down: ssh and lnet.
const KEEP_OPEN_PORTS: [u16; 2] = [22, 988];

/// Lustre resource ids from `crm_resource -L` output.
pub fn parse_pacemaker_targets(output: &str, running_only: bool) -> Vec<String> {
    output
        .lines()
        .filter(|x| x.contains("lustre:Lustre"))
        .filter(|x| !running_only || x.contains("Started"))
        .filter_map(|x| {
            x.trim_start()
                .trim_start_matches("* ")
                .split_whitespace()
                .next()
        })
        .map(String::from)
        .collect()
}

/// The node named by `crm_resource -W -r` output, if the resource is running.
pub fn parse_active_host(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|x| !x.contains("NOT running"))
        .find_map(|x| x.split("is running on:").nth(1))
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
}

/// Node names listed as `Online` by `crm_mon -1`.
pub fn parse_online_nodes(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|x| x.trim_start().trim_start_matches("* "))
        .filter(|x| x.starts_with("Online:"))
        .flat_map(|x| {
            x.trim_start_matches("Online:")
                .trim()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .split_whitespace()
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Node names from `fence_chroma -o list` output.
pub fn parse_fence_nodes(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|x| x.split(',').next())
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(String::from)
        .collect()
}

fn is_transient_cibadmin(e: &ImlSshError) -> bool {
    e.rc()
        .map(|rc| CIBADMIN_TRANSIENT_RCS.contains(&rc))
        .unwrap_or(false)
}

impl RemoteOperations {
    /// Runs `cibadmin -t 1 <args>` on `fqdn`, retrying transient failures.
    pub async fn cibadmin(
        &self,
        fqdn: &str,
        args: &str,
        stdin: Option<String>,
    ) -> Result<RunResult, RemoteOpsError> {
        let address = self.address_of(fqdn)?;
        let cmd = format!("cibadmin -t 1 {}", args);

        let opts = match stdin {
            Some(x) => RunOptions::new().stdin(x),
            None => RunOptions::new(),
        };

        let executor = self.executor();

        let x = retry_future(
            |_| executor.run(&address, &cmd, opts.clone()),
            BoundedPolicy::new(
                CIBADMIN_ATTEMPTS,
                Duration::from_secs(0),
                is_transient_cibadmin,
            ),
        )
        .await?;

        Ok(x)
    }

    /// Lustre resources known to pacemaker on `fqdn`.
    pub async fn get_pacemaker_targets(
        &self,
        fqdn: &str,
        running_only: bool,
    ) -> Result<Vec<String>, RemoteOpsError> {
        let x = self.run_on(fqdn, "crm_resource -L").await?;

        Ok(parse_pacemaker_targets(&x.stdout, running_only))
    }

    /// The fqdn of the node running `ha_label`, as seen from `fqdn`.
    pub async fn get_target_active_host(
        &self,
        fqdn: &str,
        ha_label: &str,
    ) -> Result<Option<String>, RemoteOpsError> {
        let x = self
            .run_on_unchecked(fqdn, &format!("crm_resource -W -r {}", ha_label))
            .await?;

        if x.rc != 0 {
            tracing::debug!("crm_resource -W -r {} on {} returned {}", ha_label, fqdn, x.rc);

            return Ok(None);
        }

        Ok(parse_active_host(&x.stdout).map(|x| self.config().normalize_to_fqdn(&x)))
    }

    /// Stops every running Lustre target on `fqdn`, returning their labels.
    pub async fn stop_all_targets(&self, fqdn: &str) -> Result<Vec<String>, RemoteOpsError> {
        let running = self.get_pacemaker_targets(fqdn, true).await?;

        for x in &running {
            self.stop_target(fqdn, x).await?;
        }

        wait_until_true(
            || async move {
                self.get_pacemaker_targets(fqdn, true)
                    .await
                    .map(|x| x.is_empty())
                    .unwrap_or(false)
            },
            || format!("Lustre targets still running on {}", fqdn),
            TEST_TIMEOUT,
        )
        .await?;

        Ok(running)
    }

    pub fn cib_backup_path(&self, fqdn: &str) -> PathBuf {
        self.backup_dir().join(format!("cib-backup-{}.xml", fqdn))
    }

    /// Stops all targets on `fqdn` and saves its CIB locally.
    ///
    /// Returns the targets that were running, for [`Self::restore_cib`].
    pub async fn backup_cib(&self, fqdn: &str) -> Result<Vec<String>, RemoteOpsError> {
        let running = self.stop_all_targets(fqdn).await?;

        let x = self.cibadmin(fqdn, "--query", None).await?;

        let path = self.cib_backup_path(fqdn);

        tokio::fs::write(&path, x.stdout.as_bytes()).await?;

        tracing::info!("Saved cib of {} to {}", fqdn, path.display());

        Ok(running)
    }

    /// Replaces the CIB of `fqdn` with the saved one and restarts
    /// `running_targets`.
    pub async fn restore_cib(
        &self,
        fqdn: &str,
        running_targets: &[String],
    ) -> Result<(), RemoteOpsError> {
        let path = self.cib_backup_path(fqdn);

        let xml = tokio::fs::read_to_string(&path).await?;

        let mut cib = Cib::parse(&xml)?;

        self.stop_all_targets(fqdn).await?;

        let live = self.cibadmin(fqdn, "--query", None).await?;
        cib.bump_admin_epoch(Cib::parse(&live.stdout)?.admin_epoch());

        self.cibadmin(fqdn, "--replace --xml-pipe", Some(cib.to_xml()?))
            .await?;

        for x in running_targets {
            self.start_target(fqdn, x).await?;
        }

        tracing::info!("Restored cib of {} from {}", fqdn, path.display());

        Ok(())
    }

    /// Asserts every host in `fqdns` carries the HA configuration of `fs_name`.
    pub async fn check_ha_config(
        &self,
        fqdns: &[&str],
        fs_name: &str,
    ) -> Result<(), RemoteOpsError> {
        let agents = target_agents(iml_test_env::iml_4_installed());

        self.check_ha_config_with(fqdns, fs_name, &agents).await
    }

    pub async fn check_ha_config_with(
        &self,
        fqdns: &[&str],
        fs_name: &str,
        agents: &[ResourceAgentType],
    ) -> Result<(), RemoteOpsError> {
        for fqdn in fqdns {
            let spec = self.server(fqdn)?;
            let names = [spec.fqdn.as_str(), spec.nodename.as_str()];

            let x = self.cibadmin(fqdn, "--query", None).await?;
            let cib = Cib::parse(&x.stdout)?;

            let errors = cib.filesystem_ha_errors(&names, fs_name, agents);

            if !errors.is_empty() {
                return Err(RemoteOpsError::assert(format!(
                    "HA config of {} on {} is incomplete: {}",
                    fs_name,
                    fqdn,
                    errors.join("; ")
                )));
            }
        }

        Ok(())
    }

    /// Whether `peer_fqdn` sees `fqdn` as an online cluster node.
    pub async fn node_online(&self, peer_fqdn: &str, fqdn: &str) -> Result<bool, RemoteOpsError> {
        let spec = self.server(fqdn)?;

        let x = self.run_on_unchecked(peer_fqdn, "crm_mon -1").await?;

        if x.rc != 0 {
            return Ok(false);
        }

        Ok(parse_online_nodes(&x.stdout)
            .iter()
            .any(|n| n == &spec.fqdn || n == &spec.nodename || n == spec.short_name()))
    }

    /// Nodes `address` is able to fence, as fqdns.
    ///
    /// With `ignore_failure` a failing fence agent yields an empty list.
    pub async fn get_fence_nodes_list(
        &self,
        address: &str,
        ignore_failure: bool,
    ) -> Result<Vec<String>, RemoteOpsError> {
        let cmd = "fence_chroma -o list";

        let expected_rc = if ignore_failure { None } else { Some(0) };

        let x = self.remote_command(address, cmd, expected_rc).await?;

        if x.rc != 0 {
            tracing::warn!("{} on {} returned {}", cmd, address, x.rc);

            return Ok(vec![]);
        }

        Ok(parse_fence_nodes(&x.stdout)
            .iter()
            .map(|x| self.config().normalize_to_fqdn(x))
            .collect())
    }

    async fn best_effort(&self, address: &str, cmd: &str) {
        match self.remote_command(address, cmd, None).await {
            Ok(x) if x.rc != 0 => {
                tracing::warn!("`{}` on {} returned {}: {}", cmd, address, x.rc, x.stderr)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("`{}` on {} failed: {}", cmd, address, e),
        }
    }

    /// Tears down pacemaker and corosync on every pacemaker server in `fqdns`.
    ///
    /// Workers and hosts without pacemaker are skipped. Individual steps are
    /// best effort.
    pub async fn clear_ha(&self, fqdns: &[&str]) -> Result<(), RemoteOpsError> {
        for fqdn in fqdns {
            let spec = self.server(fqdn)?;

            if spec.is_worker() {
                tracing::debug!("Not clearing HA on worker {}", fqdn);
                continue;
            }

            if !self.pacemaker_installed(fqdn).await? {
                tracing::debug!("No pacemaker on {}", fqdn);
                continue;
            }

            tracing::info!("Clearing HA config on {}", fqdn);

            let address = spec.address.as_str();

            self.best_effort(
                address,
                "crm_attribute --type crm_config --name maintenance-mode --update true",
            )
            .await;

            let resources = match self.remote_command(address, "crm_resource -l", None).await {
                Ok(x) => x.stdout,
                Err(e) => {
                    tracing::warn!("Could not list resources on {}: {}", fqdn, e);
                    String::new()
                }
            };

            for x in resources.lines().map(str::trim).filter(|x| !x.is_empty()) {
                self.best_effort(
                    address,
                    &format!(
                        "crm_resource --resource {} --set-parameter target-role --meta --parameter-value Stopped",
                        x
                    ),
                )
                .await;
            }

            self.best_effort(
                address,
                "crm_attribute --type crm_config --name maintenance-mode --delete",
            )
            .await;

            let stopped = wait_until_true(
                || async move {
                    self.remote_command(address, "crm_resource -L", None)
                        .await
                        .map(|x| parse_pacemaker_targets(&x.stdout, true).is_empty())
                        .unwrap_or(true)
                },
                || format!("Lustre targets still running on {}", fqdn),
                TEST_TIMEOUT,
            )
            .await;

            if let Err(e) = stopped {
                tracing::warn!("{}", e);
            }

            self.best_effort(address, "pcs cluster stop --all").await;
            self.best_effort(address, "pcs cluster destroy").await;
            self.best_effort(address, "systemctl disable --now pcsd pacemaker corosync")
                .await;

            if let Some(iface) = spec.ring1_iface() {
                self.best_effort(address, &format!("ifdown {}", iface)).await;
                self.best_effort(
                    address,
                    &format!("rm -f /etc/sysconfig/network-scripts/ifcfg-{}", iface),
                )
                .await;
            }

            self.best_effort(
                address,
                "rm -f /etc/corosync/corosync.conf /var/lib/pacemaker/cib/* /var/lib/corosync/*",
            )
            .await;

            match iml_firewall::controller_for(address, self.executor()).await {
                Ok(fw) => {
                    for port in KEEP_OPEN_PORTS.iter() {
                        if let Err(e) = fw.add_port(self.executor(), *port, Protocol::Tcp).await {
                            tracing::warn!("Could not open {}/tcp on {}: {}", port, fqdn, e);
                        }
                    }
                }
                Err(e) => tracing::warn!("No firewall control for {}: {}", fqdn, e),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixture;
    use iml_ssh::RunResult;
    use pretty_assertions::assert_eq;

    const CRM_RESOURCE_L: &str = r#" st-fencing	(stonith:fence_chroma):	Started lustre0.example.com
 Resource Group: group-testfs-MDT0000_a1b2c3
     testfs-MDT0000_a1b2c3-zfs	(ocf::chroma:ZFS):	Started lustre0.example.com
     testfs-MDT0000_a1b2c3	(ocf::lustre:Lustre):	Started lustre0.example.com
 testfs-OST0000_d4e5f6	(ocf::lustre:Lustre):	Stopped
"#;

    const CRM_RESOURCE_L_2_1: &str = r#"  * st-fencing	(stonith:fence_chroma):	 Started lustre0
  * testfs-MGS_9a8b7c	(ocf:lustre:Lustre):	 Started lustre1
"#;

    #[test]
    fn test_parse_pacemaker_targets() {
        assert_eq!(
            parse_pacemaker_targets(CRM_RESOURCE_L, false),
            vec!["testfs-MDT0000_a1b2c3", "testfs-OST0000_d4e5f6"]
        );
        assert_eq!(
            parse_pacemaker_targets(CRM_RESOURCE_L, true),
            vec!["testfs-MDT0000_a1b2c3"]
        );
        assert_eq!(
            parse_pacemaker_targets(CRM_RESOURCE_L_2_1, true),
            vec!["testfs-MGS_9a8b7c"]
        );
        assert_eq!(parse_pacemaker_targets("", true), Vec::<String>::new());
    }

    #[test]
    fn test_parse_active_host() {
        assert_eq!(
            parse_active_host("resource testfs-MDT0000_a1b2c3 is running on: lustre1\n"),
            Some("lustre1".to_string())
        );
        assert_eq!(
            parse_active_host("resource testfs-MDT0000_a1b2c3 is NOT running\n"),
            None
        );
    }

    #[test]
    fn test_parse_online_nodes() {
        let old = "Stack: corosync\n2 nodes configured\n\nOnline: [ lustre0 lustre1.example.com ]\nOFFLINE: [ lustre2 ]\n";
        let new = "Node List:\n  * Online: [ lustre0 ]\n  * OFFLINE: [ lustre1 ]\n";

        assert_eq!(parse_online_nodes(old), vec!["lustre0", "lustre1.example.com"]);
        assert_eq!(parse_online_nodes(new), vec!["lustre0"]);
    }

    #[test]
    fn test_parse_fence_nodes() {
        assert_eq!(
            parse_fence_nodes("lustre0,\nlustre1.example.com,on\n\n"),
            vec!["lustre0", "lustre1.example.com"]
        );
    }

    #[tokio::test]
    async fn test_fence_nodes_normalized() {
        let (x, ops) = fixture();

        x.on_host("10.0.0.1", "fence_chroma -o list", 0, "lustre0,\nlustre1,\nother,\n")
            .on_host("10.0.0.2", "fence_chroma -o list", 1, "");

        assert_eq!(
            ops.get_fence_nodes_list("10.0.0.1", false).await.unwrap(),
            vec!["lustre0.example.com", "lustre1.example.com", "other"]
        );
        assert_eq!(
            ops.get_fence_nodes_list("10.0.0.2", true).await.unwrap(),
            Vec::<String>::new()
        );
        assert!(ops.get_fence_nodes_list("10.0.0.2", false).await.is_err());
    }

    #[tokio::test]
    async fn test_target_active_host() {
        let (x, ops) = fixture();

        x.on(
            "crm_resource -W -r testfs-MDT0000_a1b2c3",
            0,
            "resource testfs-MDT0000_a1b2c3 is running on: lustre1\n",
        )
        .on("crm_resource -W -r", 6, "");

        assert_eq!(
            ops.get_target_active_host("lustre0.example.com", "testfs-MDT0000_a1b2c3")
                .await
                .unwrap(),
            Some("lustre1.example.com".to_string())
        );
        assert_eq!(
            ops.get_target_active_host("lustre0.example.com", "missing")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_cibadmin_retries_transient() {
        let (x, ops) = fixture();

        x.on_host_times("10.0.0.1", "cibadmin", 3, RunResult::new(107, "", ""))
            .on_host("10.0.0.1", "cibadmin", 0, "<cib/>");

        let r = ops
            .cibadmin("lustre0.example.com", "--query", None)
            .await
            .unwrap();

        assert_eq!(r.stdout, "<cib/>");
        assert_eq!(x.commands().len(), 4);
    }

    #[tokio::test]
    async fn test_cibadmin_fatal_rc() {
        let (x, ops) = fixture();

        x.on("cibadmin", 22, "");

        let e = ops
            .cibadmin("lustre0.example.com", "--query", None)
            .await
            .unwrap_err();

        assert!(matches!(e, RemoteOpsError::ImlSshError(_)));
        assert_eq!(x.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_cibadmin_gives_up() {
        let (x, ops) = fixture();

        x.on("cibadmin", 41, "");

        assert!(ops
            .cibadmin("lustre0.example.com", "--query", None)
            .await
            .is_err());
        assert_eq!(x.commands().len(), 300);
    }

    #[tokio::test]
    async fn test_backup_restore_cib() {
        let dir = tempfile::tempdir().unwrap();
        let (x, ops) = fixture();
        let ops = ops.with_backup_dir(dir.path());

        let started = " testfs-MDT0000_a1b2c3	(ocf::lustre:Lustre):	Started lustre0\n";

        x.on_host_times("10.0.0.1", "crm_resource -L", 1, RunResult::new(0, started, ""))
            .on_host(
                "10.0.0.1",
                "cibadmin -t 1 --query",
                0,
                r#"<cib admin_epoch="4" epoch="120"><configuration/></cib>"#,
            );

        let running = ops.backup_cib("lustre0.example.com").await.unwrap();

        assert_eq!(running, vec!["testfs-MDT0000_a1b2c3"]);
        assert!(ops.cib_backup_path("lustre0.example.com").exists());

        ops.restore_cib("lustre0.example.com", &running).await.unwrap();

        let cmds = x.commands();

        assert!(cmds.contains(&"chroma-agent stop_target --ha_label testfs-MDT0000_a1b2c3".to_string()));
        assert_eq!(
            cmds.last().map(String::as_str),
            Some("chroma-agent start_target --ha_label testfs-MDT0000_a1b2c3")
        );
        assert!(cmds.contains(&"cibadmin -t 1 --replace --xml-pipe".to_string()));

        let pushed = Cib::parse(&x.stdin_for("--replace").unwrap()).unwrap();
        assert_eq!(pushed.admin_epoch(), Some(5));
    }

    #[tokio::test]
    async fn test_restore_cib_outranks_live_cib() {
        let dir = tempfile::tempdir().unwrap();
        let (x, ops) = fixture();
        let ops = ops.with_backup_dir(dir.path());

        x.on_host_times(
            "10.0.0.1",
            "cibadmin -t 1 --query",
            1,
            RunResult::new(0, r#"<cib admin_epoch="4" epoch="120"><configuration/></cib>"#, ""),
        )
        .on_host(
            "10.0.0.1",
            "cibadmin -t 1 --query",
            0,
            r#"<cib admin_epoch="9" epoch="2"><configuration/></cib>"#,
        );

        ops.backup_cib("lustre0.example.com").await.unwrap();
        ops.restore_cib("lustre0.example.com", &[]).await.unwrap();

        let pushed = Cib::parse(&x.stdin_for("--replace").unwrap()).unwrap();

        assert_eq!(pushed.admin_epoch(), Some(10));
        assert_eq!(pushed.epoch(), Some(0));
    }

    #[tokio::test]
    async fn test_check_ha_config() {
        let (x, ops) = fixture();

        x.on_host(
            "10.0.0.1",
            "cibadmin -t 1 --query",
            0,
            r#"<cib admin_epoch="0" epoch="3">
  <configuration>
    <resources>
      <primitive class="ocf" id="testfs-MDT0000_a1b2c3" provider="lustre" type="Lustre"/>
    </resources>
    <constraints>
      <rsc_location id="testfs-MDT0000_a1b2c3-primary" node="lustre0" rsc="testfs-MDT0000_a1b2c3" score="20"/>
    </constraints>
  </configuration>
</cib>"#,
        )
        .on_host("10.0.0.2", "cibadmin -t 1 --query", 0, "<cib/>");

        ops.check_ha_config_with(&["lustre0.example.com"], "testfs", &target_agents(false))
            .await
            .unwrap();

        let e = ops
            .check_ha_config_with(
                &["lustre0.example.com", "lustre1.example.com"],
                "testfs",
                &target_agents(false),
            )
            .await
            .unwrap_err();

        assert!(matches!(e, RemoteOpsError::Assert(ref x) if x.contains("lustre1.example.com")));
    }

    #[tokio::test]
    async fn test_clear_ha() {
        let (x, ops) = fixture();

        x.on_host("10.0.0.1", "crm_resource -l", 0, "st-fencing\ntestfs-MDT0000_a1b2c3\n")
            .on_host("10.0.0.1", "which lokkit", 1, "")
            .on_host("10.0.0.2", "which crmadmin", 1, "");

        ops.clear_ha(&[
            "lustre0.example.com",
            "lustre1.example.com",
            "worker0.example.com",
        ])
        .await
        .unwrap();

        assert_eq!(x.commands_for("10.0.0.2"), vec!["which crmadmin"]);
        assert_eq!(x.commands_for("10.0.0.3"), Vec::<String>::new());

        insta::assert_debug_snapshot!(x.commands_for("10.0.0.1"), @r###"
        [
            "which crmadmin",
            "crm_attribute --type crm_config --name maintenance-mode --update true",
            "crm_resource -l",
            "crm_resource --resource st-fencing --set-parameter target-role --meta --parameter-value Stopped",
            "crm_resource --resource testfs-MDT0000_a1b2c3 --set-parameter target-role --meta --parameter-value Stopped",
            "crm_attribute --type crm_config --name maintenance-mode --delete",
            "crm_resource -L",
            "pcs cluster stop --all",
            "pcs cluster destroy",
            "systemctl disable --now pcsd pacemaker corosync",
            "ifdown eth1",
            "rm -f /etc/sysconfig/network-scripts/ifcfg-eth1",
            "rm -f /etc/corosync/corosync.conf /var/lib/pacemaker/cib/* /var/lib/corosync/*",
            "which lokkit",
            "which firewall-cmd",
            "firewall-cmd --add-port=22/tcp",
            "firewall-cmd --add-port=22/tcp --permanent",
            "firewall-cmd --add-port=988/tcp",
            "firewall-cmd --add-port=988/tcp --permanent",
        ]
        "###);
    }

    #[tokio::test]
    async fn test_clear_ha_survives_resource_listing_failure() {
        let (x, ops) = fixture();

        x.unreachable_on("10.0.0.1", "crm_resource -l");

        ops.clear_ha(&["lustre0.example.com"]).await.unwrap();

        let xs = x.commands_for("10.0.0.1");

        assert!(!xs.iter().any(|x| x.contains("target-role")));
        assert!(xs.iter().any(|x| x == "pcs cluster destroy"));
    }
}
