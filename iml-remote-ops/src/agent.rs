// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Thin wrappers over `chroma-agent` verbs.

use crate::{RemoteOperations, RemoteOpsError};
use iml_test_config::DeviceType;

impl RemoteOperations {
    async fn chroma_agent(&self, fqdn: &str, args: &str) -> Result<(), RemoteOpsError> {
        tracing::debug!("chroma-agent {} on {}", args, fqdn);

        self.run_on(fqdn, &format!("chroma-agent {}", args)).await?;

        Ok(())
    }

    pub async fn start_target(&self, fqdn: &str, ha_label: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, &format!("start_target --ha_label {}", ha_label))
            .await
    }

    pub async fn stop_target(&self, fqdn: &str, ha_label: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, &format!("stop_target --ha_label {}", ha_label))
            .await
    }

    /// Imports the storage behind a target so it can be mounted on `fqdn`.
    pub async fn import_target(
        &self,
        fqdn: &str,
        device_type: DeviceType,
        path: &str,
        pacemaker_ha_operation: bool,
    ) -> Result<(), RemoteOpsError> {
        let device_type = match device_type {
            DeviceType::Zfs => "zfs",
            _ => "linux",
        };

        self.chroma_agent(
            fqdn,
            &format!(
                "import_target --device_type {} --path {} --pacemaker_ha_operation {}",
                device_type,
                path,
                if pacemaker_ha_operation { "True" } else { "False" }
            ),
        )
        .await
    }

    pub async fn start_lnet(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, "start_lnet").await
    }

    pub async fn stop_lnet(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, "stop_lnet").await
    }

    pub async fn start_pacemaker(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, "start_pacemaker").await
    }

    pub async fn stop_pacemaker(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, "stop_pacemaker").await
    }

    pub async fn start_corosync(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, "start_corosync").await
    }

    pub async fn stop_corosync(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, "stop_corosync").await
    }

    /// Puts `node` into standby, as seen from `fqdn`.
    pub async fn set_node_standby(&self, fqdn: &str, node: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, &format!("set_node_standby --node {}", node))
            .await
    }

    pub async fn set_node_online(&self, fqdn: &str, node: &str) -> Result<(), RemoteOpsError> {
        self.chroma_agent(fqdn, &format!("set_node_online --node {}", node))
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::{test_utils::fixture, RemoteOpsError};
    use iml_test_config::DeviceType;

    #[tokio::test]
    async fn test_agent_verbs() {
        let (x, ops) = fixture();

        let fqdn = "lustre0.example.com";

        ops.stop_target(fqdn, "testfs-MDT0000_a1b2c3").await.unwrap();
        ops.start_lnet(fqdn).await.unwrap();
        ops.import_target(fqdn, DeviceType::Zfs, "zfs_pool_sdb/testfs-MDT0000", true)
            .await
            .unwrap();
        ops.set_node_standby(fqdn, "lustre1.example.com")
            .await
            .unwrap();

        insta::assert_debug_snapshot!(x.commands_for("10.0.0.1"), @r###"
        [
            "chroma-agent stop_target --ha_label testfs-MDT0000_a1b2c3",
            "chroma-agent start_lnet",
            "chroma-agent import_target --device_type zfs --path zfs_pool_sdb/testfs-MDT0000 --pacemaker_ha_operation True",
            "chroma-agent set_node_standby --node lustre1.example.com",
        ]
        "###);
    }

    #[tokio::test]
    async fn test_agent_failure_is_fatal() {
        let (x, ops) = fixture();

        x.on("chroma-agent stop_pacemaker", 1, "");

        let e = ops.stop_pacemaker("lustre0.example.com").await.unwrap_err();

        match e {
            RemoteOpsError::ImlSshError(e) => assert_eq!(e.rc(), Some(1)),
            x => panic!("unexpected {:?}", x),
        }
    }
}
