// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Diagnostics gathered when the cluster misbehaves.

use crate::{RemoteOperations, RemoteOpsError};
use futures::future::{join_all, try_join_all};
use iml_ssh::RunResult;

/// Multicast group and port corosync is expected to use.
const OMPING_GROUP: &str = "239.192.0.1";
const OMPING_PORT: u16 = 4321;

impl RemoteOperations {
    async fn health_of(&self, address: &str, manager: Option<&str>) -> String {
        let mut cmds = vec![
            "ps aux".to_string(),
            "rpm -qa | sort".to_string(),
            "netstat -tlpn".to_string(),
            "ip route".to_string(),
        ];

        if let Some(x) = manager {
            cmds.push(format!("ping -c 1 {}", x));
        }

        let mut out = format!("==== {} ====\n", address);

        for cmd in cmds {
            match self.remote_command(address, &cmd, None).await {
                Ok(x) => out.push_str(&format!(
                    "---- {} (rc {})\n{}{}\n",
                    cmd, x.rc, x.stdout, x.stderr
                )),
                Err(e) => {
                    out.push_str(&format!("---- {} failed: {}\n", cmd, e));
                    break;
                }
            }
        }

        out
    }

    /// Collects process, package, socket, routing and reachability details
    /// from every server.
    ///
    /// Never fails; unreachable servers are reported in the dump.
    pub async fn cluster_health_dump(&self) -> String {
        let manager = self.config().manager().ok().map(|x| x.address.as_str());

        let xs = join_all(
            self.config()
                .lustre_servers
                .iter()
                .map(|x| self.health_of(&x.address, manager)),
        )
        .await;

        let dump = xs.join("\n");

        tracing::error!("Cluster health dump:\n{}", dump);

        dump
    }

    /// Runs `omping` between all of `fqdns` at once, as corosync needs working
    /// multicast between them.
    pub async fn omping(
        &self,
        fqdns: &[&str],
        count: u32,
    ) -> Result<Vec<RunResult>, RemoteOpsError> {
        let addresses = fqdns
            .iter()
            .map(|x| self.address_of(x))
            .collect::<Result<Vec<_>, _>>()?;

        let cmd = format!(
            "omping -m {} -p {} -c {} -T {} -q {}",
            OMPING_GROUP,
            OMPING_PORT,
            count,
            count * 2 + 30,
            addresses.join(" ")
        );

        let cmd = cmd.as_str();

        try_join_all(
            addresses
                .iter()
                .map(|x| self.remote_command(x, cmd, Some(0))),
        )
        .await
    }
}
