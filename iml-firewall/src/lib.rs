// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Firewall control on remote hosts.
//!
//! A host runs either firewalld or lokkit managed iptables. The backend is
//! detected once per address and cached for the life of the process.

mod backend;
mod error;
mod rule;

pub use backend::FirewallBackend;
pub use error::FirewallError;
pub use rule::{FirewallRule, Protocol};

use iml_ssh::{RemoteExecutor, RunOptions};
use lazy_static::lazy_static;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::OnceCell;

/// Firewall control for one host.
#[derive(Debug)]
pub struct RemoteFirewallControl {
    address: String,
    backend: FirewallBackend,
    rules: Mutex<Vec<FirewallRule>>,
}

impl RemoteFirewallControl {
    pub fn new(address: impl Into<String>, backend: FirewallBackend) -> Self {
        Self {
            address: address.into(),
            backend,
            rules: Mutex::new(vec![]),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn backend(&self) -> FirewallBackend {
        self.backend
    }

    /// The rules read by the last [`process_rules`](Self::process_rules).
    pub fn rules(&self) -> Vec<FirewallRule> {
        self.rules
            .lock()
            .map(|x| x.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Picks the lowest priority backend installed on `address`.
    pub async fn detect(
        address: &str,
        executor: &dyn RemoteExecutor,
    ) -> Result<Self, FirewallError> {
        let mut found = vec![];

        for backend in FirewallBackend::ALL.iter() {
            let r = executor
                .run(address, backend.detect_cmd(), RunOptions::unchecked())
                .await?;

            if r.rc == 0 {
                found.push(*backend);
            }
        }

        let backend = found
            .into_iter()
            .min_by_key(|x| x.class_priority())
            .ok_or_else(|| FirewallError::NoBackend(address.to_string()))?;

        tracing::debug!("Using {:?} on {}", backend, address);

        Ok(Self::new(address, backend))
    }

    pub fn remote_add_port_cmds(&self, port: u16, proto: Protocol) -> Vec<String> {
        self.backend.add_port_cmds(port, proto)
    }

    pub fn remote_remove_port_cmds(&self, port: u16, proto: Protocol) -> Vec<String> {
        self.backend.remove_port_cmds(port, proto)
    }

    pub fn remote_validate_persistent_rule_cmd(&self, port: u16) -> String {
        self.backend.validate_persistent_cmd(port)
    }

    /// Lists the host's rules, replacing any previously read.
    pub async fn process_rules(
        &self,
        executor: &dyn RemoteExecutor,
    ) -> Result<Vec<FirewallRule>, FirewallError> {
        let r = executor
            .run(&self.address, self.backend.list_cmd(), RunOptions::new())
            .await?;

        let rules = self.backend.parse_rules(&r.stdout)?;

        let mut guard = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        *guard = rules.clone();

        Ok(rules)
    }

    pub async fn add_port(
        &self,
        executor: &dyn RemoteExecutor,
        port: u16,
        proto: Protocol,
    ) -> Result<(), FirewallError> {
        for cmd in self.remote_add_port_cmds(port, proto) {
            executor.run(&self.address, &cmd, RunOptions::new()).await?;
        }

        Ok(())
    }

    pub async fn remove_port(
        &self,
        executor: &dyn RemoteExecutor,
        port: u16,
        proto: Protocol,
    ) -> Result<(), FirewallError> {
        for cmd in self.remote_remove_port_cmds(port, proto) {
            executor.run(&self.address, &cmd, RunOptions::new()).await?;
        }

        Ok(())
    }

    /// Whether `port` survives a reboot.
    pub async fn validate_persistent_rule(
        &self,
        executor: &dyn RemoteExecutor,
        port: u16,
    ) -> Result<bool, FirewallError> {
        let r = executor
            .run(
                &self.address,
                &self.remote_validate_persistent_rule_cmd(port),
                RunOptions::unchecked(),
            )
            .await?;

        Ok(r.rc == 0)
    }
}

/// Per address cache of detected firewall controls.
///
/// Detection for an address happens at most once. Concurrent first lookups
/// of the same address wait on that address's cell only.
#[derive(Debug, Default)]
pub struct FirewallRegistry {
    controllers: Mutex<HashMap<String, Arc<OnceCell<Arc<RemoteFirewallControl>>>>>,
}

impl FirewallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, address: &str) -> Arc<OnceCell<Arc<RemoteFirewallControl>>> {
        let mut controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());

        Arc::clone(controllers.entry(address.to_string()).or_default())
    }

    pub async fn get(
        &self,
        address: &str,
        executor: &dyn RemoteExecutor,
    ) -> Result<Arc<RemoteFirewallControl>, FirewallError> {
        let cell = self.cell(address);

        let x = cell
            .get_or_try_init(|| async {
                RemoteFirewallControl::detect(address, executor)
                    .await
                    .map(Arc::new)
            })
            .await?;

        Ok(Arc::clone(x))
    }
}

lazy_static! {
    static ref CONTROLLER_INSTANCES: FirewallRegistry = FirewallRegistry::new();
}

/// The process wide firewall control for `address`.
pub async fn controller_for(
    address: &str,
    executor: &dyn RemoteExecutor,
) -> Result<Arc<RemoteFirewallControl>, FirewallError> {
    CONTROLLER_INSTANCES.get(address, executor).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use iml_ssh::scripted::ScriptedExecutor;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_firewall_cmd_wins() {
        let x = ScriptedExecutor::new();

        x.on("which lokkit", 0, "/usr/sbin/lokkit")
            .on("which firewall-cmd", 0, "/usr/bin/firewall-cmd");

        let registry = FirewallRegistry::new();

        let c = registry.get("node1", &x).await.unwrap();

        assert_eq!(c.backend(), FirewallBackend::FirewallCmd);
    }

    #[tokio::test]
    async fn test_no_backend() {
        let x = ScriptedExecutor::new();

        x.on("which", 1, "");

        let r = FirewallRegistry::new().get("node1", &x).await;

        assert!(matches!(r, Err(FirewallError::NoBackend(a)) if a == "node1"));
    }

    #[tokio::test]
    async fn test_detection_is_cached() {
        let x = ScriptedExecutor::new();

        x.on("which lokkit", 0, "").on("which firewall-cmd", 1, "");

        let registry = FirewallRegistry::new();

        let a = registry.get("node1", &x).await.unwrap();
        let b = registry.get("node1", &x).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.backend(), FirewallBackend::IpTables);
        assert_eq!(x.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_slow_detection_does_not_block_other_hosts() {
        let x = ScriptedExecutor::new();

        x.delay_host("node1", std::time::Duration::from_millis(200))
            .on("which lokkit", 0, "")
            .on("which firewall-cmd", 1, "");

        let registry = FirewallRegistry::new();

        let (a, b) = tokio::join!(registry.get("node1", &x), registry.get("node2", &x));

        assert_eq!(a.unwrap().address(), "node1");
        assert_eq!(b.unwrap().address(), "node2");

        let order: Vec<String> = x.calls().into_iter().map(|(a, _)| a).collect();

        assert_eq!(order, vec!["node2", "node2", "node1", "node1"]);
    }

    #[tokio::test]
    async fn test_add_port_then_list() {
        let x = ScriptedExecutor::new();

        x.on("firewall-cmd --list-ports", 0, "988/tcp 4321/udp\n");

        let c = RemoteFirewallControl::new("node1", FirewallBackend::FirewallCmd);

        c.add_port(&x, 4321, Protocol::Udp).await.unwrap();

        let rules = c.process_rules(&x).await.unwrap();

        assert!(rules.contains(&FirewallRule::new(4321, Protocol::Udp)));
        assert_eq!(c.rules(), rules);

        assert_eq!(
            x.commands(),
            vec![
                "firewall-cmd --add-port=4321/udp".to_string(),
                "firewall-cmd --add-port=4321/udp --permanent".to_string(),
                "firewall-cmd --list-ports".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_process_rules_replaces() {
        let x = ScriptedExecutor::new();

        x.on_host_times(
            "node1",
            "--list-ports",
            1,
            iml_ssh::RunResult::new(0, "988/tcp 4321/udp", ""),
        )
        .on("--list-ports", 0, "988/tcp");

        let c = RemoteFirewallControl::new("node1", FirewallBackend::FirewallCmd);

        assert_eq!(c.process_rules(&x).await.unwrap().len(), 2);
        assert_eq!(
            c.process_rules(&x).await.unwrap(),
            vec![FirewallRule::new(988, Protocol::Tcp)]
        );
    }

    #[tokio::test]
    async fn test_validate_persistent_rule() {
        let x = ScriptedExecutor::new();

        x.on("grep 4321", 0, "4321/udp").on("grep 5555", 1, "");

        let c = RemoteFirewallControl::new("node1", FirewallBackend::FirewallCmd);

        assert!(c.validate_persistent_rule(&x, 4321).await.unwrap());
        assert!(!c.validate_persistent_rule(&x, 5555).await.unwrap());
    }
}
