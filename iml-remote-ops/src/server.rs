// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Power state of servers: kill, start, reset and waiting for boot.

use crate::{RemoteOperations, RemoteOpsError};
use iml_poll::{wait_until, WaitStrategy};
use iml_ssh::{RunOptions, RC_CONNECTION_LOST};
use iml_test_config::timeouts::{TEST_TIMEOUT, UNATTENDED_BOOT_TIMEOUT};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const SYSRQ_REBOOT: &str = "sync; echo 1 > /proc/sys/kernel/sysrq; echo b > /proc/sysrq-trigger";

/// The reboot never answers, so do not wait long for it.
const SYSRQ_TIMEOUT: Duration = Duration::from_secs(10);

impl RemoteOperations {
    /// Runs one of the vm host side commands configured for `fqdn`.
    async fn run_on_vm_host(
        &self,
        fqdn: &str,
        field: &'static str,
        command: Option<&String>,
        expected_rc: Option<i32>,
    ) -> Result<i32, RemoteOpsError> {
        let spec = self.server(fqdn)?;

        let command = command.ok_or_else(|| iml_test_config::ConfigError::MissingField {
            host: fqdn.to_string(),
            field,
        })?;

        let vm_host = self.config().vm_host_for(spec)?;

        let x = self
            .remote_command(&vm_host.address, command, expected_rc)
            .await?;

        Ok(x.rc)
    }

    /// Hard powers off `fqdn` and waits until it is gone.
    ///
    /// The server counts as gone once it stops answering, or once its uptime
    /// went backwards, in case it came back faster than we polled.
    pub async fn kill_server(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        let spec = self.server(fqdn)?;
        let address = spec.address.as_str();

        let up_before = self.host_up_secs(address).await.ok();

        tracing::info!("Killing {}", fqdn);

        self.run_on_vm_host(fqdn, "destroy_command", spec.destroy_command.as_ref(), Some(0))
            .await?;

        wait_until(
            || async move {
                if !self.host_contactable(address).await {
                    return true;
                }

                match (up_before, self.host_up_secs(address).await) {
                    (Some(before), Ok(now)) => now < before,
                    _ => false,
                }
            },
            TEST_TIMEOUT,
            WaitStrategy::per_second(),
            || format!("{} still running after kill", fqdn),
        )
        .await?;

        Ok(())
    }

    /// Powers on `fqdn`. Callers wait with [`Self::await_server_boot`].
    pub async fn start_server(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        let spec = self.server(fqdn)?;

        tracing::info!("Starting {}", fqdn);

        let rc = self
            .run_on_vm_host(fqdn, "start_command", spec.start_command.as_ref(), None)
            .await?;

        if rc != 0 {
            tracing::warn!("start_command for {} returned {}", fqdn, rc);
        }

        Ok(())
    }

    /// Reboots `fqdn` without a clean shutdown.
    pub async fn reset_server(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        let spec = self.server(fqdn)?;

        if spec.reset_command.is_some() {
            tracing::info!("Resetting {} with reset_command", fqdn);

            self.run_on_vm_host(fqdn, "reset_command", spec.reset_command.as_ref(), Some(0))
                .await?;

            return Ok(());
        }

        if spec.reset_is_buggy {
            tracing::info!("Resetting {} with kill and start", fqdn);

            self.kill_server(fqdn).await?;

            return self.start_server(fqdn).await;
        }

        tracing::info!("Resetting {} with sysrq", fqdn);

        let r = self
            .executor()
            .run(
                &spec.address,
                SYSRQ_REBOOT,
                RunOptions::unchecked().timeout(SYSRQ_TIMEOUT),
            )
            .await;

        match r {
            Ok(x) if x.rc == RC_CONNECTION_LOST || x.rc == 0 || x.timed_out => Ok(()),
            Ok(x) => {
                x.check(&spec.address, SYSRQ_REBOOT, Some(RC_CONNECTION_LOST))?;

                Ok(())
            }
            Err(e) if e.is_transport() => {
                tracing::debug!("Connection to {} dropped by reset: {}", fqdn, e);

                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn server_booted(&self, fqdn: &str, peer: Option<&str>) -> bool {
        let address = match self.address_of(fqdn) {
            Ok(x) => x,
            Err(_) => return false,
        };

        if !self.host_contactable(&address).await {
            return false;
        }

        match peer {
            Some(peer) => self.node_online(peer, fqdn).await.unwrap_or(false),
            None => true,
        }
    }

    /// Waits for `fqdn` to come back after a reboot.
    ///
    /// With `peer` the server must also show up `Online` in the peer's
    /// `crm_mon`. With `restart` a server still down after
    /// `UNATTENDED_BOOT_TIMEOUT` is power cycled once more.
    pub async fn await_server_boot(
        &self,
        fqdn: &str,
        peer: Option<&str>,
        restart: bool,
    ) -> Result<(), RemoteOpsError> {
        let started = Instant::now();
        let grace = if restart {
            UNATTENDED_BOOT_TIMEOUT
        } else {
            Duration::from_secs(0)
        };
        let deadline = started + TEST_TIMEOUT + grace;
        let restart_at = started + UNATTENDED_BOOT_TIMEOUT;

        let mut restarted = false;

        loop {
            if self.server_booted(fqdn, peer).await {
                tracing::info!("{} is up after {:?}", fqdn, started.elapsed());

                return Ok(());
            }

            let now = Instant::now();

            if restart && !restarted && now >= restart_at {
                tracing::warn!(
                    "{} not up after {:?}, restarting it",
                    fqdn,
                    UNATTENDED_BOOT_TIMEOUT
                );

                let spec = self.server(fqdn)?;

                if let Err(e) = self
                    .run_on_vm_host(fqdn, "destroy_command", spec.destroy_command.as_ref(), None)
                    .await
                {
                    tracing::warn!("Could not destroy {}: {}", fqdn, e);
                }

                self.start_server(fqdn).await?;

                restarted = true;
            }

            if now >= deadline {
                return Err(RemoteOpsError::assert(format!(
                    "{} did not boot within {:?}",
                    fqdn,
                    deadline - started
                )));
            }

            sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{test_utils::fixture, RemoteOpsError};
    use iml_ssh::RunResult;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_kill_server_unreachable() {
        let (x, ops) = fixture();

        x.on_host_times("10.0.0.1", "cat /proc/uptime", 1, RunResult::new(0, "500.0 1.0", ""))
            .on_host_times("10.0.0.1", "echo", 2, RunResult::new(0, "", ""))
            .unreachable("10.0.0.1");

        ops.kill_server("lustre0.example.com").await.unwrap();

        assert_eq!(x.commands_for("10.0.1.1"), vec!["virsh destroy lustre0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_server_uptime_race() {
        let (x, ops) = fixture();

        x.on_host_times("10.0.0.1", "cat /proc/uptime", 2, RunResult::new(0, "500.0 1.0", ""))
            .on_host("10.0.0.1", "cat /proc/uptime", 0, "3.2 1.0");

        ops.kill_server("lustre0.example.com").await.unwrap();

        assert_eq!(
            x.commands_for("10.0.0.1")
                .iter()
                .filter(|x| x.as_str() == "cat /proc/uptime")
                .count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_server_prefers_reset_command() {
        let (x, ops) = fixture();

        ops.reset_server("lustre1.example.com").await.unwrap();

        assert_eq!(x.commands_for("10.0.1.1"), vec!["virsh reset lustre1"]);
        assert_eq!(x.commands_for("10.0.0.2"), Vec::<String>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_server_sysrq_accepts_lost_connection() {
        let (x, ops) = fixture();

        x.on_host("10.0.0.1", "sysrq-trigger", -1, "");

        ops.reset_server("lustre0.example.com").await.unwrap();

        x.on_host("10.0.0.3", "sysrq-trigger", 2, "");

        let e = ops.reset_server("worker0.example.com").await.unwrap_err();
        assert!(matches!(e, RemoteOpsError::ImlSshError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_server_boot_with_peer() {
        let (x, ops) = fixture();

        x.on_host_times(
            "10.0.0.2",
            "crm_mon -1",
            2,
            RunResult::new(0, "Online: [ lustre1 ]\nOFFLINE: [ lustre0 ]\n", ""),
        )
        .on_host("10.0.0.2", "crm_mon -1", 0, "Online: [ lustre0 lustre1 ]\n");

        ops.await_server_boot("lustre0.example.com", Some("lustre1.example.com"), false)
            .await
            .unwrap();

        assert_eq!(x.commands_for("10.0.0.2").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_server_boot_restarts_once() {
        let (x, ops) = fixture();

        x.unreachable("10.0.0.1");

        let e = ops
            .await_server_boot("lustre0.example.com", None, true)
            .await
            .unwrap_err();

        assert!(matches!(e, RemoteOpsError::Assert(_)));
        assert_eq!(
            x.commands_for("10.0.1.1"),
            vec!["virsh destroy lustre0", "virsh start lustre0"]
        );
    }
}
