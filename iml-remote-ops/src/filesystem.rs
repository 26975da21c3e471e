// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Client mounts, filesystem exercise and server side Lustre cleanup.

use crate::{RemoteOperations, RemoteOpsError};
use futures::future::join_all;
use iml_wire_types::target::Filesystem;

/// Upper bound for the bytes written per file by [`RemoteOperations::exercise_filesystem`].
const EXERCISE_MAX_BYTES: f64 = 512_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LustreMount {
    pub device: String,
    pub mountpoint: String,
}

/// Parses `mount -t lustre` output.
pub fn parse_lustre_mounts(output: &str) -> Vec<LustreMount> {
    output
        .lines()
        .filter_map(|x| {
            let mut it = x.split_whitespace();

            let device = it.next()?;
            let on = it.next()?;
            let mountpoint = it.next()?;

            if on != "on" {
                return None;
            }

            Some(LustreMount {
                device: device.to_string(),
                mountpoint: mountpoint.to_string(),
            })
        })
        .collect()
}

/// Size in KiB of each file written when exercising a filesystem with
/// `bytes_free` available.
pub fn exercise_file_kib(bytes_free: f64) -> u64 {
    let x = (bytes_free * 0.4).min(EXERCISE_MAX_BYTES) / 1000.0;

    std::cmp::max(x as u64, 1)
}

fn client_mountpoint(fs: &Filesystem) -> String {
    format!("/mnt/{}", fs.name)
}

impl RemoteOperations {
    pub async fn get_lustre_mounts(
        &self,
        address: &str,
    ) -> Result<Vec<LustreMount>, RemoteOpsError> {
        let x = self.remote_command(address, "mount -t lustre", Some(0)).await?;

        Ok(parse_lustre_mounts(&x.stdout))
    }

    /// Mounts `fs` on `client` under `/mnt/<name>`.
    pub async fn mount_filesystem(
        &self,
        client: &str,
        fs: &Filesystem,
    ) -> Result<(), RemoteOpsError> {
        let address = self.address_of(client)?;
        let mountpoint = client_mountpoint(fs);

        if fs.mount_command.is_empty() {
            return Err(RemoteOpsError::assert(format!(
                "Filesystem {} has no mount command",
                fs.name
            )));
        }

        self.remote_command(&address, &format!("mkdir -p {}", mountpoint), Some(0))
            .await?;
        self.remote_command(&address, &fs.mount_command, Some(0))
            .await?;

        let mounts = self.get_lustre_mounts(&address).await?;

        if !mounts.iter().any(|x| x.mountpoint == mountpoint) {
            return Err(RemoteOpsError::assert(format!(
                "{} is not mounted on {} after `{}`",
                fs.name, client, fs.mount_command
            )));
        }

        tracing::info!("Mounted {} on {}:{}", fs.name, client, mountpoint);

        Ok(())
    }

    pub async fn unmount_filesystem(
        &self,
        client: &str,
        fs: &Filesystem,
    ) -> Result<(), RemoteOpsError> {
        let address = self.address_of(client)?;
        let mountpoint = client_mountpoint(fs);

        self.remote_command(&address, &format!("umount {}", mountpoint), Some(0))
            .await?;

        let mounts = self.get_lustre_mounts(&address).await?;

        if mounts.iter().any(|x| x.mountpoint == mountpoint) {
            return Err(RemoteOpsError::assert(format!(
                "{} is still mounted on {}",
                fs.name, client
            )));
        }

        Ok(())
    }

    /// Writes and removes `files_per_mdt` files under a directory on each of
    /// `mdt_indexes`, one worker per index. The files of an index are written
    /// in parallel.
    pub async fn exercise_filesystem(
        &self,
        client: &str,
        fs: &Filesystem,
        mdt_indexes: &[u32],
        files_per_mdt: usize,
    ) -> Result<(), RemoteOpsError> {
        let address = self.address_of(client)?;
        let mountpoint = client_mountpoint(fs);
        let kib = exercise_file_kib(fs.bytes_free.unwrap_or(0.0));

        tracing::info!(
            "Exercising {} on {}: {} x {}KiB files on mdts {:?}",
            fs.name,
            client,
            files_per_mdt,
            kib,
            mdt_indexes
        );

        let address = address.as_str();
        let mountpoint = mountpoint.as_str();

        let xs = join_all(mdt_indexes.iter().map(|idx| async move {
            let dir = format!("{}/mdt{}", mountpoint, idx);
            let label = format!("exercise mdt{}", idx);

            let mkdir = if *idx == 0 {
                format!("mkdir -p {}", dir)
            } else {
                format!("lfs mkdir -i {} {}", idx, dir)
            };

            self.execute_commands(&[mkdir], address, &label).await?;

            let writes = join_all((0..files_per_mdt).map(|n| {
                let cmd = format!(
                    "dd if=/dev/zero of={}/exercisefile-{} bs=1k count={}",
                    dir, n, kib
                );
                let label = &label;

                async move { self.execute_commands(&[cmd], address, label).await }
            }))
            .await;

            writes.into_iter().collect::<Result<(), _>>()?;

            self.execute_commands(&[format!("rm -rf {}", dir)], address, &label)
                .await
        }))
        .await;

        xs.into_iter().collect()
    }

    /// Unmounts every Lustre target mounted on server `fqdn`.
    pub async fn unmount_lustre_targets(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        let address = self.address_of(fqdn)?;

        for x in self.get_lustre_mounts(&address).await? {
            tracing::debug!("Unmounting {} from {} on {}", x.device, x.mountpoint, fqdn);

            self.remote_command(&address, &format!("umount -f {}", x.mountpoint), Some(0))
                .await?;
        }

        Ok(())
    }

    /// Unloads Lustre and LNet and forgets any LNet configuration on `fqdn`.
    pub async fn clear_lnet_config(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        self.run_on(
            fqdn,
            "lustre_rmmod || true; rm -f /etc/modprobe.d/iml_lnet_module_parameters.conf /etc/lnet.conf",
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixture;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::Instant;

    fn testfs() -> Filesystem {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "testfs",
            "state": "available",
            "mgt": "/api/target/1/",
            "mdts": ["/api/target/2/", "/api/target/3/"],
            "osts": ["/api/target/4/"],
            "mount_command": "mount -t lustre 10.0.0.1@tcp0:/testfs /mnt/testfs",
            "bytes_free": 2_000_000.0,
            "resource_uri": "/api/filesystem/1/"
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_lustre_mounts() {
        let x = "10.0.0.1@tcp:/testfs on /mnt/testfs type lustre (rw,lazystatfs)\nzfs_pool_sdb/MGS on /mnt/MGS type lustre (ro)\n";

        assert_eq!(
            parse_lustre_mounts(x),
            vec![
                LustreMount {
                    device: "10.0.0.1@tcp:/testfs".to_string(),
                    mountpoint: "/mnt/testfs".to_string(),
                },
                LustreMount {
                    device: "zfs_pool_sdb/MGS".to_string(),
                    mountpoint: "/mnt/MGS".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_exercise_file_kib() {
        assert_eq!(exercise_file_kib(2_000_000.0), 512);
        assert_eq!(exercise_file_kib(100_000.0), 40);
        assert_eq!(exercise_file_kib(0.0), 1);
    }

    #[tokio::test]
    async fn test_mount_filesystem() {
        let (x, ops) = fixture();

        x.on_host(
            "10.0.0.9",
            "mount -t lustre",
            0,
            "10.0.0.1@tcp:/testfs on /mnt/testfs type lustre (rw)\n",
        );

        ops.mount_filesystem("client0.example.com", &testfs())
            .await
            .unwrap();

        assert_eq!(
            x.commands_for("10.0.0.9"),
            vec![
                "mkdir -p /mnt/testfs",
                "mount -t lustre 10.0.0.1@tcp0:/testfs /mnt/testfs",
                "mount -t lustre",
            ]
        );
    }

    #[tokio::test]
    async fn test_mount_filesystem_not_observed() {
        let (_, ops) = fixture();

        let e = ops
            .mount_filesystem("client0.example.com", &testfs())
            .await
            .unwrap_err();

        assert!(matches!(e, RemoteOpsError::Assert(_)));
    }

    #[tokio::test]
    async fn test_exercise_filesystem() {
        let (x, ops) = fixture();

        ops.exercise_filesystem("client0.example.com", &testfs(), &[0, 1], 2)
            .await
            .unwrap();

        let mut cmds = x.commands_for("10.0.0.9");
        cmds.sort();

        insta::assert_debug_snapshot!(cmds, @r###"
        [
            "dd if=/dev/zero of=/mnt/testfs/mdt0/exercisefile-0 bs=1k count=512",
            "dd if=/dev/zero of=/mnt/testfs/mdt0/exercisefile-1 bs=1k count=512",
            "dd if=/dev/zero of=/mnt/testfs/mdt1/exercisefile-0 bs=1k count=512",
            "dd if=/dev/zero of=/mnt/testfs/mdt1/exercisefile-1 bs=1k count=512",
            "lfs mkdir -i 1 /mnt/testfs/mdt1",
            "mkdir -p /mnt/testfs/mdt0",
            "rm -rf /mnt/testfs/mdt0",
            "rm -rf /mnt/testfs/mdt1",
        ]
        "###);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exercise_files_are_written_in_parallel() {
        let (x, ops) = fixture();

        x.delay_host("10.0.0.9", Duration::from_millis(100));

        let started = Instant::now();

        ops.exercise_filesystem("client0.example.com", &testfs(), &[0], 4)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(400));

        let xs = x.commands_for("10.0.0.9");

        assert_eq!(xs.first().map(String::as_str), Some("mkdir -p /mnt/testfs/mdt0"));
        assert_eq!(xs.last().map(String::as_str), Some("rm -rf /mnt/testfs/mdt0"));
        assert_eq!(xs.len(), 6);
    }

    #[tokio::test]
    async fn test_exercise_filesystem_propagates_failure() {
        let (x, ops) = fixture();

        x.on("lfs mkdir", 22, "");

        let e = ops
            .exercise_filesystem("client0.example.com", &testfs(), &[0, 1], 1)
            .await;

        assert!(matches!(e, Err(RemoteOpsError::ImlSshError(_))));
    }

    #[tokio::test]
    async fn test_unmount_lustre_targets() {
        let (x, ops) = fixture();

        x.on_host(
            "10.0.0.1",
            "mount -t lustre",
            0,
            "zfs_pool_sdb/MGS on /mnt/MGS type lustre (ro)\n",
        );

        ops.unmount_lustre_targets("lustre0.example.com")
            .await
            .unwrap();

        assert_eq!(
            x.commands_for("10.0.0.1"),
            vec!["mount -t lustre", "umount -f /mnt/MGS"]
        );
    }
}
