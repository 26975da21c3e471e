// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Preparing block devices for Lustre targets.
//!
//! Each backing store knows how to turn a set of raw device paths into
//! something a target can be formatted on, and how to undo that.

use crate::{RemoteOperations, RemoteOpsError};
use futures::future::join_all;
use iml_test_config::DeviceType;
use std::collections::{BTreeMap, BTreeSet};

pub trait DeviceHelper: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Packages and modules needed before any other command can run.
    fn install_packages_commands(&self) -> Vec<String> {
        vec![]
    }

    /// Builds the backing store on `paths`.
    fn create_device_commands(&self, paths: &[String]) -> Vec<String>;

    /// Removes every trace of a previous backing store from `paths`.
    fn clear_device_commands(&self, paths: &[String]) -> Vec<String>;

    /// Leaves the store on `paths` free for another host to import.
    fn release_commands(&self, _paths: &[String]) -> Vec<String> {
        vec![]
    }

    /// Takes over the store on `paths` after another host released it.
    fn capture_commands(&self, _paths: &[String]) -> Vec<String> {
        vec![]
    }

    fn destroy_commands(&self, paths: &[String]) -> Vec<String>;
}

/// The `n`th partition of `path`.
fn partition(path: &str, n: u32) -> String {
    if path.contains("/by-id/") || path.contains("/by-path/") {
        format!("{}-part{}", path, n)
    } else if path.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", path, n)
    } else {
        format!("{}{}", path, n)
    }
}

fn device_name(path: &str) -> String {
    path.trim_start_matches("/dev/")
        .replace('/', "_")
        .replace('-', "_")
}

fn wipe_commands(paths: &[String]) -> Vec<String> {
    paths.iter().map(|x| format!("wipefs -a {}", x)).collect()
}

/// Plain disks formatted as ldiskfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ldiskfs;

impl DeviceHelper for Ldiskfs {
    fn device_type(&self) -> DeviceType {
        DeviceType::Linux
    }

    fn create_device_commands(&self, _paths: &[String]) -> Vec<String> {
        vec![]
    }

    fn clear_device_commands(&self, paths: &[String]) -> Vec<String> {
        wipe_commands(paths)
    }

    fn destroy_commands(&self, paths: &[String]) -> Vec<String> {
        wipe_commands(paths)
    }
}

/// One zpool per device.
#[derive(Debug, Default, Clone, Copy)]
pub struct Zfs;

impl Zfs {
    pub fn pool_name(path: &str) -> String {
        format!("zfs_pool_{}", device_name(path))
    }
}

impl DeviceHelper for Zfs {
    fn device_type(&self) -> DeviceType {
        DeviceType::Zfs
    }

    fn install_packages_commands(&self) -> Vec<String> {
        vec![
            "yum install -y lustre-zfs".to_string(),
            "modprobe zfs".to_string(),
        ]
    }

    fn create_device_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .flat_map(|x| {
                vec![
                    format!("parted -s {} mklabel gpt", x),
                    format!(
                        "zpool create -f {} -o cachefile=none -o multihost=on {}",
                        Zfs::pool_name(x),
                        x
                    ),
                ]
            })
            .collect()
    }

    fn clear_device_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .flat_map(|x| {
                vec![
                    format!(
                        "if zpool list {0}; then zpool destroy -f {0}; fi",
                        Zfs::pool_name(x)
                    ),
                    "udevadm settle".to_string(),
                    format!("zpool labelclear -f {} || true", partition(x, 1)),
                    format!("wipefs -a {}", x),
                ]
            })
            .collect()
    }

    fn release_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .map(|x| format!("zpool export {}", Zfs::pool_name(x)))
            .collect()
    }

    fn capture_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .map(|x| format!("zpool import -f {}", Zfs::pool_name(x)))
            .collect()
    }

    fn destroy_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .map(|x| format!("zpool destroy -f {}", Zfs::pool_name(x)))
            .collect()
    }
}

/// One volume group with a single logical volume per device.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lvm;

impl Lvm {
    pub fn vg_name(path: &str) -> String {
        format!("vg_{}", device_name(path))
    }
}

impl DeviceHelper for Lvm {
    fn device_type(&self) -> DeviceType {
        DeviceType::Lvm
    }

    fn install_packages_commands(&self) -> Vec<String> {
        vec!["yum install -y lvm2".to_string()]
    }

    fn create_device_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .flat_map(|x| {
                let vg = Lvm::vg_name(x);

                vec![
                    format!("vgcreate -y {} {}", vg, x),
                    format!("lvcreate -y -n lv -l 100%FREE {}", vg),
                ]
            })
            .collect()
    }

    fn clear_device_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .flat_map(|x| {
                vec![
                    format!("vgremove -f {} || true", Lvm::vg_name(x)),
                    format!("pvremove -ff -y {} || true", x),
                    format!("wipefs -a {}", x),
                ]
            })
            .collect()
    }

    fn release_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .map(|x| format!("vgchange -a n {}", Lvm::vg_name(x)))
            .collect()
    }

    fn capture_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .map(|x| format!("vgchange -a y {}", Lvm::vg_name(x)))
            .collect()
    }

    fn destroy_commands(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .flat_map(|x| {
                let vg = Lvm::vg_name(x);

                vec![
                    format!("lvremove -f {}/lv", vg),
                    format!("vgremove -f {}", vg),
                ]
            })
            .collect()
    }
}

/// A single mirrored array across all devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mdraid;

const MD_DEVICE: &str = "/dev/md/lustre_md";

impl DeviceHelper for Mdraid {
    fn device_type(&self) -> DeviceType {
        DeviceType::Mdraid
    }

    fn install_packages_commands(&self) -> Vec<String> {
        vec!["yum install -y mdadm".to_string()]
    }

    fn create_device_commands(&self, paths: &[String]) -> Vec<String> {
        vec![format!(
            "mdadm --create {} --run --level=1 --raid-devices={} {}",
            MD_DEVICE,
            paths.len(),
            paths.join(" ")
        )]
    }

    fn clear_device_commands(&self, paths: &[String]) -> Vec<String> {
        let mut xs = vec![format!("mdadm --stop {} || true", MD_DEVICE)];

        xs.extend(
            paths
                .iter()
                .map(|x| format!("mdadm --zero-superblock {} || true", x)),
        );
        xs.extend(wipe_commands(paths));

        xs
    }

    fn release_commands(&self, _paths: &[String]) -> Vec<String> {
        vec![format!("mdadm --stop {}", MD_DEVICE)]
    }

    fn capture_commands(&self, paths: &[String]) -> Vec<String> {
        vec![format!("mdadm --assemble {} {}", MD_DEVICE, paths.join(" "))]
    }

    fn destroy_commands(&self, paths: &[String]) -> Vec<String> {
        let mut xs = vec![format!("mdadm --stop {}", MD_DEVICE)];

        xs.extend(
            paths
                .iter()
                .map(|x| format!("mdadm --zero-superblock {}", x)),
        );

        xs
    }
}

pub fn helper_for(device_type: DeviceType) -> Box<dyn DeviceHelper> {
    match device_type {
        DeviceType::Linux => Box::new(Ldiskfs),
        DeviceType::Zfs => Box::new(Zfs),
        DeviceType::Lvm => Box::new(Lvm),
        DeviceType::Mdraid => Box::new(Mdraid),
    }
}

/// Looks a helper up by its configuration name.
pub fn helper_named(name: &str) -> Result<Box<dyn DeviceHelper>, RemoteOpsError> {
    let x = match name {
        "linux" | "ldiskfs" => DeviceType::Linux,
        "zfs" => DeviceType::Zfs,
        "lvm" => DeviceType::Lvm,
        "mdraid" => DeviceType::Mdraid,
        x => return Err(RemoteOpsError::UnknownDeviceType(x.to_string())),
    };

    Ok(helper_for(x))
}

impl RemoteOperations {
    /// Device paths of `fqdn` grouped by the backend the cluster config asks
    /// for.
    pub fn lustre_device_paths(
        &self,
        fqdn: &str,
    ) -> Result<BTreeMap<DeviceType, Vec<String>>, RemoteOpsError> {
        let spec = self.server(fqdn)?;

        let mut out: BTreeMap<DeviceType, Vec<String>> = BTreeMap::new();

        for x in &self.config().lustre_devices {
            if let Some(path) = spec.device_paths.get(x.path_index) {
                out.entry(x.backend_filesystem)
                    .or_default()
                    .push(path.clone());
            }
        }

        Ok(out)
    }

    /// Splits the configured devices of `fqdns` between the hosts that will
    /// prepare them.
    ///
    /// A path listed by more than one host is shared storage and belongs to
    /// the first of `fqdns` listing it, so it is only ever prepared once.
    pub fn device_owners(
        &self,
        fqdns: &[&str],
    ) -> Result<BTreeMap<String, BTreeMap<DeviceType, Vec<String>>>, RemoteOpsError> {
        let mut claimed = BTreeSet::new();
        let mut out = BTreeMap::new();

        for fqdn in fqdns {
            let mut owned: BTreeMap<DeviceType, Vec<String>> = BTreeMap::new();

            for (device_type, paths) in self.lustre_device_paths(fqdn)? {
                for path in paths {
                    if claimed.insert(path.clone()) {
                        owned.entry(device_type).or_default().push(path);
                    }
                }
            }

            out.insert(fqdn.to_string(), owned);
        }

        Ok(out)
    }

    async fn install_device_packages(&self, fqdn: &str) -> Result<(), RemoteOpsError> {
        let address = self.address_of(fqdn)?;

        let cmds: Vec<String> = self
            .lustre_device_paths(fqdn)?
            .keys()
            .flat_map(|x| helper_for(*x).install_packages_commands())
            .collect();

        self.execute_commands(&cmds, &address, "install device packages")
            .await
    }

    async fn prepare_owned_devices(
        &self,
        fqdn: &str,
        owned: &BTreeMap<DeviceType, Vec<String>>,
    ) -> Result<(), RemoteOpsError> {
        let address = self.address_of(fqdn)?;

        for (device_type, paths) in owned {
            let helper = helper_for(*device_type);

            tracing::info!("Resetting {} devices {:?} on {}", device_type, paths, fqdn);

            let mut cmds = helper.clear_device_commands(paths);
            cmds.extend(helper.create_device_commands(paths));
            cmds.extend(helper.release_commands(paths));

            self.execute_commands(&cmds, &address, "reset devices").await?;
        }

        Ok(())
    }

    /// Wipes every configured Lustre device of `fqdns` and recreates the
    /// backing stores that need creating up front, such as zpools.
    ///
    /// Every host gets the packages its backends need. Each device is then
    /// cleared, created and released by its owner only, leaving it free for
    /// any peer to capture.
    pub async fn reset_lustre_devices(&self, fqdns: &[&str]) -> Result<(), RemoteOpsError> {
        let xs = join_all(fqdns.iter().map(|x| self.install_device_packages(x))).await;
        xs.into_iter().collect::<Result<(), _>>()?;

        let owners = self.device_owners(fqdns)?;

        let xs = join_all(
            owners
                .iter()
                .map(|(fqdn, owned)| self.prepare_owned_devices(fqdn, owned)),
        )
        .await;

        xs.into_iter().collect()
    }

    /// Removes the backing stores [`Self::reset_lustre_devices`] built. Each
    /// owner captures its released devices before destroying them.
    pub async fn destroy_lustre_devices(&self, fqdns: &[&str]) -> Result<(), RemoteOpsError> {
        let owners = self.device_owners(fqdns)?;

        let xs = join_all(owners.iter().map(|(fqdn, owned)| async move {
            let address = self.address_of(fqdn)?;

            for (device_type, paths) in owned {
                let helper = helper_for(*device_type);

                let mut cmds = helper.capture_commands(paths);
                cmds.extend(helper.destroy_commands(paths));

                self.execute_commands(&cmds, &address, "destroy devices")
                    .await?;
            }

            Ok::<_, RemoteOpsError>(())
        }))
        .await;

        xs.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixture;
    use pretty_assertions::assert_eq;

    fn paths(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_partition() {
        assert_eq!(partition("/dev/sdb", 1), "/dev/sdb1");
        assert_eq!(partition("/dev/nvme0n1", 1), "/dev/nvme0n1p1");
        assert_eq!(
            partition("/dev/disk/by-id/scsi-0QEMU_disk1", 1),
            "/dev/disk/by-id/scsi-0QEMU_disk1-part1"
        );
    }

    #[test]
    fn test_zfs_commands() {
        let xs = paths(&["/dev/disk/by-id/scsi-disk1"]);

        insta::assert_debug_snapshot!(Zfs.create_device_commands(&xs), @r###"
        [
            "parted -s /dev/disk/by-id/scsi-disk1 mklabel gpt",
            "zpool create -f zfs_pool_disk_by_id_scsi_disk1 -o cachefile=none -o multihost=on /dev/disk/by-id/scsi-disk1",
        ]
        "###);

        insta::assert_debug_snapshot!(Zfs.clear_device_commands(&xs), @r###"
        [
            "if zpool list zfs_pool_disk_by_id_scsi_disk1; then zpool destroy -f zfs_pool_disk_by_id_scsi_disk1; fi",
            "udevadm settle",
            "zpool labelclear -f /dev/disk/by-id/scsi-disk1-part1 || true",
            "wipefs -a /dev/disk/by-id/scsi-disk1",
        ]
        "###);
    }

    #[test]
    fn test_helper_named() {
        assert_eq!(helper_named("ldiskfs").unwrap().device_type(), DeviceType::Linux);
        assert_eq!(helper_named("mdraid").unwrap().device_type(), DeviceType::Mdraid);
        assert!(matches!(
            helper_named("btrfs"),
            Err(RemoteOpsError::UnknownDeviceType(_))
        ));
    }

    #[test]
    fn test_mdraid_commands() {
        let xs = paths(&["/dev/sdb", "/dev/sdc"]);

        assert_eq!(
            Mdraid.create_device_commands(&xs),
            vec!["mdadm --create /dev/md/lustre_md --run --level=1 --raid-devices=2 /dev/sdb /dev/sdc"]
        );
        assert_eq!(
            Mdraid.capture_commands(&xs),
            vec!["mdadm --assemble /dev/md/lustre_md /dev/sdb /dev/sdc"]
        );
    }

    #[tokio::test]
    async fn test_reset_lustre_devices() {
        let (x, ops) = fixture();

        ops.reset_lustre_devices(&["lustre0.example.com"])
            .await
            .unwrap();

        insta::assert_debug_snapshot!(x.commands_for("10.0.0.1"), @r###"
        [
            "yum install -y lustre-zfs",
            "modprobe zfs",
            "wipefs -a /dev/sdc",
            "if zpool list zfs_pool_sdb; then zpool destroy -f zfs_pool_sdb; fi",
            "udevadm settle",
            "zpool labelclear -f /dev/sdb1 || true",
            "wipefs -a /dev/sdb",
            "parted -s /dev/sdb mklabel gpt",
            "zpool create -f zfs_pool_sdb -o cachefile=none -o multihost=on /dev/sdb",
            "zpool export zfs_pool_sdb",
        ]
        "###);
    }

    #[tokio::test]
    async fn test_shared_devices_are_created_once() {
        let (x, ops) = fixture();

        let fqdns = ["lustre0.example.com", "lustre1.example.com"];

        ops.reset_lustre_devices(&fqdns).await.unwrap();

        let creates: Vec<(String, String)> = x
            .calls()
            .into_iter()
            .filter(|(_, c)| c.starts_with("zpool create") || c.starts_with("wipefs"))
            .collect();

        assert_eq!(
            creates,
            vec![
                ("10.0.0.1".to_string(), "wipefs -a /dev/sdc".to_string()),
                ("10.0.0.1".to_string(), "wipefs -a /dev/sdb".to_string()),
                (
                    "10.0.0.1".to_string(),
                    "zpool create -f zfs_pool_sdb -o cachefile=none -o multihost=on /dev/sdb"
                        .to_string()
                ),
            ]
        );

        assert_eq!(
            x.commands_for("10.0.0.2"),
            vec!["yum install -y lustre-zfs", "modprobe zfs"]
        );

        let owners = ops.device_owners(&fqdns).unwrap();
        assert!(owners["lustre1.example.com"].is_empty());
    }

    #[tokio::test]
    async fn test_destroy_lustre_devices() {
        let (x, ops) = fixture();

        ops.destroy_lustre_devices(&["lustre0.example.com", "lustre1.example.com"])
            .await
            .unwrap();

        assert_eq!(
            x.commands_for("10.0.0.1"),
            vec![
                "wipefs -a /dev/sdc",
                "zpool import -f zfs_pool_sdb",
                "zpool destroy -f zfs_pool_sdb"
            ]
        );
        assert!(x.commands_for("10.0.0.2").is_empty());
    }
}
