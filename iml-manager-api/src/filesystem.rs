// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Creating, stopping and removing filesystems.

use crate::{query, ApiError, ManagerApi};
use iml_poll::wait_for_assert;
use iml_test_config::timeouts::{LONG_TEST_TIMEOUT, TEST_TIMEOUT};
use iml_wire_types::{
    extract_numeric_id, Command, EndpointName, Filesystem, Host, Target, TargetKind, Volume,
};
use std::{collections::HashMap, time::Duration};

#[derive(serde::Serialize, Debug, Clone, PartialEq)]
pub struct NewTarget {
    pub volume_id: u32,
    pub conf_params: serde_json::Map<String, serde_json::Value>,
}

impl NewTarget {
    pub fn new(volume_id: u32) -> Self {
        Self {
            volume_id,
            conf_params: serde_json::Map::new(),
        }
    }
}

/// The body of `POST /api/filesystem/`.
#[derive(serde::Serialize, Debug, Clone, PartialEq)]
pub struct NewFilesystem {
    pub name: String,
    pub mgt: NewTarget,
    pub mdts: Vec<NewTarget>,
    pub osts: Vec<NewTarget>,
    pub conf_params: serde_json::Map<String, serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct CreatedFilesystem {
    command: Command,
    filesystem: Filesystem,
}

/// Where one target of the standard layout lives.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetPlacement {
    pub kind: TargetKind,
    pub volume_id: u32,
    pub primary: u32,
    pub secondary: u32,
}

/// Places MGT, MDT and two OSTs over two failover pairs of hosts,
/// `(0, 1)` and `(2, 3)`, each target primary on a different host.
///
/// Each target takes the first unused volume visible to both hosts of its
/// pair.
pub fn plan_standard_layout(
    volumes: &[Volume],
    host_ids: &[u32],
) -> Result<Vec<TargetPlacement>, ApiError> {
    let hosts = match host_ids {
        [a, b, c, d, ..] => [*a, *b, *c, *d],
        _ => {
            return Err(ApiError::assert(format!(
                "The standard layout needs 4 servers, found {}",
                host_ids.len()
            )))
        }
    };

    let wanted = [
        (TargetKind::MGT, hosts[0], hosts[1]),
        (TargetKind::MDT, hosts[1], hosts[0]),
        (TargetKind::OST, hosts[2], hosts[3]),
        (TargetKind::OST, hosts[3], hosts[2]),
    ];

    let mut used = vec![];
    let mut xs = vec![];

    for (kind, primary, secondary) in wanted.iter().copied() {
        let volume = volumes
            .iter()
            .filter(|x| !used.contains(&x.id))
            .find(|x| x.node_on_host(primary).is_some() && x.node_on_host(secondary).is_some())
            .ok_or_else(|| {
                ApiError::assert(format!(
                    "No free volume shared by hosts {} and {} for the {}",
                    primary, secondary, kind
                ))
            })?;

        used.push(volume.id);

        xs.push(TargetPlacement {
            kind,
            volume_id: volume.id,
            primary,
            secondary,
        });
    }

    Ok(xs)
}

/// The id of the volume a target sits on.
fn target_volume_id(x: &Target) -> Option<u32> {
    match &x.volume {
        serde_json::Value::Object(o) => o.get("id").and_then(|x| x.as_u64()).map(|x| x as u32),
        serde_json::Value::String(s) => extract_numeric_id(s),
        _ => None,
    }
}

impl ManagerApi {
    pub async fn get_filesystems(&self) -> Result<Vec<Filesystem>, ApiError> {
        Ok(self.client.list(&[]).await?)
    }

    pub async fn get_filesystem(&self, id: u32) -> Result<Filesystem, ApiError> {
        Ok(self.client.get_by_uri(&Filesystem::uri(id)).await?)
    }

    pub async fn get_targets(&self, filesystem_id: u32) -> Result<Vec<Target>, ApiError> {
        Ok(self
            .client
            .list(&query(&[("filesystem_id", &filesystem_id.to_string())]))
            .await?)
    }

    /// Creates `fs` and waits up to `timeout` for it to be set up.
    pub async fn create_filesystem(
        &self,
        fs: &NewFilesystem,
        timeout: Duration,
    ) -> Result<Filesystem, ApiError> {
        tracing::info!("Creating filesystem {}", fs.name);

        let CreatedFilesystem {
            command,
            filesystem,
        } = self
            .client
            .post(&Filesystem::endpoint(), fs)
            .await?
            .error_for_status()?
            .json()?;

        self.wait_for_command(command.id, timeout, true, true)
            .await?;

        self.get_filesystem(filesystem.id).await
    }

    /// Creates filesystem `name` over four servers in two failover pairs and
    /// checks each target runs on its primary, both according to the manager
    /// and to pacemaker.
    pub async fn create_filesystem_standard(
        &self,
        servers: &[Host],
        name: &str,
    ) -> Result<Filesystem, ApiError> {
        let host_ids: Vec<u32> = servers.iter().map(|x| x.id).collect();

        let volumes = self.wait_for_shared_volumes(4, 2).await?;
        let layout = plan_standard_layout(&volumes, &host_ids)?;

        for x in &layout {
            let volume = volumes
                .iter()
                .find(|v| v.id == x.volume_id)
                .ok_or_else(|| ApiError::assert(format!("Volume {} vanished", x.volume_id)))?;

            self.set_volume_mounts(volume, x.primary, Some(x.secondary))
                .await?;
        }

        let by_kind = |kind: TargetKind| {
            layout
                .iter()
                .filter(move |x| x.kind == kind)
                .map(|x| NewTarget::new(x.volume_id))
        };

        let mgt = by_kind(TargetKind::MGT)
            .next()
            .ok_or_else(|| ApiError::assert("No MGT placed"))?;

        let fs = NewFilesystem {
            name: name.into(),
            mgt,
            mdts: by_kind(TargetKind::MDT).collect(),
            osts: by_kind(TargetKind::OST).collect(),
            conf_params: serde_json::Map::new(),
        };

        let fs = self.create_filesystem(&fs, LONG_TEST_TIMEOUT).await?;

        let expected: HashMap<u32, &Host> = layout
            .iter()
            .filter_map(|x| Some((x.volume_id, servers.iter().find(|h| h.id == x.primary)?)))
            .collect();

        wait_for_assert(
            || self.verify_target_placement(fs.id, &expected),
            TEST_TIMEOUT,
        )
        .await?;

        Ok(fs)
    }

    async fn verify_target_placement(
        &self,
        filesystem_id: u32,
        expected: &HashMap<u32, &Host>,
    ) -> Result<(), ApiError> {
        for target in self.get_targets(filesystem_id).await? {
            let host = match target_volume_id(&target).and_then(|x| expected.get(&x)) {
                Some(x) => x,
                None => continue,
            };

            let active = target.active_host.as_deref().and_then(extract_numeric_id);

            if active != Some(host.id) {
                return Err(ApiError::StateMismatch {
                    uri: target.resource_uri,
                    field: "active_host".into(),
                    expected: host.resource_uri.clone(),
                    found: format!("{:?}", target.active_host),
                });
            }

            let ha_label = target
                .ha_label
                .as_deref()
                .ok_or_else(|| ApiError::assert(format!("{} has no ha_label", target.name)))?;

            let running_on = self
                .ops
                .get_target_active_host(&host.fqdn, ha_label)
                .await?;

            if running_on.as_deref() != Some(host.fqdn.as_str()) {
                return Err(ApiError::assert(format!(
                    "pacemaker runs {} on {:?}, expected {}",
                    ha_label, running_on, host.fqdn
                )));
            }
        }

        Ok(())
    }

    pub async fn stop_filesystem(&self, fs: &Filesystem) -> Result<Option<Command>, ApiError> {
        self.set_state(&fs.resource_uri, "stopped", true, LONG_TEST_TIMEOUT)
            .await
    }

    pub async fn start_filesystem(&self, fs: &Filesystem) -> Result<Option<Command>, ApiError> {
        self.set_state(&fs.resource_uri, "available", true, LONG_TEST_TIMEOUT)
            .await
    }

    /// Removes `fs` and checks the manager forgot it.
    pub async fn remove_filesystem(&self, fs: &Filesystem) -> Result<(), ApiError> {
        self.set_state(&fs.resource_uri, "removed", false, LONG_TEST_TIMEOUT)
            .await?;

        if self.get_filesystems().await?.iter().any(|x| x.id == fs.id) {
            return Err(ApiError::assert(format!("Filesystem {} was not removed", fs.name)));
        }

        Ok(())
    }

    /// Stops and removes every filesystem, then removes every host.
    pub async fn graceful_teardown(&self) -> Result<(), ApiError> {
        for fs in self.get_filesystems().await? {
            if fs.state == "available" {
                self.stop_filesystem(&fs).await?;
            }

            self.remove_filesystem(&fs).await?;
        }

        for host in self.get_hosts().await? {
            self.remove_host(&host).await?;
        }

        Ok(())
    }

    /// Checks `fs` has an MDT, an OST, and an MDT0.
    pub async fn validate_filesystem_structure(&self, id: u32) -> Result<(), ApiError> {
        let fs: Filesystem = self
            .client
            .get_json(
                &Filesystem::uri(id),
                &query(&[
                    ("dehydrate__mgt", "true"),
                    ("dehydrate__mdts", "true"),
                    ("dehydrate__osts", "true"),
                ]),
            )
            .await?;

        let errors = fs.structure_errors();

        if !errors.is_empty() {
            return Err(ApiError::Invariant(errors.join("\n")));
        }

        Ok(())
    }
}
