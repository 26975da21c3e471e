// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{query, ApiError, ManagerApi};
use iml_poll::wait_for_value;
use iml_test_config::timeouts::TEST_TIMEOUT;
use iml_wire_types::{Command, EndpointName, Volume};

/// The body of a PUT that makes `primary` the primary node of `volume` and
/// `secondary` its failover node. Nodes on other hosts are left unused.
pub fn volume_mounts_body(
    volume: &Volume,
    primary: u32,
    secondary: Option<u32>,
) -> serde_json::Value {
    let nodes: Vec<_> = volume
        .volume_nodes
        .iter()
        .map(|x| {
            serde_json::json!({
                "id": x.id,
                "primary": x.host_id == primary,
                "use": x.host_id == primary || Some(x.host_id) == secondary,
            })
        })
        .collect();

    serde_json::json!({ "id": volume.id, "nodes": nodes })
}

impl ManagerApi {
    pub async fn get_volumes(&self) -> Result<Vec<Volume>, ApiError> {
        Ok(self.client.list(&query(&[("category", "usable")])).await?)
    }

    /// Usable volumes with one primary node, at least two used nodes and at
    /// least `required_hosts` nodes in total.
    pub async fn get_shared_volumes(&self, required_hosts: usize) -> Result<Vec<Volume>, ApiError> {
        let xs = self.get_volumes().await?;

        Ok(xs
            .into_iter()
            .filter(|x| x.is_shared(required_hosts))
            .collect())
    }

    /// Polls until at least `n` shared volumes exist.
    pub async fn wait_for_shared_volumes(
        &self,
        n: usize,
        required_hosts: usize,
    ) -> Result<Vec<Volume>, ApiError> {
        wait_for_value(
            || self.get_shared_volumes(required_hosts),
            |xs| xs.len() >= n,
            TEST_TIMEOUT,
        )
        .await
    }

    /// Sets which hosts use `volume` and which of them is primary.
    pub async fn set_volume_mounts(
        &self,
        volume: &Volume,
        primary: u32,
        secondary: Option<u32>,
    ) -> Result<Option<Command>, ApiError> {
        for host_id in std::iter::once(primary).chain(secondary) {
            if volume.node_on_host(host_id).is_none() {
                return Err(ApiError::assert(format!(
                    "Volume {} ({}) has no node on host {}",
                    volume.label, volume.id, host_id
                )));
            }
        }

        let body = volume_mounts_body(volume, primary, secondary);

        self.put_and_wait(&Volume::uri(volume.id), &body, true, TEST_TIMEOUT)
            .await
    }

    /// Checks the primary and use flags of every volume are coherent.
    pub async fn verify_volume_invariants(&self) -> Result<(), ApiError> {
        let xs: Vec<Volume> = self.client.list(&[]).await?;

        let errors: Vec<String> = xs.iter().flat_map(|x| x.invariant_violations()).collect();

        if !errors.is_empty() {
            return Err(ApiError::Invariant(errors.join("\n")));
        }

        Ok(())
    }
}
