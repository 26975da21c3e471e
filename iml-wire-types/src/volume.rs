// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::EndpointName;
use std::collections::HashSet;

/// A Volume record from api/volume/
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Volume {
    pub id: u32,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub filesystem_type: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub size: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub usable_for_lustre: bool,
    #[serde(default)]
    pub volume_nodes: Vec<VolumeNode>,
    pub resource_uri: String,
}

impl Volume {
    pub fn primary_node(&self) -> Option<&VolumeNode> {
        self.volume_nodes.iter().find(|x| x.primary)
    }

    pub fn use_nodes(&self) -> impl Iterator<Item = &VolumeNode> {
        self.volume_nodes.iter().filter(|x| x.use_)
    }

    /// A shared volume has exactly one primary node, at least two used nodes
    /// and at least `required_hosts` nodes overall.
    pub fn is_shared(&self, required_hosts: usize) -> bool {
        let primaries = self.volume_nodes.iter().filter(|x| x.primary).count();

        primaries == 1 && self.use_nodes().count() >= 2 && self.volume_nodes.len() >= required_hosts
    }

    /// The node for this volume on `host_id`, if any.
    pub fn node_on_host(&self, host_id: u32) -> Option<&VolumeNode> {
        self.volume_nodes.iter().find(|x| x.host_id == host_id)
    }

    /// Structural problems with the nodes of this volume.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut xs = vec![];

        let primaries = self.volume_nodes.iter().filter(|x| x.primary).count();

        if primaries > 1 {
            xs.push(format!(
                "Volume {} ({}) has {} primary nodes",
                self.label, self.id, primaries
            ));
        }

        if self.status.as_deref() == Some("configured-ha") {
            let use_hosts: HashSet<u32> = self.use_nodes().map(|x| x.host_id).collect();

            if primaries != 1 {
                xs.push(format!(
                    "Volume {} ({}) is configured-ha without exactly one primary node",
                    self.label, self.id
                ));
            }

            if use_hosts.len() < 2 {
                xs.push(format!(
                    "Volume {} ({}) is configured-ha with {} used host(s)",
                    self.label,
                    self.id,
                    use_hosts.len()
                ));
            }
        }

        xs
    }
}

impl EndpointName for Volume {
    fn endpoint_name() -> &'static str {
        "volume"
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct VolumeNode {
    pub id: u32,
    pub host_id: u32,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub host_label: Option<String>,
    pub path: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(rename = "use", default)]
    pub use_: bool,
    #[serde(default)]
    pub resource_uri: Option<String>,
}

impl EndpointName for VolumeNode {
    fn endpoint_name() -> &'static str {
        "volume_node"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, host_id: u32, primary: bool, use_: bool) -> VolumeNode {
        VolumeNode {
            id,
            host_id,
            host: None,
            host_label: None,
            path: format!("/dev/disk/by-id/scsi-{}", id),
            primary,
            use_,
            resource_uri: None,
        }
    }

    fn volume(status: &str, volume_nodes: Vec<VolumeNode>) -> Volume {
        Volume {
            id: 1,
            label: "disk1".into(),
            filesystem_type: None,
            kind: None,
            size: None,
            status: Some(status.into()),
            usable_for_lustre: true,
            volume_nodes,
            resource_uri: "/api/volume/1/".into(),
        }
    }

    #[test]
    fn test_is_shared() {
        let v = volume(
            "configured-ha",
            vec![node(1, 1, true, true), node(2, 2, false, true)],
        );

        assert!(v.is_shared(2));
        assert!(!v.is_shared(3));
        assert!(v.invariant_violations().is_empty());
        assert_eq!(v.primary_node().map(|x| x.host_id), Some(1));
    }

    #[test]
    fn test_not_shared_without_two_use_nodes() {
        let v = volume(
            "configured-noha",
            vec![node(1, 1, true, true), node(2, 2, false, false)],
        );

        assert!(!v.is_shared(2));
    }

    #[test]
    fn test_two_primaries_is_a_violation() {
        let v = volume(
            "configured-ha",
            vec![node(1, 1, true, true), node(2, 2, true, true)],
        );

        assert_eq!(v.invariant_violations().len(), 2);
    }

    #[test]
    fn test_use_field_rename() {
        let x: VolumeNode = serde_json::from_str(
            r#"{"id": 4, "host_id": 2, "path": "/dev/sdb", "primary": false, "use": true}"#,
        )
        .unwrap();

        assert!(x.use_);
    }
}
