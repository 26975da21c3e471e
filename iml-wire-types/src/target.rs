// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::EndpointName;
use std::fmt;

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetKind {
    MGT,
    MDT,
    OST,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let x = match self {
            TargetKind::MGT => "MGT",
            TargetKind::MDT => "MDT",
            TargetKind::OST => "OST",
        };

        write!(f, "{}", x)
    }
}

/// A Target record from /api/target/
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug)]
pub struct Target {
    pub id: u32,
    pub name: String,
    pub kind: TargetKind,
    pub state: String,
    #[serde(default)]
    pub active_host: Option<String>,
    #[serde(default)]
    pub active_host_name: Option<String>,
    #[serde(default)]
    pub primary_server: Option<String>,
    #[serde(default)]
    pub primary_server_name: Option<String>,
    #[serde(default)]
    pub failover_servers: Vec<String>,
    #[serde(default)]
    pub ha_label: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub filesystem_id: Option<u32>,
    #[serde(default)]
    pub filesystem_name: Option<String>,
    #[serde(default)]
    pub volume: serde_json::Value,
    #[serde(default)]
    pub immutable_state: bool,
    pub resource_uri: String,
}

impl Target {
    pub fn is_mounted(&self) -> bool {
        self.state == "mounted"
    }
}

impl EndpointName for Target {
    fn endpoint_name() -> &'static str {
        "target"
    }
}

/// Filesystem target lists are either uris or dehydrated records,
/// depending on the `dehydrate__*` query flags.
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug)]
#[serde(untagged)]
pub enum TargetOrUri {
    Target(Box<Target>),
    Uri(String),
}

impl TargetOrUri {
    pub fn uri(&self) -> &str {
        match self {
            TargetOrUri::Target(x) => &x.resource_uri,
            TargetOrUri::Uri(x) => x,
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            TargetOrUri::Target(x) => Some(x),
            TargetOrUri::Uri(_) => None,
        }
    }
}

/// A Filesystem record from /api/filesystem/
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Filesystem {
    pub id: u32,
    pub name: String,
    pub state: String,
    pub mgt: TargetOrUri,
    #[serde(default)]
    pub mdts: Vec<TargetOrUri>,
    #[serde(default)]
    pub osts: Vec<TargetOrUri>,
    #[serde(default)]
    pub mount_command: String,
    #[serde(default)]
    pub mount_path: Option<String>,
    #[serde(default)]
    pub bytes_free: Option<f64>,
    #[serde(default)]
    pub bytes_total: Option<f64>,
    #[serde(default)]
    pub immutable_state: bool,
    pub resource_uri: String,
}

impl Filesystem {
    /// All target uris, mgt first.
    pub fn target_uris(&self) -> Vec<&str> {
        std::iter::once(&self.mgt)
            .chain(self.mdts.iter())
            .chain(self.osts.iter())
            .map(|x| x.uri())
            .collect()
    }

    /// Checks the mgt / mdt / ost shape of this filesystem.
    pub fn structure_errors(&self) -> Vec<String> {
        let mut xs = vec![];

        if self.mdts.is_empty() {
            xs.push(format!("Filesystem {} has no MDT", self.name));
        }

        if self.osts.is_empty() {
            xs.push(format!("Filesystem {} has no OST", self.name));
        }

        let mdt0 = self
            .mdts
            .iter()
            .filter_map(|x| x.target())
            .any(|x| x.index == Some(0));

        let dehydrated = self.mdts.iter().all(|x| x.target().is_some());

        if dehydrated && !self.mdts.is_empty() && !mdt0 {
            xs.push(format!("Filesystem {} has no MDT with index 0", self.name));
        }

        xs
    }
}

impl EndpointName for Filesystem {
    fn endpoint_name() -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filesystem_mixed_targets() {
        let fs: Filesystem = serde_json::from_str(
            r#"{
                "id": 1,
                "name": "testfs",
                "state": "available",
                "mgt": "/api/target/1/",
                "mdts": [{
                    "id": 2,
                    "name": "testfs-MDT0000",
                    "kind": "MDT",
                    "state": "mounted",
                    "index": 0,
                    "resource_uri": "/api/target/2/"
                }],
                "osts": ["/api/target/3/", "/api/target/4/"],
                "mount_command": "mount -t lustre 10.0.0.1@tcp0:/testfs /mnt/testfs",
                "resource_uri": "/api/filesystem/1/"
            }"#,
        )
        .unwrap();

        assert_eq!(
            fs.target_uris(),
            vec![
                "/api/target/1/",
                "/api/target/2/",
                "/api/target/3/",
                "/api/target/4/"
            ]
        );
        assert!(fs.structure_errors().is_empty());
    }

    #[test]
    fn test_filesystem_missing_osts() {
        let fs: Filesystem = serde_json::from_str(
            r#"{
                "id": 1,
                "name": "testfs",
                "state": "available",
                "mgt": "/api/target/1/",
                "mdts": ["/api/target/2/"],
                "resource_uri": "/api/filesystem/1/"
            }"#,
        )
        .unwrap();

        assert_eq!(
            fs.structure_errors(),
            vec!["Filesystem testfs has no OST".to_string()]
        );
    }
}
