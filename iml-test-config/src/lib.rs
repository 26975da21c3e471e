// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Serde model of the cluster the harness drives.
//!
//! Loading the file is up to the caller; this crate only describes its shape
//! and answers lookups against it.

pub mod timeouts;

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No server with fqdn {0} in the cluster config")]
    UnknownFqdn(String),
    #[error("No host with address {0} in the cluster config")]
    UnknownAddress(String),
    #[error("No vm host named {0} in the cluster config")]
    UnknownVmHost(String),
    #[error("Host {host} has no {field} configured")]
    MissingField { host: String, field: &'static str },
    #[error("No chroma manager configured")]
    NoManager,
    #[error("No superuser configured for the chroma manager")]
    NoSuperuser,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Backing store for Lustre targets on a server.
#[derive(
    serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Plain block devices formatted as ldiskfs.
    Linux,
    Zfs,
    Lvm,
    Mdraid,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Linux
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let x = match self {
            DeviceType::Linux => "linux",
            DeviceType::Zfs => "zfs",
            DeviceType::Lvm => "lvm",
            DeviceType::Mdraid => "mdraid",
        };

        write!(f, "{}", x)
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default, PartialEq)]
pub struct RoleFlags {
    /// Workers are managed by the manager but never run Lustre targets.
    #[serde(default)]
    pub worker: bool,
    /// Clients mount filesystems and are never added as servers.
    #[serde(default)]
    pub client: bool,
    /// Pacemaker is expected to be installed on this host.
    #[serde(default)]
    pub pacemaker: bool,
}

/// Settings rendered into `/etc/chroma.cfg` on managed servers.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default, PartialEq)]
pub struct CorosyncConfig {
    #[serde(default)]
    pub ring1_iface: Option<String>,
    #[serde(default)]
    pub mcast_port: Option<u16>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CorosyncConfig {
    /// Render as an ini-style `[corosync]` section.
    pub fn to_chroma_cfg(&self) -> String {
        let mut out = String::from("[corosync]\n");

        if let Some(x) = &self.ring1_iface {
            out.push_str(&format!("ring1_iface = {}\n", x));
        }

        if let Some(x) = self.mcast_port {
            out.push_str(&format!("mcast_port = {}\n", x));
        }

        for (k, v) in &self.extra {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                x => x.to_string(),
            };

            out.push_str(&format!("{} = {}\n", k, v));
        }

        out
    }
}

/// Stable identity of a server or client in the cluster.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default, PartialEq)]
pub struct HostSpec {
    pub address: String,
    pub fqdn: String,
    pub nodename: String,
    #[serde(default)]
    pub lnet_address: Option<String>,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub device_paths: Vec<String>,
    #[serde(default)]
    pub corosync_config: Option<CorosyncConfig>,
    #[serde(default)]
    pub role_flags: RoleFlags,
    /// Pins the server profile used when the host is added.
    #[serde(default)]
    pub profile: Option<String>,
    /// Name of the vm host that runs `destroy_command` / `start_command`.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub destroy_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub reset_command: Option<String>,
    #[serde(default)]
    pub reset_is_buggy: bool,
    #[serde(default)]
    pub distro: Option<String>,
    #[serde(default)]
    pub root_password: Option<String>,
    #[serde(default)]
    pub bridges: Vec<String>,
}

impl HostSpec {
    pub fn is_worker(&self) -> bool {
        self.role_flags.worker
    }

    /// Short hostname portion of the fqdn.
    pub fn short_name(&self) -> &str {
        self.fqdn.split('.').next().unwrap_or(&self.fqdn)
    }

    pub fn ring1_iface(&self) -> Option<&str> {
        self.corosync_config
            .as_ref()
            .and_then(|x| x.ring1_iface.as_deref())
    }

    /// The distro major version, when known (e.g. `7` for `el7`).
    pub fn distro_major(&self) -> Option<u32> {
        self.distro
            .as_deref()
            .map(|x| x.trim_start_matches(|c: char| !c.is_ascii_digit()))
            .and_then(|x| x.split('.').next())
            .and_then(|x| x.parse().ok())
    }
}

/// A hypervisor that owns one or more of the cluster hosts.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default, PartialEq)]
pub struct VmHost {
    pub address: String,
    #[serde(default)]
    pub fqdn: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct ManagerUser {
    pub username: String,
    pub password: String,
    #[serde(default, rename = "super")]
    pub superuser: bool,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct ManagerSpec {
    pub address: String,
    pub server_http_url: String,
    #[serde(default)]
    pub users: Vec<ManagerUser>,
}

/// An entry of `lustre_devices`: which `device_paths` index backs a target
/// and how it is formatted.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct LustreDevice {
    pub path_index: usize,
    #[serde(default)]
    pub backend_filesystem: DeviceType,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct PowerControlTypeSpec {
    pub agent: String,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub default_username: Option<String>,
    #[serde(default)]
    pub default_password: Option<String>,
    #[serde(default)]
    pub max_outlets: Option<u32>,
    #[serde(default)]
    pub default_port: Option<u16>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct PduSpec {
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// The `agent` of the power control type this device uses.
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct OutletSpec {
    /// Address of the owning PDU.
    pub pdu: String,
    pub identifier: String,
    /// Fqdn of the host plugged into this outlet, if any.
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default, PartialEq)]
pub struct ClusterConfig {
    #[serde(default)]
    pub lustre_servers: Vec<HostSpec>,
    #[serde(default)]
    pub lustre_clients: Vec<HostSpec>,
    #[serde(default)]
    pub hosts: BTreeMap<String, VmHost>,
    #[serde(default)]
    pub chroma_managers: Vec<ManagerSpec>,
    #[serde(default)]
    pub lustre_devices: Vec<LustreDevice>,
    #[serde(default)]
    pub power_control_types: Vec<PowerControlTypeSpec>,
    #[serde(default)]
    pub power_distribution_units: Vec<PduSpec>,
    #[serde(default)]
    pub pdu_outlets: Vec<OutletSpec>,
    /// Whether the manager is expected to manage (deploy to) the servers.
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub soft_reset: bool,
    #[serde(default)]
    pub failover_is_configured: bool,
    #[serde(default)]
    pub ssh_config: Option<PathBuf>,
    /// Recipients of the interactive help request. Empty disables the gate.
    #[serde(default)]
    pub fetch_help_recipients: Vec<String>,
    /// Free form description of the filesystem created by the run.
    #[serde(default)]
    pub filesystem: Option<serde_json::Value>,
}

impl ClusterConfig {
    pub fn from_json_str(x: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(x)?)
    }

    pub fn from_json_file(p: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let x = std::fs::read_to_string(p)?;

        Self::from_json_str(&x)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn manager(&self) -> Result<&ManagerSpec, ConfigError> {
        self.chroma_managers.first().ok_or(ConfigError::NoManager)
    }

    pub fn superuser(&self) -> Result<&ManagerUser, ConfigError> {
        self.manager()?
            .users
            .iter()
            .find(|x| x.superuser)
            .ok_or(ConfigError::NoSuperuser)
    }

    /// Servers and clients.
    pub fn all_hosts(&self) -> impl Iterator<Item = &HostSpec> {
        self.lustre_servers.iter().chain(self.lustre_clients.iter())
    }

    pub fn non_worker_servers(&self) -> impl Iterator<Item = &HostSpec> {
        self.lustre_servers.iter().filter(|x| !x.is_worker())
    }

    pub fn workers(&self) -> impl Iterator<Item = &HostSpec> {
        self.lustre_servers.iter().filter(|x| x.is_worker())
    }

    pub fn server_by_fqdn(&self, fqdn: &str) -> Result<&HostSpec, ConfigError> {
        self.all_hosts()
            .find(|x| x.fqdn == fqdn)
            .ok_or_else(|| ConfigError::UnknownFqdn(fqdn.to_string()))
    }

    pub fn server_by_address(&self, address: &str) -> Result<&HostSpec, ConfigError> {
        self.all_hosts()
            .find(|x| x.address == address)
            .ok_or_else(|| ConfigError::UnknownAddress(address.to_string()))
    }

    /// Looks a host up by fqdn, address or nodename.
    pub fn find_host(&self, x: &str) -> Option<&HostSpec> {
        self.all_hosts()
            .find(|h| h.fqdn == x || h.address == x || h.nodename == x)
    }

    pub fn vm_host(&self, name: &str) -> Result<&VmHost, ConfigError> {
        self.hosts
            .get(name)
            .ok_or_else(|| ConfigError::UnknownVmHost(name.to_string()))
    }

    /// The vm host owning `spec`.
    pub fn vm_host_for(&self, spec: &HostSpec) -> Result<&VmHost, ConfigError> {
        let name = spec.host.as_deref().ok_or_else(|| ConfigError::MissingField {
            host: spec.fqdn.clone(),
            field: "host",
        })?;

        self.vm_host(name)
    }

    /// Outlets plugged into `fqdn`.
    pub fn outlets_for(&self, fqdn: &str) -> impl Iterator<Item = &OutletSpec> {
        let fqdn = fqdn.to_string();

        self.pdu_outlets
            .iter()
            .filter(move |x| x.host.as_deref() == Some(fqdn.as_str()))
    }

    /// Normalizes a short nodename (as reported by fence agents) to an fqdn.
    pub fn normalize_to_fqdn(&self, name: &str) -> String {
        self.all_hosts()
            .find(|x| x.fqdn == name || x.nodename == name || x.short_name() == name)
            .map(|x| x.fqdn.clone())
            .unwrap_or_else(|| name.to_string())
    }
}
