// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::EndpointName;

/// A record from `/api/power_control_type/`
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct PowerControlType {
    pub id: u32,
    pub agent: String,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub default_username: Option<String>,
    #[serde(default)]
    pub default_password: Option<String>,
    #[serde(default)]
    pub max_outlets: Option<u32>,
    #[serde(default)]
    pub default_port: Option<u16>,
    pub resource_uri: String,
}

impl EndpointName for PowerControlType {
    fn endpoint_name() -> &'static str {
        "power_control_type"
    }
}

/// A record from `/api/power_control_device/`
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct PowerControlDevice {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub device_type: String,
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    /// Resource uris of the outlets on this device.
    #[serde(default)]
    pub outlets: Vec<Outlet>,
    pub resource_uri: String,
}

impl EndpointName for PowerControlDevice {
    fn endpoint_name() -> &'static str {
        "power_control_device"
    }
}

/// A record from `/api/power_control_device_outlet/`
///
/// An outlet is bound to at most one host.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Outlet {
    pub id: u32,
    pub identifier: String,
    pub device: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub has_power: Option<bool>,
    pub resource_uri: String,
}

impl EndpointName for Outlet {
    fn endpoint_name() -> &'static str {
        "power_control_device_outlet"
    }
}
