// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{Command, EndpointName};
use std::collections::HashMap;

/// A job the manager advertises as runnable on an object.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct AvailableJob {
    #[serde(default)]
    pub args: serde_json::Value,
    pub class_name: String,
    #[serde(default)]
    pub confirmation: Option<String>,
    #[serde(default)]
    pub verb: String,
}

/// A state the manager advertises as reachable from the current one.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct AvailableTransition {
    pub state: String,
    #[serde(default)]
    pub verb: String,
}

/// A Host record from `/api/host/`
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Host {
    pub id: u32,
    pub fqdn: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub nodename: String,
    pub state: String,
    #[serde(default)]
    pub lnet_configuration: Option<String>,
    #[serde(default)]
    pub pacemaker_configuration: Option<String>,
    #[serde(default)]
    pub corosync_configuration: Option<String>,
    #[serde(default)]
    pub server_profile: Option<ServerProfile>,
    #[serde(default)]
    pub available_jobs: Vec<AvailableJob>,
    #[serde(default)]
    pub available_transitions: Vec<AvailableTransition>,
    #[serde(default)]
    pub available_actions: Vec<serde_json::Value>,
    #[serde(default)]
    pub immutable_state: bool,
    #[serde(default)]
    pub boot_time: Option<String>,
    #[serde(default)]
    pub needs_update: bool,
    #[serde(default)]
    pub nids: Option<Vec<String>>,
    pub resource_uri: String,
}

impl Host {
    pub fn has_available_job(&self, class_name: &str) -> bool {
        self.available_jobs.iter().any(|x| x.class_name == class_name)
    }
}

impl EndpointName for Host {
    fn endpoint_name() -> &'static str {
        "host"
    }
}

/// A server profile record from api/server_profile/
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct ServerProfile {
    pub name: String,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub worker: bool,
    #[serde(default)]
    pub user_selectable: bool,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub initial_state: String,
    #[serde(default)]
    pub ui_name: String,
    #[serde(default)]
    pub resource_uri: String,
}

impl EndpointName for ServerProfile {
    fn endpoint_name() -> &'static str {
        "server_profile"
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct TestHostStatus {
    pub name: String,
    pub value: bool,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct TestHostResult {
    pub address: String,
    #[serde(default)]
    pub status: Vec<TestHostStatus>,
    #[serde(default)]
    pub valid: bool,
}

impl TestHostResult {
    /// Names of the checks that did not pass.
    pub fn failed_checks(&self) -> Vec<&str> {
        self.status
            .iter()
            .filter(|x| !x.value)
            .map(|x| x.name.as_str())
            .collect()
    }
}

/// A test host job, fetched through `/api/job/` once its command completes.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct TestHostJob {
    #[serde(default)]
    pub step_results: HashMap<String, TestHostResult>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct ProfileTest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error: String,
    pub pass: bool,
    #[serde(default)]
    pub test: String,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct HostProfiles {
    pub host: u32,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub profiles: HashMap<String, Vec<ProfileTest>>,
}

impl HostProfiles {
    /// Profiles whose every validation passes.
    pub fn passing(&self) -> impl Iterator<Item = &str> {
        self.profiles
            .iter()
            .filter(|(_, tests)| tests.iter().all(|x| x.pass))
            .map(|(name, _)| name.as_str())
    }
}

/// A record from `/api/host_profile/`
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct HostProfileWrapper {
    #[serde(default)]
    pub host_profiles: Option<HostProfiles>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl EndpointName for HostProfileWrapper {
    fn endpoint_name() -> &'static str {
        "host_profile"
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommandAndHost {
    pub command: Command,
    pub host: Host,
}

/// The body returned by `POST /api/host/`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommandAndHostWrapper {
    #[serde(default)]
    pub command_and_host: Option<CommandAndHost>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
}

/// One element of the body returned by `POST /api/host_profile/`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HostProfileCmdWrapper {
    #[serde(default)]
    pub commands: Vec<Command>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_host_profile_passing() {
        let x: HostProfileWrapper = serde_json::from_str(
            r#"{
                "host_profiles": {
                    "host": 4,
                    "address": "lustre0.example.com",
                    "profiles": {
                        "base_managed_rh7": [
                            {"description": "ok", "error": "", "pass": true, "test": "zfs_installed == False"}
                        ],
                        "base_monitored": [
                            {"description": "nope", "error": "", "pass": false, "test": "managed == False"}
                        ]
                    }
                },
                "error": null,
                "traceback": null
            }"#,
        )
        .unwrap();

        let profiles = x.host_profiles.unwrap();
        let passing: Vec<_> = profiles.passing().collect();

        assert_eq!(passing, vec!["base_managed_rh7"]);
    }

    #[test]
    fn test_failed_checks() {
        let x: TestHostJob = serde_json::from_str(
            r#"{"step_results": {"/api/step/1/": {
                "address": "lustre0",
                "valid": false,
                "status": [
                    {"name": "resolve", "value": true},
                    {"name": "ping", "value": false}
                ]
            }}}"#,
        )
        .unwrap();

        let r = x.step_results.values().next().unwrap();

        assert_eq!(r.failed_checks(), vec!["ping"]);
    }
}
