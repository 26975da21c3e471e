// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{ApiError, ManagerApi};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, path::Path};

const CONFIGURATION_ENDPOINT: &str = "/api/configuration/";

/// Fields tried, in order, to name an object within a section.
const IDENTITY_FIELDS: &[&str] = &["fqdn", "name", "label", "address", "resource_uri"];

/// The manager's own export of everything it manages.
///
/// Sections the harness does not look at are kept verbatim so a dump can be
/// loaded back without loss.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ConfigurationDump {
    #[serde(default)]
    pub hosts: Vec<serde_json::Value>,
    #[serde(default)]
    pub filesystems: Vec<serde_json::Value>,
    #[serde(default)]
    pub targets: Vec<serde_json::Value>,
    #[serde(default)]
    pub volumes: Vec<serde_json::Value>,
    #[serde(default)]
    pub power_control_devices: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

fn identity(x: &serde_json::Value) -> String {
    IDENTITY_FIELDS
        .iter()
        .find_map(|k| x.get(*k).and_then(|v| v.as_str()))
        .map(String::from)
        .unwrap_or_else(|| x.to_string())
}

fn section_differences(
    section: &str,
    ours: &[serde_json::Value],
    theirs: &[serde_json::Value],
) -> Vec<String> {
    let ours: BTreeSet<String> = ours.iter().map(identity).collect();
    let theirs: BTreeSet<String> = theirs.iter().map(identity).collect();

    let missing = theirs
        .difference(&ours)
        .map(|x| format!("{}: missing {}", section, x));

    let extra = ours
        .difference(&theirs)
        .map(|x| format!("{}: unexpected {}", section, x));

    missing.chain(extra).collect()
}

impl ConfigurationDump {
    fn sections(&self) -> [(&'static str, &[serde_json::Value]); 5] {
        [
            ("hosts", self.hosts.as_slice()),
            ("filesystems", self.filesystems.as_slice()),
            ("targets", self.targets.as_slice()),
            ("volumes", self.volumes.as_slice()),
            ("power_control_devices", self.power_control_devices.as_slice()),
        ]
    }

    /// Objects present in `expected` but not here, and the reverse, named
    /// by section.
    pub fn differences(&self, expected: &ConfigurationDump) -> Vec<String> {
        self.sections()
            .iter()
            .zip(expected.sections().iter())
            .flat_map(|((section, ours), (_, theirs))| section_differences(section, ours, theirs))
            .collect()
    }

    pub async fn read(path: &Path) -> Result<Self, ApiError> {
        let s = tokio::fs::read_to_string(path).await?;

        Ok(serde_json::from_str(&s)?)
    }

    pub async fn write(&self, path: &Path) -> Result<(), ApiError> {
        let s = serde_json::to_string_pretty(self)?;

        tokio::fs::write(path, s).await?;

        Ok(())
    }
}

impl ManagerApi {
    /// Exports the manager's configuration, also writing it to `path` when
    /// given.
    pub async fn dump_configuration(
        &self,
        path: Option<&Path>,
    ) -> Result<ConfigurationDump, ApiError> {
        let x: ConfigurationDump = self
            .client
            .get_json(CONFIGURATION_ENDPOINT, &[])
            .await?;

        if let Some(path) = path {
            tracing::info!("Writing manager configuration to {}", path.display());

            x.write(path).await?;
        }

        Ok(x)
    }

    /// Imports a dump previously taken with [`Self::dump_configuration`].
    pub async fn load_configuration(&self, dump: &ConfigurationDump) -> Result<(), ApiError> {
        let resp = self.client.post(CONFIGURATION_ENDPOINT, dump).await?;

        if let Some(cmd) = Self::started_command(resp)? {
            self.wait_for_command(
                cmd.id,
                iml_test_config::timeouts::LONG_TEST_TIMEOUT,
                true,
                false,
            )
            .await?;
        }

        Ok(())
    }
}
