// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Snapshots of the manager's REST resources.
//!
//! The manager owns every one of these records; the harness only holds copies
//! carrying a `resource_uri` back to the source.

pub mod alert;
pub mod command;
pub mod host;
pub mod power_control;
pub mod target;
pub mod volume;

pub use alert::{Alert, AlertSeverity};
pub use command::{
    CmdWrapper, Command, DependencyJob, DryRun, Job, SendCmd, SendJob, Step, StepState,
};
pub use host::{
    AvailableJob, AvailableTransition, CommandAndHost, CommandAndHostWrapper, Host,
    HostProfileCmdWrapper, HostProfileWrapper, HostProfiles, ProfileTest, ServerProfile,
    TestHostJob, TestHostResult, TestHostStatus,
};
pub use power_control::{Outlet, PowerControlDevice, PowerControlType};
pub use target::{Filesystem, Target, TargetKind, TargetOrUri};
pub use volume::{Volume, VolumeNode};

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

pub trait EndpointName {
    fn endpoint_name() -> &'static str;

    /// The list endpoint, e.g. `/api/host/`
    fn endpoint() -> String {
        format!("/api/{}/", Self::endpoint_name())
    }

    /// The detail endpoint for `id`, e.g. `/api/host/3/`
    fn uri(id: u32) -> String {
        format!("/api/{}/{}/", Self::endpoint_name(), id)
    }
}

/// Given a resource_uri, attempts to parse the id from it
pub fn extract_id(s: &str) -> Option<&str> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^/?api/[^/]+/(\d+)/?$").unwrap();
    }
    let x = RE.captures(s)?;

    x.get(1).map(|x| x.as_str())
}

/// Like `extract_id`, but parsed to a number.
pub fn extract_numeric_id(s: &str) -> Option<u32> {
    extract_id(s).and_then(|x| x.parse().ok())
}

/// Meta is the metadata object returned by a fetch call
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, Default)]
pub struct Meta {
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub total_count: u32,
}

/// ApiList contains the metadata and the `Vec` of objects returned by a fetch call
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug)]
pub struct ApiList<T> {
    #[serde(default)]
    pub meta: Meta,
    pub objects: Vec<T>,
}

/// A bare `{objects: [...]}` body, as used by the bulk POST endpoints.
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug)]
pub struct Objects<T> {
    pub objects: Vec<T>,
}

/// `GET /api/session/`
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, Default)]
pub struct Session {
    #[serde(default)]
    pub user: Option<SessionUser>,
    #[serde(default)]
    pub read_enabled: Option<bool>,
}

#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, PartialEq)]
pub struct SessionUser {
    pub username: String,
    #[serde(default)]
    pub resource_uri: Option<String>,
}

/// The fqdn of a manager host.
#[derive(Eq, PartialEq, Hash, Debug, Clone, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Fqdn(pub String);

impl From<&str> for Fqdn {
    fn from(x: &str) -> Self {
        Self(x.into())
    }
}

impl fmt::Display for Fqdn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
