// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::EndpointName;
use std::fmt;

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlertSeverity {
    INFO,
    DEBUG,
    CRITICAL,
    WARNING,
    ERROR,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let x = match self {
            AlertSeverity::INFO => "INFO",
            AlertSeverity::DEBUG => "DEBUG",
            AlertSeverity::CRITICAL => "CRITICAL",
            AlertSeverity::WARNING => "WARNING",
            AlertSeverity::ERROR => "ERROR",
        };

        write!(f, "{}", x)
    }
}

/// An Alert record from /api/alert/
///
/// `alert_type` is kept as a string; the manager adds and retires alert
/// classes between releases.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Alert {
    pub id: u32,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub alert_item: String,
    #[serde(default)]
    pub alert_item_id: Option<i32>,
    #[serde(default)]
    pub alert_item_str: String,
    pub alert_type: String,
    #[serde(default)]
    pub begin: String,
    #[serde(default)]
    pub dismissed: bool,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub record_type: Option<String>,
    #[serde(default)]
    pub resource_uri: String,
    pub severity: AlertSeverity,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.active == Some(true)
    }
}

impl EndpointName for Alert {
    fn endpoint_name() -> &'static str {
        "alert"
    }
}
