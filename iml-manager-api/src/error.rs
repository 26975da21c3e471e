// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use iml_manager_client::ImlManagerClientError;
use iml_poll::WaitError;
use iml_remote_ops::RemoteOpsError;
use iml_test_config::ConfigError;
use std::time::Duration;

fn completed_after(x: &Option<Duration>) -> String {
    match x {
        Some(x) => format!(" (COMPLETED {} SECONDS AFTER TIMEOUT)", x.as_secs()),
        None => String::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    ImlManagerClientError(#[from] ImlManagerClientError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
    #[error(transparent)]
    RemoteOpsError(#[from] RemoteOpsError),
    #[error(transparent)]
    WaitError(#[from] WaitError),
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Command {id} failed\n{dump}")]
    CommandFailed { id: u32, dump: String },
    #[error("Timed out after {waited:?} waiting for command {id}{}\n{dump}", self::completed_after(.completed_after))]
    CommandTimeout {
        id: u32,
        waited: Duration,
        completed_after: Option<Duration>,
        dump: String,
    },
    #[error("{uri}: expected {field} to be {expected}, found {found}")]
    StateMismatch {
        uri: String,
        field: String,
        expected: String,
        found: String,
    },
    #[error("Invariant violated: {0}")]
    Invariant(String),
    #[error("Assertion failed: {0}")]
    Assert(String),
}

impl ApiError {
    pub fn assert(msg: impl Into<String>) -> Self {
        ApiError::Assert(msg.into())
    }

    /// The HTTP status of a refused request, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::ImlManagerClientError(e) => e.status(),
            _ => None,
        }
    }

    fn body(&self) -> Option<&str> {
        match self {
            ApiError::ImlManagerClientError(e) => e.body(),
            _ => None,
        }
    }

    /// Whether the manager refused a state change to `removed` with a 400.
    ///
    /// MDT0 answers a removal this way, as it cannot be deleted on its own.
    pub fn is_invalid_state_refusal(&self) -> bool {
        if self.status() != Some(400) {
            return false;
        }

        let body: serde_json::Value = match self.body().map(serde_json::from_str) {
            Some(Ok(x)) => x,
            _ => return false,
        };

        body.get("state")
            .map(|x| x.to_string().contains("removed"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refusal(status: u16, body: &str) -> ApiError {
        ImlManagerClientError::Status {
            method: "PUT".into(),
            url: "/api/target/2/".into(),
            status,
            body: body.into(),
        }
        .into()
    }

    #[test]
    fn test_is_invalid_state_refusal() {
        assert!(refusal(
            400,
            r#"{"state": ["Cannot transition from mounted to removed"]}"#
        )
        .is_invalid_state_refusal());

        assert!(!refusal(400, r#"{"name": ["removed"]}"#).is_invalid_state_refusal());
        assert!(!refusal(500, r#"{"state": ["removed"]}"#).is_invalid_state_refusal());
        assert!(!refusal(400, "not json").is_invalid_state_refusal());
    }

    #[test]
    fn test_timeout_message() {
        let e = ApiError::CommandTimeout {
            id: 7,
            waited: Duration::from_secs(600),
            completed_after: Some(Duration::from_secs(42)),
            dump: "dump".into(),
        };

        assert_eq!(
            e.to_string(),
            "Timed out after 600s waiting for command 7 (COMPLETED 42 SECONDS AFTER TIMEOUT)\ndump"
        );
    }
}
