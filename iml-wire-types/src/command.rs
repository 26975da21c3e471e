// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::EndpointName;
use std::fmt;

/// A Command record from `/api/command/`.
///
/// Once `complete` is observed `true` it never goes back to `false`.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct Command {
    pub id: u32,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub errored: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Resource uris of the jobs belonging to this command.
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub resource_uri: String,
}

impl Command {
    pub fn failed(&self) -> bool {
        self.errored || self.cancelled
    }

    pub fn succeeded(&self) -> bool {
        self.complete && !self.failed()
    }
}

impl EndpointName for Command {
    fn endpoint_name() -> &'static str {
        "command"
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Command {} ({}): complete={} errored={} cancelled={}",
            self.id, self.message, self.complete, self.errored, self.cancelled
        )
    }
}

/// A mutating call that starts asynchronous work answers with one of these.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct CmdWrapper {
    pub command: Command,
}

/// A Job record from `/api/job/`
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Job {
    pub id: u32,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub errored: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub modified_at: Option<String>,
    /// Resource uris of the ordered steps of this job.
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub wait_for: Vec<String>,
    #[serde(default)]
    pub resource_uri: String,
}

impl EndpointName for Job {
    fn endpoint_name() -> &'static str {
        "job"
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Incomplete,
    Failed,
    Success,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let x = match self {
            StepState::Incomplete => "incomplete",
            StepState::Failed => "failed",
            StepState::Success => "success",
        };

        write!(f, "{}", x)
    }
}

/// A Step record from `/api/step/`
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Step {
    pub id: u32,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub description: String,
    pub state: StepState,
    #[serde(default)]
    pub console: String,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub backtrace: String,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub step_index: u32,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default)]
    pub resource_uri: String,
}

impl EndpointName for Step {
    fn endpoint_name() -> &'static str {
        "step"
    }
}

/// One job of a command submitted to `POST /api/command/`.
///
/// `class_name` is deliberately an open string; the manager decides which
/// job classes exist.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct SendJob<T = serde_json::Value> {
    pub class_name: String,
    pub args: T,
}

impl SendJob {
    pub fn new(class_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            class_name: class_name.into(),
            args,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct SendCmd<T = serde_json::Value> {
    pub jobs: Vec<SendJob<T>>,
    pub message: String,
}

/// A job the manager would run, as reported by a dry run state change.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct DependencyJob {
    pub class: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub confirmation_prompt: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The body returned by a `dry_run=true` state change.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
pub struct DryRun {
    #[serde(default)]
    pub dependency_jobs: Vec<DependencyJob>,
    #[serde(default)]
    pub transition_job: Option<DependencyJob>,
}

impl DryRun {
    /// Class names of every job the transition depends on.
    pub fn dependency_classes(&self) -> Vec<&str> {
        self.dependency_jobs.iter().map(|x| x.class.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_deserialize() {
        let cmd: Command = serde_json::from_str(
            r#"{
                "id": 10,
                "cancelled": false,
                "complete": true,
                "errored": true,
                "created_at": "2021-01-01T00:00:00",
                "jobs": ["/api/job/4/"],
                "logs": "",
                "message": "Stopping filesystem",
                "resource_uri": "/api/command/10/"
            }"#,
        )
        .unwrap();

        assert!(cmd.failed());
        assert!(!cmd.succeeded());
        assert_eq!(cmd.jobs, vec!["/api/job/4/".to_string()]);
    }

    #[test]
    fn test_dry_run_classes() {
        let x: DryRun = serde_json::from_str(
            r#"{"dependency_jobs": [
                {"class": "StopTargetJob", "requires_confirmation": true},
                {"class": "StopPacemakerJob", "requires_confirmation": false}
            ]}"#,
        )
        .unwrap();

        assert_eq!(
            x.dependency_classes(),
            vec!["StopTargetJob", "StopPacemakerJob"]
        );
    }

    #[test]
    fn test_send_cmd_serialize() {
        let cmd = SendCmd {
            jobs: vec![SendJob::new(
                "ForceRemoveHostJob",
                serde_json::json!({"host_id": 1}),
            )],
            message: "Force removing host".into(),
        };

        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            serde_json::json!({
                "jobs": [{"class_name": "ForceRemoveHostJob", "args": {"host_id": 1}}],
                "message": "Force removing host"
            })
        );
    }
}
