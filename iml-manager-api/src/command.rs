// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Waiting for manager commands.
//!
//! A command is polled at 1 Hz until `complete`. When the wait times out the
//! command, its jobs and their steps are dumped, and optionally the wait is
//! repeated once to tell a slow manager from a stuck one.

use crate::{query, ApiError, ManagerApi};
use iml_poll::{wait_for_value, WaitError};
use iml_wire_types::{Command, EndpointName, Job, SendCmd, SendJob, Step};
use std::time::Duration;
use tokio::time::Instant;

pub fn format_step(step: &Step) -> String {
    let mut out = format!(
        "    Step {}/{} {}: {}\n      {}\n",
        step.step_index + 1,
        step.step_count,
        step.class_name,
        step.state,
        step.description
    );

    if !step.console.is_empty() {
        out.push_str(&format!("      console:\n{}\n", step.console));
    }

    if let Some(x) = &step.exception {
        out.push_str(&format!("      exception: {}\n", x));
    }

    if !step.backtrace.is_empty() {
        out.push_str(&format!("      backtrace:\n{}\n", step.backtrace));
    }

    out
}

pub fn format_job(job: &Job) -> String {
    format!(
        "  Job {} {} ({}): state={} errored={} cancelled={}\n",
        job.id, job.class_name, job.description, job.state, job.errored, job.cancelled
    )
}

impl ManagerApi {
    pub async fn get_command(&self, id: u32) -> Result<Command, ApiError> {
        Ok(self.client.get_by_uri(&Command::uri(id)).await?)
    }

    /// Describes command `id` with all of its jobs and steps.
    ///
    /// Records that cannot be fetched are noted in the dump rather than
    /// failing it.
    pub async fn command_dump(&self, id: u32) -> String {
        let cmd = match self.get_command(id).await {
            Ok(x) => x,
            Err(e) => return format!("Could not fetch command {}: {}\n", id, e),
        };

        let mut out = format!("{}\n", cmd);

        if let Some(x) = &cmd.logs {
            out.push_str(&format!("  logs: {}\n", x));
        }

        for uri in &cmd.jobs {
            let job: Job = match self.client.get_by_uri(uri).await {
                Ok(x) => x,
                Err(e) => {
                    out.push_str(&format!("  Could not fetch {}: {}\n", uri, e));
                    continue;
                }
            };

            out.push_str(&format_job(&job));

            for uri in &job.steps {
                match self.client.get_by_uri::<Step>(uri).await {
                    Ok(x) => out.push_str(&format_step(&x)),
                    Err(e) => out.push_str(&format!("    Could not fetch {}: {}\n", uri, e)),
                }
            }
        }

        out
    }

    async fn poll_command(&self, id: u32, timeout: Duration) -> Result<Command, ApiError> {
        wait_for_value(|| self.get_command(id), |x| x.complete, timeout).await
    }

    /// Waits up to `timeout` for command `id` to complete.
    ///
    /// With `verify_successful` an errored or cancelled command is an error.
    /// With `test_for_eventual_completion` a timed out command is given one
    /// more `timeout` so the error can say whether it finished late. A
    /// timeout is an error either way.
    pub async fn wait_for_command(
        &self,
        id: u32,
        timeout: Duration,
        verify_successful: bool,
        test_for_eventual_completion: bool,
    ) -> Result<Command, ApiError> {
        tracing::debug!("Waiting up to {:?} for command {}", timeout, id);

        let started = Instant::now();

        let cmd = match self.poll_command(id, timeout).await {
            Ok(x) => x,
            Err(ApiError::WaitError(WaitError::Timeout { .. })) => {
                let waited = started.elapsed();
                let dump = self.command_dump(id).await;

                tracing::error!("Command {} did not complete in {:?}\n{}", id, waited, dump);

                let completed_after = if test_for_eventual_completion {
                    let timed_out = Instant::now();

                    match self.poll_command(id, timeout).await {
                        Ok(_) => {
                            let x = timed_out.elapsed();

                            tracing::error!(
                                "Command {} COMPLETED {} SECONDS AFTER TIMEOUT",
                                id,
                                x.as_secs()
                            );

                            Some(x)
                        }
                        Err(e) => {
                            tracing::error!("Command {} still not complete: {}", id, e);

                            None
                        }
                    }
                } else {
                    None
                };

                return Err(ApiError::CommandTimeout {
                    id,
                    waited,
                    completed_after,
                    dump,
                });
            }
            Err(e) => return Err(e),
        };

        if verify_successful && cmd.failed() {
            let dump = self.command_dump(id).await;

            tracing::error!("Command {} failed\n{}", id, dump);

            return Err(ApiError::CommandFailed { id, dump });
        }

        tracing::debug!("{}", cmd);

        Ok(cmd)
    }

    /// [`Self::wait_for_command`] for every command, in order.
    pub async fn wait_for_commands(
        &self,
        cmds: &[Command],
        timeout: Duration,
        verify_successful: bool,
    ) -> Result<Vec<Command>, ApiError> {
        let mut xs = vec![];

        for cmd in cmds {
            xs.push(
                self.wait_for_command(cmd.id, timeout, verify_successful, true)
                    .await?,
            );
        }

        Ok(xs)
    }

    /// Waits until no command is incomplete.
    ///
    /// With `verify_successful` the most recent command must have succeeded.
    pub async fn wait_last_command_complete(
        &self,
        timeout: Duration,
        verify_successful: bool,
    ) -> Result<(), ApiError> {
        let incomplete = query(&[("complete", "false")]);

        self.wait_for_items_length::<Command>(&incomplete, 0, timeout)
            .await?;

        if !verify_successful {
            return Ok(());
        }

        let last: Vec<Command> = self
            .client
            .get_json::<iml_wire_types::ApiList<Command>>(
                &Command::endpoint(),
                &query(&[("order_by", "-id"), ("limit", "1")]),
            )
            .await?
            .objects;

        match last.first() {
            Some(x) if x.failed() => {
                let dump = self.command_dump(x.id).await;

                tracing::error!("Last command {} failed\n{}", x.id, dump);

                Err(ApiError::CommandFailed { id: x.id, dump })
            }
            _ => Ok(()),
        }
    }

    /// Submits `jobs` as one command and waits for it to succeed.
    pub async fn run_command(
        &self,
        jobs: Vec<SendJob>,
        message: impl Into<String>,
        timeout: Duration,
    ) -> Result<Command, ApiError> {
        let body = SendCmd {
            jobs,
            message: message.into(),
        };

        tracing::info!("Running command: {}", body.message);

        let cmd: Command = self
            .client
            .post(&Command::endpoint(), &body)
            .await?
            .error_for_status()?
            .json()?;

        self.wait_for_command(cmd.id, timeout, true, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{command, fixture, list};
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_step() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": 3,
            "class_name": "MountStep",
            "description": "Mount target",
            "state": "failed",
            "console": "mount: /dev/sdb is busy",
            "exception": "RuntimeError('rc 32')",
            "backtrace": "Traceback ...",
            "step_index": 0,
            "step_count": 2
        }))
        .unwrap();

        assert_eq!(
            format_step(&step),
            "    Step 1/2 MountStep: failed\n      Mount target\n      console:\nmount: /dev/sdb is busy\n      exception: RuntimeError('rc 32')\n      backtrace:\nTraceback ...\n"
        );
    }

    #[tokio::test]
    async fn test_wait_for_completed_command() {
        let mut f = fixture().await;

        f.server
            .mock("GET", "/api/command/7/")
            .with_status(200)
            .with_body(command(7, true, false).to_string())
            .create_async()
            .await;

        let x = f
            .api
            .wait_for_command(7, Duration::from_secs(5), true, false)
            .await
            .unwrap();

        assert!(x.succeeded());
    }

    #[tokio::test]
    async fn test_failed_command_is_dumped() {
        let mut f = fixture().await;

        let mut cmd = command(7, true, true);
        cmd["jobs"] = serde_json::json!(["/api/job/11/"]);

        f.server
            .mock("GET", "/api/command/7/")
            .with_status(200)
            .with_body(cmd.to_string())
            .create_async()
            .await;

        f.server
            .mock("GET", "/api/job/11/")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": 11,
                    "class_name": "StartTargetJob",
                    "description": "Start target testfs-MDT0000",
                    "state": "complete",
                    "errored": true,
                    "steps": ["/api/step/21/"]
                })
                .to_string(),
            )
            .create_async()
            .await;

        f.server
            .mock("GET", "/api/step/21/")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": 21,
                    "class_name": "MountStep",
                    "state": "failed",
                    "console": "mount failed",
                    "step_index": 0,
                    "step_count": 1
                })
                .to_string(),
            )
            .create_async()
            .await;

        let e = f
            .api
            .wait_for_command(7, Duration::from_secs(5), true, false)
            .await
            .unwrap_err();

        match e {
            ApiError::CommandFailed { id, dump } => {
                assert_eq!(id, 7);
                assert!(dump.contains("Job 11 StartTargetJob"));
                assert!(dump.contains("mount failed"));
            }
            x => panic!("unexpected {:?}", x),
        }
    }

    #[tokio::test]
    async fn test_failed_command_without_verify() {
        let mut f = fixture().await;

        f.server
            .mock("GET", "/api/command/7/")
            .with_status(200)
            .with_body(command(7, true, true).to_string())
            .create_async()
            .await;

        let x = f
            .api
            .wait_for_command(7, Duration::from_secs(5), false, false)
            .await
            .unwrap();

        assert!(x.failed());
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let mut f = fixture().await;

        f.server
            .mock("GET", "/api/command/7/")
            .with_status(200)
            .with_body(command(7, false, false).to_string())
            .create_async()
            .await;

        let e = f
            .api
            .wait_for_command(7, Duration::from_secs(1), true, true)
            .await
            .unwrap_err();

        match e {
            ApiError::CommandTimeout {
                id,
                completed_after,
                dump,
                ..
            } => {
                assert_eq!(id, 7);
                assert_eq!(completed_after, None);
                assert!(dump.starts_with("Command 7 (command 7): complete=false"));
            }
            x => panic!("unexpected {:?}", x),
        }
    }

    #[tokio::test]
    async fn test_wait_last_command_complete() {
        let mut f = fixture().await;

        f.server
            .mock("GET", "/api/command/")
            .match_query(Matcher::UrlEncoded("complete".into(), "false".into()))
            .with_status(200)
            .with_body(list(serde_json::json!([])))
            .create_async()
            .await;

        f.server
            .mock("GET", "/api/command/")
            .match_query(Matcher::UrlEncoded("order_by".into(), "-id".into()))
            .with_status(200)
            .with_body(list(serde_json::json!([command(9, true, true)])))
            .create_async()
            .await;

        f.server
            .mock("GET", "/api/command/9/")
            .with_status(200)
            .with_body(command(9, true, true).to_string())
            .create_async()
            .await;

        f.api
            .wait_last_command_complete(Duration::from_secs(5), false)
            .await
            .unwrap();

        let e = f
            .api
            .wait_last_command_complete(Duration::from_secs(5), true)
            .await
            .unwrap_err();

        assert!(matches!(e, ApiError::CommandFailed { id: 9, .. }));
    }

    #[tokio::test]
    async fn test_run_command() {
        let mut f = fixture().await;

        let post = f
            .server
            .mock("POST", "/api/command/")
            .match_body(Matcher::Json(serde_json::json!({
                "jobs": [{"class_name": "ForceRemoveHostJob", "args": {"host_id": 3}}],
                "message": "Force remove lustre0"
            })))
            .with_status(201)
            .with_body(command(12, false, false).to_string())
            .create_async()
            .await;

        f.server
            .mock("GET", "/api/command/12/")
            .with_status(200)
            .with_body(command(12, true, false).to_string())
            .create_async()
            .await;

        let x = f
            .api
            .run_command(
                vec![SendJob::new(
                    "ForceRemoveHostJob",
                    serde_json::json!({"host_id": 3}),
                )],
                "Force remove lustre0",
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(x.id, 12);

        post.assert_async().await;
    }
}
