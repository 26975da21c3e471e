// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Pausing a failed run so a person can look at the cluster.
//!
//! When a guarded check fails for the first time, an email draft is written
//! to a marker file and piped to `sendmail -t`. The run then waits until
//! someone deletes the marker file (or the timeout passes) before the
//! failure is returned.

use futures::Future;
use iml_poll::wait_until_true;
use lazy_static::lazy_static;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{fs, io::AsyncWriteExt, process::Command};

pub const WAITING_HELP_PATH: &str = "/tmp/waiting_help";

pub const HELP_TIMEOUT: Duration = Duration::from_secs(1800);

lazy_static! {
    static ref HELP_REQUESTED: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Records `key`, returning `false` if help was already requested for it.
fn first_request(key: &str) -> bool {
    let mut xs = HELP_REQUESTED.lock().unwrap_or_else(|e| e.into_inner());

    xs.insert(key.to_string())
}

async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

/// Called with the key and message of every help request before waiting.
pub type HelpCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone)]
pub struct HelpGate {
    recipients: Vec<String>,
    path: PathBuf,
    timeout: Duration,
    callback: Option<HelpCallback>,
}

impl std::fmt::Debug for HelpGate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HelpGate")
            .field("recipients", &self.recipients)
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl HelpGate {
    /// A gate mailing `recipients`. `None` when there is nobody to ask.
    pub fn new(recipients: &[String]) -> Option<Self> {
        if recipients.is_empty() {
            return None;
        }

        Some(Self {
            recipients: recipients.to_vec(),
            path: PathBuf::from(WAITING_HELP_PATH),
            timeout: HELP_TIMEOUT,
            callback: None,
        })
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_callback(mut self, callback: HelpCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn email_draft(&self, key: &str, message: &str) -> String {
        format!(
            "To: {}\nSubject: Help requested for {}\n\n{}\n\nRemove {} to continue the run.\n",
            self.recipients.join(", "),
            key,
            message,
            self.path.display()
        )
    }

    async fn send(&self, draft: &str) -> Result<(), std::io::Error> {
        let mut child = Command::new("sendmail")
            .arg("-t")
            .stdin(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(draft.as_bytes()).await?;
        }

        let status = child.wait().await?;

        if !status.success() {
            tracing::warn!("sendmail exited with {}", status);
        }

        Ok(())
    }

    async fn request_help(&self, key: &str, message: &str) -> Result<(), std::io::Error> {
        let draft = self.email_draft(key, message);

        fs::write(&self.path, &draft).await?;

        if let Err(e) = self.send(&draft).await {
            tracing::warn!("Could not send help request for {}: {}", key, e);
        }

        if let Some(f) = &self.callback {
            f(key, message);
        }

        tracing::info!(
            "Waiting up to {:?} for {} to be removed",
            self.timeout,
            self.path.display()
        );

        let path = self.path.as_path();

        let r = wait_until_true(
            || async move { !exists(path).await },
            || format!("Nobody answered the help request for {}", key),
            self.timeout,
        )
        .await;

        if let Err(e) = r {
            tracing::warn!("{}", e);
        }

        Ok(())
    }

    /// Runs `f`. On its first failure for `key` in this process, asks for
    /// help and waits before returning the failure.
    pub async fn fetch_help<T, E, F, Fut>(&self, key: &str, message: &str, f: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let e = match f().await {
            Ok(x) => return Ok(x),
            Err(e) => e,
        };

        if !first_request(key) {
            return Err(e);
        }

        let message = format!("{}\n\n{}", message, e);

        if let Err(io) = self.request_help(key, &message).await {
            tracing::warn!("Could not request help for {}: {}", key, io);
        }

        Err(e)
    }
}
