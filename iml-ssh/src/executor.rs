// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{
    client::{connect, Auth},
    config::SshConfig,
    ImlSshError, RemoteExecutor, RunOptions, RunResult, RC_CONNECTION_LOST,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};

/// Escapes `s` for use inside a double quoted shell string.
pub fn escape_double_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }

        out.push(c);
    }

    out
}

/// Builds the command line that is actually sent to the remote shell.
///
/// The command runs under `set -e`. Without stdin the remote side's stdin is
/// closed so nothing blocks reading from it. A non-root login gets the
/// command wrapped in `sudo sh -c`.
pub fn wrap_command(command: &str, has_stdin: bool, sudo: bool) -> String {
    let cmd = format!("set -e; {}", command);

    let cmd = if sudo {
        format!("sudo sh -c \"{}\"", escape_double_quoted(&cmd))
    } else {
        cmd
    };

    if has_stdin {
        cmd
    } else {
        format!("exec 0<&-; {}", cmd)
    }
}

/// Runs commands over a fresh SSH connection per call.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: Arc<SshConfig>,
    default_user: String,
    password: Option<String>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            config: Arc::new(SshConfig::default()),
            default_user: "root".into(),
            password: None,
        }
    }
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..Default::default()
        }
    }

    /// Reads the file named by `SSH_CONFIG`, if set.
    pub async fn from_env() -> Result<Self, ImlSshError> {
        match iml_test_env::get_ssh_config() {
            Some(path) => {
                tracing::debug!("Using ssh config {}", path.display());

                Ok(Self::new(SshConfig::from_file(path).await?))
            }
            None => Ok(Self::default()),
        }
    }

    /// The login user when the ssh config does not name one.
    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = user.into();
        self
    }

    /// Authenticate with a password instead of keys.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    fn auth_for(&self, identity_file: Option<std::path::PathBuf>) -> Auth {
        if let Some(password) = &self.password {
            return Auth::Password(password.clone());
        }

        match identity_file {
            Some(key_path) => Auth::Key {
                key_path,
                password: None,
            },
            None if std::env::var_os("SSH_AUTH_SOCK").is_some() => Auth::Agent,
            None => Auth::Auto,
        }
    }

    async fn exec(
        &self,
        address: &str,
        command: &str,
        opts: &RunOptions,
        deadline: Instant,
        out: &mut Output,
    ) -> Result<(), ImlSshError> {
        let host_cfg = self.config.lookup(address);

        let hostname = host_cfg.hostname.as_deref().unwrap_or(address);
        let user = host_cfg
            .user
            .clone()
            .unwrap_or_else(|| self.default_user.clone());

        let auth = self.auth_for(host_cfg.identity_file.clone());

        let mut session = connect(hostname, host_cfg.port, &user, auth).await?;

        let sudo = opts.as_root && user != "root";
        let wrapped = wrap_command(command, opts.stdin.is_some(), sudo);

        tracing::debug!("{}: {}", address, wrapped);

        let mut channel = session.channel_open_session().await?;

        channel.exec(true, wrapped).await?;

        if let Some(stdin) = &opts.stdin {
            channel.data(&stdin[..]).await?;
            channel.eof().await?;
        }

        loop {
            let msg = match timeout_at(deadline, channel.wait()).await {
                Ok(Some(x)) => x,
                Ok(None) => break,
                Err(_) => {
                    out.timed_out = true;
                    break;
                }
            };

            match msg {
                thrussh::ChannelMsg::Data { ref data } if opts.buffer_output => {
                    data.write_all_from(0, &mut out.stdout)?;
                }
                thrussh::ChannelMsg::ExtendedData { ref data, ext } if opts.buffer_output => {
                    if ext == 1 {
                        data.write_all_from(0, &mut out.stderr)?;
                    }
                }
                thrussh::ChannelMsg::Data { ref data }
                | thrussh::ChannelMsg::ExtendedData { ref data, .. } => {
                    tracing::info!("{}: {}", address, String::from_utf8_lossy(data).trim_end());
                }
                thrussh::ChannelMsg::ExitStatus { exit_status } => {
                    out.exit_status = Some(exit_status);
                }
                x => {
                    tracing::trace!("Got ssh ChannelMsg {:?}", x);
                }
            }
        }

        Ok(())
    }
}

#[derive(Default)]
struct Output {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    timed_out: bool,
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[tracing::instrument(skip(self, opts), fields(timeout = ?opts.timeout))]
    async fn run(
        &self,
        address: &str,
        command: &str,
        opts: RunOptions,
    ) -> Result<RunResult, ImlSshError> {
        let deadline = Instant::now() + opts.timeout;

        let mut out = Output::default();

        match timeout_at(deadline, self.exec(address, command, &opts, deadline, &mut out)).await {
            Ok(r) => r?,
            Err(_) => out.timed_out = true,
        };

        let result = RunResult {
            rc: out
                .exit_status
                .map(|x| x as i32)
                .unwrap_or(RC_CONNECTION_LOST),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            timed_out: out.timed_out,
        };

        tracing::debug!(
            "{}: rc={} stdout={:?} stderr={:?}",
            address,
            result.rc,
            result.stdout,
            result.stderr
        );

        if result.timed_out && opts.expected_rc.is_some() {
            return Err(ImlSshError::Timeout {
                address: address.to_string(),
                command: command.to_string(),
                timeout: opts.timeout,
            });
        }

        result.check(address, command, opts.expected_rc)
    }
}
