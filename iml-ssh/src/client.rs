// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{ClientError, ImlSshError};
use futures::{stream, TryStreamExt};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thrussh::client::{self, Handle};

/// Various ways to Authenticate the SSH client
#[derive(Debug, Clone)]
pub enum Auth {
    /// Use the ssh-agent if one is available.
    Agent,
    /// Use password based authentication
    Password(String),
    /// Use a given private key with optional passphrase
    Key {
        key_path: PathBuf,
        password: Option<String>,
    },
    /// Try the default keys in `~/.ssh/`
    Auto,
}

/// Connect to `host` on `port` as `user`, authenticating with `auth`.
pub async fn connect(
    host: impl ToString,
    port: impl Into<Option<u16>>,
    user: impl ToString,
    auth: Auth,
) -> Result<Handle<Client>, ImlSshError> {
    let cfg = client::Config {
        connection_timeout: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    let cfg = Arc::new(cfg);

    let port = port.into();

    let host = host.to_string();

    let user = user.to_string();

    let address = format!("{}:{}", &host, port.unwrap_or(22));

    let sh = Client {
        host: host.clone(),
        port,
    };

    let mut session: Handle<Client> = client::connect(cfg, address, sh).await?;

    let authed = match auth {
        Auth::Password(password) => session.authenticate_password(&user, password).await?,
        Auth::Key { key_path, password } => {
            let password = password.as_deref();

            let keypair = thrussh_keys::load_secret_key(key_path, password)?;

            session
                .authenticate_publickey(&user, Arc::new(keypair))
                .await?
        }
        Auth::Agent => {
            let mut agent = thrussh_keys::agent::client::AgentClient::connect_env().await?;

            let identities = agent.request_identities().await?;

            let (_, s, x) = stream::iter(identities.into_iter().map(Ok::<_, ImlSshError>))
                .try_fold((agent, session, false), |(agent, mut session, authed), x| {
                    let user = &user;
                    let host = &host;

                    async move {
                        if authed {
                            return Ok((agent, session, authed));
                        }

                        let (agent, authed) = session.authenticate_future(user, x, agent).await;
                        let authed =
                            authed.map_err(|_| ImlSshError::AuthenticationFailed(host.clone()))?;

                        Ok((agent, session, authed))
                    }
                })
                .await?;

            session = s;

            x
        }
        Auth::Auto => {
            let dir = dirs::home_dir()
                .map(|x| x.join(".ssh"))
                .ok_or(ImlSshError::NoHomeDir)?;

            let mut authed = false;

            for k in &["id_rsa", "id_ed25519"] {
                let k = dir.join(k);

                if tokio::fs::metadata(&k).await.is_err() {
                    continue;
                }

                let keypair = thrussh_keys::load_secret_key(k, None)?;

                authed = session
                    .authenticate_publickey(&user, Arc::new(keypair))
                    .await?;

                if authed {
                    break;
                }
            }

            authed
        }
    };

    if authed {
        Ok(session)
    } else {
        Err(ImlSshError::AuthenticationFailed(host))
    }
}

pub struct Client {
    pub host: String,
    pub port: Option<u16>,
}

impl client::Handler for Client {
    type Error = ClientError;
    type FutureUnit = futures::future::Ready<Result<(Self, client::Session), Self::Error>>;
    type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }
    fn finished(self, session: client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }
    fn check_server_key(
        self,
        server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        let r =
            thrussh_keys::check_known_hosts(&self.host, self.port.unwrap_or(22), server_public_key);

        match r {
            Ok(true) => self.finished_bool(true),
            Ok(false) => {
                tracing::debug!("Server key for {} not found in known_hosts", &self.host);

                self.finished_bool(true)
            }
            Err(thrussh_keys::Error::KeyChanged { line: x }) => {
                tracing::error!(
                    "Server Key for host: {} has changed on line {} of known_hosts file",
                    &self.host,
                    x
                );

                self.finished_bool(false)
            }
            Err(e) => {
                tracing::debug!("Could not check server key for {}: {:?}", &self.host, e);

                self.finished_bool(true)
            }
        }
    }
}
