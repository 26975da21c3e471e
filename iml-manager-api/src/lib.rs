// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Typed verbs against the manager's REST API.
//!
//! Most mutations on the manager start a Command and return before it has
//! run. Every verb here that mutates waits for that command using the
//! protocol in [`command`], so callers observe a settled manager.

pub mod alerts;
pub mod command;
mod configuration;
mod error;
pub mod filesystem;
pub mod hosts;
mod power;
pub mod state;
pub mod volumes;

pub use alerts::AlertFilter;
pub use configuration::ConfigurationDump;
pub use error::ApiError;
pub use filesystem::{NewFilesystem, NewTarget};
pub use hosts::AuthType;
pub use state::VerifyValue;

use iml_manager_client::{ApiResponse, ManagerClient, StatusCode};
use iml_remote_ops::RemoteOperations;
use iml_test_config::ClusterConfig;
use iml_wire_types::{Command, EndpointName};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Turns `&[("k", "v")]` into the owned query shape the client takes.
pub(crate) fn query<'a>(xs: &[(&'a str, &str)]) -> Vec<(&'a str, String)> {
    xs.iter().map(|(k, v)| (*k, v.to_string())).collect()
}

#[derive(Clone)]
pub struct ManagerApi {
    client: ManagerClient,
    ops: RemoteOperations,
}

impl std::fmt::Debug for ManagerApi {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ManagerApi")
            .field("client", &self.client)
            .finish()
    }
}

impl ManagerApi {
    pub fn new(client: ManagerClient, ops: RemoteOperations) -> Self {
        Self { client, ops }
    }

    /// Builds a client for the configured manager and logs in as its
    /// superuser.
    pub async fn connect(ops: RemoteOperations) -> Result<Self, ApiError> {
        let manager = ops.config().manager()?;
        let user = ops.config().superuser()?;

        let client = ManagerClient::new(&manager.server_http_url)?;

        client.login(&user.username, &user.password).await?;

        Ok(Self::new(client, ops))
    }

    pub fn client(&self) -> &ManagerClient {
        &self.client
    }

    pub fn ops(&self) -> &RemoteOperations {
        &self.ops
    }

    pub fn config(&self) -> &ClusterConfig {
        self.ops.config()
    }

    /// Every object of a list endpoint.
    pub async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ApiError> {
        Ok(self.client.get_list(path, query).await?)
    }

    /// Polls the list endpoint of `T` at 1 Hz until it holds exactly
    /// `expected_len` objects.
    pub async fn wait_for_items_length<T: DeserializeOwned + EndpointName>(
        &self,
        query: &[(&str, String)],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<T>, ApiError> {
        iml_poll::wait_for_items_length(
            || async move { self.get_list(&T::endpoint(), query).await },
            expected_len,
            timeout,
        )
        .await
    }

    /// The command a mutating request started, if it started one.
    ///
    /// Non 2xx responses are errors. A 204 means the request was a no-op.
    pub(crate) fn started_command(resp: ApiResponse) -> Result<Option<Command>, ApiError> {
        let resp = resp.error_for_status()?;

        if resp.status_code == StatusCode::NO_CONTENT {
            tracing::debug!("{} {} was a no-op", resp.method, resp.url);

            return Ok(None);
        }

        match resp.json_value()?.get("command") {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(x) => Ok(Some(serde_json::from_value(x.clone())?)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::ManagerApi;
    use iml_manager_client::ManagerClient;
    use iml_remote_ops::RemoteOperations;
    use iml_ssh::scripted::ScriptedExecutor;
    use iml_test_config::ClusterConfig;
    use std::sync::Arc;

    fn cluster(url: &str) -> String {
        serde_json::json!({
            "lustre_servers": [
                {"address": "10.0.0.1", "fqdn": "lustre0.example.com", "nodename": "lustre0"},
                {"address": "10.0.0.2", "fqdn": "lustre1.example.com", "nodename": "lustre1"},
                {"address": "10.0.0.3", "fqdn": "lustre2.example.com", "nodename": "lustre2"},
                {"address": "10.0.0.4", "fqdn": "lustre3.example.com", "nodename": "lustre3"}
            ],
            "chroma_managers": [{
                "address": "10.0.0.100",
                "server_http_url": url,
                "users": [{"username": "admin", "password": "lustre", "superuser": true}]
            }],
            "managed": true
        })
        .to_string()
    }

    pub struct Fixture {
        pub server: mockito::ServerGuard,
        pub executor: Arc<ScriptedExecutor>,
        pub api: ManagerApi,
    }

    pub async fn fixture() -> Fixture {
        let server = mockito::Server::new_async().await;

        let config = ClusterConfig::from_json_str(&cluster(&server.url())).unwrap();
        let executor = Arc::new(ScriptedExecutor::new());

        let ops = RemoteOperations::new(executor.clone(), Arc::new(config));
        let client = ManagerClient::new(&server.url()).unwrap();

        Fixture {
            server,
            executor,
            api: ManagerApi::new(client, ops),
        }
    }

    pub fn command(id: u32, complete: bool, errored: bool) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "complete": complete,
            "errored": errored,
            "cancelled": false,
            "jobs": [],
            "message": format!("command {}", id),
            "resource_uri": format!("/api/command/{}/", id)
        })
    }

    pub fn list(objects: serde_json::Value) -> String {
        serde_json::json!({
            "meta": {"limit": 0, "next": null, "offset": 0, "previous": null, "total_count": 0},
            "objects": objects
        })
        .to_string()
    }
}
