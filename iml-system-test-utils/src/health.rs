// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use async_trait::async_trait;
use iml_manager_client::ConnectionHealthHook;
use iml_remote_ops::RemoteOperations;

/// Logs the state of every server when the manager stops answering.
pub struct ClusterHealthHook {
    ops: RemoteOperations,
}

impl ClusterHealthHook {
    pub fn new(ops: RemoteOperations) -> Self {
        Self { ops }
    }
}

#[async_trait]
impl ConnectionHealthHook for ClusterHealthHook {
    async fn on_connection_error(&self, url: &str) {
        tracing::error!("Could not connect to {}, dumping cluster health", url);

        self.ops.cluster_health_dump().await;
    }
}
