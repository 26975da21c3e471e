// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{RemoteOperations, RemoteOpsError};
use futures::future::join_all;

impl RemoteOperations {
    /// Runs `commands` on `address` in order, stopping at the first failure.
    pub async fn execute_commands<S: AsRef<str>>(
        &self,
        commands: &[S],
        address: &str,
        label: &str,
    ) -> Result<(), RemoteOpsError> {
        for cmd in commands {
            let cmd = cmd.as_ref();

            tracing::debug!("{} on {}: {}", label, address, cmd);

            self.remote_command(address, cmd, Some(0)).await?;
        }

        Ok(())
    }

    /// Runs [`Self::execute_commands`] on every address concurrently.
    ///
    /// All workers are joined and the first failure is returned. Nothing is
    /// guaranteed about ordering across addresses.
    pub async fn execute_simultaneous_commands<S: AsRef<str>>(
        &self,
        commands: &[S],
        addresses: &[&str],
        label: &str,
    ) -> Result<(), RemoteOpsError> {
        tracing::info!("{} on {:?}", label, addresses);

        let xs = join_all(
            addresses
                .iter()
                .map(|address| self.execute_commands(commands, address, label)),
        )
        .await;

        xs.into_iter().collect()
    }
}
