// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{ApiError, ManagerApi};
use iml_poll::wait_until_true;
use iml_test_config::{timeouts::TEST_TIMEOUT, PduSpec, PowerControlTypeSpec};
use iml_wire_types::{EndpointName, Outlet, PowerControlDevice, PowerControlType};

fn same_type(x: &PowerControlType, spec: &PowerControlTypeSpec) -> bool {
    x.agent == spec.agent && x.make == spec.make && x.model == spec.model
}

fn device_body(pdu: &PduSpec, device_type: &PowerControlType) -> serde_json::Value {
    serde_json::json!({
        "device_type": device_type.resource_uri,
        "address": pdu.address,
        "port": pdu.port.or(device_type.default_port),
        "name": pdu.name.clone().unwrap_or_else(|| pdu.address.clone()),
        "username": pdu.username.as_ref().or_else(|| device_type.default_username.as_ref()),
        "password": pdu.password.as_ref().or_else(|| device_type.default_password.as_ref()),
    })
}

impl ManagerApi {
    async fn ensure_power_control_types(&self) -> Result<Vec<PowerControlType>, ApiError> {
        let mut xs: Vec<PowerControlType> = self.client.list(&[]).await?;

        for spec in &self.config().power_control_types {
            if xs.iter().any(|x| same_type(x, spec)) {
                continue;
            }

            tracing::info!("Adding power control type {}", spec.agent);

            let x: PowerControlType = self
                .client
                .post(&PowerControlType::endpoint(), spec)
                .await?
                .error_for_status()?
                .json()?;

            xs.push(x);
        }

        Ok(xs)
    }

    /// Points `outlet_uri` at `host_uri`, or at no host with `None`.
    pub async fn set_outlet_host(
        &self,
        outlet_uri: &str,
        host_uri: Option<&str>,
    ) -> Result<(), ApiError> {
        self.client
            .patch(outlet_uri, serde_json::json!({ "host": host_uri }))
            .await?
            .error_for_status()?;

        let x: Outlet = self.client.get_by_uri(outlet_uri).await?;

        if x.host.as_deref() != host_uri {
            return Err(ApiError::StateMismatch {
                uri: outlet_uri.into(),
                field: "host".into(),
                expected: format!("{:?}", host_uri),
                found: format!("{:?}", x.host),
            });
        }

        Ok(())
    }

    /// Registers the configured power control types, PDUs and outlet to host
    /// assignments with the manager.
    ///
    /// On a managed cluster, waits until every server with an outlet lists
    /// itself as fenceable.
    pub async fn configure_power_control(&self) -> Result<Vec<PowerControlDevice>, ApiError> {
        let types = self.ensure_power_control_types().await?;

        let mut devices = vec![];

        for pdu in &self.config().power_distribution_units {
            let device_type = types
                .iter()
                .find(|x| x.agent == pdu.device_type)
                .ok_or_else(|| {
                    ApiError::assert(format!("No power control type for agent {}", pdu.device_type))
                })?;

            let device: PowerControlDevice = self
                .client
                .post(&PowerControlDevice::endpoint(), device_body(pdu, device_type))
                .await?
                .error_for_status()?
                .json()?;

            tracing::info!("Added power control device {}", device.address);

            for spec in self.config().pdu_outlets.iter().filter(|x| x.pdu == pdu.address) {
                let fqdn = match &spec.host {
                    Some(x) => x,
                    None => continue,
                };

                let outlet = device
                    .outlets
                    .iter()
                    .find(|x| x.identifier == spec.identifier)
                    .ok_or_else(|| {
                        ApiError::assert(format!(
                            "{} has no outlet {}",
                            pdu.address, spec.identifier
                        ))
                    })?;

                let host = self.get_host_by_fqdn(fqdn).await?.ok_or_else(|| {
                    ApiError::assert(format!("{} is not known to the manager", fqdn))
                })?;

                self.set_outlet_host(&outlet.resource_uri, Some(&host.resource_uri))
                    .await?;
            }

            devices.push(device);
        }

        if self.config().managed {
            self.wait_for_fencing().await?;
        }

        Ok(devices)
    }

    async fn wait_for_fencing(&self) -> Result<(), ApiError> {
        for server in self.config().lustre_servers.iter() {
            if self.config().outlets_for(&server.fqdn).next().is_none() {
                continue;
            }

            let address = server.address.as_str();
            let fqdn = server.fqdn.as_str();

            wait_until_true(
                || async move {
                    self.ops
                        .get_fence_nodes_list(address, true)
                        .await
                        .map(|xs| xs.iter().any(|x| x == fqdn))
                        .unwrap_or(false)
                },
                || format!("{} never became fenceable", fqdn),
                TEST_TIMEOUT,
            )
            .await?;
        }

        Ok(())
    }

    /// Deletes every power control device, returning how many there were.
    pub async fn remove_power_control(&self) -> Result<usize, ApiError> {
        let xs: Vec<PowerControlDevice> = self.client.list(&[]).await?;

        for x in &xs {
            tracing::info!("Removing power control device {}", x.address);

            self.client
                .delete(&x.resource_uri)
                .await?
                .error_for_status()?;
        }

        Ok(xs.len())
    }
}
