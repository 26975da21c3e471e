// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Adding servers to the manager and taking them away again.
//!
//! Adding is four steps: test that each address can be reached and set up,
//! create the host records, apply the best server profile to each, then
//! check the resulting host state.

use crate::{query, ApiError, ManagerApi};
use iml_test_config::timeouts::{INSTALL_TIMEOUT, TEST_TIMEOUT};
use iml_test_env::quick_test_setup;
use iml_wire_types::{
    CmdWrapper, Command, CommandAndHostWrapper, EndpointName, Host, HostProfileCmdWrapper,
    HostProfileWrapper, HostProfiles, Objects, SendJob, ServerProfile, TestHostJob,
};
use std::collections::HashMap;

/// States older managers report after deploying a host instead of the
/// profile's initial state.
const LEGACY_HOST_STATES: &[&str] = &["lnet_up", "lnet_down", "lnet_unloaded"];

/// How the manager authenticates to a new server.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthType {
    /// The manager's own ssh keys are already authorized.
    ExistingKeys,
    /// Use the root password from the cluster config.
    RootPassword,
}

impl AuthType {
    fn as_str(&self) -> &'static str {
        match self {
            AuthType::ExistingKeys => "existing_keys_choice",
            AuthType::RootPassword => "id_password_root",
        }
    }
}

/// Picks the profile to apply to a host.
///
/// A profile `pinned` in the cluster config wins. Otherwise exactly one
/// profile must be user selectable, non worker, of the right `managed`
/// kind, and pass all of the host's validations.
pub fn select_best_profile<'a>(
    profiles: &'a [ServerProfile],
    validations: &HostProfiles,
    managed: bool,
    pinned: Option<&str>,
) -> Result<&'a ServerProfile, ApiError> {
    if let Some(name) = pinned {
        return profiles
            .iter()
            .find(|x| x.name == name)
            .ok_or_else(|| ApiError::assert(format!("Pinned profile {} does not exist", name)));
    }

    let passing: Vec<&str> = validations.passing().collect();

    let xs: Vec<&ServerProfile> = profiles
        .iter()
        .filter(|x| x.managed == managed && !x.worker && x.user_selectable)
        .filter(|x| passing.contains(&x.name.as_str()))
        .collect();

    match xs.as_slice() {
        [x] => Ok(*x),
        xs => Err(ApiError::assert(format!(
            "Expected one profile for {}, found {:?}",
            validations.address,
            xs.iter().map(|x| &x.name).collect::<Vec<_>>()
        ))),
    }
}

/// Whether a freshly added host in `state` has settled into `profile`.
pub fn in_initial_state(state: &str, profile: &ServerProfile) -> bool {
    state == profile.initial_state || LEGACY_HOST_STATES.contains(&state)
}

impl ManagerApi {
    pub async fn get_hosts(&self) -> Result<Vec<Host>, ApiError> {
        Ok(self.client.list(&[]).await?)
    }

    pub async fn get_host_by_fqdn(&self, fqdn: &str) -> Result<Option<Host>, ApiError> {
        let xs: Vec<Host> = self.client.list(&query(&[("fqdn", fqdn)])).await?;

        Ok(xs.into_iter().find(|x| x.fqdn == fqdn))
    }

    fn root_password(&self, address: &str) -> Option<String> {
        self.config()
            .find_host(address)
            .and_then(|x| x.root_password.clone())
    }

    fn host_body(&self, address: &str, auth_type: &AuthType) -> serde_json::Value {
        let mut x = serde_json::json!({
            "address": address,
            "auth_type": auth_type.as_str(),
        });

        if *auth_type == AuthType::RootPassword {
            x["root_password"] = serde_json::json!(self.root_password(address));
        }

        x
    }

    /// Runs `test_host` for every address in one request, waits for each
    /// resulting command and checks every reported status passed.
    pub async fn test_hosts(
        &self,
        addresses: &[&str],
        auth_type: &AuthType,
    ) -> Result<(), ApiError> {
        let objects: Vec<_> = addresses
            .iter()
            .map(|x| self.host_body(x, auth_type))
            .collect();

        let Objects { objects } = self
            .client
            .post("/api/test_host/", serde_json::json!({ "objects": objects }))
            .await?
            .error_for_status()?
            .json::<Objects<CmdWrapper>>()?;

        for CmdWrapper { command } in objects {
            let command = self
                .wait_for_command(command.id, TEST_TIMEOUT, true, true)
                .await?;

            for uri in &command.jobs {
                let job: TestHostJob = self.client.get_by_uri(uri).await?;

                for result in job.step_results.values() {
                    let failed = result.failed_checks();

                    if !failed.is_empty() {
                        return Err(ApiError::assert(format!(
                            "test_host for {} failed: {:?}",
                            result.address, failed
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn test_host(&self, address: &str, auth_type: &AuthType) -> Result<(), ApiError> {
        self.test_hosts(&[address], auth_type).await
    }

    /// Creates the host record for `address` with the default profile and
    /// waits for its setup command.
    async fn create_host(&self, address: &str, auth_type: &AuthType) -> Result<Host, ApiError> {
        let mut body = self.host_body(address, auth_type);
        body["server_profile"] = format!("{}default/", ServerProfile::endpoint()).into();

        let CommandAndHostWrapper {
            command_and_host,
            error,
            traceback,
        } = self
            .client
            .post(&Host::endpoint(), body)
            .await?
            .error_for_status()?
            .json()?;

        let created = command_and_host.ok_or_else(|| {
            ApiError::assert(format!(
                "Creating host {} failed: {}\n{}",
                address,
                error.unwrap_or_default(),
                traceback.unwrap_or_default()
            ))
        })?;

        self.wait_for_command(created.command.id, TEST_TIMEOUT, true, true)
            .await?;

        Ok(created.host)
    }

    async fn apply_best_profiles(&self, hosts: &[Host]) -> Result<Vec<ServerProfile>, ApiError> {
        let profiles: Vec<ServerProfile> = self.client.list(&[]).await?;

        let mut chosen = vec![];
        let mut requests = vec![];

        for host in hosts {
            let HostProfileWrapper {
                host_profiles,
                error,
                ..
            } = self
                .client
                .get_by_uri(&HostProfileWrapper::uri(host.id))
                .await?;

            let validations = host_profiles.ok_or_else(|| {
                ApiError::assert(format!(
                    "No profile validations for {}: {}",
                    host.fqdn,
                    error.unwrap_or_default()
                ))
            })?;

            let pinned = self
                .config()
                .find_host(&host.fqdn)
                .or_else(|| self.config().find_host(&host.address))
                .and_then(|x| x.profile.as_deref());

            let profile =
                select_best_profile(&profiles, &validations, self.config().managed, pinned)?;

            tracing::info!("Applying profile {} to {}", profile.name, host.fqdn);

            requests.push(serde_json::json!({ "host": host.id, "profile": profile.name }));
            chosen.push(profile.clone());
        }

        let Objects { objects } = self
            .client
            .post(
                &HostProfileWrapper::endpoint(),
                serde_json::json!({ "objects": requests }),
            )
            .await?
            .error_for_status()?
            .json::<Objects<HostProfileCmdWrapper>>()?;

        let cmds: Vec<Command> = objects.into_iter().flat_map(|x| x.commands).collect();

        self.wait_for_commands(&cmds, INSTALL_TIMEOUT, true).await?;

        Ok(chosen)
    }

    /// Adds `addresses` as servers and deploys the best profile to each.
    ///
    /// Under quick setup, addresses the manager already knows are skipped.
    pub async fn add_hosts(
        &self,
        addresses: &[&str],
        auth_type: AuthType,
    ) -> Result<Vec<Host>, ApiError> {
        let existing: HashMap<String, Host> = if quick_test_setup() {
            self.get_hosts()
                .await?
                .into_iter()
                .flat_map(|x| vec![(x.address.clone(), x.clone()), (x.fqdn.clone(), x)])
                .collect()
        } else {
            HashMap::new()
        };

        let (known, new): (Vec<&str>, Vec<&str>) =
            addresses.iter().copied().partition(|x| existing.contains_key(*x));

        if !known.is_empty() {
            tracing::info!("Hosts {:?} already added", known);
        }

        let mut hosts: Vec<Host> = known
            .iter()
            .filter_map(|x| existing.get(*x).cloned())
            .collect();

        if new.is_empty() {
            return Ok(hosts);
        }

        self.test_hosts(&new, &auth_type).await?;

        let mut created = vec![];

        for address in &new {
            created.push(self.create_host(address, &auth_type).await?);
        }

        let profiles = self.apply_best_profiles(&created).await?;

        for (host, profile) in created.iter().zip(profiles.iter()) {
            let x: Host = self.client.get_by_uri(&host.resource_uri).await?;

            if !in_initial_state(&x.state, profile) {
                return Err(ApiError::StateMismatch {
                    uri: x.resource_uri,
                    field: "state".into(),
                    expected: profile.initial_state.clone(),
                    found: x.state,
                });
            }

            hosts.push(x);
        }

        Ok(hosts)
    }

    /// Removes `host` from the manager, tearing down what it deployed.
    pub async fn remove_host(&self, host: &Host) -> Result<(), ApiError> {
        self.set_state(&host.resource_uri, "removed", false, TEST_TIMEOUT)
            .await?;

        if self.get_host_by_fqdn(&host.fqdn).await?.is_some() {
            return Err(ApiError::assert(format!("{} was not removed", host.fqdn)));
        }

        Ok(())
    }

    /// Forgets `host` without touching the server itself.
    pub async fn force_remove_host(&self, host: &Host) -> Result<Command, ApiError> {
        self.run_command(
            vec![SendJob::new(
                "ForceRemoveHostJob",
                serde_json::json!({ "host_id": host.id }),
            )],
            format!("Test force remove hosts {}", host.fqdn),
            TEST_TIMEOUT,
        )
        .await
    }
}
