// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::TestError;
use iml_manager_api::ManagerApi;
use iml_wire_types::{extract_numeric_id, Filesystem, Host};
use std::collections::HashMap;

/// Checks that a filesystem the manager reports as `available` really is.
///
/// Every target must be `mounted`, and pacemaker must run each one on the
/// host the manager names as its active host.
pub async fn assert_filesystem_available_consistent(
    api: &ManagerApi,
    fs: &Filesystem,
) -> Result<(), TestError> {
    let fs = api.get_filesystem(fs.id).await?;

    if fs.state != "available" {
        return Err(TestError::assert(format!(
            "Filesystem {} is {}, not available",
            fs.name, fs.state
        )));
    }

    let hosts: HashMap<u32, Host> = api
        .get_hosts()
        .await?
        .into_iter()
        .map(|x| (x.id, x))
        .collect();

    let mut errors = vec![];

    for target in api.get_targets(fs.id).await? {
        if target.state != "mounted" {
            errors.push(format!("{} is {}", target.name, target.state));
        }

        let host = target
            .active_host
            .as_deref()
            .and_then(extract_numeric_id)
            .and_then(|x| hosts.get(&x));

        let (host, label) = match (host, target.ha_label.as_deref()) {
            (Some(host), Some(label)) => (host, label),
            _ => {
                errors.push(format!("{} has no active host", target.name));
                continue;
            }
        };

        let running_on = api.ops().get_target_active_host(&host.fqdn, label).await?;

        if running_on.as_deref() != Some(host.fqdn.as_str()) {
            errors.push(format!(
                "{} is active on {} but pacemaker runs it on {:?}",
                target.name, host.fqdn, running_on
            ));
        }
    }

    if !errors.is_empty() {
        return Err(TestError::assert(errors.join("\n")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fixture, list};
    use mockito::Matcher;

    fn filesystem() -> serde_json::Value {
        serde_json::json!({
            "id": 1,
            "name": "testfs",
            "state": "available",
            "mgt": "/api/target/1/",
            "resource_uri": "/api/filesystem/1/"
        })
    }

    fn targets(mdt_state: &str) -> serde_json::Value {
        serde_json::json!([
            {
                "id": 1,
                "name": "MGS",
                "kind": "MGT",
                "state": "mounted",
                "active_host": "/api/host/1/",
                "ha_label": "MGS_a1b2c3",
                "resource_uri": "/api/target/1/"
            },
            {
                "id": 2,
                "name": "testfs-MDT0000",
                "kind": "MDT",
                "state": mdt_state,
                "active_host": "/api/host/2/",
                "ha_label": "testfs-MDT0000_d4e5f6",
                "resource_uri": "/api/target/2/"
            }
        ])
    }

    fn hosts() -> serde_json::Value {
        serde_json::json!([
            {"id": 1, "fqdn": "lustre0.example.com", "state": "managed", "resource_uri": "/api/host/1/"},
            {"id": 2, "fqdn": "lustre1.example.com", "state": "managed", "resource_uri": "/api/host/2/"}
        ])
    }

    async fn serve(f: &mut crate::test_utils::Fixture, mdt_state: &str) {
        f.server
            .mock("GET", "/api/filesystem/1/")
            .with_status(200)
            .with_body(filesystem().to_string())
            .create_async()
            .await;

        f.server
            .mock("GET", "/api/host/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(list(hosts()))
            .create_async()
            .await;

        f.server
            .mock("GET", "/api/target/")
            .match_query(Matcher::UrlEncoded("filesystem_id".into(), "1".into()))
            .with_status(200)
            .with_body(list(targets(mdt_state)))
            .create_async()
            .await;
    }

    #[tokio::test]
    async fn test_consistent_filesystem() {
        let mut f = fixture().await;

        serve(&mut f, "mounted").await;

        f.executor
            .on_host(
                "10.0.0.1",
                "crm_resource -W -r MGS_a1b2c3",
                0,
                "resource MGS_a1b2c3 is running on: lustre0",
            )
            .on_host(
                "10.0.0.2",
                "crm_resource -W -r testfs-MDT0000_d4e5f6",
                0,
                "resource testfs-MDT0000_d4e5f6 is running on: lustre1",
            );

        let fs: Filesystem = serde_json::from_value(filesystem()).unwrap();

        let api = ManagerApi::new(f.client.clone(), f.ops.clone());

        assert_filesystem_available_consistent(&api, &fs)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_inconsistent_filesystem() {
        let mut f = fixture().await;

        serve(&mut f, "unmounted").await;

        f.executor
            .on_host(
                "10.0.0.1",
                "crm_resource -W -r MGS_a1b2c3",
                0,
                "resource MGS_a1b2c3 is running on: lustre1",
            )
            .on_host("10.0.0.2", "crm_resource", 6, "");

        let fs: Filesystem = serde_json::from_value(filesystem()).unwrap();

        let api = ManagerApi::new(f.client.clone(), f.ops.clone());

        let e = assert_filesystem_available_consistent(&api, &fs)
            .await
            .unwrap_err();

        let msg = e.to_string();

        assert!(msg.contains("testfs-MDT0000 is unmounted"));
        assert!(msg.contains("MGS is active on lustre0.example.com"));
        assert!(msg.contains("pacemaker runs it on None"));
    }
}
