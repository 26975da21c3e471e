// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! State transitions and field updates on any stateful resource.

use crate::{ApiError, ManagerApi};
use iml_poll::{wait_for_assert, wait_for_value};
use iml_test_config::timeouts::TEST_TIMEOUT;
use iml_wire_types::{Command, DryRun};
use serde_json::Value;
use std::time::Duration;

/// How [`ManagerApi::set_value`] confirms the update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerifyValue {
    No,
    /// Read the field back once.
    Now,
    /// Poll until the field reads back as set.
    Eventually(Duration),
}

/// The body of a PUT that moves `object` to `state`.
///
/// Any `state` already present is replaced.
pub fn state_change_body(mut object: Value, state: &str) -> Value {
    if let Value::Object(x) = &mut object {
        x.remove("state");
        x.insert("state".into(), Value::String(state.into()));
    }

    object
}

fn describe(x: Option<&Value>) -> String {
    match x {
        Some(Value::String(x)) => x.clone(),
        Some(x) => x.to_string(),
        None => "<missing>".into(),
    }
}

impl ManagerApi {
    async fn get_object(&self, uri: &str) -> Result<Value, ApiError> {
        Ok(self.client.get_by_uri(uri).await?)
    }

    /// Puts `body` to `uri` and waits for the command it starts, if any.
    pub(crate) async fn put_and_wait(
        &self,
        uri: &str,
        body: &Value,
        verify_successful: bool,
        timeout: Duration,
    ) -> Result<Option<Command>, ApiError> {
        let resp = self.client.put(uri, body).await?;

        match Self::started_command(resp)? {
            Some(cmd) => Ok(Some(
                self.wait_for_command(cmd.id, timeout, verify_successful, true)
                    .await?,
            )),
            None => Ok(None),
        }
    }

    /// Moves the object at `uri` to `state`.
    ///
    /// Returns the command that did it, or `None` when the object was
    /// already in `state`. With `verify_successful` the command must succeed
    /// and the object must read back in `state`. The command gets `timeout`
    /// to complete.
    pub async fn set_state(
        &self,
        uri: &str,
        state: &str,
        verify_successful: bool,
        timeout: Duration,
    ) -> Result<Option<Command>, ApiError> {
        tracing::info!("Setting {} to {}", uri, state);

        let object = self.get_object(uri).await?;
        let body = state_change_body(object, state);

        let cmd = self
            .put_and_wait(uri, &body, verify_successful, timeout)
            .await?;

        if verify_successful {
            self.assert_state(uri, state).await?;
        }

        Ok(cmd)
    }

    /// What moving `uri` to `state` would do, without doing it.
    pub async fn set_state_dry_run(&self, uri: &str, state: &str) -> Result<DryRun, ApiError> {
        let body = serde_json::json!({ "state": state, "dry_run": true });

        let x = self.client.put(uri, body).await?.error_for_status()?.json()?;

        Ok(x)
    }

    /// Sets field `name` of the object at `uri` to `value`.
    pub async fn set_value(
        &self,
        uri: &str,
        name: &str,
        value: Value,
        verify: VerifyValue,
    ) -> Result<Option<Command>, ApiError> {
        let mut object = self.get_object(uri).await?;

        if let Value::Object(x) = &mut object {
            x.insert(name.into(), value.clone());
        }

        let cmd = self
            .put_and_wait(uri, &object, verify != VerifyValue::No, TEST_TIMEOUT)
            .await?;

        match verify {
            VerifyValue::No => {}
            VerifyValue::Now => self.assert_value(uri, name, &value).await?,
            VerifyValue::Eventually(timeout) => {
                let value = &value;

                wait_for_assert(
                    || async move { self.assert_value(uri, name, value).await },
                    timeout,
                )
                .await?
            }
        }

        Ok(cmd)
    }

    pub async fn assert_value(
        &self,
        uri: &str,
        name: &str,
        expected: &Value,
    ) -> Result<(), ApiError> {
        let object = self.get_object(uri).await?;
        let found = object.get(name);

        if found != Some(expected) {
            return Err(ApiError::StateMismatch {
                uri: uri.into(),
                field: name.into(),
                expected: describe(Some(expected)),
                found: describe(found),
            });
        }

        Ok(())
    }

    pub async fn assert_state(&self, uri: &str, state: &str) -> Result<(), ApiError> {
        self.assert_value(uri, "state", &Value::String(state.into()))
            .await
    }

    /// Polls the object at `uri` until it advertises an action matching
    /// every `key=value` in `filters`, and returns that action.
    pub async fn wait_for_action(
        &self,
        uri: &str,
        filters: &[(&str, Value)],
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        let matches = |x: &Value| filters.iter().all(|(k, v)| x.get(k) == Some(v));

        let actions = wait_for_value(
            || async move {
                let object = self.get_object(uri).await?;

                let xs = match object.get("available_actions") {
                    Some(Value::Array(xs)) => xs.clone(),
                    _ => vec![],
                };

                Ok::<_, ApiError>(xs)
            },
            |xs: &Vec<Value>| xs.iter().any(matches),
            timeout,
        )
        .await?;

        actions
            .into_iter()
            .find(matches)
            .ok_or_else(|| ApiError::assert(format!("No action on {} matches {:?}", uri, filters)))
    }
}
