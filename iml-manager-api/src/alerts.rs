// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{ApiError, ManagerApi};
use iml_poll::wait_for_value;
use iml_wire_types::{Alert, AlertSeverity};
use regex::Regex;
use std::time::Duration;

/// Alert types that may or may not be raised depending on timing, and are
/// ignored by [`ManagerApi::wait_alerts_optional`].
pub const OPTIONAL_ALERT_TYPES: &[&str] = &["CorosyncNoPeersAlert"];

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub active: Option<bool>,
    pub severity: Option<AlertSeverity>,
    pub alert_type: Option<String>,
    pub alert_item: Option<String>,
}

impl AlertFilter {
    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn alert_type(mut self, alert_type: impl Into<String>) -> Self {
        self.alert_type = Some(alert_type.into());
        self
    }

    /// Only alerts raised against the resource at `uri`.
    pub fn alert_item(mut self, uri: impl Into<String>) -> Self {
        self.alert_item = Some(uri.into());
        self
    }

    /// Query parameters narrowing `/api/alert/` to this filter.
    ///
    /// Inactive alerts carry a null `active`. `alert_item` is sent as its
    /// id; the uri is checked again by [`Self::matches`] since ids repeat
    /// across resource types.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut xs = vec![];

        match self.active {
            Some(true) => xs.push(("active", "true".to_string())),
            Some(false) => xs.push(("active__isnull", "true".to_string())),
            None => {}
        }

        if let Some(x) = self.severity {
            xs.push(("severity", x.to_string()));
        }

        if let Some(x) = &self.alert_type {
            xs.push(("alert_type", x.clone()));
        }

        if let Some(x) = self.alert_item.as_deref().and_then(uri_id) {
            xs.push(("alert_item_id", x.to_string()));
        }

        xs
    }

    pub fn matches(&self, x: &Alert) -> bool {
        self.active.map(|a| x.is_active() == a).unwrap_or(true)
            && self.severity.map(|s| x.severity == s).unwrap_or(true)
            && self
                .alert_type
                .as_ref()
                .map(|t| &x.alert_type == t)
                .unwrap_or(true)
            && self
                .alert_item
                .as_ref()
                .map(|i| &x.alert_item == i)
                .unwrap_or(true)
    }
}

/// The trailing id of a resource uri such as `/api/host/1/`.
fn uri_id(uri: &str) -> Option<&str> {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|x| !x.is_empty() && x.chars().all(|c| c.is_ascii_digit()))
}

/// Sorted alert types of `xs`, leaving out any in `ignore`.
pub fn alert_types(xs: &[Alert], ignore: &[&str]) -> Vec<String> {
    let mut types: Vec<String> = xs
        .iter()
        .map(|x| x.alert_type.clone())
        .filter(|x| !ignore.contains(&x.as_str()))
        .collect();

    types.sort();

    types
}

fn sorted(xs: &[&str]) -> Vec<String> {
    let mut xs: Vec<String> = xs.iter().map(|x| x.to_string()).collect();

    xs.sort();

    xs
}

impl ManagerApi {
    pub async fn get_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, ApiError> {
        let xs: Vec<Alert> = self.client.list(&filter.query()).await?;

        Ok(xs.into_iter().filter(|x| filter.matches(x)).collect())
    }

    /// The single alert against `alert_item` matching every given criterion.
    pub async fn get_alert(
        &self,
        alert_item: &str,
        message: Option<&Regex>,
        alert_type: Option<&str>,
        active: Option<bool>,
    ) -> Result<Alert, ApiError> {
        let filter = AlertFilter {
            active,
            severity: None,
            alert_type: alert_type.map(String::from),
            alert_item: Some(alert_item.into()),
        };

        let mut xs: Vec<Alert> = self
            .get_alerts(&filter)
            .await?
            .into_iter()
            .filter(|x| message.map(|r| r.is_match(&x.message)).unwrap_or(true))
            .collect();

        match xs.len() {
            1 => Ok(xs.remove(0)),
            n => Err(ApiError::assert(format!(
                "Expected one alert on {} matching {:?}, found {}: {:?}",
                alert_item,
                filter,
                n,
                alert_types(&xs, &[])
            ))),
        }
    }

    async fn wait_alert_types(
        &self,
        expected: &[&str],
        ignore: &[&str],
        filter: &AlertFilter,
        timeout: Duration,
    ) -> Result<Vec<Alert>, ApiError> {
        let expected = sorted(expected);

        let xs = wait_for_value(
            || self.get_alerts(filter),
            |xs| alert_types(xs, ignore) == expected,
            timeout,
        )
        .await
        .map_err(|e| match e {
            ApiError::WaitError(e) => ApiError::assert(format!(
                "Alerts matching {:?} never became {:?}: {}",
                filter, expected, e
            )),
            e => e,
        })?;

        Ok(xs)
    }

    /// Polls until the types of the alerts matching `filter` are exactly
    /// `expected`, ignoring order.
    pub async fn wait_alerts(
        &self,
        expected: &[&str],
        filter: &AlertFilter,
        timeout: Duration,
    ) -> Result<Vec<Alert>, ApiError> {
        self.wait_alert_types(expected, &[], filter, timeout).await
    }

    /// [`Self::wait_alerts`], with [`OPTIONAL_ALERT_TYPES`] left out of the
    /// comparison.
    pub async fn wait_alerts_optional(
        &self,
        expected: &[&str],
        filter: &AlertFilter,
        timeout: Duration,
    ) -> Result<Vec<Alert>, ApiError> {
        let expected: Vec<&str> = expected
            .iter()
            .copied()
            .filter(|x| !OPTIONAL_ALERT_TYPES.contains(x))
            .collect();

        self.wait_alert_types(&expected, OPTIONAL_ALERT_TYPES, filter, timeout)
            .await
    }

    pub async fn assert_has_alert(&self, filter: &AlertFilter) -> Result<Alert, ApiError> {
        let mut xs = self.get_alerts(filter).await?;

        if xs.is_empty() {
            return Err(ApiError::assert(format!("No alert matching {:?}", filter)));
        }

        Ok(xs.remove(0))
    }

    pub async fn assert_no_alerts(&self, filter: &AlertFilter) -> Result<(), ApiError> {
        let xs = self.get_alerts(filter).await?;

        if !xs.is_empty() {
            return Err(ApiError::assert(format!(
                "Unexpected alerts matching {:?}: {:?}",
                filter,
                xs.iter().map(|x| &x.message).collect::<Vec<_>>()
            )));
        }

        Ok(())
    }

    pub async fn dismiss_alert(&self, alert: &Alert) -> Result<(), ApiError> {
        self.client
            .patch(&alert.resource_uri, serde_json::json!({ "dismissed": true }))
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fixture, list};
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    fn alerts() -> serde_json::Value {
        serde_json::json!([
            {
                "id": 1,
                "active": true,
                "alert_item": "/api/host/1/",
                "alert_type": "HostOfflineAlert",
                "message": "Host is offline lustre0.example.com",
                "severity": "ERROR",
                "resource_uri": "/api/alert/1/"
            },
            {
                "id": 2,
                "active": true,
                "alert_item": "/api/host/1/",
                "alert_type": "CorosyncNoPeersAlert",
                "message": "No peers",
                "severity": "WARNING",
                "resource_uri": "/api/alert/2/"
            },
            {
                "id": 3,
                "active": null,
                "alert_item": "/api/host/2/",
                "alert_type": "HostOfflineAlert",
                "message": "Host is offline lustre1.example.com",
                "severity": "ERROR",
                "resource_uri": "/api/alert/3/"
            }
        ])
    }

    async fn with_alerts() -> crate::test_utils::Fixture {
        let mut f = fixture().await;

        f.server
            .mock("GET", "/api/alert/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(list(alerts()))
            .create_async()
            .await;

        f
    }

    #[test]
    fn test_alert_filter() {
        let xs: Vec<Alert> = serde_json::from_value(alerts()).unwrap();

        let active = AlertFilter::default().active(true);
        let errors = AlertFilter::default().severity(AlertSeverity::ERROR);
        let host2 = AlertFilter::default().alert_item("/api/host/2/");

        assert_eq!(xs.iter().filter(|x| active.matches(x)).count(), 2);
        assert_eq!(xs.iter().filter(|x| errors.matches(x)).count(), 2);
        assert_eq!(xs.iter().filter(|x| host2.matches(x)).count(), 1);
    }

    #[test]
    fn test_alert_filter_query() {
        let x = AlertFilter::default()
            .active(false)
            .severity(AlertSeverity::WARNING)
            .alert_type("HostOfflineAlert")
            .alert_item("/api/host/12/");

        assert_eq!(
            x.query(),
            vec![
                ("active__isnull", "true".to_string()),
                ("severity", "WARNING".to_string()),
                ("alert_type", "HostOfflineAlert".to_string()),
                ("alert_item_id", "12".to_string()),
            ]
        );

        assert!(AlertFilter::default().query().is_empty());
        assert!(AlertFilter::default()
            .alert_item("/api/host/")
            .query()
            .is_empty());
    }

    #[tokio::test]
    async fn test_get_alerts_filters_on_the_server() {
        let mut f = fixture().await;

        let host1 = serde_json::json!([alerts()[0].clone()]);

        let m = f
            .server
            .mock("GET", "/api/alert/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("active".into(), "true".into()),
                Matcher::UrlEncoded("alert_type".into(), "HostOfflineAlert".into()),
                Matcher::UrlEncoded("alert_item_id".into(), "1".into()),
                Matcher::UrlEncoded("limit".into(), "0".into()),
            ]))
            .with_status(200)
            .with_body(list(host1))
            .expect(1)
            .create_async()
            .await;

        let xs = f
            .api
            .get_alerts(
                &AlertFilter::default()
                    .active(true)
                    .alert_type("HostOfflineAlert")
                    .alert_item("/api/host/1/"),
            )
            .await
            .unwrap();

        m.assert_async().await;

        assert_eq!(xs.iter().map(|x| x.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_wait_alerts() {
        let f = with_alerts().await;

        let filter = AlertFilter::default().active(true);

        let xs = f
            .api
            .wait_alerts(
                &["HostOfflineAlert", "CorosyncNoPeersAlert"],
                &filter,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(xs.len(), 2);

        f.api
            .wait_alerts_optional(&["HostOfflineAlert"], &filter, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_alerts_timeout() {
        let f = with_alerts().await;

        let e = f
            .api
            .wait_alerts(
                &["HostOfflineAlert"],
                &AlertFilter::default().active(true),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert!(e.to_string().contains("CorosyncNoPeersAlert"));
    }

    #[tokio::test]
    async fn test_get_alert() {
        let f = with_alerts().await;

        let re = Regex::new("offline").unwrap();

        let x = f
            .api
            .get_alert("/api/host/1/", Some(&re), None, Some(true))
            .await
            .unwrap();

        assert_eq!(x.id, 1);

        let e = f
            .api
            .get_alert("/api/host/3/", None, None, None)
            .await
            .unwrap_err();

        assert!(matches!(e, ApiError::Assert(_)));
    }

    #[tokio::test]
    async fn test_assert_alerts() {
        let f = with_alerts().await;

        f.api
            .assert_has_alert(&AlertFilter::default().alert_type("CorosyncNoPeersAlert"))
            .await
            .unwrap();

        f.api
            .assert_no_alerts(
                &AlertFilter::default()
                    .alert_item("/api/host/2/")
                    .active(true),
            )
            .await
            .unwrap();

        assert!(f
            .api
            .assert_no_alerts(&AlertFilter::default().alert_item("/api/host/2/"))
            .await
            .is_err());
    }
}
