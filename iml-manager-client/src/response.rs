// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::ImlManagerClientError;
use reqwest::{header::HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// A fully read response.
///
/// The body is kept as text; [`ApiResponse::json`] decodes it on demand.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub method: String,
    pub url: String,
    pub status_code: StatusCode,
    pub cookies: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body_text: String,
}

impl ApiResponse {
    pub(crate) async fn read(
        method: &str,
        resp: reqwest::Response,
    ) -> Result<Self, ImlManagerClientError> {
        let url = resp.url().to_string();
        let status_code = resp.status();
        let headers = resp.headers().clone();
        let cookies = resp
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let body_text = resp.text().await?;

        tracing::debug!("{} {} -> {} {}", method, url, status_code, body_text);

        Ok(Self {
            method: method.to_string(),
            url,
            status_code,
            cookies,
            headers,
            body_text,
        })
    }

    /// 200 <= status < 300
    pub fn successful(&self) -> bool {
        self.status_code.is_success()
    }

    pub fn status(&self) -> u16 {
        self.status_code.as_u16()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ImlManagerClientError> {
        Ok(serde_json::from_str(&self.body_text)?)
    }

    /// The body as an untyped value, `Null` when empty.
    pub fn json_value(&self) -> Result<serde_json::Value, ImlManagerClientError> {
        if self.body_text.trim().is_empty() {
            Ok(serde_json::Value::Null)
        } else {
            self.json()
        }
    }

    /// Turns a non 2xx response into an error carrying the body.
    pub fn error_for_status(self) -> Result<Self, ImlManagerClientError> {
        if self.successful() {
            Ok(self)
        } else {
            Err(ImlManagerClientError::Status {
                method: self.method,
                url: self.url,
                status: self.status_code.as_u16(),
                body: self.body_text,
            })
        }
    }
}
