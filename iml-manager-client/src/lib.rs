// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! HTTP session client for the manager's REST API.
//!
//! The manager uses Django session cookies with CSRF protection. Opening a
//! session with `GET /api/session/` sets the `csrftoken` and `sessionid`
//! cookies; every later request carries both, and mutating requests also
//! send the current `csrftoken` back as `X-CSRFToken`.

mod error;
pub mod proxy;
mod response;

pub use error::ImlManagerClientError;
pub use reqwest::{header, Method, StatusCode, Url};
pub use response::ApiResponse;

use async_trait::async_trait;
use iml_poll::{retry_future, RetryAction, RetryPolicy};
use iml_wire_types::{ApiList, EndpointName, Session};
use reqwest::cookie::{CookieStore, Jar};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, fmt::Debug, path::Path, sync::Arc, time::Duration};

/// Connections kept open per host. Heavy concurrent polling must not starve.
pub const POOL_MAX_IDLE_PER_HOST: usize = 2000;

const CSRF_COOKIE: &str = "csrftoken";
const CSRF_HEADER: &str = "X-CSRFToken";

/// Called when a request fails to connect, before the error is returned.
#[async_trait]
pub trait ConnectionHealthHook: Send + Sync {
    async fn on_connection_error(&self, url: &str);
}

/// How server certificates are checked.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Accept any certificate.
    Insecure,
    /// Trust only this PEM encoded CA.
    PinnedCa(Vec<u8>),
}

#[derive(Clone)]
pub struct ManagerClient {
    client: reqwest::Client,
    jar: Arc<Jar>,
    base: Url,
    health_hook: Option<Arc<dyn ConnectionHealthHook>>,
}

impl Debug for ManagerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ManagerClient")
            .field("base", &self.base.as_str())
            .finish()
    }
}

fn build_client(jar: Arc<Jar>, tls: &TlsMode) -> Result<reqwest::Client, ImlManagerClientError> {
    let headers = vec![
        (
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        ),
        (
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        ),
    ]
    .into_iter()
    .collect();

    let builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(600))
        .default_headers(headers)
        .cookie_provider(jar)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);

    let builder = match tls {
        TlsMode::Insecure => builder.danger_accept_invalid_certs(true),
        TlsMode::PinnedCa(pem) => builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(reqwest::Certificate::from_pem(pem)?),
    };

    Ok(builder.build()?)
}

/// Given a path relative to the manager, constructs a url
pub fn create_url(base: &Url, path: impl ToString) -> Result<Url, ImlManagerClientError> {
    let path = path.to_string();

    Ok(base.join("/")?.join(path.trim_start_matches('/'))?)
}

/// Given an API path, constructs a full API url
///
/// `host`, `/api/host`, `api/host/1/` and `/api/host/?fqdn=x` are all
/// accepted. A trailing slash is added to paths without an extension.
pub fn create_api_url(base: &Url, path: impl ToString) -> Result<Url, ImlManagerClientError> {
    let path = path.to_string();

    let (path, query) = match path.find('?') {
        Some(idx) => (&path[..idx], Some(&path[idx + 1..])),
        None => (path.as_str(), None),
    };

    let mut path = path.trim_start_matches('/');

    if path.starts_with("api/") {
        path = &path[4..];
    }

    let mut path = path.to_string();

    let has_extension = Path::new(&path).extension().is_some();

    if !path.is_empty() && !has_extension && !path.ends_with('/') {
        path.push('/');
    }

    let mut url = base.join("/api/")?.join(&path)?;

    url.set_query(query);

    Ok(url)
}

fn is_mutating(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD && *method != Method::OPTIONS
}

fn create_policy<E: Debug>() -> impl RetryPolicy<E> {
    |k: u32, e| match k {
        0 => RetryAction::RetryNow,
        k if k < 3 => RetryAction::WaitFor(Duration::from_secs((2 * k) as u64)),
        _ => RetryAction::ReturnError(e),
    }
}

impl ManagerClient {
    /// A client that does not verify the manager's certificate.
    pub fn new(base: &str) -> Result<Self, ImlManagerClientError> {
        Self::with_tls(base, TlsMode::Insecure)
    }

    pub fn with_tls(base: &str, tls: TlsMode) -> Result<Self, ImlManagerClientError> {
        proxy::strip_ignored_proxies();

        let base = Url::parse(base)?;

        proxy::warn_if_proxied(&base);

        let jar = Arc::new(Jar::default());
        let client = build_client(Arc::clone(&jar), &tls)?;

        Ok(Self {
            client,
            jar,
            base,
            health_hook: None,
        })
    }

    /// Downloads the manager's local CA over an unverified connection, then
    /// returns a client that trusts only that CA.
    pub async fn with_pinned_ca(base: &str) -> Result<Self, ImlManagerClientError> {
        let insecure = Self::new(base)?;

        let resp = insecure
            .request_url(Method::GET, create_url(&insecure.base, "/certificate/")?, None)
            .await?
            .error_for_status()?;

        Self::with_tls(base, TlsMode::PinnedCa(resp.body_text.into_bytes()))
    }

    pub fn with_health_hook(mut self, hook: Arc<dyn ConnectionHealthHook>) -> Self {
        self.health_hook = Some(hook);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Current value of a cookie the manager has set.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.base)?;
        let header = header.to_str().ok()?;

        header.split(';').find_map(|x| {
            let (k, v) = x.trim().split_at(x.trim().find('=')?);

            if k == name {
                Some(v[1..].to_string())
            } else {
                None
            }
        })
    }

    pub fn csrf_token(&self) -> Option<String> {
        self.cookie(CSRF_COOKIE)
    }

    async fn request_url(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse, ImlManagerClientError> {
        tracing::debug!("{} to {} {:?}", method, url, body);

        let mut req = self.client.request(method.clone(), url.clone());

        if is_mutating(&method) {
            if let Some(token) = self.csrf_token() {
                req = req.header(CSRF_HEADER, header::HeaderValue::from_str(&token)?);
            }
        }

        if let Some(body) = &body {
            req = req.json(body);
        }

        let resp = match req.send().await {
            Ok(x) => x,
            Err(e) if e.is_connect() => {
                tracing::error!("Connection to {} failed: {}", url, e);

                if let Some(hook) = &self.health_hook {
                    hook.on_connection_error(url.as_str()).await;
                }

                return Err(ImlManagerClientError::Connection {
                    url: url.to_string(),
                    source: e,
                });
            }
            Err(e) => return Err(e.into()),
        };

        ApiResponse::read(method.as_str(), resp).await
    }

    /// Issues a request against an API path. Non 2xx statuses are *not*
    /// treated as errors.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        query: &[(&str, String)],
    ) -> Result<ApiResponse, ImlManagerClientError> {
        let mut url = create_api_url(&self.base, path)?;

        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }

        self.request_url(method, url, body).await
    }

    pub async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<ApiResponse, ImlManagerClientError> {
        self.request(Method::GET, path, None, query).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: impl Serialize,
    ) -> Result<ApiResponse, ImlManagerClientError> {
        self.request(Method::POST, path, Some(serde_json::to_value(body)?), &[])
            .await
    }

    pub async fn put(
        &self,
        path: &str,
        body: impl Serialize,
    ) -> Result<ApiResponse, ImlManagerClientError> {
        self.request(Method::PUT, path, Some(serde_json::to_value(body)?), &[])
            .await
    }

    pub async fn patch(
        &self,
        path: &str,
        body: impl Serialize,
    ) -> Result<ApiResponse, ImlManagerClientError> {
        self.request(Method::PATCH, path, Some(serde_json::to_value(body)?), &[])
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ImlManagerClientError> {
        self.request(Method::DELETE, path, None, &[]).await
    }

    /// GET and decode, failing on non 2xx.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ImlManagerClientError> {
        self.get(path, query).await?.error_for_status()?.json()
    }

    /// GET a single resource by its `resource_uri`.
    pub async fn get_by_uri<T: DeserializeOwned>(
        &self,
        uri: &str,
    ) -> Result<T, ImlManagerClientError> {
        self.get_json(uri, &[]).await
    }

    /// GET every object of a list endpoint, following `meta.next`.
    ///
    /// `limit=0` is sent unless the query names a limit.
    pub async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ImlManagerClientError> {
        let mut query = query.to_vec();

        if !query.iter().any(|(k, _)| *k == "limit") {
            query.push(("limit", "0".into()));
        }

        let ApiList { meta, mut objects }: ApiList<T> = self.get_json(path, &query).await?;

        let mut next = meta.next;

        while let Some(path) = next {
            let x: ApiList<T> = self.get_json(&path, &[]).await?;

            objects.extend(x.objects);

            next = x.meta.next;
        }

        Ok(objects)
    }

    /// [`get_list`](Self::get_list) on the endpoint of `T`.
    pub async fn list<T: DeserializeOwned + EndpointName>(
        &self,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ImlManagerClientError> {
        self.get_list(&T::endpoint(), query).await
    }

    /// GET and decode, retrying failed attempts up to 3 times.
    pub async fn get_retry<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ImlManagerClientError> {
        retry_future(|_| self.get_json(path, query), create_policy()).await
    }

    /// `GET /api/session/`, which sets the session and csrf cookies.
    pub async fn open_session(&self) -> Result<Session, ImlManagerClientError> {
        let resp = self.get("/api/session/", &[]).await?;

        if !resp.successful() {
            return Err(ImlManagerClientError::Session(format!(
                "GET /api/session/ returned {}: {}",
                resp.status(),
                resp.body_text
            )));
        }

        if self.csrf_token().is_none() {
            tracing::warn!("No {} cookie after opening a session", CSRF_COOKIE);
        }

        resp.json()
    }

    /// Opens a session and authenticates it.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), ImlManagerClientError> {
        self.open_session().await?;

        let resp = self
            .post(
                "/api/session/",
                serde_json::json!({ "username": username, "password": password }),
            )
            .await?;

        if !resp.successful() {
            return Err(ImlManagerClientError::Session(format!(
                "Login as {} failed with {}: {}",
                username,
                resp.status(),
                resp.body_text
            )));
        }

        tracing::info!("Logged in to {} as {}", self.base, username);

        Ok(())
    }

    pub async fn logout(&self) -> Result<(), ImlManagerClientError> {
        self.delete("/api/session/").await?.error_for_status()?;

        Ok(())
    }

    /// Whether the API answers at all.
    pub async fn api_contactable(&self) -> bool {
        match self.get("/api/session/", &[]).await {
            Ok(x) => x.successful(),
            Err(e) => {
                tracing::debug!("API not contactable: {}", e);

                false
            }
        }
    }

    /// `GET /api/`, the map of endpoint name to its description.
    pub async fn endpoints(
        &self,
    ) -> Result<BTreeMap<String, serde_json::Value>, ImlManagerClientError> {
        self.get_json("/api/", &[]).await
    }
}
