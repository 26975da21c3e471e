// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

#[derive(Debug, thiserror::Error)]
pub enum ImlManagerClientError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("Could not connect to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::error::Error),
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("Could not open a session: {0}")]
    Session(String),
}

impl ImlManagerClientError {
    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ImlManagerClientError::Status { status, .. } => Some(*status),
            ImlManagerClientError::Reqwest(e) => e.status().map(|x| x.as_u16()),
            _ => None,
        }
    }

    /// The response body carried by this error, if any.
    pub fn body(&self) -> Option<&str> {
        match self {
            ImlManagerClientError::Status { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, ImlManagerClientError::Connection { .. })
    }
}
