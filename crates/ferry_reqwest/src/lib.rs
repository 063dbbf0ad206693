// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A [`TransportExecutor`] backed by pooled [`reqwest::Client`]s.
//!
//! A client is built lazily for every distinct combination of connect timeout and redirect
//! handling it is asked to honor, then reused so connections stay pooled across attempts. The read
//! timeout is applied per request.
//!
//! # Examples
//!
//! ```no_run
//! use ferry::{ClientConfig, RequestTemplate, RetryOrchestrator, ServerInstance};
//! use ferry_reqwest::ReqwestTransport;
//! use tick::Clock;
//!
//! # async fn example(clock: &Clock) -> Result<(), ferry::Error> {
//! let orchestrator = RetryOrchestrator::builder(
//!     clock,
//!     |_service: &str, _key: Option<&str>| Some(ServerInstance::new("api.internal", 443).secure(true)),
//!     ReqwestTransport::new().user_agent("inventory-client/1.0"),
//! )
//! .config(ClientConfig::default().follow_redirects(true))
//! .build();
//!
//! let template = RequestTemplate::builder("inventory").uri("/v1/items").build()?;
//! let response = orchestrator.execute(&template).await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use ferry::{BoundRequest, ClientConfig, Response, TransportError, TransportErrorKind, TransportExecutor};
use parking_lot::Mutex;
use reqwest::redirect::Policy;
use tracing::{Level, event};

/// The number of redirects followed when the configuration enables redirects.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientKey {
    connect_timeout: Duration,
    follow_redirects: bool,
}

/// Sends attempts with a cached [`reqwest::Client`].
#[derive(Debug, Default)]
pub struct ReqwestTransport {
    user_agent: Option<String>,
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
}

impl ReqwestTransport {
    /// Creates a transport with no cached clients.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `User-Agent` sent by every client this transport builds.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self.clients.get_mut().clear();
        self
    }

    fn client(&self, config: &ClientConfig) -> Result<reqwest::Client, TransportError> {
        let key = ClientKey {
            connect_timeout: config.get_connect_timeout(),
            follow_redirects: config.get_follow_redirects(),
        };

        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let redirect = if key.follow_redirects {
            Policy::limited(DEFAULT_MAX_REDIRECTS)
        } else {
            Policy::none()
        };
        let mut builder = reqwest::Client::builder()
            .connect_timeout(key.connect_timeout)
            .redirect(redirect);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        let client = builder.build().map_err(TransportError::setup)?;
        event!(
            name: "ferry.reqwest.client",
            Level::DEBUG,
            client.connect_timeout_ms = u64::try_from(key.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            client.follow_redirects = key.follow_redirects,
            "built HTTP client",
        );
        clients.insert(key, client.clone());
        Ok(client)
    }

    #[cfg(test)]
    fn cached_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

impl TransportExecutor for ReqwestTransport {
    async fn execute(&self, request: BoundRequest, config: &ClientConfig) -> Result<Response, TransportError> {
        let client = self.client(config)?;

        let mut request = reqwest::Request::try_from(request.into_request()).map_err(TransportError::invalid_request)?;
        *request.timeout_mut() = Some(config.get_read_timeout());

        let response = client.execute(request).await.map_err(classify)?;
        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        *response.version_mut() = version;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Maps a reqwest failure onto the transport error taxonomy.
fn classify(error: reqwest::Error) -> TransportError {
    let kind = if error.is_connect() {
        if error.is_timeout() {
            TransportErrorKind::ConnectTimeout
        } else {
            TransportErrorKind::Connect
        }
    } else if error.is_timeout() {
        TransportErrorKind::ReadTimeout
    } else if error.is_builder() {
        TransportErrorKind::InvalidRequest
    } else {
        TransportErrorKind::Io
    };

    TransportError::new(kind, error)
}
