// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A [`TransportExecutor`] that sends every attempt over a fresh hyper HTTP/1.1 connection.
//!
//! One TCP connection per attempt keeps the failure classification exact: a failure while
//! connecting is always [`TransportErrorKind::Connect`][ferry::TransportErrorKind::Connect] or
//! [`ConnectTimeout`][ferry::TransportErrorKind::ConnectTimeout], and anything after the connection
//! was established happened once the request may have been sent.
//!
//! Only plain `http` and `ws` URIs are supported. Use a TLS-capable transport for `https`.
//!
//! # Examples
//!
//! ```no_run
//! use ferry::{RequestTemplate, RetryOrchestrator, ServerInstance};
//! use ferry_hyper::HyperTransport;
//! use tick::Clock;
//!
//! # async fn example(clock: &Clock) -> Result<(), ferry::Error> {
//! let orchestrator = RetryOrchestrator::builder(
//!     clock,
//!     |_service: &str, _key: Option<&str>| Some(ServerInstance::new("127.0.0.1", 8080)),
//!     HyperTransport::new(),
//! )
//! .build();
//!
//! let template = RequestTemplate::builder("users").uri("/v1/users/7").build()?;
//! let response = orchestrator.execute(&template).await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use ferry::{BoundRequest, ClientConfig, Response, TransportError, TransportExecutor};
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, PROXY_AUTHORIZATION};
use http::{HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{Level, event};

/// The number of redirects followed before giving up.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Sends attempts over hyper HTTP/1.1 client connections.
#[derive(Debug, Clone, Copy)]
pub struct HyperTransport {
    max_redirects: usize,
}

impl HyperTransport {
    /// Creates a transport that follows at most [`DEFAULT_MAX_REDIRECTS`] redirects when the
    /// configuration asks for it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    /// Sets how many redirects are followed before the attempt fails.
    #[must_use]
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportExecutor for HyperTransport {
    async fn execute(&self, request: BoundRequest, config: &ClientConfig) -> Result<Response, TransportError> {
        let mut request = request.into_request();
        let mut redirects = 0;

        loop {
            let response = send(&request, config).await?;
            if !config.get_follow_redirects() {
                return Ok(response);
            }

            let Some(next) = redirect(&request, &response)? else {
                return Ok(response);
            };

            if redirects == self.max_redirects {
                return Err(TransportError::io(format!("stopped after {redirects} redirects")));
            }
            redirects += 1;

            event!(
                name: "ferry.redirect",
                Level::DEBUG,
                redirect.status = response.status().as_u16(),
                redirect.from = %request.uri(),
                redirect.to = %next.uri(),
            );
            request = next;
        }
    }
}

async fn send(request: &Request<Bytes>, config: &ClientConfig) -> Result<Response, TransportError> {
    let uri = request.uri();
    match uri.scheme_str() {
        Some("http" | "ws") => {}
        Some(scheme) => {
            return Err(TransportError::invalid_request(format!("scheme '{scheme}' is not supported")));
        }
        None => return Err(TransportError::invalid_request("request URI has no scheme")),
    }

    let Some(host) = uri.host() else {
        return Err(TransportError::invalid_request("request URI has no host"));
    };
    let port = uri.port_u16().unwrap_or(80);
    let address = host.trim_start_matches('[').trim_end_matches(']');

    let stream = match timeout(config.get_connect_timeout(), TcpStream::connect((address, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => return Err(TransportError::connect(error)),
        Err(_elapsed) => return Err(TransportError::connect_timeout()),
    };

    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await.map_err(TransportError::connect)?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            event!(name: "ferry.connection", Level::DEBUG, error = %error, "connection closed with an error");
        }
    });

    let outgoing = origin_form(request, host, uri.port_u16())?;
    let exchange = async {
        let response = sender.send_request(outgoing).await.map_err(TransportError::io)?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await.map_err(TransportError::io)?.to_bytes();
        Ok::<_, TransportError>(Response::from_parts(parts, body))
    };

    match timeout(config.get_read_timeout(), exchange).await {
        Ok(result) => result,
        Err(_elapsed) => Err(TransportError::read_timeout()),
    }
}

/// Rewrites an absolute-form request into the origin form sent on the wire.
fn origin_form(request: &Request<Bytes>, host: &str, port: Option<u16>) -> Result<Request<Full<Bytes>>, TransportError> {
    let mut outgoing = Request::new(Full::new(request.body().clone()));
    *outgoing.method_mut() = request.method().clone();
    *outgoing.headers_mut() = request.headers().clone();
    *outgoing.uri_mut() = request
        .uri()
        .path_and_query()
        .map_or_else(|| Uri::from_static("/"), |path| Uri::from(path.clone()));

    if !outgoing.headers().contains_key(HOST) {
        let value = match port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let value = HeaderValue::try_from(value).map_err(TransportError::invalid_request)?;
        outgoing.headers_mut().insert(HOST, value);
    }

    Ok(outgoing)
}

/// Builds the follow-up request for a redirect response, or `None` when `response` is not one.
fn redirect(request: &Request<Bytes>, response: &Response) -> Result<Option<Request<Bytes>>, TransportError> {
    let status = response.status();
    if !matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return Ok(None);
    }

    let Some(location) = response.headers().get(LOCATION) else {
        return Ok(None);
    };
    let location = location.to_str().map_err(TransportError::io)?;
    let target = resolve(request.uri(), location)?;

    let drop_body = status == StatusCode::SEE_OTHER
        || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND) && request.method() == Method::POST);

    let mut next = if drop_body {
        let mut next = Request::new(Bytes::new());
        *next.headers_mut() = request.headers().clone();
        next.headers_mut().remove(CONTENT_LENGTH);
        next.headers_mut().remove(CONTENT_TYPE);
        if request.method() != Method::HEAD {
            *next.method_mut() = Method::GET;
        }
        next
    } else {
        request.clone()
    };

    if target.authority() != request.uri().authority() {
        for name in [HOST, AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION] {
            next.headers_mut().remove(name);
        }
    }

    *next.uri_mut() = target;
    Ok(Some(next))
}

/// Resolves a `Location` header value against the URI that produced it.
fn resolve(base: &Uri, location: &str) -> Result<Uri, TransportError> {
    if let Ok(target) = location.parse::<Uri>()
        && target.scheme().is_some()
    {
        return Ok(target);
    }

    let path_and_query = if location.starts_with('/') {
        location.to_string()
    } else {
        let path = base.path();
        let directory = path.rfind('/').map_or("/", |index| &path[..=index]);
        format!("{directory}{location}")
    };

    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().map_err(TransportError::io)?);
    Uri::from_parts(parts).map_err(TransportError::io)
}
