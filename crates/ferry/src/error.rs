// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt;

use http::StatusCode;
use recoverable::{Recovery, RecoveryInfo};
use thiserror::Error;

use crate::{Response, ServerInstance};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error returned by [`RetryOrchestrator`][crate::RetryOrchestrator] when a logical call
/// does not produce a response.
///
/// Retryable failures are absorbed by the retry loop. Only the error of the final attempt, or a
/// fatal error that stopped the loop early, reaches the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The load balancer had no server for the service.
    #[error("no server available for service '{service_id}'")]
    NoAvailableServer {
        /// The logical service that was looked up.
        service_id: String,
    },

    /// The load balancer returned a server that cannot be addressed.
    #[error("load balancer returned invalid server '{server}' for service '{service_id}'")]
    InvalidServer {
        /// The logical service that was looked up.
        service_id: String,
        /// The rejected server.
        server: ServerInstance,
    },

    /// The request could not be bound to a concrete server.
    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequestError),

    /// The transport failed to complete the exchange.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with a status configured as retryable.
    #[error(transparent)]
    RetryableStatus(#[from] RetryableStatusError),

    /// The caller cancelled the call.
    #[error("request was cancelled")]
    Cancelled,
}

impl Error {
    /// Returns the transport error, if this error came from the transport.
    #[must_use]
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if the failed attempt may have reached the server.
    ///
    /// Responses with a retryable status were always sent; transport failures defer to
    /// [`TransportError::is_request_sent`].
    #[must_use]
    pub fn is_request_sent(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_request_sent(),
            Self::RetryableStatus(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if the transport failed in a way that counts against a server's health.
    #[must_use]
    pub fn is_circuit_tripping(&self) -> bool {
        self.as_transport().is_some_and(TransportError::is_circuit_tripping)
    }
}

impl Recovery for Error {
    fn recovery(&self) -> RecoveryInfo {
        match self {
            Self::NoAvailableServer { .. } => RecoveryInfo::unavailable(),
            Self::Transport(e) => e.recovery(),
            Self::RetryableStatus(e) => e.recovery(),
            Self::InvalidServer { .. } | Self::InvalidRequest(_) | Self::Cancelled => RecoveryInfo::never(),
        }
    }
}

/// The failure category of a [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// The connection could not be established.
    Connect,
    /// Establishing the connection took longer than the connect timeout.
    ConnectTimeout,
    /// The response did not arrive within the read timeout.
    ReadTimeout,
    /// The exchange failed after the request was handed to the connection.
    Io,
    /// The transport rejected the request before sending anything.
    InvalidRequest,
    /// The transport itself could not be set up.
    Setup,
}

impl TransportErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connection failed",
            Self::ConnectTimeout => "connect timed out",
            Self::ReadTimeout => "read timed out",
            Self::Io => "i/o failure",
            Self::InvalidRequest => "invalid request",
            Self::Setup => "transport setup failed",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by a [`TransportExecutor`][crate::TransportExecutor] for a single attempt.
///
/// Transports report failures only. Status codes, including 4xx and 5xx, are returned as
/// responses and classified by the [`RetryPolicy`][crate::RetryPolicy].
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl TransportError {
    /// Creates a new error of the given kind caused by `source`.
    pub fn new(kind: TransportErrorKind, source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    /// Creates a new error of the given kind without an underlying cause.
    #[must_use]
    pub fn from_kind(kind: TransportErrorKind) -> Self {
        Self { kind, source: None }
    }

    /// The connection could not be established.
    pub fn connect(source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::new(TransportErrorKind::Connect, source)
    }

    /// The connect timeout elapsed.
    #[must_use]
    pub fn connect_timeout() -> Self {
        Self::from_kind(TransportErrorKind::ConnectTimeout)
    }

    /// The read timeout elapsed.
    #[must_use]
    pub fn read_timeout() -> Self {
        Self::from_kind(TransportErrorKind::ReadTimeout)
    }

    /// The exchange failed after the request was sent.
    pub fn io(source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::new(TransportErrorKind::Io, source)
    }

    /// The request cannot be sent by this transport.
    pub fn invalid_request(source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::new(TransportErrorKind::InvalidRequest, source)
    }

    /// The transport could not be set up.
    pub fn setup(source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::new(TransportErrorKind::Setup, source)
    }

    /// Returns the failure category.
    #[must_use]
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Returns `true` if the request may have reached the server.
    ///
    /// Retrying such a request can apply its side effects twice.
    #[must_use]
    pub fn is_request_sent(&self) -> bool {
        matches!(self.kind, TransportErrorKind::ReadTimeout | TransportErrorKind::Io)
    }

    /// Returns `true` for connection failures and timeouts, which indicate an unhealthy server.
    #[must_use]
    pub fn is_circuit_tripping(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Connect | TransportErrorKind::ConnectTimeout | TransportErrorKind::ReadTimeout
        )
    }
}

impl Recovery for TransportError {
    fn recovery(&self) -> RecoveryInfo {
        match self.kind {
            TransportErrorKind::Connect | TransportErrorKind::ConnectTimeout | TransportErrorKind::ReadTimeout | TransportErrorKind::Io => {
                RecoveryInfo::retry()
            }
            TransportErrorKind::InvalidRequest | TransportErrorKind::Setup => RecoveryInfo::never(),
        }
    }
}

/// A response whose status code is configured as retryable.
///
/// The full response is kept so that callers receiving this error after the retry budget is
/// spent can still inspect what the server said.
#[derive(Debug, Error)]
#[error("server '{server}' responded with retryable status {}", .response.status())]
pub struct RetryableStatusError {
    server: ServerInstance,
    response: Response,
}

impl RetryableStatusError {
    /// Wraps a response received from `server`.
    #[must_use]
    pub fn new(server: ServerInstance, response: Response) -> Self {
        Self { server, response }
    }

    /// Returns the status code of the response.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Returns the server that produced the response.
    #[must_use]
    pub fn server(&self) -> &ServerInstance {
        &self.server
    }

    /// Returns the response.
    #[must_use]
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Consumes the error and returns the response.
    #[must_use]
    pub fn into_response(self) -> Response {
        self.response
    }
}

impl Recovery for RetryableStatusError {
    fn recovery(&self) -> RecoveryInfo {
        RecoveryInfo::retry()
    }
}

/// A request that cannot be turned into a concrete HTTP request.
#[derive(Debug, Error)]
#[error("invalid request: {message}")]
pub struct InvalidRequestError {
    message: Cow<'static, str>,
    #[source]
    source: Option<BoxError>,
}

impl InvalidRequestError {
    /// Creates an error with a message.
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error with a message and an underlying cause.
    pub fn with_source(
        message: impl Into<Cow<'static, str>>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::io;

    use recoverable::RecoveryKind;

    use super::*;

    #[test]
    fn transport_kinds_classify_sent_and_recovery() {
        let refused = TransportError::connect(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(!refused.is_request_sent());
        assert!(refused.is_circuit_tripping());
        assert_eq!(refused.recovery().kind(), RecoveryKind::Retry);
        assert!(refused.source().is_some());

        let reset = TransportError::io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_request_sent());
        assert!(!reset.is_circuit_tripping());

        let invalid = TransportError::invalid_request("unsupported scheme");
        assert_eq!(invalid.recovery().kind(), RecoveryKind::Never);
        assert_eq!(invalid.to_string(), "invalid request");
    }

    #[test]
    fn error_recovery_follows_variant() {
        let no_server = Error::NoAvailableServer {
            service_id: "users".to_string(),
        };
        assert_eq!(no_server.recovery().kind(), RecoveryKind::Unavailable);
        assert_eq!(no_server.to_string(), "no server available for service 'users'");

        assert_eq!(Error::Cancelled.recovery().kind(), RecoveryKind::Never);
        assert!(!Error::Cancelled.is_request_sent());
        assert!(!no_server.is_request_sent());
        assert!(Error::from(TransportError::read_timeout()).is_request_sent());
        assert!(!Error::from(TransportError::connect_timeout()).is_request_sent());
        assert_eq!(
            Error::from(TransportError::read_timeout()).recovery().kind(),
            RecoveryKind::Retry
        );
    }

    #[test]
    fn retryable_status_keeps_response() {
        let response = http::Response::builder().status(503).body(bytes::Bytes::from_static(b"busy")).unwrap();
        let error = RetryableStatusError::new(ServerInstance::new("h", 80), response);

        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.to_string(), "server 'h:80' responded with retryable status 503 Service Unavailable");
        assert_eq!(error.into_response().body().as_ref(), b"busy");
    }
}
