// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use crate::{BoundRequest, ClientConfig, Response, TransportError};

/// Executes a single attempt over a concrete HTTP stack.
///
/// Implementations send the bound request once and return whatever the server answered, whatever
/// the status code. They apply the connect and read timeouts and the redirect setting of the
/// [`ClientConfig`] to this attempt. Retrying, status interpretation, and server selection belong
/// to the [`RetryOrchestrator`][crate::RetryOrchestrator].
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use ferry::{BoundRequest, ClientConfig, Response, TransportError, TransportExecutor};
///
/// struct Echo;
///
/// impl TransportExecutor for Echo {
///     async fn execute(&self, request: BoundRequest, _config: &ClientConfig) -> Result<Response, TransportError> {
///         Ok(http::Response::new(Bytes::from(request.uri().to_string())))
///     }
/// }
/// ```
pub trait TransportExecutor: Send + Sync {
    /// Sends `request` and waits for the complete response.
    fn execute(&self, request: BoundRequest, config: &ClientConfig) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

impl<T: TransportExecutor> TransportExecutor for Arc<T> {
    fn execute(&self, request: BoundRequest, config: &ClientConfig) -> impl Future<Output = Result<Response, TransportError>> + Send {
        (**self).execute(request, config)
    }
}

impl<T: TransportExecutor> TransportExecutor for &T {
    fn execute(&self, request: BoundRequest, config: &ClientConfig) -> impl Future<Output = Result<Response, TransportError>> + Send {
        (**self).execute(request, config)
    }
}
