// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::request::Parts;
use http::{HeaderMap, Method, Uri};

use crate::{InvalidRequestError, ReplayableBody, ServerInstance};

/// A hook that adjusts the concrete request of each attempt.
///
/// Customizers run after binding, in the order they were added to the template, and can change
/// the headers, extensions, or even the URI of the outgoing request. The template itself is never
/// modified.
///
/// Any `Fn(&mut Parts, &ServerInstance) + Send + Sync` closure is a customizer.
///
/// # Examples
///
/// ```
/// use ferry::RequestTemplate;
/// use http::HeaderValue;
/// use http::request::Parts;
///
/// let template = RequestTemplate::builder("users")
///     .uri("http://users/v1/me")
///     .customizer(|parts: &mut Parts, server: &ferry::ServerInstance| {
///         if let Some(zone) = server.get_metadata("zone") {
///             if let Ok(value) = HeaderValue::from_str(zone) {
///                 parts.headers.insert("x-zone", value);
///             }
///         }
///     })
///     .build()?;
/// # Ok::<(), ferry::InvalidRequestError>(())
/// ```
pub trait RequestCustomizer: Send + Sync {
    /// Adjusts the request about to be sent to `server`.
    fn customize(&self, parts: &mut Parts, server: &ServerInstance);
}

impl<F> RequestCustomizer for F
where
    F: Fn(&mut Parts, &ServerInstance) + Send + Sync,
{
    fn customize(&self, parts: &mut Parts, server: &ServerInstance) {
        self(parts, server);
    }
}

/// An immutable description of one logical request to a named service.
///
/// The host and port of the URI are placeholders; every attempt substitutes the server chosen by
/// the load balancer (see [`RequestBinder`][crate::RequestBinder]). Templates are cheap to clone.
///
/// # Examples
///
/// ```
/// use ferry::RequestTemplate;
/// use http::Method;
///
/// let template = RequestTemplate::builder("orders")
///     .method(Method::POST)
///     .uri("http://orders/v2/orders?source=web")
///     .header("content-type", "application/json")
///     .query_param("dry_run", "true")
///     .body(r#"{"sku":42}"#)
///     .build()?;
///
/// assert_eq!(template.service_id(), "orders");
/// assert_eq!(template.method(), Method::POST);
/// # Ok::<(), ferry::InvalidRequestError>(())
/// ```
#[derive(Clone)]
pub struct RequestTemplate {
    service_id: String,
    method: Method,
    uri: Uri,
    fragment: Option<String>,
    headers: HeaderMap,
    query_params: Vec<(String, String)>,
    body: ReplayableBody,
    content_length: Option<u64>,
    retryable_override: Option<bool>,
    load_balancer_key: Option<String>,
    customizers: Vec<Arc<dyn RequestCustomizer>>,
}

impl RequestTemplate {
    /// Starts building a `GET /` request to `service_id`.
    pub fn builder(service_id: impl Into<String>) -> RequestTemplateBuilder {
        RequestTemplateBuilder::new(service_id.into())
    }

    /// Returns the logical service name.
    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Returns the HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the URI with placeholder host and port.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Returns the URI fragment, without the leading `#`.
    #[must_use]
    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// Returns the headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the query parameters appended at bind time, in insertion order.
    #[must_use]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// Returns the body.
    #[must_use]
    pub fn body(&self) -> &ReplayableBody {
        &self.body
    }

    /// Returns the declared content length, if any.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Returns the explicit retry eligibility of this request, if set.
    #[must_use]
    pub fn retryable_override(&self) -> Option<bool> {
        self.retryable_override
    }

    /// Returns the hint passed to the load balancer.
    #[must_use]
    pub fn load_balancer_key(&self) -> Option<&str> {
        self.load_balancer_key.as_deref()
    }

    pub(crate) fn customizers(&self) -> impl Iterator<Item = &dyn RequestCustomizer> {
        self.customizers.iter().map(|c| &**c)
    }
}

impl fmt::Debug for RequestTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTemplate")
            .field("service_id", &self.service_id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("fragment", &self.fragment)
            .field("headers", &self.headers)
            .field("query_params", &self.query_params)
            .field("body_len", &self.body.len())
            .field("content_length", &self.content_length)
            .field("retryable_override", &self.retryable_override)
            .field("load_balancer_key", &self.load_balancer_key)
            .field("customizers", &self.customizers.len())
            .finish()
    }
}

/// Builder for [`RequestTemplate`].
///
/// Like [`http::request::Builder`], invalid inputs are remembered and reported by
/// [`build`][RequestTemplateBuilder::build].
#[must_use]
pub struct RequestTemplateBuilder {
    inner: Result<RequestTemplate, InvalidRequestError>,
}

impl RequestTemplateBuilder {
    fn new(service_id: String) -> Self {
        Self {
            inner: Ok(RequestTemplate {
                service_id,
                method: Method::GET,
                uri: Uri::from_static("/"),
                fragment: None,
                headers: HeaderMap::new(),
                query_params: Vec::new(),
                body: ReplayableBody::empty(),
                content_length: None,
                retryable_override: None,
                load_balancer_key: None,
                customizers: Vec::new(),
            }),
        }
    }

    fn and_then(self, f: impl FnOnce(RequestTemplate) -> Result<RequestTemplate, InvalidRequestError>) -> Self {
        Self {
            inner: self.inner.and_then(f),
        }
    }

    /// Sets the HTTP method.
    pub fn method(self, method: Method) -> Self {
        self.and_then(|mut t| {
            t.method = method;
            Ok(t)
        })
    }

    /// Sets the URI. The fragment, if any, is kept separately.
    pub fn uri(self, uri: impl AsRef<str>) -> Self {
        let raw = uri.as_ref();
        let (target, fragment) = match raw.split_once('#') {
            Some((target, fragment)) => (target, Some(fragment.to_string())),
            None => (raw, None),
        };
        let parsed = target
            .parse::<Uri>()
            .map_err(|e| InvalidRequestError::with_source(format!("invalid uri '{raw}'"), e));

        self.and_then(|mut t| {
            t.uri = parsed?;
            t.fragment = fragment;
            Ok(t)
        })
    }

    /// Appends a header value.
    pub fn header<K, V>(self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        K::Error: Into<http::Error>,
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        let name = name
            .try_into()
            .map_err(|e| InvalidRequestError::with_source("invalid header name", e.into()));
        let value = value
            .try_into()
            .map_err(|e| InvalidRequestError::with_source("invalid header value", e.into()));

        self.and_then(|mut t| {
            t.headers.append(name?, value?);
            Ok(t)
        })
    }

    /// Appends a query parameter. Names and values are percent-encoded at bind time.
    pub fn query_param(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let param = (name.into(), value.into());
        self.and_then(|mut t| {
            t.query_params.push(param);
            Ok(t)
        })
    }

    /// Sets the body.
    pub fn body(self, body: impl Into<ReplayableBody>) -> Self {
        let body = body.into();
        self.and_then(|mut t| {
            t.body = body;
            Ok(t)
        })
    }

    /// Declares the content length of the body.
    pub fn content_length(self, length: u64) -> Self {
        self.and_then(|mut t| {
            t.content_length = Some(length);
            Ok(t)
        })
    }

    /// Overrides the method-based retry eligibility of this request.
    pub fn retryable(self, retryable: bool) -> Self {
        self.and_then(|mut t| {
            t.retryable_override = Some(retryable);
            Ok(t)
        })
    }

    /// Sets the hint passed to the load balancer.
    pub fn load_balancer_key(self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.and_then(|mut t| {
            t.load_balancer_key = Some(key);
            Ok(t)
        })
    }

    /// Adds a customizer applied to every bound request.
    pub fn customizer(self, customizer: impl RequestCustomizer + 'static) -> Self {
        let customizer: Arc<dyn RequestCustomizer> = Arc::new(customizer);
        self.and_then(|mut t| {
            t.customizers.push(customizer);
            Ok(t)
        })
    }

    /// Finishes the template.
    ///
    /// # Errors
    ///
    /// Returns the first invalid input passed to the builder.
    pub fn build(self) -> Result<RequestTemplate, InvalidRequestError> {
        self.inner
    }
}

impl fmt::Debug for RequestTemplateBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTemplateBuilder").field("inner", &self.inner).finish()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let template = RequestTemplate::builder("users").build().unwrap();

        assert_eq!(template.method(), Method::GET);
        assert_eq!(template.uri(), "/");
        assert!(template.body().is_empty());
        assert_eq!(template.retryable_override(), None);
        assert_eq!(template.load_balancer_key(), None);
    }

    #[test]
    fn fragment_is_split_from_uri() {
        let template = RequestTemplate::builder("users").uri("http://users/a?b=1#top").build().unwrap();

        assert_eq!(template.uri(), "http://users/a?b=1");
        assert_eq!(template.fragment(), Some("top"));
    }

    #[test]
    fn headers_are_multi_valued() {
        let template = RequestTemplate::builder("users")
            .header("accept", "text/plain")
            .header("accept", "application/json")
            .build()
            .unwrap();

        assert_eq!(template.headers().get_all("accept").iter().count(), 2);
    }

    #[test]
    fn first_invalid_input_is_reported() {
        let error = RequestTemplate::builder("users")
            .header("bad header", "x")
            .uri("http://[::1")
            .build()
            .unwrap_err();

        assert_eq!(error.message(), "invalid header name");
    }

    #[test]
    fn debug_omits_body_bytes() {
        let template = RequestTemplate::builder("users").body("secret").build().unwrap();
        let debug = format!("{template:?}");

        assert!(debug.contains("body_len: 6"));
        assert!(!debug.contains("secret"));
    }
}
