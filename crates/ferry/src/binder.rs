// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HeaderValue};
use http::{HeaderMap, Method, Request, Uri};
use pct_str::{PctString, UriReserved};

use crate::{ClientConfig, InvalidRequestError, RequestTemplate, ServerInstance};

/// A request bound to a concrete server, ready for a transport.
#[derive(Debug)]
pub struct BoundRequest {
    request: Request<Bytes>,
    server: ServerInstance,
    fragment: Option<String>,
}

impl BoundRequest {
    /// Returns the method.
    #[must_use]
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Returns the absolute URI of the attempt.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    /// Returns the fragment carried over from the template. It is never sent on the wire.
    #[must_use]
    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// Returns the headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// Returns the body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        self.request.body()
    }

    /// Returns the server the request is bound to.
    #[must_use]
    pub fn server(&self) -> &ServerInstance {
        &self.server
    }

    /// Returns the underlying request.
    #[must_use]
    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    /// Consumes the bound request and returns the underlying request.
    #[must_use]
    pub fn into_request(self) -> Request<Bytes> {
        self.request
    }
}

/// Turns a [`RequestTemplate`] into a concrete request for one server.
///
/// Binding is pure: the template is only read, so binding the same template for several attempts
/// yields the same request every time (apart from what customizers choose to vary per server).
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct RequestBinder;

impl RequestBinder {
    /// Binds `template` to `server`.
    ///
    /// The scheme, host and port of the template URI are replaced; the user-info, path, query and
    /// fragment are kept. A missing scheme is treated as `http`. When the server or the
    /// configuration asks for a secure connection, `http` becomes `https` and `ws` becomes `wss`.
    ///
    /// A `+` in the template query is rewritten as `%20`, and the template query parameters are
    /// appended percent-encoded. `GET` and `HEAD` requests never carry a body.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting URI is not valid.
    ///
    /// # Examples
    ///
    /// ```
    /// use ferry::{ClientConfig, RequestBinder, RequestTemplate, ServerInstance};
    ///
    /// let template = RequestTemplate::builder("users").uri("http://placeholder/path?q=1").build()?;
    /// let server = ServerInstance::new("h", 443).secure(true);
    ///
    /// let bound = RequestBinder::bind(&template, &server, &ClientConfig::default())?;
    ///
    /// assert_eq!(bound.uri(), "https://h:443/path?q=1");
    /// # Ok::<(), ferry::InvalidRequestError>(())
    /// ```
    pub fn bind(template: &RequestTemplate, server: &ServerInstance, config: &ClientConfig) -> Result<BoundRequest, InvalidRequestError> {
        let uri = bind_uri(template, server, config)?;

        let body = if permits_body(template.method()) {
            template.body().replay()
        } else {
            Bytes::new()
        };

        let mut request = Request::new(body);
        *request.method_mut() = template.method().clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = template.headers().clone();

        if !request.body().is_empty() {
            let length = HeaderValue::from(request.body().len());
            request.headers_mut().insert(CONTENT_LENGTH, length);
        }

        let (mut parts, body) = request.into_parts();
        for customizer in template.customizers() {
            customizer.customize(&mut parts, server);
        }

        Ok(BoundRequest {
            request: Request::from_parts(parts, body),
            server: server.clone(),
            fragment: template.fragment().map(str::to_string),
        })
    }

    /// Returns whether requests to `server` use a secure scheme; the configuration override wins.
    #[must_use]
    pub fn is_secure(server: &ServerInstance, config: &ClientConfig) -> bool {
        config.get_secure().unwrap_or_else(|| server.is_secure())
    }
}

fn bind_uri(template: &RequestTemplate, server: &ServerInstance, config: &ClientConfig) -> Result<Uri, InvalidRequestError> {
    let source = template.uri();

    let scheme = source.scheme_str().unwrap_or("http");
    let scheme = if RequestBinder::is_secure(server, config) {
        secure_scheme(scheme).unwrap_or(scheme)
    } else {
        scheme
    };

    let authority = match source.authority().and_then(|a| a.as_str().rsplit_once('@')) {
        Some((user_info, _)) => format!("{user_info}@{server}"),
        None => server.to_string(),
    };

    let path_and_query = path_and_query(source, template.query_params());

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .map_err(|e| InvalidRequestError::with_source(format!("cannot bind '{source}' to server '{server}'"), e))
}

fn secure_scheme(scheme: &str) -> Option<&'static str> {
    if scheme.eq_ignore_ascii_case("http") {
        Some("https")
    } else if scheme.eq_ignore_ascii_case("ws") {
        Some("wss")
    } else {
        None
    }
}

fn path_and_query(source: &Uri, params: &[(String, String)]) -> String {
    let path = match source.path() {
        "" => "/",
        path => path,
    };

    // The raw query is already percent-encoded, so only `+` needs rewriting.
    let mut query = source.query().map(|q| q.replace('+', "%20")).unwrap_or_default();

    for (name, value) in params {
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(PctString::encode(name.chars(), UriReserved::Any).as_str());
        query.push('=');
        query.push_str(PctString::encode(value.chars(), UriReserved::Any).as_str());
    }

    if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    }
}

fn permits_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}
