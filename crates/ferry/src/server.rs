// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;

/// A concrete endpoint that a request can be sent to.
///
/// Instances are produced by a [`LoadBalancer`][crate::LoadBalancer] for each attempt. The
/// engine only reads them.
///
/// # Examples
///
/// ```
/// use ferry::ServerInstance;
///
/// let server = ServerInstance::new("10.0.0.7", 8443).secure(true).metadata("zone", "west");
///
/// assert_eq!(server.to_string(), "10.0.0.7:8443");
/// assert!(server.is_secure());
/// assert_eq!(server.get_metadata("zone"), Some("west"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerInstance {
    host: String,
    port: u16,
    secure: bool,
    metadata: BTreeMap<String, String>,
}

impl ServerInstance {
    /// Creates an insecure instance without metadata.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets whether the instance expects a secure scheme.
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` if the instance expects a secure scheme.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Returns a metadata value.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Returns all metadata entries.
    #[must_use]
    pub fn metadata_entries(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Returns `true` if the instance can be addressed, i.e. it has a non-blank host.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// The host formatted for use in a URI authority, with IPv6 literals bracketed.
    pub(crate) fn uri_host(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uri_host(), self.port)
    }
}
