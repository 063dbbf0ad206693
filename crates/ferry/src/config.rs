// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default time allowed for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default time allowed for receiving a response once connected.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of retries against the same server.
pub const DEFAULT_MAX_RETRIES_SAME_SERVER: u32 = 0;

/// Default number of times a different server is tried.
pub const DEFAULT_MAX_RETRIES_NEXT_SERVER: u32 = 1;

const NAMESPACE: &str = "ferry";

/// Resolved client configuration for one logical service.
///
/// The configuration is passed by value to the orchestrator and the transport; nothing is looked
/// up from global state. Values can be set directly or loaded from a flat property source with
/// [`ClientConfig::from_properties`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use ferry::ClientConfig;
///
/// let config = ClientConfig::default()
///     .read_timeout(Duration::from_secs(5))
///     .max_retries_same_server(1)
///     .retryable_status_codes([502, 503]);
///
/// assert_eq!(config.get_max_retries_next_server(), 1);
/// assert!(config.is_retryable_status(503));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClientConfig {
    #[cfg_attr(feature = "serde", serde(rename = "connect_timeout_ms", with = "millis"))]
    connect_timeout: Duration,
    #[cfg_attr(feature = "serde", serde(rename = "read_timeout_ms", with = "millis"))]
    read_timeout: Duration,
    follow_redirects: bool,
    secure: Option<bool>,
    ok_to_retry_on_all_operations: bool,
    max_retries_same_server: u32,
    max_retries_next_server: u32,
    retryable_status_codes: BTreeSet<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            follow_redirects: false,
            secure: None,
            ok_to_retry_on_all_operations: false,
            max_retries_same_server: DEFAULT_MAX_RETRIES_SAME_SERVER,
            max_retries_next_server: DEFAULT_MAX_RETRIES_NEXT_SERVER,
            retryable_status_codes: BTreeSet::new(),
        }
    }
}

impl ClientConfig {
    /// Sets the time allowed for establishing a connection.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the time allowed for receiving a response once connected.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets whether the transport follows redirects.
    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Forces the secure scheme on or off, regardless of what the server instance reports.
    #[must_use]
    pub fn secure(mut self, secure: impl Into<Option<bool>>) -> Self {
        self.secure = secure.into();
        self
    }

    /// Allows retries of non-idempotent methods.
    #[must_use]
    pub fn ok_to_retry_on_all_operations(mut self, ok: bool) -> Self {
        self.ok_to_retry_on_all_operations = ok;
        self
    }

    /// Sets how many times a failed attempt is repeated against the same server.
    #[must_use]
    pub fn max_retries_same_server(mut self, retries: u32) -> Self {
        self.max_retries_same_server = retries;
        self
    }

    /// Sets how many times a different server is tried.
    #[must_use]
    pub fn max_retries_next_server(mut self, retries: u32) -> Self {
        self.max_retries_next_server = retries;
        self
    }

    /// Replaces the set of status codes that are retried like transport failures.
    #[must_use]
    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Returns the connect timeout.
    #[must_use]
    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the read timeout.
    #[must_use]
    pub fn get_read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Returns whether redirects are followed.
    #[must_use]
    pub fn get_follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    /// Returns the secure override, if any.
    #[must_use]
    pub fn get_secure(&self) -> Option<bool> {
        self.secure
    }

    /// Returns whether non-idempotent methods may be retried.
    #[must_use]
    pub fn get_ok_to_retry_on_all_operations(&self) -> bool {
        self.ok_to_retry_on_all_operations
    }

    /// Returns the number of retries against the same server.
    #[must_use]
    pub fn get_max_retries_same_server(&self) -> u32 {
        self.max_retries_same_server
    }

    /// Returns the number of times a different server is tried.
    #[must_use]
    pub fn get_max_retries_next_server(&self) -> u32 {
        self.max_retries_next_server
    }

    /// Returns the retryable status codes.
    #[must_use]
    pub fn get_retryable_status_codes(&self) -> &BTreeSet<u16> {
        &self.retryable_status_codes
    }

    /// Returns `true` if `status` is configured as retryable.
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Returns the longest time a call can spend in the transport when every attempt hits both
    /// timeouts.
    ///
    /// The engine does not enforce a deadline across the retry loop. Callers that wrap calls in
    /// their own deadline can use this value to size it.
    #[must_use]
    pub fn get_retry_budget(&self) -> Duration {
        let per_attempt = self.connect_timeout.saturating_add(self.read_timeout);
        per_attempt
            .saturating_mul(self.max_retries_same_server.saturating_add(1))
            .saturating_mul(self.max_retries_next_server.saturating_add(1))
    }

    /// Loads the configuration of `service_id` from flat key/value properties.
    ///
    /// Keys have the form `<service>.ferry.<Name>`; a key of the form `ferry.<Name>` applies to
    /// every service. Per-service keys win over global keys, which win over the defaults.
    ///
    /// | name                       | value                                  |
    /// |----------------------------|----------------------------------------|
    /// | `ConnectTimeout`           | milliseconds                           |
    /// | `ReadTimeout`              | milliseconds                           |
    /// | `FollowRedirects`          | `true` or `false`                      |
    /// | `IsSecure`                 | `true` or `false`                      |
    /// | `OkToRetryOnAllOperations` | `true` or `false`                      |
    /// | `MaxAutoRetries`           | retries against the same server        |
    /// | `MaxAutoRetriesNextServer` | number of other servers to try         |
    /// | `RetryableStatusCodes`     | comma-separated list, e.g. `502,503`   |
    ///
    /// Entries of the status code list that are not valid numbers are skipped.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the key when any other value cannot be parsed.
    ///
    /// # Examples
    ///
    /// ```
    /// use ferry::ClientConfig;
    ///
    /// let config = ClientConfig::from_properties(
    ///     "users",
    ///     [
    ///         ("ferry.MaxAutoRetries", "2"),
    ///         ("users.ferry.MaxAutoRetries", "1"),
    ///         ("users.ferry.RetryableStatusCodes", "503, 504"),
    ///     ],
    /// )?;
    ///
    /// assert_eq!(config.get_max_retries_same_server(), 1);
    /// assert!(config.is_retryable_status(504));
    /// # Ok::<(), ferry::ConfigError>(())
    /// ```
    pub fn from_properties<K, V>(service_id: &str, properties: impl IntoIterator<Item = (K, V)>) -> Result<Self, ConfigError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let source = PropertySource {
            service_prefix: format!("{service_id}.{NAMESPACE}."),
            properties: properties.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        };

        let mut config = Self::default();

        if let Some(ms) = source.parse::<u64>("ConnectTimeout")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = source.parse::<u64>("ReadTimeout")? {
            config.read_timeout = Duration::from_millis(ms);
        }
        if let Some(follow) = source.parse_bool("FollowRedirects")? {
            config.follow_redirects = follow;
        }
        if let Some(secure) = source.parse_bool("IsSecure")? {
            config.secure = Some(secure);
        }
        if let Some(ok) = source.parse_bool("OkToRetryOnAllOperations")? {
            config.ok_to_retry_on_all_operations = ok;
        }
        if let Some(retries) = source.parse::<u32>("MaxAutoRetries")? {
            config.max_retries_same_server = retries;
        }
        if let Some(retries) = source.parse::<u32>("MaxAutoRetriesNextServer")? {
            config.max_retries_next_server = retries;
        }
        if let Some((_, list)) = source.get("RetryableStatusCodes") {
            config.retryable_status_codes = parse_status_codes(list);
        }

        Ok(config)
    }
}

/// A property value that could not be parsed.
#[derive(Debug, Error)]
#[error("invalid value '{value}' for configuration key '{key}'")]
pub struct ConfigError {
    key: String,
    value: String,
}

impl ConfigError {
    /// Returns the offending key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the offending value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

struct PropertySource {
    service_prefix: String,
    properties: HashMap<String, String>,
}

impl PropertySource {
    fn get(&self, name: &str) -> Option<(String, &str)> {
        let service_key = format!("{}{name}", self.service_prefix);
        if let Some(value) = self.properties.get(&service_key) {
            return Some((service_key, value.trim()));
        }

        let global_key = format!("{NAMESPACE}.{name}");
        self.properties.get(&global_key).map(|value| (global_key, value.trim()))
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        self.get(name)
            .map(|(key, value)| match value.parse() {
                Ok(parsed) => Ok(parsed),
                Err(_) => Err(ConfigError {
                    key,
                    value: value.to_string(),
                }),
            })
            .transpose()
    }

    fn parse_bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        self.get(name)
            .map(|(key, value)| {
                if value.eq_ignore_ascii_case("true") {
                    Ok(true)
                } else if value.eq_ignore_ascii_case("false") {
                    Ok(false)
                } else {
                    Err(ConfigError {
                        key,
                        value: value.to_string(),
                    })
                }
            })
            .transpose()
    }
}

fn parse_status_codes(list: &str) -> BTreeSet<u16> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<u16>() {
            Ok(code) => Some(code),
            Err(_) => {
                tracing::debug!(ferry.config.entry = entry, "ignoring invalid retryable status code");
                None
            }
        })
        .collect()
}

#[cfg(feature = "serde")]
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
