// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::{Error, ServerInstance};

static NEXT_ATTEMPT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one attempt between [`StatsSink::on_attempt_start`] and
/// [`StatsSink::on_attempt_complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptToken {
    id: u64,
    server: ServerInstance,
}

impl AttemptToken {
    /// Creates a token with a process-unique id for an attempt against `server`.
    #[must_use]
    pub fn new(server: ServerInstance) -> Self {
        Self {
            id: NEXT_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed),
            server,
        }
    }

    /// Returns the id of the attempt.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the server the attempt was sent to.
    #[must_use]
    pub fn server(&self) -> &ServerInstance {
        &self.server
    }
}

/// Receives the outcome of every attempt.
///
/// Sinks usually feed the bookkeeping a load balancer uses to pick servers. A sink is shared by
/// all concurrent calls and must synchronize internally.
pub trait StatsSink: Send + Sync {
    /// Called right before the transport is invoked.
    fn on_attempt_start(&self, server: &ServerInstance) -> AttemptToken {
        AttemptToken::new(server.clone())
    }

    /// Called once the transport returned, with the error of the attempt if it failed.
    ///
    /// Responses with a retryable status are reported as errors.
    fn on_attempt_complete(&self, token: AttemptToken, duration: Duration, error: Option<&Error>);
}

impl<T: StatsSink + ?Sized> StatsSink for Arc<T> {
    fn on_attempt_start(&self, server: &ServerInstance) -> AttemptToken {
        (**self).on_attempt_start(server)
    }

    fn on_attempt_complete(&self, token: AttemptToken, duration: Duration, error: Option<&Error>) {
        (**self).on_attempt_complete(token, duration, error);
    }
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct NoopStatsSink;

impl StatsSink for NoopStatsSink {
    fn on_attempt_complete(&self, _token: AttemptToken, _duration: Duration, _error: Option<&Error>) {}
}

/// Counters for one server, as recorded by [`ServerStatsRegistry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    active_requests: u64,
    total_requests: u64,
    failures: u64,
    successive_connection_failures: u64,
    last_response_time: Option<Duration>,
}

impl ServerStats {
    /// Returns the number of attempts currently in flight.
    #[must_use]
    pub fn active_requests(&self) -> u64 {
        self.active_requests
    }

    /// Returns the number of attempts started.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Returns the number of failed attempts.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Returns the number of connection failures and timeouts since the last attempt that reached
    /// the server.
    #[must_use]
    pub fn successive_connection_failures(&self) -> u64 {
        self.successive_connection_failures
    }

    /// Returns the duration of the most recent completed attempt.
    #[must_use]
    pub fn last_response_time(&self) -> Option<Duration> {
        self.last_response_time
    }
}

/// An in-memory [`StatsSink`] that keeps [`ServerStats`] per `host:port`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use ferry::{ServerInstance, ServerStatsRegistry, StatsSink};
///
/// let registry = ServerStatsRegistry::new();
/// let server = ServerInstance::new("10.0.0.1", 80);
///
/// let token = registry.on_attempt_start(&server);
/// registry.on_attempt_complete(token, Duration::from_millis(12), None);
///
/// let stats = registry.snapshot(&server).unwrap();
/// assert_eq!(stats.total_requests(), 1);
/// assert_eq!(stats.last_response_time(), Some(Duration::from_millis(12)));
/// ```
#[derive(Debug, Default)]
pub struct ServerStatsRegistry {
    servers: DashMap<String, ServerStats>,
}

impl ServerStatsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the counters of `server`, if it has been used.
    #[must_use]
    pub fn snapshot(&self, server: &ServerInstance) -> Option<ServerStats> {
        self.servers.get(&server.to_string()).map(|stats| *stats)
    }
}

impl StatsSink for ServerStatsRegistry {
    fn on_attempt_start(&self, server: &ServerInstance) -> AttemptToken {
        let mut stats = self.servers.entry(server.to_string()).or_default();
        stats.active_requests = stats.active_requests.saturating_add(1);
        stats.total_requests = stats.total_requests.saturating_add(1);

        AttemptToken::new(server.clone())
    }

    fn on_attempt_complete(&self, token: AttemptToken, duration: Duration, error: Option<&Error>) {
        let mut stats = self.servers.entry(token.server().to_string()).or_default();
        stats.active_requests = stats.active_requests.saturating_sub(1);
        stats.last_response_time = Some(duration);

        match error {
            Some(error) => {
                stats.failures = stats.failures.saturating_add(1);
                if error.is_circuit_tripping() {
                    stats.successive_connection_failures = stats.successive_connection_failures.saturating_add(1);
                } else {
                    stats.successive_connection_failures = 0;
                }
            }
            None => stats.successive_connection_failures = 0,
        }
    }
}
