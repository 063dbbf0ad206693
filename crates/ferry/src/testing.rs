// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fake collaborators for exercising a [`RetryOrchestrator`][crate::RetryOrchestrator] without a
//! network or a real load balancer.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::Mutex;

use crate::{
    AttemptToken, BoundRequest, ClientConfig, Error, LoadBalancer, Response, ServerInstance, StatsSink, TransportError,
    TransportErrorKind, TransportExecutor,
};

/// A load balancer that hands out a fixed list of servers in rotation.
#[derive(Debug, Default)]
pub struct FakeLoadBalancer {
    servers: Vec<ServerInstance>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeLoadBalancer {
    /// Rotates over `servers`.
    pub fn new(servers: impl IntoIterator<Item = ServerInstance>) -> Self {
        Self {
            servers: servers.into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Never returns a server.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the `(service_id, key)` pairs of every selection.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().clone()
    }
}

impl LoadBalancer for FakeLoadBalancer {
    fn choose_server(&self, service_id: &str, key: Option<&str>) -> Option<ServerInstance> {
        let mut calls = self.calls.lock();
        let index = calls.len();
        calls.push((service_id.to_string(), key.map(str::to_string)));

        if self.servers.is_empty() {
            None
        } else {
            self.servers.get(index % self.servers.len()).cloned()
        }
    }
}

/// One scripted answer of a [`ScriptedTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    /// Respond with this status code.
    Status(u16),
    /// Fail with this kind of transport error.
    Failure(TransportErrorKind),
}

/// What a [`ScriptedTransport`] received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// The method.
    pub method: Method,
    /// The bound URI.
    pub uri: Uri,
    /// The headers.
    pub headers: HeaderMap,
    /// The body.
    pub body: Bytes,
    /// The server the request was bound to.
    pub server: ServerInstance,
}

type Hook = Box<dyn Fn(&BoundRequest) + Send + Sync>;

/// A transport that answers from a script.
///
/// Answers are used in order; once the script runs out the last answer repeats. Responses carry
/// the `host:port` of the server in their body.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    last: Mutex<Scripted>,
    requests: Mutex<Vec<RecordedRequest>>,
    hook: Option<Hook>,
}

impl ScriptedTransport {
    /// Answers with `outcomes` in order, then repeats the last one. An empty script answers `200`.
    pub fn new(outcomes: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            last: Mutex::new(Scripted::Status(200)),
            requests: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    /// Always answers with `outcome`.
    #[must_use]
    pub fn always(outcome: Scripted) -> Self {
        Self::new([outcome])
    }

    /// Runs `hook` whenever a request arrives, before answering.
    #[must_use]
    pub fn on_execute(mut self, hook: impl Fn(&BoundRequest) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Returns every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    fn next_outcome(&self) -> Scripted {
        let mut last = self.last.lock();
        if let Some(next) = self.script.lock().pop_front() {
            *last = next;
        }
        *last
    }
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("script", &self.script)
            .field("requests", &self.requests.lock().len())
            .finish_non_exhaustive()
    }
}

impl TransportExecutor for ScriptedTransport {
    async fn execute(&self, request: BoundRequest, _config: &ClientConfig) -> Result<Response, TransportError> {
        if let Some(hook) = &self.hook {
            hook(&request);
        }

        let server = request.server().clone();
        self.requests.lock().push(RecordedRequest {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            body: request.body().clone(),
            server: server.clone(),
        });

        match self.next_outcome() {
            Scripted::Status(code) => {
                let mut response = http::Response::new(Bytes::from(server.to_string()));
                *response.status_mut() = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Ok(response)
            }
            Scripted::Failure(kind) => Err(TransportError::from_kind(kind)),
        }
    }
}

/// One attempt seen by a [`RecordingStatsSink`].
#[derive(Debug, Clone)]
pub struct RecordedAttempt {
    /// The server of the attempt.
    pub server: ServerInstance,
    /// How long the attempt took.
    pub duration: Duration,
    /// The error message, if the attempt failed.
    pub error: Option<String>,
}

/// A sink that remembers every notification.
#[derive(Debug, Default)]
pub struct RecordingStatsSink {
    started: Mutex<Vec<ServerInstance>>,
    completed: Mutex<Vec<RecordedAttempt>>,
}

impl RecordingStatsSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the servers of every started attempt.
    #[must_use]
    pub fn started(&self) -> Vec<ServerInstance> {
        self.started.lock().clone()
    }

    /// Returns every completed attempt.
    #[must_use]
    pub fn completed(&self) -> Vec<RecordedAttempt> {
        self.completed.lock().clone()
    }
}

impl StatsSink for RecordingStatsSink {
    fn on_attempt_start(&self, server: &ServerInstance) -> AttemptToken {
        self.started.lock().push(server.clone());
        AttemptToken::new(server.clone())
    }

    fn on_attempt_complete(&self, token: AttemptToken, duration: Duration, error: Option<&Error>) {
        self.completed.lock().push(RecordedAttempt {
            server: token.server().clone(),
            duration,
            error: error.map(ToString::to_string),
        });
    }
}
