// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeSet;
use std::fmt;

use http::Method;
use recoverable::{Recovery, RecoveryKind};

use crate::{ClientConfig, Error, RequestTemplate, Response, RetryableStatusError, ServerInstance, TransportError};

/// What the orchestrator does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Classification {
    /// Return the response to the caller.
    Success,
    /// Repeat the attempt against the current server.
    RetrySameServer,
    /// Repeat the attempt against a newly selected server.
    RetryNewServer,
    /// Stop and return the error to the caller.
    Fatal,
}

impl Classification {
    /// Returns `true` for either retry outcome.
    #[must_use]
    pub fn is_retry(self) -> bool {
        matches!(self, Self::RetrySameServer | Self::RetryNewServer)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetrySameServer => "retry_same_server",
            Self::RetryNewServer => "retry_new_server",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call state of the retry loop.
///
/// A context is created at the start of every call and dropped at its end. It is never shared
/// between calls.
#[derive(Debug)]
pub struct RetryContext {
    eligible: bool,
    attempts: u32,
    attempt_same_server: u32,
    attempt_next_server: u32,
    current_server: Option<ServerInstance>,
    last_classification: Option<Classification>,
    last_error: Option<Error>,
    exhausted: bool,
}

impl RetryContext {
    /// Creates the context of a call whose retry eligibility has already been decided.
    #[must_use]
    pub fn new(eligible: bool) -> Self {
        Self {
            eligible,
            attempts: 0,
            attempt_same_server: 0,
            attempt_next_server: 0,
            current_server: None,
            last_classification: None,
            last_error: None,
            exhausted: false,
        }
    }

    /// Returns whether the call may be retried at all.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.eligible
    }

    /// Returns the number of attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns how many times the current server has been retried.
    #[must_use]
    pub fn attempt_same_server(&self) -> u32 {
        self.attempt_same_server
    }

    /// Returns how many times a different server has been selected.
    #[must_use]
    pub fn attempt_next_server(&self) -> u32 {
        self.attempt_next_server
    }

    /// Returns the server of the current attempt.
    #[must_use]
    pub fn current_server(&self) -> Option<&ServerInstance> {
        self.current_server.as_ref()
    }

    /// Returns the classification of the previous attempt.
    #[must_use]
    pub fn last_classification(&self) -> Option<Classification> {
        self.last_classification
    }

    /// Returns the error of the most recent retried attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Returns `true` once the loop has given up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn set_server(&mut self, server: ServerInstance) {
        self.current_server = Some(server);
    }

    pub(crate) fn start_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub(crate) fn record(&mut self, classification: Classification) {
        self.last_classification = Some(classification);
        match classification {
            Classification::RetrySameServer => {
                self.attempt_same_server = self.attempt_same_server.saturating_add(1);
            }
            Classification::RetryNewServer => {
                self.attempt_next_server = self.attempt_next_server.saturating_add(1);
                self.attempt_same_server = 0;
            }
            Classification::Fatal => self.exhausted = true,
            Classification::Success => {}
        }
    }

    pub(crate) fn set_last_error(&mut self, error: Error) {
        self.last_error = Some(error);
    }
}

/// Decides whether a call may be retried and how each attempt is classified.
///
/// The policy is derived from a [`ClientConfig`] and holds no per-call state; that lives in
/// [`RetryContext`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    ok_to_retry_on_all_operations: bool,
    max_retries_same_server: u32,
    max_retries_next_server: u32,
    retryable_status_codes: BTreeSet<u16>,
}

impl RetryPolicy {
    /// Creates the policy described by `config`.
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            ok_to_retry_on_all_operations: config.get_ok_to_retry_on_all_operations(),
            max_retries_same_server: config.get_max_retries_same_server(),
            max_retries_next_server: config.get_max_retries_next_server(),
            retryable_status_codes: config.get_retryable_status_codes().clone(),
        }
    }

    /// Returns whether the call described by `template` may be retried.
    ///
    /// An explicit override on the template wins. Otherwise idempotent methods (`GET`, `HEAD` and
    /// `OPTIONS`) are eligible, and every method is eligible when the configuration allows
    /// retrying all operations.
    #[must_use]
    pub fn is_eligible(&self, template: &RequestTemplate) -> bool {
        template
            .retryable_override()
            .unwrap_or_else(|| self.ok_to_retry_on_all_operations || is_idempotent(template.method()))
    }

    /// Turns the raw transport result into the outcome of the attempt.
    ///
    /// Responses with a retryable status become [`Error::RetryableStatus`].
    ///
    /// # Errors
    ///
    /// Returns the transport error, or the retryable-status error.
    pub fn evaluate(&self, server: &ServerInstance, result: Result<Response, TransportError>) -> Result<Response, Error> {
        match result {
            Ok(response) if self.retryable_status_codes.contains(&response.status().as_u16()) => {
                Err(RetryableStatusError::new(server.clone(), response).into())
            }
            Ok(response) => Ok(response),
            Err(error) => Err(error.into()),
        }
    }

    /// Classifies the outcome of the attempt tracked by `context`.
    #[must_use]
    pub fn classify(&self, context: &RetryContext, outcome: &Result<Response, Error>) -> Classification {
        let error = match outcome {
            Ok(_) => return Classification::Success,
            Err(error) => error,
        };

        if !context.is_eligible() || error.recovery().kind() != RecoveryKind::Retry {
            return Classification::Fatal;
        }

        if context.attempt_same_server() < self.max_retries_same_server {
            Classification::RetrySameServer
        } else if context.attempt_next_server() < self.max_retries_next_server {
            Classification::RetryNewServer
        } else {
            Classification::Fatal
        }
    }

    /// Returns `true` when the next attempt needs a server from the load balancer.
    #[must_use]
    pub fn next_server_required(&self, context: &RetryContext) -> bool {
        context.current_server().is_none() || context.last_classification() == Some(Classification::RetryNewServer)
    }

    /// Returns the largest number of attempts one call can make.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries_same_server
            .saturating_add(1)
            .saturating_mul(self.max_retries_next_server.saturating_add(1))
    }
}

fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::io;

    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    fn template(method: Method) -> RequestTemplate {
        RequestTemplate::builder("svc").method(method).uri("http://svc/").build().unwrap()
    }

    fn response(status: u16) -> Response {
        http::Response::builder().status(status).body(Bytes::new()).unwrap()
    }

    fn refused() -> Error {
        TransportError::connect(io::Error::from(io::ErrorKind::ConnectionRefused)).into()
    }

    #[rstest]
    #[case(Method::GET, true)]
    #[case(Method::HEAD, true)]
    #[case(Method::OPTIONS, true)]
    #[case(Method::POST, false)]
    #[case(Method::PUT, false)]
    #[case(Method::PATCH, false)]
    #[case(Method::DELETE, false)]
    fn eligibility_by_method(#[case] method: Method, #[case] expected: bool) {
        let policy = RetryPolicy::new(&ClientConfig::default());
        assert_eq!(policy.is_eligible(&template(method)), expected);
    }

    #[test]
    fn eligibility_override_wins() {
        let policy = RetryPolicy::new(&ClientConfig::default().ok_to_retry_on_all_operations(true));
        let get = RequestTemplate::builder("svc").retryable(false).build().unwrap();
        assert!(!policy.is_eligible(&get));

        let policy = RetryPolicy::new(&ClientConfig::default());
        let post = RequestTemplate::builder("svc").method(Method::POST).retryable(true).build().unwrap();
        assert!(policy.is_eligible(&post));
    }

    #[test]
    fn all_operations_flag_makes_post_eligible() {
        let policy = RetryPolicy::new(&ClientConfig::default().ok_to_retry_on_all_operations(true));
        assert!(policy.is_eligible(&template(Method::POST)));
    }

    #[test]
    fn retryable_status_becomes_error() {
        let policy = RetryPolicy::new(&ClientConfig::default().retryable_status_codes([503]));
        let server = ServerInstance::new("h", 80);

        let outcome = policy.evaluate(&server, Ok(response(503)));
        assert!(matches!(outcome, Err(Error::RetryableStatus(ref e)) if e.server() == &server));

        let outcome = policy.evaluate(&server, Ok(response(404)));
        assert_eq!(outcome.unwrap().status(), 404);
    }

    #[test]
    fn success_regardless_of_eligibility() {
        let policy = RetryPolicy::new(&ClientConfig::default());
        let context = RetryContext::new(false);

        assert_eq!(policy.classify(&context, &Ok(response(500))), Classification::Success);
    }

    #[test]
    fn ineligible_failure_is_fatal() {
        let policy = RetryPolicy::new(&ClientConfig::default().max_retries_same_server(3));
        let context = RetryContext::new(false);

        assert_eq!(policy.classify(&context, &Err(refused())), Classification::Fatal);
    }

    #[test]
    fn non_recoverable_error_is_fatal() {
        let policy = RetryPolicy::new(&ClientConfig::default().max_retries_same_server(3));
        let context = RetryContext::new(true);

        let invalid = Error::from(TransportError::invalid_request("nope"));
        assert_eq!(policy.classify(&context, &Err(invalid)), Classification::Fatal);
        assert_eq!(policy.classify(&context, &Err(Error::Cancelled)), Classification::Fatal);
    }

    #[test]
    fn budget_walks_same_then_next_then_fatal() {
        let policy = RetryPolicy::new(
            &ClientConfig::default()
                .max_retries_same_server(1)
                .max_retries_next_server(1),
        );
        let mut context = RetryContext::new(true);
        let mut sequence = Vec::new();

        loop {
            let classification = policy.classify(&context, &Err(refused()));
            context.record(classification);
            sequence.push(classification);
            if classification == Classification::Fatal {
                break;
            }
        }

        assert_eq!(
            sequence,
            [
                Classification::RetrySameServer,
                Classification::RetryNewServer,
                Classification::RetrySameServer,
                Classification::Fatal,
            ]
        );
        assert!(context.is_exhausted());
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn next_server_required_on_first_attempt_and_after_new_server() {
        let policy = RetryPolicy::new(&ClientConfig::default());
        let mut context = RetryContext::new(true);
        assert!(policy.next_server_required(&context));

        context.set_server(ServerInstance::new("a", 80));
        assert!(!policy.next_server_required(&context));

        context.record(Classification::RetrySameServer);
        assert!(!policy.next_server_required(&context));

        context.record(Classification::RetryNewServer);
        assert!(policy.next_server_required(&context));
        assert_eq!(context.attempt_same_server(), 0);
        assert_eq!(context.attempt_next_server(), 1);
    }
}
