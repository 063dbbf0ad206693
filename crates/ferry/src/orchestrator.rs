// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use layered::Service;
use tick::Clock;

use crate::{
    BackoffPolicy, CancellationToken, Classification, ClientConfig, Error, LoadBalancer, NoBackoff, NoopStatsSink,
    RequestBinder, RequestTemplate, Response, RetryContext, RetryPolicy, ServerInstance, StatsSink, TransportExecutor,
};

/// Executes logical requests against load-balanced servers, retrying transient failures.
///
/// Every call runs the same loop: pick a server, bind the template to it, send it through the
/// transport, classify the outcome, and either return, retry (on the same or a new server after a
/// backoff delay), or give up. The [`StatsSink`] hears about every attempt.
///
/// The orchestrator spawns nothing; the loop runs on the task that awaits the call. Concurrent
/// calls share the load balancer, the stats sink, and the transport but nothing else.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use ferry::{
///     BoundRequest, ClientConfig, RequestTemplate, Response, RetryOrchestrator, ServerInstance, TransportError,
///     TransportExecutor,
/// };
/// use tick::Clock;
///
/// struct Accepting;
///
/// impl TransportExecutor for Accepting {
///     async fn execute(&self, _request: BoundRequest, _config: &ClientConfig) -> Result<Response, TransportError> {
///         Ok(http::Response::new(Bytes::new()))
///     }
/// }
///
/// # async fn example(clock: &Clock) -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = RetryOrchestrator::builder(
///     clock,
///     |_service: &str, _key: Option<&str>| Some(ServerInstance::new("10.0.0.1", 8080)),
///     Accepting,
/// )
/// .config(ClientConfig::default().retryable_status_codes([503]))
/// .build();
///
/// let template = RequestTemplate::builder("users").uri("http://users/v1/me").build()?;
/// let response = orchestrator.execute(&template).await?;
///
/// assert_eq!(response.status(), 200);
/// # Ok(())
/// # }
/// ```
pub struct RetryOrchestrator<T> {
    clock: Clock,
    load_balancer: Arc<dyn LoadBalancer>,
    transport: T,
    stats: Arc<dyn StatsSink>,
    backoff: Arc<dyn BackoffPolicy>,
    config: ClientConfig,
    policy: RetryPolicy,
}

impl<T> RetryOrchestrator<T> {
    /// Starts building an orchestrator with the default configuration, no backoff, and no stats.
    pub fn builder(clock: &Clock, load_balancer: impl LoadBalancer + 'static, transport: T) -> RetryOrchestratorBuilder<T> {
        RetryOrchestratorBuilder {
            clock: clock.clone(),
            load_balancer: Arc::new(load_balancer),
            transport,
            stats: Arc::new(NoopStatsSink),
            backoff: Arc::new(NoBackoff),
            config: ClientConfig::default(),
        }
    }

    /// Returns the configuration used for every call.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: TransportExecutor> RetryOrchestrator<T> {
    /// Executes `template`, retrying as the configuration allows.
    ///
    /// # Errors
    ///
    /// - [`Error::NoAvailableServer`] or [`Error::InvalidServer`] when server selection fails.
    /// - [`Error::InvalidRequest`] when the template cannot be bound.
    /// - The [`Error::Transport`] or [`Error::RetryableStatus`] of the last attempt once retries
    ///   are exhausted, or of the first attempt if the request is not eligible for retries.
    ///
    /// Responses with a status that is not configured as retryable are returned as `Ok`,
    /// whatever the status.
    pub async fn execute(&self, template: &RequestTemplate) -> Result<Response, Error> {
        self.run(template, None).await
    }

    /// Like [`execute`][Self::execute], but stops when `cancellation` is cancelled.
    ///
    /// Cancellation is checked before every server selection and after every attempt. An attempt
    /// in flight is not interrupted; its result is reported to the stats sink and then discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] once cancellation is observed, otherwise the same errors as
    /// [`execute`][Self::execute].
    pub async fn execute_with_cancellation(&self, template: &RequestTemplate, cancellation: &CancellationToken) -> Result<Response, Error> {
        self.run(template, Some(cancellation)).await
    }

    async fn run(&self, template: &RequestTemplate, cancellation: Option<&CancellationToken>) -> Result<Response, Error> {
        let is_cancelled = || cancellation.is_some_and(CancellationToken::is_cancelled);
        let service_id = template.service_id();
        let mut context = RetryContext::new(self.policy.is_eligible(template));

        loop {
            if is_cancelled() {
                tracing::debug!(ferry.service = service_id, ferry.attempt.count = context.attempts(), "call cancelled");
                return Err(Error::Cancelled);
            }

            let reuse = if self.policy.next_server_required(&context) {
                None
            } else {
                context.current_server().cloned()
            };
            let server = match reuse {
                Some(server) => server,
                None => {
                    let server = self.select_server(template)?;
                    context.set_server(server.clone());
                    server
                }
            };

            let request = RequestBinder::bind(template, &server, &self.config)?;
            let attempt = context.start_attempt();

            tracing::debug!(
                ferry.service = service_id,
                ferry.server = %server,
                ferry.attempt.index = attempt,
                http.method = %template.method(),
                "sending attempt"
            );

            let token = self.stats.on_attempt_start(&server);
            let stopwatch = self.clock.stopwatch();
            let result = self.transport.execute(request, &self.config).await;
            let outcome = self.policy.evaluate(&server, result);
            self.stats.on_attempt_complete(token, stopwatch.elapsed(), outcome.as_ref().err());

            if is_cancelled() {
                tracing::debug!(ferry.service = service_id, ferry.attempt.index = attempt, "discarding result of cancelled call");
                return Err(Error::Cancelled);
            }

            let classification = self.policy.classify(&context, &outcome);
            context.record(classification);

            match outcome {
                Ok(response) => return Ok(response),
                Err(error) if classification.is_retry() => {
                    let delay = self.backoff.delay_before(attempt.saturating_add(1));

                    tracing::event!(
                        name: "ferry.retry",
                        tracing::Level::WARN,
                        ferry.service = service_id,
                        ferry.server = %server,
                        ferry.attempt.index = attempt,
                        ferry.classification = %classification,
                        ferry.request_sent = error.is_request_sent(),
                        ferry.retry.delay = delay.as_secs_f32(),
                        error = %error,
                    );

                    context.set_last_error(error);

                    if !delay.is_zero() {
                        self.clock.delay(delay).await;
                    }
                }
                Err(error) => {
                    tracing::event!(
                        name: "ferry.failed",
                        tracing::Level::WARN,
                        ferry.service = service_id,
                        ferry.server = %server,
                        ferry.attempt.count = attempt,
                        ferry.eligible = context.is_eligible(),
                        ferry.request_sent = error.is_request_sent(),
                        error = %error,
                    );
                    return Err(error);
                }
            }
        }
    }

    fn select_server(&self, template: &RequestTemplate) -> Result<ServerInstance, Error> {
        let service_id = template.service_id();

        let Some(server) = self.load_balancer.choose_server(service_id, template.load_balancer_key()) else {
            tracing::warn!(ferry.service = service_id, "no server available");
            return Err(Error::NoAvailableServer {
                service_id: service_id.to_string(),
            });
        };

        if !server.is_valid() {
            tracing::warn!(ferry.service = service_id, ferry.server = %server, "load balancer returned an invalid server");
            return Err(Error::InvalidServer {
                service_id: service_id.to_string(),
                server,
            });
        }

        Ok(server)
    }
}

impl<T: TransportExecutor> Service<RequestTemplate> for RetryOrchestrator<T> {
    type Out = Result<Response, Error>;

    async fn execute(&self, input: RequestTemplate) -> Self::Out {
        self.run(&input, None).await
    }
}

impl<T: Clone> Clone for RetryOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            clock: self.clock.clone(),
            load_balancer: Arc::clone(&self.load_balancer),
            transport: self.transport.clone(),
            stats: Arc::clone(&self.stats),
            backoff: Arc::clone(&self.backoff),
            config: self.config.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<T> fmt::Debug for RetryOrchestrator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RetryOrchestrator`].
#[must_use]
pub struct RetryOrchestratorBuilder<T> {
    clock: Clock,
    load_balancer: Arc<dyn LoadBalancer>,
    transport: T,
    stats: Arc<dyn StatsSink>,
    backoff: Arc<dyn BackoffPolicy>,
    config: ClientConfig,
}

impl<T> RetryOrchestratorBuilder<T> {
    /// Sets the configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the delay policy between attempts.
    pub fn backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Sets the sink notified of every attempt.
    pub fn stats_sink(mut self, stats: impl StatsSink + 'static) -> Self {
        self.stats = Arc::new(stats);
        self
    }

    /// Builds the orchestrator.
    pub fn build(self) -> RetryOrchestrator<T> {
        RetryOrchestrator {
            clock: self.clock,
            load_balancer: self.load_balancer,
            transport: self.transport,
            stats: self.stats,
            backoff: self.backoff,
            policy: RetryPolicy::new(&self.config),
            config: self.config,
        }
    }
}

impl<T> fmt::Debug for RetryOrchestratorBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOrchestratorBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
