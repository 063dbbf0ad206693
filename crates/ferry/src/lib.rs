// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Client-side load-balanced HTTP execution with retry orchestration.
//!
//! Requests are addressed to a named service rather than a host. For every attempt a
//! [`LoadBalancer`] picks a concrete [`ServerInstance`], the [`RequestBinder`] turns the
//! [`RequestTemplate`] into a request for that server, and a [`TransportExecutor`] sends it.
//! The [`RetryPolicy`] then decides whether the call succeeded, should be retried on the same or
//! a different server, or failed for good.
//!
//! # Core Types
//!
//! - [`RequestTemplate`]: Immutable description of a logical request.
//! - [`ClientConfig`]: Timeouts, secure override, redirect handling, and retry limits.
//! - [`RetryOrchestrator`]: Runs the attempt loop; the entry point for callers.
//! - [`TransportExecutor`]: Sends a single attempt over a concrete HTTP stack.
//! - [`StatsSink`]: Hears about every attempt, e.g. to feed load balancer bookkeeping.
//!
//! # Retry Rules
//!
//! A call is eligible for retries when its template says so, when the configuration allows
//! retrying every operation, or when its method is idempotent (`GET`, `HEAD`, `OPTIONS`).
//! Transport failures and responses whose status is listed in
//! [`ClientConfig::retryable_status_codes`] are retried, first against the same server up to
//! [`ClientConfig::max_retries_same_server`] times, then against newly selected servers up to
//! [`ClientConfig::max_retries_next_server`] times. A call therefore makes at most
//! `(same + 1) * (next + 1)` attempts. Any other response, including 4xx and 5xx, is returned as-is.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use ferry::{
//!     Backoff, ClientConfig, DelayBackoff, RequestTemplate, RetryOrchestrator, ServerInstance,
//!     ServerStatsRegistry, TransportExecutor,
//! };
//! use tick::Clock;
//!
//! # async fn example(clock: &Clock, transport: impl TransportExecutor) -> Result<(), ferry::Error> {
//! let config = ClientConfig::default()
//!     .connect_timeout(Duration::from_millis(500))
//!     .max_retries_same_server(1)
//!     .retryable_status_codes([503]);
//!
//! let orchestrator = RetryOrchestrator::builder(
//!     clock,
//!     |_service: &str, _key: Option<&str>| Some(ServerInstance::new("10.0.0.1", 8080)),
//!     transport,
//! )
//! .config(config)
//! .backoff(DelayBackoff::new(Backoff::Exponential, Duration::from_millis(50)).use_jitter(true))
//! .stats_sink(ServerStatsRegistry::new())
//! .build();
//!
//! let template = RequestTemplate::builder("users").uri("http://users/v1/profile?id=7").build()?;
//! let response = orchestrator.execute(&template).await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```

mod backoff;
mod balancer;
mod binder;
mod body;
mod cancel;
mod config;
mod error;
mod orchestrator;
mod policy;
mod rnd;
mod server;
mod stats;
mod template;
mod transport;

#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

pub use backoff::{Backoff, BackoffPolicy, DelayBackoff, NoBackoff};
pub use balancer::LoadBalancer;
pub use binder::{BoundRequest, RequestBinder};
pub use body::{BodyError, DEFAULT_MAX_REPLAY_BYTES, ReplayableBody};
pub use cancel::CancellationToken;
pub use config::{
    ClientConfig, ConfigError, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES_NEXT_SERVER, DEFAULT_MAX_RETRIES_SAME_SERVER,
    DEFAULT_READ_TIMEOUT,
};
pub use error::{Error, InvalidRequestError, RetryableStatusError, TransportError, TransportErrorKind};
pub use orchestrator::{RetryOrchestrator, RetryOrchestratorBuilder};
pub use policy::{Classification, RetryContext, RetryPolicy};
pub use server::ServerInstance;
pub use stats::{AttemptToken, NoopStatsSink, ServerStats, ServerStatsRegistry, StatsSink};
pub use template::{RequestCustomizer, RequestTemplate, RequestTemplateBuilder};
pub use transport::TransportExecutor;

/// A fully received HTTP response.
pub type Response = http::Response<bytes::Bytes>;
