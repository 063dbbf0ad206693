// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use crate::ServerInstance;

/// Selects the server for an attempt.
///
/// The selection algorithm and the discovery of candidate servers are up to the implementation.
/// A load balancer is shared by all concurrent calls and must synchronize internally.
///
/// Any `Fn(&str, Option<&str>) -> Option<ServerInstance> + Send + Sync` closure is a load
/// balancer.
///
/// # Examples
///
/// ```
/// use ferry::{LoadBalancer, ServerInstance};
///
/// let pinned = |service: &str, _key: Option<&str>| (service == "users").then(|| ServerInstance::new("10.0.0.5", 8080));
///
/// assert!(pinned.choose_server("users", None).is_some());
/// assert!(pinned.choose_server("orders", None).is_none());
/// ```
pub trait LoadBalancer: Send + Sync {
    /// Returns a server for `service_id`, or `None` if there is no candidate.
    ///
    /// `key` is the opaque hint of the request, e.g. for canary routing.
    fn choose_server(&self, service_id: &str, key: Option<&str>) -> Option<ServerInstance>;
}

impl<F> LoadBalancer for F
where
    F: Fn(&str, Option<&str>) -> Option<ServerInstance> + Send + Sync,
{
    fn choose_server(&self, service_id: &str, key: Option<&str>) -> Option<ServerInstance> {
        self(service_id, key)
    }
}

impl<T: LoadBalancer + ?Sized> LoadBalancer for Arc<T> {
    fn choose_server(&self, service_id: &str, key: Option<&str>) -> Option<ServerInstance> {
        (**self).choose_server(service_id, key)
    }
}
