//! Route descriptors and the in-memory route table.
//!
//! Routes and their rate-limit policies are owned by the control plane. The
//! gateway only consumes them: an initial snapshot loaded at startup and a
//! stream of [`RouteChangeEvent`]s delivered over a channel whenever the
//! control plane publishes a change.
//!
//! # Matching
//!
//! A request path matches a route when it equals the route's `pathPrefix` or
//! continues it at a `/` boundary. The longest matching prefix wins, so
//! `/api/orders/42` prefers `/api/orders` over `/api`.
//!
//! # Snapshot semantics
//!
//! Lookups clone an `Arc` of the current descriptor, so an in-flight request
//! keeps the policy it started with even if the table changes mid-request.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};

/// Token-bucket quota attached to a route.
///
/// The control plane guarantees `burst_size >= requests_per_second`; routes
/// that violate it are refused by [`RouteTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    /// Sustained refill rate.
    pub requests_per_second: u32,
    /// Bucket capacity.
    pub burst_size: u32,
}

impl RateLimitPolicy {
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        Self {
            requests_per_second,
            burst_size,
        }
    }

    /// Check the invariants the limiter relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.requests_per_second == 0 {
            return Err("requestsPerSecond must be greater than 0".to_string());
        }
        if self.burst_size < self.requests_per_second {
            return Err(format!(
                "burstSize ({}) must be >= requestsPerSecond ({})",
                self.burst_size, self.requests_per_second
            ));
        }
        Ok(())
    }

    /// This instance's share of the quota when `instances` gateways each
    /// enforce it independently.
    pub fn share(&self, instances: u32) -> Self {
        let instances = instances.max(1);
        Self {
            requests_per_second: (self.requests_per_second / instances).max(1),
            burst_size: (self.burst_size / instances).max(1),
        }
    }
}

/// A route as published by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    pub id: String,
    pub path_prefix: String,
    /// Base URL requests are proxied to.
    pub upstream: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub allowed_consumers: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
}

impl RouteDescriptor {
    /// Whether a consumer may call this route.
    ///
    /// An absent or empty whitelist admits everyone.
    pub fn admits(&self, consumer_id: &str) -> bool {
        match &self.allowed_consumers {
            Some(allowed) if !allowed.is_empty() => allowed.iter().any(|c| c == consumer_id),
            _ => true,
        }
    }

    fn matches(&self, path: &str) -> bool {
        let prefix = self.path_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("route id cannot be empty".to_string());
        }
        if !self.path_prefix.starts_with('/') {
            return Err(format!("pathPrefix '{}' must start with '/'", self.path_prefix));
        }
        if let Some(policy) = &self.rate_limit {
            policy.validate()?;
        }
        Ok(())
    }
}

/// Change notification emitted by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RouteChangeEvent {
    /// A route was created or its definition changed.
    Upsert { route: RouteDescriptor },
    /// A route was deleted or unpublished.
    Remove {
        #[serde(rename = "routeId")]
        route_id: String,
    },
    /// Full resynchronisation.
    ReplaceAll { routes: Vec<RouteDescriptor> },
}

/// Concurrent route table with copy-on-write snapshots.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Arc<Vec<Arc<RouteDescriptor>>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from an initial set of routes, skipping invalid entries.
    pub fn with_routes(routes: Vec<RouteDescriptor>) -> Self {
        let table = Self::new();
        table.apply(RouteChangeEvent::ReplaceAll { routes });
        table
    }

    /// Load routes from a JSON file containing an array of descriptors.
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::ConfigError(format!("Cannot read routes file {}: {e}", path.display()))
        })?;
        let routes: Vec<RouteDescriptor> = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::ConfigError(format!("Invalid routes file {}: {e}", path.display()))
        })?;
        Ok(Self::with_routes(routes))
    }

    /// Find the route with the longest prefix matching `path`.
    pub fn find(&self, path: &str) -> Option<Arc<RouteDescriptor>> {
        let routes = self.routes.read().clone();
        routes
            .iter()
            .filter(|route| route.matches(path))
            .max_by_key(|route| route.path_prefix.trim_end_matches('/').len())
            .cloned()
    }

    /// Look up a route by id.
    pub fn get(&self, route_id: &str) -> Option<Arc<RouteDescriptor>> {
        self.routes
            .read()
            .iter()
            .find(|route| route.id == route_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Apply a change notification.
    pub fn apply(&self, event: RouteChangeEvent) {
        match event {
            RouteChangeEvent::Upsert { route } => {
                if let Err(reason) = route.validate() {
                    warn!(route_id = %route.id, %reason, "Ignoring invalid route update");
                    return;
                }
                let mut guard = self.routes.write();
                let mut next: Vec<_> = guard.iter().filter(|r| r.id != route.id).cloned().collect();
                debug!(route_id = %route.id, "Route upserted");
                next.push(Arc::new(route));
                *guard = Arc::new(next);
            }
            RouteChangeEvent::Remove { route_id } => {
                let mut guard = self.routes.write();
                let next: Vec<_> = guard.iter().filter(|r| r.id != route_id).cloned().collect();
                if next.len() == guard.len() {
                    debug!(route_id = %route_id, "Remove for unknown route ignored");
                }
                *guard = Arc::new(next);
            }
            RouteChangeEvent::ReplaceAll { routes } => {
                let valid: Vec<_> = routes
                    .into_iter()
                    .filter(|route| match route.validate() {
                        Ok(()) => true,
                        Err(reason) => {
                            warn!(route_id = %route.id, %reason, "Skipping invalid route");
                            false
                        }
                    })
                    .map(Arc::new)
                    .collect();
                info!(count = valid.len(), "Route table replaced");
                *self.routes.write() = Arc::new(valid);
            }
        }
    }

    /// Consume change notifications until the channel closes or `cancel` fires.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<RouteChangeEvent>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) {
        let table = Arc::clone(self);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Route change listener cancelled");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => table.apply(event),
                        None => {
                            info!("Route change channel closed");
                            break;
                        }
                    }
                }
            }
        });
    }
}
