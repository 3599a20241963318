//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor. The whole
//! component graph — store, registry, authorizer, refresh coordinator,
//! broadcaster, translator — is built once here and passed around by handle;
//! there are no process-wide mutable globals.
//!
//! ## Thread Safety Pattern:
//! Mutable pieces (config, metrics) sit behind `Arc<RwLock<_>>`: many readers
//! or one writer, with locks held only long enough to copy data out.

use crate::auth::{Authorizer, RemoteKeySet, TokenValidator};
use crate::broadcast::Broadcaster;
use crate::config::AppConfig;
use crate::lifecycle::events::{LifecycleEvent, LifecycleState};
use crate::lifecycle::refresh::RefreshCoordinator;
use crate::session::registry::ConnectionRegistry;
use crate::session::store::{MemorySessionStore, SessionStore};
use crate::translator::{PassthroughTranslator, Translator};
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// The main application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be read concurrently)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance and lifecycle metrics (updated by every request)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub authorizer: Arc<Authorizer>,
    pub refresh: Arc<RefreshCoordinator>,
    pub broadcaster: Arc<Broadcaster>,
    pub translator: Arc<dyn Translator>,

    /// Sink for lifecycle transitions; the receiver side feeds metrics
    pub lifecycle_events: tokio::sync::mpsc::UnboundedSender<LifecycleEvent>,
}

/// Counters surfaced by /health and /metrics.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Admissions that produced a live connection
    pub connections_admitted: u64,

    /// Attempts refused by the authorizer or the registry
    pub admission_refusals: u64,

    /// Connections closed for missing their heartbeat deadline
    pub heartbeat_timeouts: u64,

    /// Refresh windows opened / completed
    pub refreshes_started: u64,
    pub refreshes_completed: u64,

    /// Audio chunk deliveries to listeners
    pub chunks_delivered: u64,

    /// Lifecycle transition counts, keyed "from->to"
    pub lifecycle_transitions: HashMap<String, u64>,

    /// Detailed metrics for each HTTP endpoint
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the component graph. Returns the state plus the lifecycle event
    /// receiver; `main` spawns the consumer that folds events into metrics.
    pub fn new(config: AppConfig) -> (Self, UnboundedReceiver<LifecycleEvent>) {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let registry = Arc::new(ConnectionRegistry::new(
            store.clone(),
            ChronoDuration::seconds(config.lifecycle.connection_ttl_secs as i64),
            config.performance.max_concurrent_sessions,
            config.performance.max_listeners_per_session,
        ));
        let validator = TokenValidator::new(
            Arc::new(RemoteKeySet::new(config.auth.jwks_url.clone())),
            config.auth.issuer.clone(),
            config.auth.audience.clone(),
            config.auth.expected_token_use.clone(),
        );
        let authorizer = Arc::new(Authorizer::new(Arc::new(validator)));
        let refresh = Arc::new(RefreshCoordinator::new(
            registry.clone(),
            config.lifecycle.clone(),
        ));
        let translator: Arc<dyn Translator> = Arc::new(PassthroughTranslator::new(
            config.audio.sample_rate,
            config.audio.channels,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state = Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            store,
            registry,
            authorizer,
            refresh,
            broadcaster: Arc::new(Broadcaster::new()),
            translator,
            lifecycle_events: events_tx,
        };
        (state, events_rx)
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_chunks_delivered(&self, delivered: u64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.chunks_delivered += delivered;
    }

    /// Fold one observed lifecycle transition into the counters.
    pub fn record_lifecycle_event(&self, event: &LifecycleEvent) {
        let mut metrics = self.metrics.write().unwrap();
        let key = format!("{}->{}", event.from.as_str(), event.to.as_str());
        *metrics.lifecycle_transitions.entry(key).or_insert(0) += 1;

        match (event.from, event.to) {
            (LifecycleState::Connecting, LifecycleState::Connected) => {
                metrics.connections_admitted += 1;
            }
            (LifecycleState::Connecting, LifecycleState::Closed) => {
                metrics.admission_refusals += 1;
            }
            (LifecycleState::Connected, LifecycleState::Refreshing) => {
                metrics.refreshes_started += 1;
            }
            (LifecycleState::Refreshing, LifecycleState::Closed) => {
                metrics.refreshes_completed += 1;
            }
            _ => {}
        }

        if matches!(
            event.reason,
            Some(crate::lifecycle::events::CloseReason::HeartbeatTimeout)
        ) {
            metrics.heartbeat_timeouts += 1;
        }
    }

    /// Snapshot for the /metrics endpoint; clones so no lock is held while
    /// the response serializes.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            connections_admitted: metrics.connections_admitted,
            admission_refusals: metrics.admission_refusals,
            heartbeat_timeouts: metrics.heartbeat_timeouts,
            refreshes_started: metrics.refreshes_started,
            refreshes_completed: metrics.refreshes_completed,
            chunks_delivered: metrics.chunks_delivered,
            lifecycle_transitions: metrics.lifecycle_transitions.clone(),
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::events::CloseReason;
    use chrono::Utc;

    fn event(from: LifecycleState, to: LifecycleState, reason: Option<CloseReason>) -> LifecycleEvent {
        LifecycleEvent {
            connection_id: "c-1".to_string(),
            from,
            to,
            reason,
            at: Utc::now(),
        }
    }

    #[test]
    fn lifecycle_events_fold_into_counters() {
        let (state, _rx) = AppState::new(AppConfig::default());

        state.record_lifecycle_event(&event(
            LifecycleState::Connecting,
            LifecycleState::Connected,
            None,
        ));
        state.record_lifecycle_event(&event(
            LifecycleState::Connected,
            LifecycleState::Refreshing,
            None,
        ));
        state.record_lifecycle_event(&event(
            LifecycleState::Refreshing,
            LifecycleState::Closed,
            Some(CloseReason::Superseded),
        ));
        state.record_lifecycle_event(&event(
            LifecycleState::Connected,
            LifecycleState::Closed,
            Some(CloseReason::HeartbeatTimeout),
        ));

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.connections_admitted, 1);
        assert_eq!(snapshot.refreshes_started, 1);
        assert_eq!(snapshot.refreshes_completed, 1);
        assert_eq!(snapshot.heartbeat_timeouts, 1);
        assert_eq!(
            snapshot.lifecycle_transitions.get("connecting->connected"),
            Some(&1)
        );
    }

    #[test]
    fn endpoint_metrics_average_and_error_rate() {
        let (state, _rx) = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = snapshot.endpoint_metrics.get("GET /health").unwrap();
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
