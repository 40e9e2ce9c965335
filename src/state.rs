//! # Application State Management
//!
//! Shared state accessed by every HTTP request handler and the WebSocket
//! transport.
//!
//! ## Thread Safety Pattern:
//! All mutable data sits behind `Arc<RwLock<T>>`: many concurrent readers or
//! one writer, shared across handlers by cloning the `Arc`. Updates are short
//! counter bumps, so the write lock is never held across I/O.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The application state shared across all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration, updatable at runtime.
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay and HTTP metrics, updated by middleware and the transport layer.
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started. Never changes, so shared directly.
    pub start_time: Instant,
}

/// Counters collected across all requests and relay sessions.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since server start.
    pub request_count: u64,

    /// Total HTTP errors since server start.
    pub error_count: u64,

    /// Currently active relay sessions.
    pub active_sessions: u32,

    /// Relay sessions started since server start.
    pub sessions_started: u64,

    /// Audio chunks accepted into session buffers, summed over finished
    /// sessions.
    pub chunks_relayed: u64,

    /// Audio chunks discarded by backpressure policies, summed over finished
    /// sessions.
    pub chunks_dropped: u64,

    /// Per-endpoint request statistics, keyed like "GET /api/v1/health".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration. Cloning releases the lock
    /// immediately; `AppConfig` is cheap to copy.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
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

    /// Called when a relay session is successfully registered.
    pub fn session_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_sessions += 1;
        metrics.sessions_started += 1;
    }

    /// Called at session teardown; folds the session's chunk counters into
    /// the server-wide totals. Underflow-guarded so a double report of the
    /// same session cannot panic.
    pub fn session_finished(&self, chunks_enqueued: u64, chunks_dropped: u64) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
        metrics.chunks_relayed += chunks_enqueued;
        metrics.chunks_dropped += chunks_dropped;
    }

    /// Consistent copy of the metrics for the /metrics endpoint; the clone
    /// keeps the lock out of HTTP response generation.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            sessions_started: metrics.sessions_started,
            chunks_relayed: metrics.chunks_relayed,
            chunks_dropped: metrics.chunks_dropped,
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

    /// Error rate in [0.0, 1.0]; 0.0 before any request.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
