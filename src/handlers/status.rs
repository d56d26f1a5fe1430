//! Status and health check handlers for the billing server.
//!
//! - `/health` - liveness check
//! - `/ready` - readiness check (fails once the mail dispatcher is closed)
//! - `/status` - webhook and mailer counters, latency, memory
//!
//! # Architecture
//!
//! ```text
//! HTTP Request ──> Axum Router ──> status_handler ──> AppState
//!                                        │                │
//!                                        ▼                ▼
//!                              StatusResponse     WebhookState
//!                                        │        ├─ WebhookStats + LatencyHistogram
//!                                        ▼        └─ Mailer stats
//!                                   JSON Response
//! ```
//!
//! # Example Response
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "name": "levelup-billing",
//!   "uptime_seconds": 3600,
//!   "webhooks": { "received": 120, "rejected": 2, "applied": 110, "ignored": 6,
//!                 "not_found": 2, "persistence_failures": 0 },
//!   "mailer": { "enqueued": 9, "dropped": 0, "sent": 9, "failed": 0, "queued": 0 },
//!   "memory": { "rss_bytes": 52428800, "virtual_bytes": 268435456 },
//!   "latency": { "p50_ms": 1.2, "p95_ms": 4.5, "p99_ms": 9.8,
//!                "total_requests": 120, "mean_ms": 1.8, "max_ms": 25.0 },
//!   "status": "running",
//!   "timestamp": "2026-01-01T12:00:00Z"
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, instrument};

use crate::mailer::MailerStatsSnapshot;
use crate::stripe::{WebhookState, WebhookStatsSnapshot};

/// Server version from Cargo.toml
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name from Cargo.toml
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

// ============================================================================
// Response Types
// ============================================================================

/// Health check response for liveness checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Health status
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

/// Detailed server status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Server version (from Cargo.toml)
    pub version: String,

    /// Server name
    pub name: String,

    /// Server uptime in seconds
    pub uptime_seconds: u64,

    /// Webhook pipeline counters
    pub webhooks: WebhookStatsSnapshot,

    /// Mail dispatcher counters
    pub mailer: MailerStatsSnapshot,

    /// Memory usage metrics
    pub memory: MemoryMetrics,

    /// Webhook handler latency (percentiles)
    pub latency: LatencyMetrics,

    /// Server status (always "running" if responding)
    pub status: String,

    /// RFC 3339 timestamp of when status was generated
    pub timestamp: String,
}

/// Memory usage metrics collected from sysinfo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    /// Resident Set Size (bytes)
    pub rss_bytes: u64,

    /// Virtual memory size (bytes)
    pub virtual_bytes: u64,
}

/// Latency percentile metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    /// 50th percentile latency in milliseconds
    pub p50_ms: f64,

    /// 95th percentile latency in milliseconds
    pub p95_ms: f64,

    /// 99th percentile latency in milliseconds
    pub p99_ms: f64,

    /// Total number of requests recorded
    pub total_requests: u64,

    /// Mean latency in milliseconds
    pub mean_ms: f64,

    /// Maximum latency recorded in milliseconds
    pub max_ms: f64,
}

// ============================================================================
// Latency Histogram
// ============================================================================

/// Thread-safe latency histogram for recording request timings.
///
/// Tracks latencies from 1 microsecond to 60 seconds with 3 significant
/// figures of precision.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: RwLock<Histogram<u64>>,
}

impl LatencyHistogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        let histogram =
            Histogram::new_with_bounds(1, 60_000_000, 3).expect("static histogram bounds are valid");
        Self {
            inner: RwLock::new(histogram),
        }
    }

    /// Record a latency value in microseconds. Out-of-range values are ignored.
    pub fn record(&self, latency_us: u64) {
        let _ = self.inner.write().record(latency_us.max(1));
    }

    /// Record a latency duration.
    pub fn record_duration(&self, duration: std::time::Duration) {
        self.record(duration.as_micros() as u64);
    }

    /// Number of recorded values.
    pub fn count(&self) -> u64 {
        self.inner.read().len()
    }

    /// Percentiles and summary converted to milliseconds.
    pub fn metrics(&self) -> LatencyMetrics {
        let hist = self.inner.read();
        LatencyMetrics {
            p50_ms: hist.value_at_percentile(50.0) as f64 / 1000.0,
            p95_ms: hist.value_at_percentile(95.0) as f64 / 1000.0,
            p99_ms: hist.value_at_percentile(99.0) as f64 / 1000.0,
            total_requests: hist.len(),
            mean_ms: hist.mean() / 1000.0,
            max_ms: hist.max() as f64 / 1000.0,
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Application State
// ============================================================================

/// Shared state behind the status routes.
pub struct AppState {
    start_time: Instant,
    webhook: Arc<WebhookState>,
}

impl AppState {
    /// Wrap the webhook pipeline; uptime counts from now.
    pub fn new(webhook: Arc<WebhookState>) -> Self {
        Self {
            start_time: Instant::now(),
            webhook,
        }
    }

    /// Server uptime in seconds.
    #[inline]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// The webhook pipeline.
    pub fn webhook(&self) -> &Arc<WebhookState> {
        &self.webhook
    }

    /// Build the current status document.
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            version: SERVER_VERSION.to_string(),
            name: SERVER_NAME.to_string(),
            uptime_seconds: self.uptime_seconds(),
            webhooks: self.webhook.stats().snapshot(),
            mailer: self.webhook.mailer().stats(),
            memory: collect_memory_metrics(),
            latency: self.webhook.stats().latency.metrics(),
            status: "running".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ============================================================================
// System Metrics Collection
// ============================================================================

/// Memory usage of the current process; zeros if it cannot be read.
fn collect_memory_metrics() -> MemoryMetrics {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();

    // sysinfo 0.33 API: refresh_processes with ProcessesToUpdate
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    match system.process(pid) {
        Some(process) => MemoryMetrics {
            rss_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
        },
        None => {
            debug!("Could not find current process in sysinfo");
            MemoryMetrics::default()
        }
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

/// `GET /health`
#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    debug!("Health check requested");
    (StatusCode::OK, Json(HealthResponse::default()))
}

/// `GET /ready`
///
/// - `200 OK` while the mail dispatcher accepts jobs
/// - `503 Service Unavailable` once it is closed (shutdown in progress)
#[instrument(skip_all)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    debug!("Readiness check requested");
    if state.webhook.mailer().is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "shutting_down".to_string(),
            }),
        );
    }
    (StatusCode::OK, Json(HealthResponse::default()))
}

/// `GET /status`
///
/// ```bash
/// curl http://localhost:8080/status
/// ```
#[instrument(skip_all)]
pub async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    debug!("Status check requested");
    (StatusCode::OK, Json(state.status()))
}

// ============================================================================
// Router Setup
// ============================================================================

/// Router with `/health`, `/ready` and `/status`.
pub fn status_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ready", get(readiness_handler))
        .with_state(state)
}

// ============================================================================
// Tests
// ============================================================================
