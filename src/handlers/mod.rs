//! HTTP handlers outside the webhook route

pub mod status;

pub use status::{
    health_handler, readiness_handler, status_handler, status_router, AppState, HealthResponse,
    LatencyHistogram, LatencyMetrics, StatusResponse,
};
