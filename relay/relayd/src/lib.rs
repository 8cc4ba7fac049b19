//! HTTP surface and metrics for the `relayd` command relay.
#![deny(missing_docs)]

/// Axum routes for submit, fetch-next, report-result, webhook and status.
pub mod http;
/// Prometheus instruments.
pub mod metrics;

pub use http::{build_router, AppState};
pub use metrics::RelayMetrics;
