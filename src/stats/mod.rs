//! Service metrics
//!
//! Request counters kept by the lookup service and their Prometheus
//! exposition.

pub mod metrics;
pub mod prometheus;

pub use metrics::{ServiceSnapshot, ServiceStats};
pub use prometheus::{table_metrics, MetricsHttpServer, PrometheusRenderer, RenderFn, TableMetrics};
