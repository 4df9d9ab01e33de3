//! Metrics and alert emission for enforcement decisions.

pub mod alerts;
pub mod metrics;

pub use alerts::{AlertEvent, AlertKind, AlertSink, BufferedAlertSink, TracingAlertSink};
pub use metrics::{Counter, Gauge, GateMetrics, GateMetricsSnapshot};
