//! Metrics registry (C12): installs the global Prometheus recorder and
//! describes every metric this crate emits. Decision counters and the
//! decision-latency histogram are recorded directly in `engine`; breaker,
//! audit, and resolver metrics are recorded at their own call sites.

pub mod registry;

pub use registry::Metrics;
