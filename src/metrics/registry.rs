use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for decision-latency metrics (seconds). The
/// whole point of this crate is to sit on a hot path, so the low end is
/// denser than a typical HTTP-latency histogram.
const LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering a `/metrics` endpoint, should the
/// embedder choose to expose one.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // decision path
        describe_counter!(
            "ratekeeper_decisions_total",
            Unit::Count,
            "Total rate limit decisions, labeled by limiter and outcome (allow|deny)"
        );
        describe_histogram!(
            "ratekeeper_decision_duration_seconds",
            Unit::Seconds,
            "Time spent in the storage layer producing one decision"
        );
        describe_counter!(
            "ratekeeper_throttle_delays_total",
            Unit::Count,
            "Total admitted requests that were assigned a non-zero throttle delay"
        );

        // circuit breaker / storage health
        describe_counter!(
            "ratekeeper_breaker_trips_total",
            Unit::Count,
            "Total times a limiter's circuit breaker transitioned to open"
        );
        describe_gauge!(
            "ratekeeper_breaker_state",
            Unit::Count,
            "Circuit breaker state per limiter: 0=closed 1=half_open 2=open"
        );
        describe_counter!(
            "ratekeeper_storage_errors_total",
            Unit::Count,
            "Total storage operations that returned a transient or data error"
        );

        // audit pipeline
        describe_gauge!(
            "ratekeeper_audit_queue_depth",
            Unit::Count,
            "Number of audit events currently queued awaiting the consumer"
        );
        describe_counter!(
            "ratekeeper_audit_dropped_total",
            Unit::Count,
            "Total audit events dropped because the queue was full"
        );

        // key resolution
        describe_counter!(
            "ratekeeper_resolver_cache_hits_total",
            Unit::Count,
            "Total key resolutions served from the compiled-expression cache"
        );
        describe_counter!(
            "ratekeeper_resolver_security_rejections_total",
            Unit::Count,
            "Total key templates rejected by the sandbox"
        );

        // config
        describe_counter!(
            "ratekeeper_config_reloads_total",
            Unit::Count,
            "Total successful hot-reloads of the policy configuration"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
