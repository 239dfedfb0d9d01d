//! Metric names and exporter wiring
//!
//! All counters and histograms live under stable `mip.*` names so dashboards
//! survive refactors. The Prometheus recorder is installed once at startup
//! and rendered by the control plane's `/metrics` route. Subsystems go
//! through the thin wrappers below; this module is the only place that
//! touches the recorder macros directly.

use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const ADAPTER_OBSERVATIONS: &str = "mip.adapter.observations_total";
pub const ADAPTER_INVALID: &str = "mip.adapter.invalid_total";
pub const ADAPTER_RECONNECTS: &str = "mip.adapter.reconnects_total";
pub const NORMALIZER_DUPLICATES: &str = "mip.normalizer.duplicates_total";
pub const NORMALIZER_HYDRATION_FAILURES: &str = "mip.normalizer.hydration_failures_total";
pub const DISPATCHER_DROPS: &str = "mip.dispatcher.drops_total";
pub const EVALUATOR_OPPORTUNITIES: &str = "mip.evaluator.opportunities_total";
pub const EVALUATOR_FAILURES: &str = "mip.evaluator.failures_total";
pub const SANDBOX_RUNS_SECONDS: &str = "mip.sandbox.runs_seconds";
pub const SANDBOX_FAILURES: &str = "mip.sandbox.failures_total";
pub const SANDBOX_MODULE_LOADS: &str = "mip.sandbox.module_loads_total";
pub const SANDBOX_CACHE_HITS: &str = "mip.sandbox.cache_hits_total";
pub const BROKER_PENDING: &str = "mip.broker.pending";
pub const BROKER_DOMINATED: &str = "mip.broker.dominated_total";
pub const BROKER_EXPIRED: &str = "mip.broker.expired_total";
pub const BROKER_COOLDOWN_REJECTS: &str = "mip.broker.cooldown_rejects_total";
pub const EXECUTOR_SUBMISSIONS: &str = "mip.executor.submissions_total";
pub const OUTCOME_REALIZED_PROFIT: &str = "mip.outcome.realized_profit_base";
pub const ERRORS: &str = "mip.errors_total";

/// Install the Prometheus recorder and describe every metric once.
/// Returns the render handle for the control plane.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(
        ADAPTER_OBSERVATIONS,
        Unit::Count,
        "Pending observations delivered by a source adapter"
    );
    describe_counter!(
        ADAPTER_INVALID,
        Unit::Count,
        "Push-feed messages dropped by schema validation"
    );
    describe_counter!(
        ADAPTER_RECONNECTS,
        Unit::Count,
        "Source adapter reconnect attempts"
    );
    describe_counter!(
        NORMALIZER_DUPLICATES,
        Unit::Count,
        "Observations collapsed by the dedup cache"
    );
    describe_counter!(
        NORMALIZER_HYDRATION_FAILURES,
        Unit::Count,
        "Hash-only observations dropped after hydration retries"
    );
    describe_counter!(
        DISPATCHER_DROPS,
        Unit::Count,
        "Deliveries dropped because a subscriber ring was full"
    );
    describe_counter!(
        EVALUATOR_OPPORTUNITIES,
        Unit::Count,
        "Opportunities emitted per strategy"
    );
    describe_counter!(
        EVALUATOR_FAILURES,
        Unit::Count,
        "Evaluator errors and deadline overruns"
    );
    describe_histogram!(
        SANDBOX_RUNS_SECONDS,
        Unit::Seconds,
        "Sandbox run wall-clock time"
    );
    describe_counter!(SANDBOX_FAILURES, Unit::Count, "Sandbox traps by reason");
    describe_counter!(
        SANDBOX_MODULE_LOADS,
        Unit::Count,
        "Artifacts loaded after digest verification"
    );
    describe_counter!(SANDBOX_CACHE_HITS, Unit::Count, "Sandbox result cache hits");
    describe_gauge!(BROKER_PENDING, Unit::Count, "Schedulable opportunities");
    describe_counter!(
        BROKER_DOMINATED,
        Unit::Count,
        "Opportunities dropped by the domination rule"
    );
    describe_counter!(BROKER_EXPIRED, Unit::Count, "Opportunities expired unserved");
    describe_counter!(
        BROKER_COOLDOWN_REJECTS,
        Unit::Count,
        "Submissions rejected by fingerprint cooldown"
    );
    describe_counter!(
        EXECUTOR_SUBMISSIONS,
        Unit::Count,
        "Bundle submissions by outcome"
    );
    describe_gauge!(
        OUTCOME_REALIZED_PROFIT,
        "Rolling realized profit in base units"
    );
    describe_counter!(ERRORS, Unit::Count, "Errors by kind");

    Ok(handle)
}

/// Increment a plain counter.
pub fn inc(name: &'static str) {
    ::metrics::increment_counter!(name);
}

/// Increment a counter with one label.
pub fn inc1(name: &'static str, key: &'static str, value: impl Into<String>) {
    ::metrics::increment_counter!(name, key => value.into());
}

/// Increment a counter with two labels.
pub fn inc2(
    name: &'static str,
    k1: &'static str,
    v1: impl Into<String>,
    k2: &'static str,
    v2: impl Into<String>,
) {
    ::metrics::increment_counter!(name, k1 => v1.into(), k2 => v2.into());
}

/// Set a gauge.
pub fn gauge(name: &'static str, value: f64) {
    ::metrics::gauge!(name, value);
}

/// Record a histogram sample with two labels.
pub fn histogram2(
    name: &'static str,
    value: f64,
    k1: &'static str,
    v1: impl Into<String>,
    k2: &'static str,
    v2: impl Into<String>,
) {
    ::metrics::histogram!(name, value, k1 => v1.into(), k2 => v2.into());
}

/// Count an error by its stable kind label.
pub fn record_error(kind: &'static str) {
    inc1(ERRORS, "kind", kind);
}
