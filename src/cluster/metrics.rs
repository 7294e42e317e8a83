//! Prometheus metrics for the broker.
//!
//! Metrics cover:
//! - RPC requests (count and latency per operation)
//! - Publish and delivery throughput, including dead letters
//! - Redo attempts and exhaustion
//! - Heartbeat failures and lease revocations
//! - Active subscriptions, members and connections
//!
//! All metrics live in a custom registry with the `bundlemq` prefix. A metric
//! that fails to register falls back to an unregistered instance instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use tracing::warn;

/// Custom Prometheus registry for broker metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("bundlemq".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Request metrics
// =============================================================================

define_counter_vec!(
    REQUEST_COUNT,
    "requests_total",
    "Total number of broker RPC requests",
    ["op", "status"]
);
define_histogram_vec!(
    REQUEST_DURATION,
    "request_duration_seconds",
    "Broker RPC processing duration in seconds",
    ["op"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
);
define_gauge!(
    ACTIVE_CONNECTIONS,
    "active_connections",
    "Number of open transport connections"
);

// =============================================================================
// Data path metrics
// =============================================================================

define_counter_vec!(
    MESSAGES_PUBLISHED,
    "messages_published_total",
    "Messages assigned an msid",
    ["topic"]
);
define_counter_vec!(
    MESSAGES_DELIVERED,
    "messages_delivered_total",
    "Messages pushed to subscribers",
    ["topic"]
);
define_counter_vec!(
    DEAD_LETTERS,
    "dead_letters_total",
    "Messages dropped after the redo budget for a push ran out",
    ["topic"]
);
define_counter!(
    CAS_CONFLICTS,
    "cas_conflicts_total",
    "Compare-and-swap failures on persisted descriptors"
);

// =============================================================================
// Redo / liveness metrics
// =============================================================================

define_counter_vec!(
    REDO_ATTEMPTS,
    "redo_attempts_total",
    "Retries issued after a timed-out call",
    ["op"]
);
define_counter_vec!(
    REDO_EXHAUSTED,
    "redo_exhausted_total",
    "Calls that failed with max redo exceeded",
    ["op"]
);
define_counter!(
    HEARTBEAT_FAILURES,
    "heartbeat_failures_total",
    "Failed alive-checks"
);
define_counter!(
    LEASES_REVOKED,
    "leases_revoked_total",
    "Lead nodes removed by the heartbeat monitor"
);

// =============================================================================
// Membership metrics
// =============================================================================

define_gauge!(
    ACTIVE_SUBSCRIPTIONS,
    "active_subscriptions",
    "Subscriptions loaded on this broker"
);
define_gauge!(
    ACTIVE_MONITORS,
    "active_heartbeat_monitors",
    "Running heartbeat monitors"
);

// =============================================================================
// Registration helpers
// =============================================================================

/// Register `metric` in `registry`, keeping it usable even when registration
/// fails (e.g. a duplicate name from a second broker in the same process).
fn register_safe<C>(registry: &Registry, name: &str, metric: C) -> C
where
    C: Collector + Clone + 'static,
{
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        warn!(name, error = %e, "Metric registration failed, using unregistered instance");
    }
    metric
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    register_safe(registry, name, gauge)
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    register_safe(registry, name, counter)
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    register_safe(registry, name, counter)
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    register_safe(registry, name, histogram)
}

/// Force registration of every metric so they appear before first use.
pub fn init_metrics() {
    let _ = &*REQUEST_COUNT;
    let _ = &*REQUEST_DURATION;
    let _ = &*ACTIVE_CONNECTIONS;
    let _ = &*MESSAGES_PUBLISHED;
    let _ = &*MESSAGES_DELIVERED;
    let _ = &*DEAD_LETTERS;
    let _ = &*CAS_CONFLICTS;
    let _ = &*REDO_ATTEMPTS;
    let _ = &*REDO_EXHAUSTED;
    let _ = &*HEARTBEAT_FAILURES;
    let _ = &*LEASES_REVOKED;
    let _ = &*ACTIVE_SUBSCRIPTIONS;
    let _ = &*ACTIVE_MONITORS;
}

/// Encode all metrics in Prometheus text format.
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one broker RPC.
pub fn record_request(op: &str, ok: bool, duration_secs: f64) {
    let status = if ok { "ok" } else { "error" };
    REQUEST_COUNT.with_label_values(&[op, status]).inc();
    REQUEST_DURATION.with_label_values(&[op]).observe(duration_secs);
}

/// Holds one unit of a gauge; the unit is given back exactly once, on drop.
#[derive(Debug)]
pub struct GaugeGuard(IntGauge);

impl GaugeGuard {
    pub fn new(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_prefixed_names() {
        init_metrics();
        record_request("lookup", true, 0.002);
        REDO_ATTEMPTS.with_label_values(&["publish"]).inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("bundlemq_requests_total"));
        assert!(text.contains("bundlemq_redo_attempts_total"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        LEASES_REVOKED.inc();
        assert!(LEASES_REVOKED.get() >= 1);
    }

    #[test]
    fn test_gauge_guard_releases_once() {
        let gauge = IntGauge::new("guarded", "test gauge").unwrap();
        let mut slot = Some(GaugeGuard::new(&gauge));
        let second = GaugeGuard::new(&gauge);
        assert_eq!(gauge.get(), 2);

        drop(slot.take());
        // Releasing an already released slot is a no-op.
        drop(slot.take());
        assert_eq!(gauge.get(), 1);

        drop(second);
        assert_eq!(gauge.get(), 0);
    }
}
