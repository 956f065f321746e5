//! Prometheus metrics for the membership layer.
//!
//! Metrics cover:
//! - Registration lifecycle and leadership
//! - Shard ownership (owned and stopping counts)
//! - Rebalance plans and their transactions
//! - Routing timeouts and listener failures
//! - Node-id allocation (claims, races, width)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "shardherd" prefix to avoid
//! name collisions with other libraries using the default Prometheus registry.
//! Registration errors are handled gracefully: if a metric fails to register,
//! the unregistered metric is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for shardherd metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("shardherd".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Membership
// =============================================================================

define_counter_vec!(
    REGISTRATIONS,
    "registrations_total",
    "Registration attempts by outcome",
    ["cluster", "outcome"]
);
define_gauge_vec!(
    IS_LEADER,
    "is_leader",
    "1 if this node is the cluster leader",
    ["cluster"]
);
define_gauge_vec!(
    OWNED_SHARDS,
    "owned_shards",
    "Shards actively served by this node",
    ["cluster"]
);
define_gauge_vec!(
    STOPPING_SHARDS,
    "stopping_shards",
    "Shards this node is draining",
    ["cluster"]
);
define_gauge_vec!(
    CLUSTER_NODES,
    "cluster_nodes",
    "Nodes in the last published topology",
    ["cluster"]
);

// =============================================================================
// Rebalancing
// =============================================================================

define_counter_vec!(
    REBALANCE_PLANS,
    "rebalance_plans_total",
    "Rebalance plans applied by the leader, by outcome",
    ["cluster", "outcome"]
);
define_counter_vec!(
    SHARD_MOVES,
    "shard_moves_total",
    "Shard starts and stops written by rebalance plans",
    ["cluster", "direction"]
);
define_counter_vec!(
    STORE_FAILURES,
    "store_failures_total",
    "Failed store operations by operation and error",
    ["operation", "error"]
);

// =============================================================================
// Routing and Listeners
// =============================================================================

define_counter_vec!(
    ROUTED_REQUESTS,
    "routed_requests_total",
    "Routed requests by destination and status",
    ["cluster", "destination", "status"]
);
define_histogram_vec!(
    ROUTE_DURATION,
    "route_duration_seconds",
    "Routed request duration in seconds",
    ["cluster"],
    [0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
);
define_counter_vec!(
    LISTENER_FAILURES,
    "listener_failures_total",
    "Listener callbacks that returned an error or panicked",
    ["kind"]
);

// =============================================================================
// Node-ID Allocation
// =============================================================================

define_counter_vec!(
    SEQUENCE_CLAIMS,
    "sequence_claims_total",
    "Node-id reservations claimed",
    ["sequence"]
);
define_counter_vec!(
    SEQUENCE_RACES,
    "sequence_races_total",
    "Reservation attempts lost to a concurrent claimer",
    ["sequence"]
);
define_gauge_vec!(
    NODE_WIDTH,
    "node_width_bits",
    "Bits needed to represent node ids of a sequence",
    ["sequence"]
);

/// Register an IntGaugeVec safely, returning the unregistered metric on error.
fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning the unregistered metric on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning the unregistered metric on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric.
///
/// Idempotent. Metrics are otherwise registered lazily on first use.
pub fn init_metrics() {
    let _ = &*REGISTRATIONS;
    let _ = &*IS_LEADER;
    let _ = &*OWNED_SHARDS;
    let _ = &*STOPPING_SHARDS;
    let _ = &*CLUSTER_NODES;
    let _ = &*REBALANCE_PLANS;
    let _ = &*SHARD_MOVES;
    let _ = &*STORE_FAILURES;
    let _ = &*ROUTED_REQUESTS;
    let _ = &*ROUTE_DURATION;
    let _ = &*LISTENER_FAILURES;
    let _ = &*SEQUENCE_CLAIMS;
    let _ = &*SEQUENCE_RACES;
    let _ = &*NODE_WIDTH;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording Helpers
// =============================================================================

pub fn record_registration(cluster: &str, outcome: &str) {
    REGISTRATIONS.with_label_values(&[cluster, outcome]).inc();
}

pub fn set_leader(cluster: &str, is_leader: bool) {
    IS_LEADER
        .with_label_values(&[cluster])
        .set(i64::from(is_leader));
}

/// Update the owned and stopping shard gauges from the local node.
pub fn set_local_shards(cluster: &str, owned: usize, stopping: usize) {
    OWNED_SHARDS.with_label_values(&[cluster]).set(owned as i64);
    STOPPING_SHARDS
        .with_label_values(&[cluster])
        .set(stopping as i64);
}

pub fn set_cluster_nodes(cluster: &str, nodes: usize) {
    CLUSTER_NODES.with_label_values(&[cluster]).set(nodes as i64);
}

/// Record an applied (or rejected) rebalance plan.
pub fn record_rebalance(cluster: &str, outcome: &str, starts: usize, stops: usize) {
    REBALANCE_PLANS.with_label_values(&[cluster, outcome]).inc();
    if outcome == "applied" {
        SHARD_MOVES
            .with_label_values(&[cluster, "start"])
            .inc_by(starts as u64);
        SHARD_MOVES
            .with_label_values(&[cluster, "stop"])
            .inc_by(stops as u64);
    }
}

pub fn record_store_failure(operation: &str, error: &str) {
    STORE_FAILURES.with_label_values(&[operation, error]).inc();
}

/// Record a routed request. `destination` is `local` or `remote`.
pub fn record_route(cluster: &str, destination: &str, status: &str, duration_secs: f64) {
    ROUTED_REQUESTS
        .with_label_values(&[cluster, destination, status])
        .inc();
    ROUTE_DURATION
        .with_label_values(&[cluster])
        .observe(duration_secs);
}

pub fn record_listener_failure(kind: &str) {
    LISTENER_FAILURES.with_label_values(&[kind]).inc();
}

pub fn record_sequence_claim(sequence: &str) {
    SEQUENCE_CLAIMS.with_label_values(&[sequence]).inc();
}

pub fn record_sequence_race(sequence: &str) {
    SEQUENCE_RACES.with_label_values(&[sequence]).inc();
}

pub fn set_node_width(sequence: &str, bits: u8) {
    NODE_WIDTH
        .with_label_values(&[sequence])
        .set(i64::from(bits));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_helpers_do_not_panic() {
        init_metrics();
        record_registration("metrics-test", "registered");
        set_leader("metrics-test", true);
        set_local_shards("metrics-test", 3, 1);
        set_cluster_nodes("metrics-test", 2);
        record_rebalance("metrics-test", "applied", 2, 2);
        record_rebalance("metrics-test", "conflict", 0, 0);
        record_store_failure("transaction", "bad_version");
        record_route("metrics-test", "local", "ok", 0.001);
        record_listener_failure("topology");
        record_sequence_claim("metrics-test");
        record_sequence_race("metrics-test");
        set_node_width("metrics-test", 9);
    }

    #[test]
    fn test_leader_gauge_value() {
        set_leader("gauge-test", true);
        assert_eq!(IS_LEADER.with_label_values(&["gauge-test"]).get(), 1);
        set_leader("gauge-test", false);
        assert_eq!(IS_LEADER.with_label_values(&["gauge-test"]).get(), 0);
    }

    #[test]
    fn test_encode_metrics_uses_prefix() {
        record_sequence_claim("encode-test");
        let text = encode_metrics().unwrap();
        assert!(text.contains("shardherd_sequence_claims_total"));
    }
}
