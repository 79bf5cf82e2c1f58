//! Router metrics
//!
//! Thin wrappers over the `metrics` facade so names and labels stay in one place.
//! Nothing is recorded unless the binary installs a recorder.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

pub const MESSAGES_ROUTED: &str = "edgehub_messages_routed_total";
pub const MESSAGES_UNMATCHED: &str = "edgehub_messages_unmatched_total";
pub const ENDPOINT_SEND_LATENCY: &str = "edgehub_endpoint_send_latency_ms";
pub const ENDPOINT_SEND_FAILURES: &str = "edgehub_endpoint_send_failures_total";
pub const ENDPOINT_REJECTED: &str = "edgehub_endpoint_rejected_total";
pub const ENDPOINT_DEAD: &str = "edgehub_endpoint_dead_total";
pub const DEAD_ENDPOINT_SKIPS: &str = "edgehub_dead_endpoint_skips_total";
pub const ENDPOINT_SKIPPED: &str = "edgehub_endpoint_skipped_total";
pub const ENDPOINT_DROPPED: &str = "edgehub_endpoint_dropped_total";
pub const ROUTE_TABLE_SIZE: &str = "edgehub_route_table_routes";
pub const CONFIG_REJECTED: &str = "edgehub_config_rejected_total";

/// Register descriptions with the installed recorder
pub fn describe() {
    describe_counter!(MESSAGES_ROUTED, "Messages matched by at least one route");
    describe_counter!(MESSAGES_UNMATCHED, "Messages that matched no route");
    describe_histogram!(ENDPOINT_SEND_LATENCY, Unit::Milliseconds, "Endpoint delivery attempt latency");
    describe_counter!(ENDPOINT_SEND_FAILURES, "Failed endpoint delivery attempts");
    describe_counter!(ENDPOINT_REJECTED, "Messages permanently rejected by an endpoint");
    describe_counter!(ENDPOINT_DEAD, "Endpoints declared dead");
    describe_counter!(DEAD_ENDPOINT_SKIPS, "Deliveries skipped because the endpoint is dead");
    describe_counter!(ENDPOINT_SKIPPED, "Messages at or below the endpoint checkpoint");
    describe_counter!(ENDPOINT_DROPPED, "Queued messages discarded when an executor stopped");
    describe_gauge!(ROUTE_TABLE_SIZE, "Routes in the installed route table");
    describe_counter!(CONFIG_REJECTED, "Route configurations rejected at compile time");
    describe_histogram!(
        "edgehub_checkpoint_latency_ms",
        Unit::Milliseconds,
        "Checkpoint store operation latency"
    );
}

pub fn record_routed() {
    counter!(MESSAGES_ROUTED).increment(1);
}

pub fn record_unmatched() {
    counter!(MESSAGES_UNMATCHED).increment(1);
}

pub fn record_send_latency(endpoint: &str, elapsed: Duration) {
    histogram!(ENDPOINT_SEND_LATENCY, "endpoint" => endpoint.to_string())
        .record(elapsed.as_secs_f64() * 1000.0);
}

pub fn record_send_failure(endpoint: &str) {
    counter!(ENDPOINT_SEND_FAILURES, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_rejected(endpoint: &str) {
    counter!(ENDPOINT_REJECTED, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_dead(endpoint: &str) {
    counter!(ENDPOINT_DEAD, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_dead_skip(endpoint: &str) {
    counter!(DEAD_ENDPOINT_SKIPS, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_skipped(endpoint: &str) {
    counter!(ENDPOINT_SKIPPED, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_dropped(endpoint: &str, count: usize) {
    counter!(ENDPOINT_DROPPED, "endpoint" => endpoint.to_string()).increment(count as u64);
}

pub fn record_route_table(routes: usize) {
    gauge!(ROUTE_TABLE_SIZE).set(routes as f64);
}

pub fn record_config_rejected() {
    counter!(CONFIG_REJECTED).increment(1);
}
