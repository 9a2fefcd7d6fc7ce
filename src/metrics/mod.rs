//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health scores and probe outcomes
//! - Routing decisions, retries and re-routes
//! - Sponsorship grants and treasury balance
//! - Validator attestations and flags
//! - Bridge transfer transitions

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Encoder, Gauge, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{info, warn};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEALTH: GaugeVec = register_gauge_vec!(
        "conduit_chain_health_score",
        "Composite health score per chain (0..1)",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref PROBES: CounterVec = register_counter_vec!(
        "conduit_probes_total",
        "Health probes by outcome",
        &["chain_id", "outcome"]
    ).expect("metric registration");

    // Routing metrics
    pub static ref ROUTES: CounterVec = register_counter_vec!(
        "conduit_routes_total",
        "Intents routed per chain",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref ROUTING_FAILURES: Counter = register_counter!(
        "conduit_routing_failures_total",
        "Intents with no compatible chain"
    ).expect("metric registration");

    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "conduit_retries_total",
        "Transient-error retries per chain and operation",
        &["chain_id", "operation"]
    ).expect("metric registration");

    pub static ref REROUTES: CounterVec = register_counter_vec!(
        "conduit_reroutes_total",
        "Re-routes away from a chain after a permanent error",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref INTENTS: CounterVec = register_counter_vec!(
        "conduit_intents_total",
        "Intents by final outcome",
        &["outcome"]
    ).expect("metric registration");

    // Sponsorship metrics
    pub static ref SPONSORSHIP_DECISIONS: CounterVec = register_counter_vec!(
        "conduit_sponsorship_decisions_total",
        "Sponsorship requests by decision",
        &["decision"]
    ).expect("metric registration");

    pub static ref TREASURY_BALANCE: Gauge = register_gauge!(
        "conduit_treasury_balance",
        "Operator treasury balance in normalized cost units"
    ).expect("metric registration");

    // Quorum metrics
    pub static ref ATTESTATIONS: CounterVec = register_counter_vec!(
        "conduit_attestations_total",
        "Validator attestations by result",
        &["validator", "result"]
    ).expect("metric registration");

    pub static ref FLAGGED_VALIDATORS: Gauge = register_gauge!(
        "conduit_flagged_validators",
        "Validators currently excluded for conflicting attestations"
    ).expect("metric registration");

    // Bridge metrics
    pub static ref BRIDGE_TRANSITIONS: CounterVec = register_counter_vec!(
        "conduit_bridge_transitions_total",
        "Bridge transfers entering each status",
        &["status"]
    ).expect("metric registration");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        warn!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

// Helper functions to record metrics

pub fn set_chain_health(chain_id: &str, score: f64) {
    CHAIN_HEALTH.with_label_values(&[chain_id]).set(score);
}

pub fn record_probe(chain_id: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    PROBES.with_label_values(&[chain_id, outcome]).inc();
}

/// Drop the per-chain series of a deregistered chain.
pub fn remove_chain(chain_id: &str) {
    let _ = CHAIN_HEALTH.remove_label_values(&[chain_id]);
    let _ = ROUTES.remove_label_values(&[chain_id]);
    let _ = REROUTES.remove_label_values(&[chain_id]);
}

pub fn record_route(chain_id: &str) {
    ROUTES.with_label_values(&[chain_id]).inc();
}

pub fn record_routing_failure() {
    ROUTING_FAILURES.inc();
}

pub fn record_retry(chain_id: &str, operation: &str) {
    RETRIES.with_label_values(&[chain_id, operation]).inc();
}

pub fn record_reroute(chain_id: &str) {
    REROUTES.with_label_values(&[chain_id]).inc();
}

pub fn record_intent(outcome: &str) {
    INTENTS.with_label_values(&[outcome]).inc();
}

pub fn record_sponsorship(decision: &str) {
    SPONSORSHIP_DECISIONS.with_label_values(&[decision]).inc();
}

pub fn set_treasury_balance(balance: u64) {
    TREASURY_BALANCE.set(balance as f64);
}

pub fn record_attestation(validator: &str, result: &str) {
    ATTESTATIONS.with_label_values(&[validator, result]).inc();
}

pub fn set_flagged_validators(count: usize) {
    FLAGGED_VALIDATORS.set(count as f64);
}

pub fn record_bridge_transition(status: &str) {
    BRIDGE_TRANSITIONS.with_label_values(&[status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_series() {
        record_route("metrics-test-chain");
        record_bridge_transition("MINTED");
        let text = render().unwrap();
        assert!(text.contains("conduit_routes_total"));
        assert!(text.contains("metrics-test-chain"));
        assert!(text.contains("conduit_bridge_transitions_total"));
    }
}
