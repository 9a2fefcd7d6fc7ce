//! Health scoring and the per-chain probe loop
//!
//! Score = 0.4 x responsiveness + 0.4 x (1 - error rate) + 0.2 x (1 - fee volatility),
//! each term clamped to [0, 1]. Responsiveness falls linearly from 1 at zero
//! latency to 0 at the probe timeout; a failed probe scores 0.

use super::AdapterRegistry;
use crate::model::ChainId;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const RESPONSIVENESS_WEIGHT: f64 = 0.4;
const RELIABILITY_WEIGHT: f64 = 0.4;
const STABILITY_WEIGHT: f64 = 0.2;

pub fn health_score(
    latency: Option<Duration>,
    timeout: Duration,
    error_rate: f64,
    fee_volatility: f64,
) -> f64 {
    let responsiveness = match latency {
        Some(latency) if !timeout.is_zero() => {
            1.0 - (latency.as_secs_f64() / timeout.as_secs_f64()).min(1.0)
        }
        Some(_) => 1.0,
        None => 0.0,
    };
    let reliability = 1.0 - error_rate.clamp(0.0, 1.0);
    let stability = 1.0 - fee_volatility.clamp(0.0, 1.0);

    (RESPONSIVENESS_WEIGHT * responsiveness
        + RELIABILITY_WEIGHT * reliability
        + STABILITY_WEIGHT * stability)
        .clamp(0.0, 1.0)
}

/// Runs one probe task per registered chain. Probes never block routing:
/// each task only takes its own chain's descriptor lock while writing.
pub struct HealthMonitor {
    registry: Arc<AdapterRegistry>,
    tasks: DashMap<ChainId, JoinHandle<()>>,
    shutdown: Arc<RwLock<bool>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            registry,
            tasks: DashMap::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Start probing every registered chain, picking up chains registered
    /// later on each reconcile tick.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.registry.config().probe_interval());
            loop {
                ticker.tick().await;
                if *monitor.shutdown.read().await {
                    break;
                }
                monitor.reconcile();
            }
            info!("Health monitor stopped");
        })
    }

    /// Spawn tasks for new chains and forget tasks whose chain is gone.
    pub fn reconcile(&self) {
        self.tasks.retain(|_, handle| !handle.is_finished());
        for chain_id in self.registry.chain_ids() {
            if !self.tasks.contains_key(&chain_id) {
                let handle = self.spawn_probe_loop(chain_id.clone());
                self.tasks.insert(chain_id, handle);
            }
        }
    }

    fn spawn_probe_loop(&self, chain_id: ChainId) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let interval = registry.config().probe_interval();

        tokio::spawn(async move {
            debug!("Probe loop started for chain {}", chain_id);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *shutdown.read().await {
                    break;
                }
                if registry.refresh(&chain_id).await.is_none() {
                    break;
                }
            }
            debug!("Probe loop finished for chain {}", chain_id);
        })
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_chain_scores_one() {
        let score = health_score(Some(Duration::ZERO), Duration::from_secs(5), 0.0, 0.0);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn failed_probe_loses_responsiveness() {
        let score = health_score(None, Duration::from_secs(5), 0.0, 0.0);
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn terms_are_clamped() {
        let score = health_score(Some(Duration::from_secs(10)), Duration::from_secs(5), 2.0, 3.0);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn half_latency_half_errors() {
        let score = health_score(
            Some(Duration::from_millis(2_500)),
            Duration::from_secs(5),
            0.5,
            0.0,
        );
        assert!((score - 0.6).abs() < 1e-9);
    }
}
