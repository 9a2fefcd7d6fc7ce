//! Adapter registry - the live set of ledgers the relayer can route to
//!
//! Chains live in a concurrent map with no lock spanning chains. Each entry
//! carries its descriptor (behind a per-chain lock so readers always see the
//! last-known-good health score), a sliding window of call outcomes, and an
//! in-flight counter used to drain the chain on deregistration.

pub mod health;

pub use health::{health_score, HealthMonitor};

use crate::adapter::{LedgerAdapter, ProbeReport};
use crate::config::HealthConfig;
use crate::error::{AdapterError, RegistryError};
use crate::metrics;
use crate::model::{ChainDescriptor, ChainId, LedgerModel};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, instrument, warn};

/// Outcomes of the most recent calls against one chain.
#[derive(Debug, Clone)]
pub struct HealthWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl HealthWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, ok: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

pub struct RegisteredChain {
    adapter: Arc<dyn LedgerAdapter>,
    descriptor: RwLock<ChainDescriptor>,
    window: Mutex<HealthWindow>,
    last_probe: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    draining: AtomicBool,
    drained: Notify,
}

impl RegisteredChain {
    pub fn adapter(&self) -> Arc<dyn LedgerAdapter> {
        self.adapter.clone()
    }

    pub async fn descriptor(&self) -> ChainDescriptor {
        self.descriptor.read().await.clone()
    }

    pub async fn failure_rate(&self) -> f64 {
        self.window.lock().await.error_rate()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Counts one in-flight call; dropping it may complete a drain.
pub struct InFlightGuard {
    chain: Arc<RegisteredChain>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.chain.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.chain.drained.notify_waiters();
        }
    }
}

/// Routing view of one chain.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub descriptor: ChainDescriptor,
    pub failure_rate: f64,
}

/// One row of the admin health table.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRow {
    pub chain_id: ChainId,
    pub model: LedgerModel,
    pub health_score: f64,
    pub error_rate: f64,
    pub fee_volatility: f64,
    pub last_fee: Option<u64>,
    /// Latency of the last probe; absent when it failed.
    pub last_probe_ms: Option<u64>,
    pub in_flight: usize,
    pub draining: bool,
    pub routable: bool,
}

pub struct AdapterRegistry {
    chains: DashMap<ChainId, Arc<RegisteredChain>>,
    config: HealthConfig,
}

impl AdapterRegistry {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            chains: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Admit a chain after it answers an initial probe. Registration is
    /// refused once the failure threshold of consecutive probes fails inside
    /// the registration window.
    #[instrument(skip(self, adapter, descriptor), fields(chain_id = %descriptor.chain_id))]
    pub async fn register(
        &self,
        adapter: Arc<dyn LedgerAdapter>,
        mut descriptor: ChainDescriptor,
    ) -> Result<(), RegistryError> {
        let chain_id = descriptor.chain_id.clone();
        if self.chains.contains_key(&chain_id) {
            return Err(RegistryError::DuplicateChain(chain_id));
        }

        let threshold = self.config.registration_failure_threshold.max(1);
        let spacing = self.config.registration_window() / threshold;
        let mut failures = 0u32;
        let report = loop {
            match self.probe_once(adapter.as_ref()).await {
                Ok(report) => break report,
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Registration probe {}/{} for chain {} failed: {}",
                        failures, threshold, chain_id, e
                    );
                    if failures >= threshold {
                        return Err(RegistryError::ProbeFailed { chain_id, failures });
                    }
                    tokio::time::sleep(spacing).await;
                }
            }
        };

        let mut window = HealthWindow::new(self.config.window_size);
        window.record(true);
        descriptor.fee_stats.push(report.fee_sample);
        descriptor.health_score = health_score(
            Some(report.latency),
            self.config.probe_timeout(),
            window.error_rate(),
            descriptor.fee_stats.volatility(),
        );
        let score = descriptor.health_score;

        let chain = Arc::new(RegisteredChain {
            adapter,
            descriptor: RwLock::new(descriptor),
            window: Mutex::new(window),
            last_probe: Mutex::new(Some(report.latency)),
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            drained: Notify::new(),
        });

        match self.chains.entry(chain_id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateChain(chain_id)),
            Entry::Vacant(slot) => {
                slot.insert(chain);
            }
        }

        metrics::set_chain_health(chain_id.as_str(), score);
        info!("Registered chain {} with health {:.2}", chain_id, score);
        Ok(())
    }

    /// Stop routing to a chain immediately, wait for in-flight calls to
    /// finish (bounded by the drain timeout) and remove it.
    #[instrument(skip(self))]
    pub async fn deregister(&self, chain_id: &ChainId) -> Result<(), RegistryError> {
        let chain = self
            .get(chain_id)
            .ok_or_else(|| RegistryError::ChainNotFound(chain_id.clone()))?;

        if chain.draining.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::Draining(chain_id.clone()));
        }
        info!(
            "Draining chain {} ({} calls in flight)",
            chain_id,
            chain.in_flight()
        );

        let deadline = Instant::now() + self.config.drain_timeout();
        loop {
            let notified = chain.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if chain.in_flight() == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                warn!(
                    "Drain timeout for chain {} with {} calls still in flight",
                    chain_id,
                    chain.in_flight()
                );
                break;
            }
        }

        self.chains.remove(chain_id);
        if let Err(e) = chain.adapter.disconnect().await {
            warn!("Disconnect of chain {} failed: {}", chain_id, e);
        }
        metrics::remove_chain(chain_id.as_str());
        info!("Deregistered chain {}", chain_id);
        Ok(())
    }

    pub fn get(&self, chain_id: &ChainId) -> Option<Arc<RegisteredChain>> {
        self.chains.get(chain_id).map(|c| c.value().clone())
    }

    /// Adapter for reads, available while the chain drains.
    pub fn adapter(&self, chain_id: &ChainId) -> Option<Arc<dyn LedgerAdapter>> {
        self.get(chain_id).map(|c| c.adapter())
    }

    /// Claim a chain for new work.
    pub fn acquire(
        &self,
        chain_id: &ChainId,
    ) -> Result<(Arc<dyn LedgerAdapter>, InFlightGuard), RegistryError> {
        let chain = self
            .get(chain_id)
            .ok_or_else(|| RegistryError::ChainNotFound(chain_id.clone()))?;

        chain.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            chain: chain.clone(),
        };
        if chain.is_draining() {
            return Err(RegistryError::Draining(chain_id.clone()));
        }
        Ok((chain.adapter(), guard))
    }

    pub fn contains(&self, chain_id: &ChainId) -> bool {
        self.chains.contains_key(chain_id)
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.chains.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Chains accepting new work, sorted by chain id. Health filtering is the
    /// router's job.
    pub async fn routable(&self) -> Vec<ChainSnapshot> {
        let chains: Vec<_> = self
            .chains
            .iter()
            .filter(|e| !e.value().is_draining())
            .map(|e| e.value().clone())
            .collect();

        let mut snapshots = Vec::with_capacity(chains.len());
        for chain in chains {
            snapshots.push(ChainSnapshot {
                descriptor: chain.descriptor().await,
                failure_rate: chain.failure_rate().await,
            });
        }
        snapshots.sort_by(|a, b| a.descriptor.chain_id.cmp(&b.descriptor.chain_id));
        snapshots
    }

    /// Feed one call outcome into the chain's sliding window.
    pub async fn record_call(&self, chain_id: &ChainId, ok: bool) {
        if let Some(chain) = self.get(chain_id) {
            chain.window.lock().await.record(ok);
        }
    }

    /// Probe a chain once and recompute its health score.
    pub async fn refresh(&self, chain_id: &ChainId) -> Option<f64> {
        let chain = self.get(chain_id)?;
        let result = self.probe_once(chain.adapter.as_ref()).await;
        metrics::record_probe(chain_id.as_str(), result.is_ok());

        let (latency, error_rate) = {
            let mut window = chain.window.lock().await;
            window.record(result.is_ok());
            let latency = result.as_ref().ok().map(|r| r.latency);
            (latency, window.error_rate())
        };
        *chain.last_probe.lock().await = latency;

        let mut descriptor = chain.descriptor.write().await;
        if let Ok(report) = &result {
            descriptor.fee_stats.push(report.fee_sample);
        }
        descriptor.health_score = health_score(
            latency,
            self.config.probe_timeout(),
            error_rate,
            descriptor.fee_stats.volatility(),
        );
        let score = descriptor.health_score;
        drop(descriptor);

        metrics::set_chain_health(chain_id.as_str(), score);
        match result {
            Ok(_) => debug!("Chain {} health {:.2}", chain_id, score),
            Err(e) => warn!("Probe of chain {} failed: {} (health {:.2})", chain_id, e, score),
        }
        Some(score)
    }

    async fn probe_once(&self, adapter: &dyn LedgerAdapter) -> Result<ProbeReport, AdapterError> {
        match tokio::time::timeout(self.config.probe_timeout(), adapter.probe()).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                chain_id: adapter.chain_id(),
                operation: "probe".to_string(),
            }),
        }
    }

    pub async fn health_table(&self) -> Vec<HealthRow> {
        let mut rows = Vec::new();
        for chain_id in self.chain_ids() {
            let Some(chain) = self.get(&chain_id) else {
                continue;
            };
            let descriptor = chain.descriptor().await;
            let draining = chain.is_draining();
            let last_probe = *chain.last_probe.lock().await;
            rows.push(HealthRow {
                routable: !draining && descriptor.health_score > self.config.score_floor,
                chain_id,
                model: descriptor.model,
                health_score: descriptor.health_score,
                error_rate: chain.failure_rate().await,
                fee_volatility: descriptor.fee_stats.volatility(),
                last_fee: descriptor.fee_stats.last(),
                last_probe_ms: last_probe.map(|d| d.as_millis() as u64),
                in_flight: chain.in_flight(),
                draining,
            });
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Fault, ObjectLedgerAdapter};
    use crate::config::ChainConfig;

    fn config() -> HealthConfig {
        HealthConfig {
            registration_window_ms: 30,
            probe_timeout_ms: 200,
            drain_timeout_secs: 1,
            ..HealthConfig::default()
        }
    }

    async fn object_adapter(id: &str) -> Arc<ObjectLedgerAdapter> {
        let mut chain = ChainConfig::new(id, LedgerModel::ObjectOwned);
        chain.confirmation_latency_ms = 0;
        let adapter = Arc::new(ObjectLedgerAdapter::new(chain.clone()));
        adapter.initialize(&chain).await.unwrap();
        adapter.connect().await.unwrap();
        adapter
    }

    #[test]
    fn window_error_rate_slides() {
        let mut window = HealthWindow::new(4);
        for ok in [false, false, true, true] {
            window.record(ok);
        }
        assert_eq!(window.error_rate(), 0.5);
        window.record(true);
        window.record(true);
        assert_eq!(window.error_rate(), 0.0);
        assert_eq!(window.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let registry = AdapterRegistry::new(config());
        let adapter = object_adapter("object-1").await;
        registry
            .register(adapter.clone(), adapter.descriptor())
            .await
            .unwrap();

        let err = registry
            .register(adapter.clone(), adapter.descriptor())
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateChain(ChainId::from("object-1")));
    }

    #[tokio::test]
    async fn three_failed_probes_refuse_registration() {
        let registry = AdapterRegistry::new(config());
        let adapter = object_adapter("object-1").await;
        adapter.book().inject(Fault::Unreachable, 3).await;

        let err = registry
            .register(adapter.clone(), adapter.descriptor())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::ProbeFailed {
                chain_id: ChainId::from("object-1"),
                failures: 3
            }
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn recovers_after_two_failed_probes() {
        let registry = AdapterRegistry::new(config());
        let adapter = object_adapter("object-1").await;
        adapter.book().inject(Fault::Timeout, 2).await;

        registry
            .register(adapter.clone(), adapter.descriptor())
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn failing_probes_push_score_below_floor() {
        let registry = AdapterRegistry::new(config());
        let adapter = object_adapter("object-1").await;
        let id = adapter.chain_id();
        registry
            .register(adapter.clone(), adapter.descriptor())
            .await
            .unwrap();

        adapter.book().set_offline(true).await;
        for _ in 0..5 {
            registry.refresh(&id).await;
        }
        let row = registry.health_table().await.remove(0);
        assert!(row.health_score < 0.3);
        assert!(!row.routable);

        adapter.book().set_offline(false).await;
        for _ in 0..19 {
            registry.refresh(&id).await;
        }
        let row = registry.health_table().await.remove(0);
        assert!(row.routable);
    }

    #[tokio::test]
    async fn draining_chain_refuses_new_work_and_waits() {
        let registry = Arc::new(AdapterRegistry::new(config()));
        let adapter = object_adapter("object-1").await;
        let id = adapter.chain_id();
        registry
            .register(adapter.clone(), adapter.descriptor())
            .await
            .unwrap();

        let (_, guard) = registry.acquire(&id).unwrap();
        let drain = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.deregister(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.routable().await.is_empty());
        assert!(matches!(
            registry.acquire(&id),
            Err(RegistryError::Draining(_))
        ));
        assert!(registry.contains(&id));

        drop(guard);
        drain.await.unwrap().unwrap();
        assert!(!registry.contains(&id));
    }
}
