//! Main coordination engine: intent intake, dispatch and housekeeping

use crate::adapter::build_adapter;
use crate::bridge::{BridgeOrchestrator, BridgeRequest, BridgeTransfer};
use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::events::EventBus;
use crate::fallback::{Execution, FallbackController, RetryPolicy};
use crate::model::{ChainId, TransactionIntent};
use crate::quorum::ValidatorQuorum;
use crate::registry::{AdapterRegistry, HealthMonitor};
use crate::router::{Router, RoutingContext};
use crate::sponsorship::SponsorshipManager;
use crate::state::StateStore;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock, Semaphore};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// What became of an intent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntentOutcome {
    Executed(Execution),
    Bridged(BridgeTransfer),
}

/// Owns every component and runs the intake loop.
pub struct CoordinationEngine {
    registry: Arc<AdapterRegistry>,
    monitor: Arc<HealthMonitor>,
    router: Arc<Router>,
    sponsorship: Arc<SponsorshipManager>,
    quorum: Arc<ValidatorQuorum>,
    fallback: Arc<FallbackController>,
    orchestrator: Arc<BridgeOrchestrator>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    intake_tx: mpsc::Sender<TransactionIntent>,
    intake_rx: Mutex<Option<mpsc::Receiver<TransactionIntent>>>,
    permits: Arc<Semaphore>,
    settings: Settings,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
    stopped: Notify,
}

impl CoordinationEngine {
    /// Wire up every component from configuration. Chains that fail their
    /// registration probes are skipped with a warning.
    pub async fn build(settings: Settings, store: Arc<dyn StateStore>) -> RelayerResult<Self> {
        let registry = Arc::new(AdapterRegistry::new(settings.health.clone()));

        for (name, chain) in settings.enabled_chains() {
            let adapter = build_adapter(chain);
            adapter.initialize(chain).await?;
            adapter.connect().await?;
            match registry.register(adapter.clone(), adapter.descriptor()).await {
                Ok(()) => info!("Chain {} ({}) ready", chain.chain_id, name),
                Err(e) => warn!("Skipping chain {}: {}", chain.chain_id, e),
            }
        }
        if registry.is_empty() {
            return Err(RelayerError::Config("no chain passed registration".to_string()));
        }

        let sponsorship = Arc::new(
            SponsorshipManager::new(&settings.sponsorship).with_store(store.clone()),
        );
        sponsorship.restore().await;

        let quorum = Arc::new(ValidatorQuorum::from_settings(
            &settings,
            registry.clone(),
            store.clone(),
        )?);
        if quorum.is_empty() {
            warn!("No validators configured - bridge transfers cannot be proven");
        }

        let events = EventBus::default();
        let retry = RetryPolicy::from_config(&settings.retry);
        let call_timeout = settings.bridge.call_timeout();

        let router = Arc::new(Router::new(
            registry.clone(),
            settings.router.weights,
            call_timeout,
        ));
        let fallback = Arc::new(FallbackController::new(
            router.clone(),
            registry.clone(),
            sponsorship.clone(),
            events.clone(),
            retry,
            call_timeout,
        ));
        let orchestrator = Arc::new(BridgeOrchestrator::new(
            registry.clone(),
            quorum.clone(),
            store.clone(),
            events.clone(),
            retry,
            settings.bridge.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(registry.clone()));

        let (intake_tx, intake_rx) = mpsc::channel(settings.relayer.intake_buffer.max(1));
        let permits = Arc::new(Semaphore::new(settings.relayer.max_concurrent_intents.max(1)));

        Ok(Self {
            registry,
            monitor,
            router,
            sponsorship,
            quorum,
            fallback,
            orchestrator,
            store,
            events,
            intake_tx,
            intake_rx: Mutex::new(Some(intake_rx)),
            permits,
            settings,
            shutdown: Arc::new(RwLock::new(false)),
            stopped: Notify::new(),
        })
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn sponsorship(&self) -> &Arc<SponsorshipManager> {
        &self.sponsorship
    }

    pub fn quorum(&self) -> &Arc<ValidatorQuorum> {
        &self.quorum
    }

    pub fn orchestrator(&self) -> &Arc<BridgeOrchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Sender side of the intake channel.
    pub fn intake(&self) -> mpsc::Sender<TransactionIntent> {
        self.intake_tx.clone()
    }

    /// Queue an intent for asynchronous processing.
    pub async fn submit(&self, intent: TransactionIntent) -> RelayerResult<()> {
        self.intake_tx
            .send(intent)
            .await
            .map_err(|_| RelayerError::Internal("intake channel closed".to_string()))
    }

    /// Process one intent to completion.
    #[instrument(skip(self, intent), fields(intent_id = %intent.id))]
    pub async fn handle_intent(&self, intent: TransactionIntent) -> RelayerResult<IntentOutcome> {
        match intent.constraints.bridge_target.clone() {
            Some(target) => self.bridge_intent(intent, target).await,
            None => {
                let execution = self.fallback.execute(&intent).await?;
                Ok(IntentOutcome::Executed(execution))
            }
        }
    }

    /// Route a cross-ledger intent to a source chain and bridge it.
    async fn bridge_intent(
        &self,
        intent: TransactionIntent,
        target: ChainId,
    ) -> RelayerResult<IntentOutcome> {
        let decision = self.router.select(&intent, &RoutingContext::default()).await?;
        debug!("Bridging from chain {} to chain {}", decision.chain_id, target);

        let transfer = self
            .orchestrator
            .execute(BridgeRequest {
                bridge_id: Some(intent.id),
                source_chain: decision.chain_id,
                target_chain: target,
                owner: intent.origin,
                recipient: intent.destination,
                amount: intent.value,
            })
            .await?;
        Ok(IntentOutcome::Bridged(transfer))
    }

    /// Main coordination loop
    pub async fn run(self: &Arc<Self>) -> RelayerResult<()> {
        let mut intake_rx = self
            .intake_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayerError::Internal("coordination engine already running".to_string()))?;

        let monitor_handle = self.monitor.start();

        let mut reset_interval = interval(Duration::from_secs(
            self.settings.sponsorship.reset_check_secs.max(1),
        ));
        let mut sweep_interval = interval(Duration::from_secs(
            self.settings.bridge.sweep_interval_secs.max(1),
        ));
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Coordination engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                // Incoming intents, bounded by the concurrency permits
                maybe_intent = intake_rx.recv() => {
                    let Some(intent) = maybe_intent else {
                        info!("Intake channel closed");
                        break;
                    };
                    let permit = match self.permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let intent_id = intent.id;
                        match engine.handle_intent(intent).await {
                            Ok(IntentOutcome::Executed(e)) => {
                                debug!(intent_id = %intent_id, "Executed on chain {}", e.chain_id);
                            }
                            Ok(IntentOutcome::Bridged(t)) => {
                                debug!(intent_id = %intent_id, "Bridge transfer {} ended in {}", t.bridge_id, t.status);
                            }
                            Err(e) => error!(intent_id = %intent_id, "Intent failed: {}", e),
                        }
                        drop(permit);
                    });
                }

                _ = self.stopped.notified() => break,

                // Daily sponsorship rollover
                _ = reset_interval.tick() => {
                    self.sponsorship.reset_if_due(Utc::now());
                }

                // Recover stuck bridge transfers
                _ = sweep_interval.tick() => {
                    if let Err(e) = self.orchestrator.sweep().await {
                        error!("Bridge sweep failed: {}", e);
                    }
                }
            }
        }

        self.monitor.stop().await;
        monitor_handle.abort();
        info!("Coordination engine stopped");
        Ok(())
    }

    /// Stop the coordination engine
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        self.stopped.notify_one();
        info!("Coordination engine shutdown initiated");
    }

    pub async fn is_stopping(&self) -> bool {
        *self.shutdown.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeStatus;
    use crate::state::MemoryStore;

    const ALICE: &str = "0x00000000000000000000000000000000000000000000000000000000000000a1";
    const BOB: &str = "0x00000000000000000000000000000000000000b0";

    fn settings() -> Settings {
        let toml = format!(
            r#"
            [relayer]
            instance_id = "engine-test"

            [api]
            host = "127.0.0.1"
            port = 8080

            [metrics]
            enabled = false
            port = 9090

            [[validators]]
            name = "v1"
            private_key = "{k1}"

            [[validators]]
            name = "v2"
            private_key = "{k2}"

            [[validators]]
            name = "v3"
            private_key = "{k3}"

            [chains.object]
            chain_id = "object-1"
            name = "Object ledger"
            model = "object_owned"
            confirmation_latency_ms = 0
            genesis = {{ "{alice}" = 1000 }}

            [chains.evm]
            chain_id = "evm-1"
            name = "EVM ledger"
            model = "variable_fee_account"
            confirmation_latency_ms = 0
            "#,
            k1 = format!("{:064x}", 1),
            k2 = format!("{:064x}", 2),
            k3 = format!("{:064x}", 3),
            alice = ALICE,
        );
        Settings::parse(&toml).unwrap()
    }

    #[tokio::test]
    async fn builds_every_component_from_settings() {
        let engine = CoordinationEngine::build(settings(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        assert_eq!(engine.registry().len(), 2);
        assert_eq!(engine.quorum().len(), 3);
        assert_eq!(engine.quorum().validator_set().len(), 3);
    }

    #[tokio::test]
    async fn cross_ledger_intents_go_through_the_bridge() {
        let engine = CoordinationEngine::build(settings(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let intent = TransactionIntent::transfer(ALICE, BOB, 500).bridged_to("evm-1");

        let outcome = engine.handle_intent(intent.clone()).await.unwrap();
        let IntentOutcome::Bridged(transfer) = outcome else {
            panic!("expected a bridge transfer");
        };
        assert_eq!(transfer.bridge_id, intent.id);
        assert_eq!(transfer.source_chain, ChainId::from("object-1"));
        assert_eq!(transfer.status, BridgeStatus::Minted);
        assert_eq!(transfer.minted_amount, 500);
    }

    #[tokio::test]
    async fn run_drains_intake_until_stopped() {
        let engine = Arc::new(
            CoordinationEngine::build(settings(), Arc::new(MemoryStore::new()))
                .await
                .unwrap(),
        );
        let mut events = engine.events().subscribe();
        let runner = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });

        let intent = TransactionIntent::transfer(ALICE, BOB, 100).bridged_to("evm-1");
        engine.submit(intent).await.unwrap();

        let minted = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(crate::events::RelayEvent::Transfer(t)) = events.recv().await {
                    if t.kind == crate::events::TransferEventKind::Minted {
                        return t.amount;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(minted, 100);

        engine.stop().await;
        runner.await.unwrap().unwrap();
        assert!(engine.is_stopping().await);
    }
}
