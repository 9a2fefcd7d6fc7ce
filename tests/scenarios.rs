//! End-to-end relay scenarios against the in-process ledgers

use conduit_relayer::adapter::{LedgerAdapter, ObjectLedgerAdapter, VariableFeeAdapter};
use conduit_relayer::bridge::{BridgeOrchestrator, BridgeRequest, BridgeStatus};
use conduit_relayer::config::{BridgeConfig, ChainConfig, HealthConfig, RoutingWeights, SponsorshipConfig};
use conduit_relayer::error::{AttestationError, RoutingError, SponsorshipError};
use conduit_relayer::events::EventBus;
use conduit_relayer::fallback::{FallbackController, RetryPolicy};
use conduit_relayer::model::{
    capability_set, Amount, Capability, ChainDescriptor, ChainId, CostEstimate, FeePayer,
    IntentKind, LedgerModel, TransactionIntent,
};
use conduit_relayer::quorum::{
    Attestor, LocalValidator, LockClaim, QuorumPolicy, ValidatorAttestation, ValidatorQuorum,
};
use conduit_relayer::registry::AdapterRegistry;
use conduit_relayer::router::{rank, Candidate, Router, RoutingContext};
use conduit_relayer::sponsorship::SponsorshipManager;
use conduit_relayer::state::MemoryStore;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

const ALICE: &str = "0x00000000000000000000000000000000000000000000000000000000000000a1";
const CAROL: &str = "0x00000000000000000000000000000000000000000000000000000000000000c3";
const BOB: &str = "0x00000000000000000000000000000000000000b0";

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(5),
        max_attempts: 3,
    }
}

async fn object_chain(config: ChainConfig) -> Arc<ObjectLedgerAdapter> {
    let adapter = Arc::new(ObjectLedgerAdapter::new(config.clone()));
    assert_ok!(adapter.initialize(&config).await);
    assert_ok!(adapter.connect().await);
    adapter
}

async fn evm_chain(id: &str) -> Arc<VariableFeeAdapter> {
    let mut config = ChainConfig::new(id, LedgerModel::VariableFeeAccount);
    config.confirmation_latency_ms = 0;
    let adapter = Arc::new(VariableFeeAdapter::new(config.clone()));
    assert_ok!(adapter.initialize(&config).await);
    assert_ok!(adapter.connect().await);
    adapter
}

fn source_config(genesis: u64) -> ChainConfig {
    let mut config =
        ChainConfig::new("object-1", LedgerModel::ObjectOwned).with_genesis(ALICE, genesis);
    config.confirmation_latency_ms = 0;
    config
}

async fn register(registry: &AdapterRegistry, adapter: Arc<dyn LedgerAdapter>) {
    let descriptor = adapter.descriptor();
    assert_ok!(registry.register(adapter, descriptor).await);
}

fn honest_validators(registry: &Arc<AdapterRegistry>, n: usize) -> Vec<Arc<dyn Attestor>> {
    (1..=n)
        .map(|i| {
            Arc::new(LocalValidator::generate(
                format!("v{}", i),
                registry.clone(),
                1_000_000,
                Duration::from_secs(3_600),
            )) as Arc<dyn Attestor>
        })
        .collect()
}

fn orchestrator(
    registry: Arc<AdapterRegistry>,
    validators: Vec<Arc<dyn Attestor>>,
    config: BridgeConfig,
) -> BridgeOrchestrator {
    let quorum = Arc::new(ValidatorQuorum::new(validators, QuorumPolicy::flat(2)));
    BridgeOrchestrator::new(
        registry,
        quorum,
        Arc::new(MemoryStore::new()),
        EventBus::default(),
        fast_retry(),
        config,
    )
}

fn bridge(target: &str, amount: Amount) -> BridgeRequest {
    BridgeRequest {
        bridge_id: None,
        source_chain: ChainId::from("object-1"),
        target_chain: ChainId::from(target),
        owner: ALICE.to_string(),
        recipient: BOB.to_string(),
        amount,
    }
}

/// A validator that never answers.
struct SilentValidator {
    id: Address,
    name: String,
}

#[async_trait]
impl Attestor for SilentValidator {
    fn id(&self) -> Address {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn attest(&self, _claim: &LockClaim) -> Result<ValidatorAttestation, AttestationError> {
        std::future::pending().await
    }
}

fn candidate(id: &str, caps: &[Capability], cost: u64, latency_ms: u64) -> Candidate {
    Candidate {
        descriptor: ChainDescriptor::new(
            ChainId::from(id),
            LedgerModel::FastFinalityAccount,
            capability_set(caps),
        ),
        failure_rate: 0.0,
        estimate: Some(CostEstimate {
            chain_id: ChainId::from(id),
            native_fee: cost,
            normalized_cost: cost,
            estimated_latency: Duration::from_millis(latency_ms),
        }),
    }
}

#[test]
fn required_capability_outranks_a_better_score() {
    let candidates = vec![
        candidate("chain-a", &[Capability::Transfer, Capability::ContractCall], 80, 800),
        candidate("chain-b", &[Capability::Transfer], 40, 400),
    ];
    let weights = RoutingWeights::default();
    let ctx = RoutingContext::default();

    // without the capability requirement chain-b is the better chain
    let plain = TransactionIntent::transfer("alice", "bob", 10);
    let ranked = assert_ok!(rank(&plain, &ctx, &candidates, &weights, 0.3));
    assert_eq!(ranked[0].chain_id, ChainId::from("chain-b"));
    assert!(ranked[0].score > ranked[1].score);

    let call = TransactionIntent::new(IntentKind::ContractCall, "alice", "bob", 0);
    let ranked = assert_ok!(rank(&call, &ctx, &candidates, &weights, 0.3));
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].chain_id, ChainId::from("chain-a"));

    let impossible = call.clone().denying("chain-a");
    let err = assert_err!(rank(&impossible, &ctx, &candidates, &weights, 0.3));
    assert!(matches!(err, RoutingError::NoCompatibleChain { .. }));
}

#[test]
fn identical_snapshots_rank_identically() {
    let candidates = vec![
        candidate("chain-a", &[Capability::Transfer], 50, 500),
        candidate("chain-b", &[Capability::Transfer], 50, 500),
        candidate("chain-c", &[Capability::Transfer], 60, 300),
    ];
    let mut reversed = candidates.clone();
    reversed.reverse();
    let intent = TransactionIntent::transfer("alice", "bob", 10);
    let weights = RoutingWeights::default();
    let ctx = RoutingContext::default();

    let first = assert_ok!(rank(&intent, &ctx, &candidates, &weights, 0.3));
    for _ in 0..10 {
        let again = assert_ok!(rank(&intent, &ctx, &reversed, &weights, 0.3));
        let ids: Vec<_> = again.iter().map(|s| s.chain_id.clone()).collect();
        let expected: Vec<_> = first.iter().map(|s| s.chain_id.clone()).collect();
        assert_eq!(ids, expected);
    }
}

#[tokio::test]
async fn quorum_reached_mints_the_locked_amount() {
    let source = object_chain(source_config(1_000)).await;
    let target = evm_chain("evm-1").await;
    let registry = Arc::new(AdapterRegistry::new(HealthConfig::default()));
    register(&registry, source.clone()).await;
    register(&registry, target.clone()).await;
    let validators = honest_validators(&registry, 3);
    let orchestrator = orchestrator(registry, validators, BridgeConfig::default());

    let transfer = assert_ok!(orchestrator.execute(bridge("evm-1", 500)).await);
    assert_eq!(transfer.status, BridgeStatus::Minted);
    assert_eq!(transfer.locked_amount, 500);
    assert_eq!(transfer.minted_amount, 500);
    assert!(transfer.attestations.len() >= 2);

    assert_eq!(source.book().outstanding_locked().await, 500);
    assert_eq!(target.book().total_minted().await, 500);
    assert_eq!(target.book().balance(BOB).await, 500);
}

#[tokio::test]
async fn quorum_timeout_refunds_the_owner() {
    let source = object_chain(source_config(1_000)).await;
    let target = evm_chain("evm-1").await;
    let registry = Arc::new(AdapterRegistry::new(HealthConfig::default()));
    register(&registry, source.clone()).await;
    register(&registry, target.clone()).await;

    let mut validators = honest_validators(&registry, 1);
    for i in 2..=3u64 {
        validators.push(Arc::new(SilentValidator {
            id: Address::from_low_u64_be(i),
            name: format!("silent-{}", i),
        }));
    }
    let config = BridgeConfig {
        quorum_timeout_secs: 1,
        ..BridgeConfig::default()
    };
    let orchestrator = orchestrator(registry, validators, config);

    let transfer = assert_ok!(orchestrator.execute(bridge("evm-1", 500)).await);
    assert_eq!(transfer.status, BridgeStatus::Refunded);
    assert_eq!(transfer.refunded_amount, 500);
    assert_eq!(transfer.minted_amount, 0);

    let statuses: Vec<_> = transfer.history.iter().map(|t| t.to).collect();
    assert!(statuses.contains(&BridgeStatus::Failed));
    assert!(statuses.contains(&BridgeStatus::Refunding));

    assert_eq!(source.book().balance(ALICE).await, 1_000);
    assert_eq!(source.book().outstanding_locked().await, 0);
    assert_eq!(target.book().mint_count().await, 0);
}

#[tokio::test]
async fn second_sponsored_request_falls_back_to_identity_pays() {
    let mut config = source_config(10_000_000);
    config.fee.base_fee = 600;
    config.fee.max_fee = 1_000_000;
    config.cost_normalization = 1_000;
    config.operator_float = 5_000_000;
    let chain = object_chain(config).await;

    let registry = Arc::new(AdapterRegistry::new(HealthConfig::default()));
    register(&registry, chain.clone()).await;
    let router = Arc::new(Router::new(
        registry.clone(),
        RoutingWeights::default(),
        Duration::from_secs(1),
    ));
    let sponsorship = Arc::new(SponsorshipManager::new(&SponsorshipConfig::default()));
    let controller = FallbackController::new(
        router,
        registry,
        sponsorship.clone(),
        EventBus::default(),
        fast_retry(),
        Duration::from_secs(1),
    );

    let first = TransactionIntent::transfer(ALICE, CAROL, 10).sponsored_under("basic");
    let execution = assert_ok!(controller.execute(&first).await);
    assert!(execution.sponsored);
    assert!(execution.outcome.is_confirmed());
    assert_eq!(execution.outcome.fee_payer, FeePayer::Operator);
    assert_eq!(execution.outcome.cost_paid, 600);

    let today = Utc::now().date_naive();
    let budget = sponsorship.budget(ALICE, "basic", today).unwrap();
    assert_eq!(budget.used_today, 600);
    assert!(!sponsorship.has_headroom(ALICE, "basic", 600));

    let err = assert_err!(sponsorship.sponsor(ALICE, "basic", Uuid::new_v4(), 600).await);
    assert!(matches!(err, SponsorshipError::BudgetExceeded { used: 600, limit: 1_000, .. }));

    let second = TransactionIntent::transfer(ALICE, CAROL, 10).sponsored_under("basic");
    let execution = assert_ok!(controller.execute(&second).await);
    assert!(!execution.sponsored);
    assert_eq!(execution.outcome.fee_payer, FeePayer::Identity);

    let budget = sponsorship.budget(ALICE, "basic", today).unwrap();
    assert_eq!(budget.used_today, 600);
    assert_eq!(chain.book().balance(ALICE).await, 10_000_000 - 20 - 600_000);
    assert_eq!(chain.book().balance(CAROL).await, 20);
}

#[tokio::test]
async fn replayed_drives_never_mint_twice() {
    let source = object_chain(source_config(1_000)).await;
    let target = evm_chain("evm-1").await;
    let registry = Arc::new(AdapterRegistry::new(HealthConfig::default()));
    register(&registry, source.clone()).await;
    register(&registry, target.clone()).await;
    let validators = honest_validators(&registry, 3);
    let orchestrator = orchestrator(registry, validators, BridgeConfig::default());

    let requested = assert_ok!(orchestrator.request(bridge("evm-1", 250)).await);
    let id = requested.bridge_id;
    let (a, b) = tokio::join!(orchestrator.drive(id), orchestrator.drive(id));
    assert_eq!(assert_ok!(a).status, BridgeStatus::Minted);
    assert_eq!(assert_ok!(b).status, BridgeStatus::Minted);

    // the same id submitted again resolves to the existing transfer
    let again = BridgeRequest {
        bridge_id: Some(id),
        ..bridge("evm-1", 250)
    };
    let replay = assert_ok!(orchestrator.execute(again).await);
    assert_eq!(replay.status, BridgeStatus::Minted);

    assert_eq!(target.book().mint_count().await, 1);
    assert_eq!(target.book().total_minted().await, 250);
    assert_eq!(source.book().outstanding_locked().await, 250);
}

#[tokio::test]
async fn concurrent_sponsorship_never_exceeds_the_daily_limit() {
    let sponsorship = Arc::new(SponsorshipManager::new(&SponsorshipConfig::default()));

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let sponsorship = sponsorship.clone();
            tokio::spawn(async move {
                sponsorship
                    .sponsor("identity-1", "basic", Uuid::new_v4(), 70)
                    .await
                    .is_ok()
            })
        })
        .collect();

    let mut granted = 0;
    for handle in futures::future::join_all(handles).await {
        if assert_ok!(handle) {
            granted += 1;
        }
    }

    assert_eq!(granted, 1_000 / 70);
    let budget = sponsorship
        .budget("identity-1", "basic", Utc::now().date_naive())
        .unwrap();
    assert_eq!(budget.used_today, 70 * (1_000 / 70));
    assert!(budget.used_today <= budget.daily_limit);
}

#[tokio::test]
async fn an_offline_target_does_not_hold_up_other_transfers() {
    let source = object_chain(source_config(1_000)).await;
    let broken = evm_chain("evm-1").await;
    let healthy = evm_chain("evm-2").await;
    let registry = Arc::new(AdapterRegistry::new(HealthConfig::default()));
    register(&registry, source.clone()).await;
    register(&registry, broken.clone()).await;
    register(&registry, healthy.clone()).await;
    let validators = honest_validators(&registry, 3);
    let orchestrator = orchestrator(registry, validators, BridgeConfig::default());

    broken.book().set_offline(true).await;
    let (stuck, done) = tokio::join!(
        orchestrator.execute(bridge("evm-1", 300)),
        orchestrator.execute(bridge("evm-2", 400)),
    );
    let stuck = assert_ok!(stuck);
    let done = assert_ok!(done);

    assert_eq!(done.status, BridgeStatus::Minted);
    assert_eq!(healthy.book().balance(BOB).await, 400);
    assert_eq!(stuck.status, BridgeStatus::Failed);
    assert!(stuck.has_lock());

    broken.book().set_offline(false).await;
    let report = assert_ok!(orchestrator.sweep().await);
    assert_eq!(report.recovered, 1);

    let stuck = assert_ok!(orchestrator.get(stuck.bridge_id).await);
    assert_eq!(stuck.status, BridgeStatus::Refunded);
    assert_eq!(source.book().balance(ALICE).await, 600);
    assert_eq!(source.book().outstanding_locked().await, healthy.book().total_minted().await);
}

#[tokio::test]
async fn routing_moves_off_a_chain_whose_health_collapses() {
    let mut cheap = source_config(1_000_000);
    cheap.fee.base_fee = 1;
    let mut dear = ChainConfig::new("object-2", LedgerModel::ObjectOwned).with_genesis(ALICE, 1_000_000);
    dear.confirmation_latency_ms = 0;
    dear.fee.base_fee = 5;
    let cheap = object_chain(cheap).await;
    let dear = object_chain(dear).await;

    let registry = Arc::new(AdapterRegistry::new(HealthConfig::default()));
    register(&registry, cheap.clone()).await;
    register(&registry, dear.clone()).await;
    let router = Router::new(registry.clone(), RoutingWeights::default(), Duration::from_secs(1));
    let intent = TransactionIntent::transfer(ALICE, CAROL, 10).with_strategy(
        conduit_relayer::model::RoutingStrategy::LowestCost,
    );

    let decision = assert_ok!(router.select(&intent, &RoutingContext::default()).await);
    assert_eq!(decision.chain_id, ChainId::from("object-1"));

    cheap.book().set_offline(true).await;
    let cheap_id = ChainId::from("object-1");
    let mut score = 1.0;
    for _ in 0..30 {
        score = registry.refresh(&cheap_id).await.unwrap();
        if score <= 0.3 {
            break;
        }
    }
    assert!(score <= 0.3);

    let decision = assert_ok!(router.select(&intent, &RoutingContext::default()).await);
    assert_eq!(decision.chain_id, ChainId::from("object-2"));
    let dear_id = ChainId::from("object-2");
    let dear_score = registry.refresh(&dear_id).await.unwrap();
    assert!(dear_score > 0.3);
}
