//! Fallback and retry policy
//!
//! Transient adapter errors are retried on the same chain with capped
//! exponential backoff. Permanent errors re-route through the router with the
//! failing chain excluded, unless the intent is pinned. The bridge
//! orchestrator reuses `RetryPolicy` for its mint and refund steps but keeps
//! its own failure semantics: past the lock, it refunds rather than retrying
//! forever.

use crate::config::RetryConfig;
use crate::error::{AdapterError, ExecutionError};
use crate::events::{EventBus, RelayEvent};
use crate::metrics;
use crate::model::{Capability, ChainId, FeePayer, Outcome, TransactionIntent};
use crate::registry::AdapterRegistry;
use crate::router::{RouteDecision, Router, RoutingContext};
use crate::sponsorship::{SponsorshipGrant, SponsorshipManager};

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Bound an adapter call. Adapters never time themselves out.
pub async fn call_with_timeout<T, F>(
    chain_id: &ChainId,
    operation: &str,
    timeout: Duration,
    call: F,
) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout {
            chain_id: chain_id.clone(),
            operation: operation.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Delay after the given failed attempt (1-based): base x 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt budget
    /// runs out. Returns the last result and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> (Result<T, AdapterError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    metrics::record_retry(e.chain_id().as_str(), operation);
                    warn!(
                        "{} on chain {} failed (attempt {}/{}): {} - retrying in {:?}",
                        operation,
                        e.chain_id(),
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

/// How an intent was finally executed.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub chain_id: ChainId,
    pub outcome: Outcome,
    /// Submit attempts across every chain tried.
    pub attempts: u32,
    /// Chains abandoned after a permanent error, in order.
    pub rerouted_from: Vec<ChainId>,
    pub sponsored: bool,
}

/// Executes intents end to end: route, arrange fees, submit with retry, and
/// re-route on permanent failure.
pub struct FallbackController {
    router: Arc<Router>,
    registry: Arc<AdapterRegistry>,
    sponsorship: Arc<SponsorshipManager>,
    events: EventBus,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl FallbackController {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<AdapterRegistry>,
        sponsorship: Arc<SponsorshipManager>,
        events: EventBus,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            router,
            registry,
            sponsorship,
            events,
            retry,
            call_timeout,
        }
    }

    #[instrument(skip(self, intent), fields(intent_id = %intent.id))]
    pub async fn execute(&self, intent: &TransactionIntent) -> Result<Execution, ExecutionError> {
        let result = self.execute_inner(intent).await;
        match &result {
            Ok(execution) => {
                let outcome = if execution.rerouted_from.is_empty() {
                    "executed"
                } else {
                    "rerouted"
                };
                metrics::record_intent(outcome);
                self.events.publish(RelayEvent::IntentExecuted {
                    intent_id: intent.id,
                    chain_id: execution.chain_id.clone(),
                    reference: execution.outcome.id.clone(),
                    cost_paid: execution.outcome.cost_paid,
                    sponsored: execution.sponsored,
                    at: Utc::now(),
                });
            }
            Err(e) => {
                metrics::record_intent("failed");
                warn!("Intent failed: {}", e);
                self.events.publish(RelayEvent::IntentFailed {
                    intent_id: intent.id,
                    reason: e.to_string(),
                    at: Utc::now(),
                });
            }
        }
        result
    }

    async fn execute_inner(&self, intent: &TransactionIntent) -> Result<Execution, ExecutionError> {
        let tier = intent.constraints.sponsorship_tier.as_deref();
        let mut exclude = BTreeSet::new();
        let mut rerouted_from = Vec::new();
        let mut attempts = 0;

        loop {
            let ctx = RoutingContext {
                exclude: exclude.clone(),
                sponsorship_available: tier
                    .is_some_and(|t| self.sponsorship.has_headroom(&intent.origin, t, 1)),
                require_sponsorship: tier.is_some() && !intent.constraints.allow_identity_pays,
            };
            let decision = self.router.select(intent, &ctx).await?;
            let chain_id = decision.chain_id.clone();

            let (fee_payer, grant) = self.arrange_fees(intent, &decision).await?;
            let (result, made) = self.submit(intent, &chain_id, fee_payer).await;
            attempts += made;

            match result {
                Ok(outcome) => {
                    if let Some(grant) = &grant {
                        let unused = grant.cost.saturating_sub(outcome.cost_paid);
                        self.sponsorship.release(grant, unused).await;
                    }
                    info!(
                        "Intent executed on chain {} after {} attempts (cost {}, {:?} paid)",
                        chain_id, attempts, outcome.cost_paid, outcome.fee_payer
                    );
                    return Ok(Execution {
                        sponsored: outcome.fee_payer == FeePayer::Operator,
                        chain_id,
                        outcome,
                        attempts,
                        rerouted_from,
                    });
                }
                Err(e) => {
                    if let Some(grant) = &grant {
                        self.sponsorship.release(grant, grant.cost).await;
                    }
                    if e.is_transient() || intent.constraints.pinned_chain.is_some() {
                        return Err(ExecutionError::Exhausted {
                            chain_id,
                            attempts,
                            source: e,
                        });
                    }
                    warn!(
                        "Chain {} failed permanently: {} - re-routing",
                        chain_id, e
                    );
                    metrics::record_reroute(chain_id.as_str());
                    exclude.insert(chain_id.clone());
                    rerouted_from.push(chain_id);
                }
            }
        }
    }

    /// Decide who pays. Sponsorship is tried only when the intent names a
    /// tier and the chosen chain can take operator-paid fees.
    async fn arrange_fees(
        &self,
        intent: &TransactionIntent,
        decision: &RouteDecision,
    ) -> Result<(FeePayer, Option<SponsorshipGrant>), ExecutionError> {
        let Some(tier) = intent.constraints.sponsorship_tier.as_deref() else {
            return Ok((FeePayer::Identity, None));
        };
        let identity_pays = intent.constraints.allow_identity_pays;

        let supports = match self.registry.get(&decision.chain_id) {
            Some(chain) => chain
                .descriptor()
                .await
                .supports(Capability::NativeSponsorship),
            None => false,
        };
        if !supports {
            // routing only picks such a chain when identity-pays is allowed
            return Ok((FeePayer::Identity, None));
        }

        let cost = decision.estimate.normalized_cost;
        let grant = match self
            .sponsorship
            .sponsor(&intent.origin, tier, intent.id, cost)
            .await
        {
            Ok(grant) => grant,
            Err(e) if identity_pays => {
                info!("Sponsorship denied ({}); identity pays", e);
                return Ok((FeePayer::Identity, None));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(adapter) = self.registry.adapter(&decision.chain_id) else {
            self.sponsorship.release(&grant, grant.cost).await;
            return Ok((FeePayer::Identity, None));
        };
        match call_with_timeout(
            &decision.chain_id,
            "sponsor",
            self.call_timeout,
            adapter.sponsor(intent),
        )
        .await
        {
            Ok(payer) => Ok((payer, Some(grant))),
            Err(e) => {
                self.sponsorship.release(&grant, grant.cost).await;
                if identity_pays {
                    warn!(
                        "Chain {} cannot sponsor ({}); identity pays",
                        decision.chain_id, e
                    );
                    Ok((FeePayer::Identity, None))
                } else {
                    Err(ExecutionError::SponsorUnavailable {
                        chain_id: decision.chain_id.clone(),
                        source: e,
                    })
                }
            }
        }
    }

    async fn submit(
        &self,
        intent: &TransactionIntent,
        chain_id: &ChainId,
        fee_payer: FeePayer,
    ) -> (Result<Outcome, AdapterError>, u32) {
        let (adapter, _guard) = match self.registry.acquire(chain_id) {
            Ok(claimed) => claimed,
            Err(e) => {
                return (
                    Err(AdapterError::Rejected {
                        chain_id: chain_id.clone(),
                        reason: e.to_string(),
                    }),
                    0,
                )
            }
        };

        self.retry
            .run("submit", |_| {
                let adapter = adapter.clone();
                async move {
                    let result = call_with_timeout(
                        chain_id,
                        "submit",
                        self.call_timeout,
                        adapter.submit(intent, fee_payer),
                    )
                    .await;
                    self.registry.record_call(chain_id, result.is_ok()).await;
                    result
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{LedgerAdapter, MockLedgerAdapter, ProbeReport};
    use crate::config::{HealthConfig, RoutingWeights, SponsorshipConfig};
    use crate::model::{capability_set, ChainDescriptor, CostEstimate, LedgerModel, OutcomeStatus};
    use crate::registry::AdapterRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            max_attempts: 5,
        }
    }

    fn outcome(chain: &ChainId, intent: &TransactionIntent, payer: FeePayer) -> Outcome {
        Outcome {
            id: format!("{}-tx", chain),
            intent_id: intent.id,
            chain_id: chain.clone(),
            status: OutcomeStatus::Confirmed { height: 1 },
            cost_paid: 10,
            fee_payer: payer,
            confirmation_latency: Duration::from_millis(1),
        }
    }

    /// A mock chain that probes healthy and prices every intent at `cost`.
    fn mock_chain(id: &str, cost: u64) -> MockLedgerAdapter {
        let chain = ChainId::from(id);
        let mut mock = MockLedgerAdapter::new();
        let c = chain.clone();
        mock.expect_chain_id().returning(move || c.clone());
        let c = chain.clone();
        mock.expect_descriptor().returning(move || {
            ChainDescriptor::new(
                c.clone(),
                LedgerModel::FastFinalityAccount,
                capability_set(&[Capability::Transfer, Capability::NativeSponsorship]),
            )
        });
        mock.expect_probe().returning(|| {
            Ok(ProbeReport {
                latency: Duration::from_millis(1),
                fee_sample: 10,
                height: 1,
            })
        });
        let c = chain;
        mock.expect_estimate_cost().returning(move |_| {
            Ok(CostEstimate {
                chain_id: c.clone(),
                native_fee: cost,
                normalized_cost: cost,
                estimated_latency: Duration::from_millis(400),
            })
        });
        mock
    }

    async fn controller(mocks: Vec<MockLedgerAdapter>) -> FallbackController {
        let registry = Arc::new(AdapterRegistry::new(HealthConfig::default()));
        for mock in mocks {
            let adapter: Arc<dyn LedgerAdapter> = Arc::new(mock);
            let descriptor = adapter.descriptor();
            registry.register(adapter, descriptor).await.unwrap();
        }
        let router = Arc::new(Router::new(
            registry.clone(),
            RoutingWeights::default(),
            Duration::from_secs(1),
        ));
        let sponsorship = Arc::new(SponsorshipManager::new(&SponsorshipConfig::default()));
        FallbackController::new(
            router,
            registry,
            sponsorship,
            EventBus::default(),
            fast_policy(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(7), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 5);
    }

    #[tokio::test]
    async fn run_stops_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = fast_policy()
            .run("submit", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(AdapterError::Rejected {
                        chain_id: ChainId::from("a"),
                        reason: "bad".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_with_timeout_maps_to_timeout_error() {
        let err = call_with_timeout(
            &ChainId::from("a"),
            "submit",
            Duration::from_millis(5),
            std::future::pending::<Result<(), AdapterError>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
    }

    #[tokio::test]
    async fn transient_errors_retry_on_the_same_chain() {
        let mut mock = mock_chain("a", 10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        mock.expect_submit().returning(move |intent, payer| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AdapterError::RateLimited {
                    chain_id: ChainId::from("a"),
                })
            } else {
                Ok(outcome(&ChainId::from("a"), intent, payer))
            }
        });

        let controller = controller(vec![mock]).await;
        let execution = controller
            .execute(&TransactionIntent::transfer("alice", "bob", 5))
            .await
            .unwrap();
        assert_eq!(execution.attempts, 3);
        assert!(execution.rerouted_from.is_empty());
    }

    #[tokio::test]
    async fn permanent_error_reroutes_to_the_next_chain() {
        let mut a = mock_chain("a", 10);
        a.expect_submit().returning(|_, _| {
            Err(AdapterError::Rejected {
                chain_id: ChainId::from("a"),
                reason: "nonce too low".into(),
            })
        });
        let mut b = mock_chain("b", 20);
        b.expect_submit()
            .returning(|intent, payer| Ok(outcome(&ChainId::from("b"), intent, payer)));

        let controller = controller(vec![a, b]).await;
        let execution = controller
            .execute(&TransactionIntent::transfer("alice", "bob", 5))
            .await
            .unwrap();
        assert_eq!(execution.chain_id, ChainId::from("b"));
        assert_eq!(execution.rerouted_from, vec![ChainId::from("a")]);
    }

    #[tokio::test]
    async fn pinned_intents_are_not_rerouted() {
        let mut a = mock_chain("a", 10);
        a.expect_submit().returning(|_, _| {
            Err(AdapterError::InsufficientFunds {
                chain_id: ChainId::from("a"),
                have: 0,
                need: 5,
            })
        });
        let mut b = mock_chain("b", 20);
        b.expect_submit().never();

        let controller = controller(vec![a, b]).await;
        let err = controller
            .execute(&TransactionIntent::transfer("alice", "bob", 5).pinned_to("a"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Exhausted { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn exhausting_every_chain_is_a_routing_error() {
        let mut a = mock_chain("a", 10);
        a.expect_submit().returning(|_, _| {
            Err(AdapterError::Rejected {
                chain_id: ChainId::from("a"),
                reason: "paused".into(),
            })
        });

        let controller = controller(vec![a]).await;
        let err = controller
            .execute(&TransactionIntent::transfer("alice", "bob", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Routing(_)));
    }

    #[tokio::test]
    async fn sponsored_intent_is_charged_to_the_budget() {
        let mut a = mock_chain("a", 300);
        a.expect_sponsor().returning(|_| Ok(FeePayer::Operator));
        a.expect_submit().returning(|intent, payer| {
            let mut o = outcome(&ChainId::from("a"), intent, payer);
            o.cost_paid = 300;
            Ok(o)
        });

        let controller = controller(vec![a]).await;
        let intent = TransactionIntent::transfer("alice", "bob", 5).sponsored_under("basic");
        let execution = controller.execute(&intent).await.unwrap();

        assert!(execution.sponsored);
        let budget = controller
            .sponsorship
            .budget("alice", "basic", Utc::now().date_naive())
            .unwrap();
        assert_eq!(budget.used_today, 300);
    }

    #[tokio::test]
    async fn failed_chain_sponsorship_surfaces_the_adapter_error() {
        let mut a = mock_chain("a", 300);
        a.expect_sponsor().returning(|_| {
            Err(AdapterError::Rejected {
                chain_id: ChainId::from("a"),
                reason: "paymaster paused".into(),
            })
        });
        a.expect_submit().never();

        let controller = controller(vec![a]).await;
        let intent = TransactionIntent::transfer("alice", "bob", 5)
            .sponsored_under("basic")
            .identity_pays_allowed(false);
        let err = controller.execute(&intent).await.unwrap_err();

        match err {
            ExecutionError::SponsorUnavailable { chain_id, source } => {
                assert_eq!(chain_id, ChainId::from("a"));
                assert!(matches!(source, AdapterError::Rejected { ref reason, .. } if reason == "paymaster paused"));
            }
            other => panic!("unexpected error: {}", other),
        }
        // the reserved budget is handed back
        let used = controller
            .sponsorship
            .budget("alice", "basic", Utc::now().date_naive())
            .map_or(0, |b| b.used_today);
        assert_eq!(used, 0);
    }
}
