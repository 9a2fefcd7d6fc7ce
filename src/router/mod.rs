//! Chain selection for transaction intents
//!
//! Routing is split in two: `rank` is a pure, deterministic scoring function
//! over a snapshot of candidates, and `Router` gathers that snapshot from the
//! registry and the adapters' cost estimates.
//!
//! Candidates are filtered by every hard constraint of the intent first. The
//! survivors are scored as a weighted sum of sponsorship availability,
//! relative latency, relative cost, reliability and a preferred-chain bonus.
//! Equal scores fall back to the lower historical failure rate, then to the
//! chain id.

use crate::config::RoutingWeights;
use crate::error::RoutingError;
use crate::fallback::call_with_timeout;
use crate::metrics;
use crate::model::{
    Capability, ChainDescriptor, ChainId, CostEstimate, RoutingStrategy, TransactionIntent,
};
use crate::registry::AdapterRegistry;

use futures::future::join_all;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

const SCORE_EPSILON: f64 = 1e-9;

/// Caller-side routing state that is not part of the intent itself.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Chains already tried and failed permanently for this intent.
    pub exclude: BTreeSet<ChainId>,
    /// Whether the identity has sponsorship headroom.
    pub sponsorship_available: bool,
    /// Only chains able to take operator-paid fees qualify.
    pub require_sponsorship: bool,
}

/// One chain as seen at decision time.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub descriptor: ChainDescriptor,
    pub failure_rate: f64,
    /// `None` when the adapter could not price the intent.
    pub estimate: Option<CostEstimate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChain {
    pub chain_id: ChainId,
    pub score: f64,
    pub failure_rate: f64,
    pub estimate: CostEstimate,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub chain_id: ChainId,
    pub score: f64,
    pub estimate: CostEstimate,
    /// Every qualifying chain, best first.
    pub ranked: Vec<ScoredChain>,
}

/// Term weights after applying the intent's strategy.
pub fn effective_weights(strategy: RoutingStrategy, weights: &RoutingWeights) -> RoutingWeights {
    let only = |sponsorship: bool, latency: bool, cost: bool, reliability: bool| RoutingWeights {
        sponsorship: if sponsorship { weights.sponsorship } else { 0.0 },
        latency: if latency { weights.latency } else { 0.0 },
        cost: if cost { weights.cost } else { 0.0 },
        reliability: if reliability { weights.reliability } else { 0.0 },
        preference: weights.preference,
    };
    match strategy {
        RoutingStrategy::Balanced => *weights,
        RoutingStrategy::LowestCost => only(false, false, true, false),
        RoutingStrategy::Fastest => only(false, true, false, false),
        RoutingStrategy::MostReliable => only(false, false, false, true),
    }
}

fn ratio(best: u128, value: u128) -> f64 {
    if value == 0 {
        1.0
    } else {
        best as f64 / value as f64
    }
}

/// Why a candidate was filtered out, or `None` if it qualifies.
fn rejection(
    intent: &TransactionIntent,
    ctx: &RoutingContext,
    candidate: &Candidate,
    floor: f64,
) -> Option<String> {
    let descriptor = &candidate.descriptor;
    let chain_id = &descriptor.chain_id;
    let constraints = &intent.constraints;

    if ctx.exclude.contains(chain_id) {
        return Some(format!("{} already failed this intent", chain_id));
    }
    if let Some(pinned) = &constraints.pinned_chain {
        if pinned != chain_id {
            return Some(format!("{} is not the pinned chain", chain_id));
        }
    }
    if constraints.deny_chains.contains(chain_id) {
        return Some(format!("{} is denied", chain_id));
    }
    if !constraints.allow_chains.is_empty() && !constraints.allow_chains.contains(chain_id) {
        return Some(format!("{} is not allowed", chain_id));
    }
    if constraints.bridge_target.as_ref() == Some(chain_id) {
        return Some(format!("{} is the bridge target", chain_id));
    }
    if let Some(missing) = descriptor.missing_capability(&intent.required_capabilities()) {
        return Some(format!("{} lacks {}", chain_id, missing));
    }
    if ctx.require_sponsorship && !descriptor.supports(Capability::NativeSponsorship) {
        return Some(format!("{} cannot take sponsored fees", chain_id));
    }
    if descriptor.health_score <= floor {
        return Some(format!(
            "{} health {:.2} is at or below the floor",
            chain_id, descriptor.health_score
        ));
    }
    let Some(estimate) = &candidate.estimate else {
        return Some(format!("{} could not estimate cost", chain_id));
    };
    if let Some(max_cost) = constraints.max_cost {
        if estimate.normalized_cost > max_cost {
            return Some(format!(
                "{} costs {} above the limit {}",
                chain_id, estimate.normalized_cost, max_cost
            ));
        }
    }
    None
}

/// Rank the qualifying candidates, best first.
///
/// Identical inputs always produce identical output.
pub fn rank(
    intent: &TransactionIntent,
    ctx: &RoutingContext,
    candidates: &[Candidate],
    weights: &RoutingWeights,
    floor: f64,
) -> Result<Vec<ScoredChain>, RoutingError> {
    let mut reasons = Vec::new();
    let qualified: Vec<(&Candidate, &CostEstimate)> = candidates
        .iter()
        .filter_map(|c| match rejection(intent, ctx, c, floor) {
            Some(reason) => {
                reasons.push(reason);
                None
            }
            None => c.estimate.as_ref().map(|e| (c, e)),
        })
        .collect();

    if qualified.is_empty() {
        let reason = if reasons.is_empty() {
            "no chains registered".to_string()
        } else {
            reasons.join("; ")
        };
        return Err(RoutingError::NoCompatibleChain {
            intent_id: intent.id,
            reason,
        });
    }

    let weights = effective_weights(intent.constraints.strategy, weights);
    let cheapest = qualified
        .iter()
        .map(|(_, e)| e.normalized_cost as u128)
        .min()
        .unwrap_or(0);
    let fastest = qualified
        .iter()
        .map(|(_, e)| e.estimated_latency.as_millis())
        .min()
        .unwrap_or(0);

    let mut scored: Vec<ScoredChain> = qualified
        .into_iter()
        .map(|(candidate, estimate)| {
            let descriptor = &candidate.descriptor;
            let sponsorship = if ctx.sponsorship_available
                && descriptor.supports(Capability::NativeSponsorship)
            {
                1.0
            } else {
                0.0
            };
            let preference =
                if intent.constraints.preferred_chain.as_ref() == Some(&descriptor.chain_id) {
                    1.0
                } else {
                    0.0
                };

            let score = weights.sponsorship * sponsorship
                + weights.latency * ratio(fastest, estimate.estimated_latency.as_millis())
                + weights.cost * ratio(cheapest, estimate.normalized_cost as u128)
                + weights.reliability * descriptor.health_score
                + weights.preference * preference;

            ScoredChain {
                chain_id: descriptor.chain_id.clone(),
                score,
                failure_rate: candidate.failure_rate,
                estimate: estimate.clone(),
            }
        })
        .collect();

    scored.sort_by(compare);
    Ok(scored)
}

fn compare(a: &ScoredChain, b: &ScoredChain) -> Ordering {
    if (a.score - b.score).abs() > SCORE_EPSILON {
        return b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal);
    }
    a.failure_rate
        .partial_cmp(&b.failure_rate)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.chain_id.cmp(&b.chain_id))
}

/// Gathers a snapshot of the registry and picks a chain for each intent.
pub struct Router {
    registry: Arc<AdapterRegistry>,
    weights: RwLock<RoutingWeights>,
    call_timeout: Duration,
}

impl Router {
    pub fn new(registry: Arc<AdapterRegistry>, weights: RoutingWeights, call_timeout: Duration) -> Self {
        Self {
            registry,
            weights: RwLock::new(weights),
            call_timeout,
        }
    }

    pub async fn weights(&self) -> RoutingWeights {
        *self.weights.read().await
    }

    pub async fn set_weights(&self, weights: RoutingWeights) {
        *self.weights.write().await = weights;
    }

    /// Snapshot every routable chain, pricing the intent on each in parallel.
    pub async fn candidates(&self, intent: &TransactionIntent) -> Vec<Candidate> {
        let snapshots = self.registry.routable().await;
        let estimates = join_all(snapshots.iter().map(|snapshot| {
            let chain_id = snapshot.descriptor.chain_id.clone();
            let adapter = self.registry.adapter(&chain_id);
            async move {
                let adapter = adapter?;
                match call_with_timeout(
                    &chain_id,
                    "estimate_cost",
                    self.call_timeout,
                    adapter.estimate_cost(intent),
                )
                .await
                {
                    Ok(estimate) => Some(estimate),
                    Err(e) => {
                        debug!(intent_id = %intent.id, "Chain {} cannot price intent: {}", chain_id, e);
                        None
                    }
                }
            }
        }))
        .await;

        snapshots
            .into_iter()
            .zip(estimates)
            .map(|(snapshot, estimate)| Candidate {
                descriptor: snapshot.descriptor,
                failure_rate: snapshot.failure_rate,
                estimate,
            })
            .collect()
    }

    #[instrument(skip(self, intent, ctx), fields(intent_id = %intent.id))]
    pub async fn select(
        &self,
        intent: &TransactionIntent,
        ctx: &RoutingContext,
    ) -> Result<RouteDecision, RoutingError> {
        let candidates = self.candidates(intent).await;
        let weights = self.weights().await;
        let floor = self.registry.config().score_floor;

        let ranked = match rank(intent, ctx, &candidates, &weights, floor) {
            Ok(ranked) => ranked,
            Err(e) => {
                metrics::record_routing_failure();
                warn!("{}", e);
                return Err(e);
            }
        };

        // rank never returns an empty list
        let best = ranked[0].clone();
        metrics::record_route(best.chain_id.as_str());
        debug!(
            "Routed {} intent to chain {} (score {:.4}, {} candidates)",
            intent.kind.as_str(),
            best.chain_id,
            best.score,
            ranked.len()
        );
        Ok(RouteDecision {
            chain_id: best.chain_id,
            score: best.score,
            estimate: best.estimate,
            ranked,
        })
    }
}
