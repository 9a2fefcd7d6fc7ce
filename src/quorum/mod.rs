//! Validator quorum - independent m-of-n attestation of bridge locks
//!
//! This module provides:
//! - The `Attestor` seam and a key-holding `LocalValidator`
//! - Risk-tiered threshold policy, adjustable at runtime
//! - Concurrent signature collection with a deadline
//! - Exclusion and flagging of validators that sign conflicting statements

mod proof;
mod validator;

pub use proof::{LockClaim, ThresholdProof, ValidatorAttestation};
pub use validator::{Attestor, LocalValidator};

use crate::config::{RiskTierConfig, Settings};
use crate::error::{AttestationError, BridgeError, RelayerError};
use crate::metrics;
use crate::model::Amount;
use crate::registry::AdapterRegistry;
use crate::state::StateStore;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::signers::LocalWallet;
use ethers::types::{Address, H256};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Threshold selection by transfer amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pub default_threshold: usize,
    /// Ordered by `max_amount`, unbounded tier last.
    pub tiers: Vec<RiskTierConfig>,
}

impl QuorumPolicy {
    pub fn new(default_threshold: usize, mut tiers: Vec<RiskTierConfig>) -> Self {
        tiers.sort_by_key(|t| (t.max_amount.is_none(), t.max_amount));
        Self {
            default_threshold,
            tiers,
        }
    }

    pub fn flat(threshold: usize) -> Self {
        Self::new(threshold, Vec::new())
    }

    pub fn threshold_for(&self, amount: Amount) -> usize {
        self.tiers
            .iter()
            .find(|t| t.max_amount.map_or(true, |max| amount <= max as Amount))
            .map(|t| t.threshold)
            .unwrap_or(self.default_threshold)
    }

    fn thresholds(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.default_threshold).chain(self.tiers.iter().map(|t| t.threshold))
    }
}

/// Why a validator was flagged. Removal is left to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagRecord {
    pub validator_id: Address,
    pub name: String,
    pub bridge_id: Uuid,
    pub reason: String,
    pub at: DateTime<Utc>,
}

pub struct ValidatorQuorum {
    validators: Vec<Arc<dyn Attestor>>,
    policy: RwLock<QuorumPolicy>,
    flagged: DashMap<Address, FlagRecord>,
    /// First digest each validator signed per bridge id.
    seen: DashMap<(Uuid, Address), H256>,
}

impl ValidatorQuorum {
    pub fn new(validators: Vec<Arc<dyn Attestor>>, policy: QuorumPolicy) -> Self {
        Self {
            validators,
            policy: RwLock::new(policy),
            flagged: DashMap::new(),
            seen: DashMap::new(),
        }
    }

    /// Build the configured validator set. Keys come from `[[validators]]`.
    pub fn from_settings(
        settings: &Settings,
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, RelayerError> {
        let period = Duration::from_secs(settings.quorum.anomaly_period_secs);
        let mut validators: Vec<Arc<dyn Attestor>> = Vec::with_capacity(settings.validators.len());

        for config in &settings.validators {
            let wallet: LocalWallet = config
                .private_key
                .trim_start_matches("0x")
                .parse()
                .map_err(|e| {
                    RelayerError::Wallet(format!("validator {}: {}", config.name, e))
                })?;
            let validator = LocalValidator::new(
                config.name.clone(),
                wallet,
                registry.clone(),
                settings.quorum.anomaly_threshold as Amount,
                period,
            )
            .with_store(store.clone());
            info!("Loaded validator {} ({:?})", validator.name(), validator.id());
            validators.push(Arc::new(validator));
        }

        let policy = QuorumPolicy::new(
            settings.quorum.default_threshold,
            settings.quorum.risk_tiers.clone(),
        );
        let max = policy.thresholds().max().unwrap_or(0);
        if !validators.is_empty() && max > validators.len() {
            return Err(RelayerError::Config(format!(
                "quorum threshold {} exceeds the {} configured validators",
                max,
                validators.len()
            )));
        }
        Ok(Self::new(validators, policy))
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Addresses a proof may be signed by.
    pub fn validator_set(&self) -> BTreeSet<Address> {
        self.validators.iter().map(|v| v.id()).collect()
    }

    pub async fn policy(&self) -> QuorumPolicy {
        self.policy.read().await.clone()
    }

    pub async fn threshold_for(&self, amount: Amount) -> usize {
        self.policy.read().await.threshold_for(amount)
    }

    /// Replace the threshold policy. Every threshold must be reachable by
    /// the current validator set.
    pub async fn set_policy(&self, policy: QuorumPolicy) -> Result<(), BridgeError> {
        let n = self.validators.len();
        if let Some(bad) = policy.thresholds().find(|t| *t == 0 || *t > n) {
            return Err(BridgeError::InvalidRequest(format!(
                "threshold {} is outside 1..={}",
                bad, n
            )));
        }
        info!(
            "Quorum policy updated: default {}-of-{}, {} risk tiers",
            policy.default_threshold,
            n,
            policy.tiers.len()
        );
        *self.policy.write().await = policy;
        Ok(())
    }

    pub async fn set_default_threshold(&self, threshold: usize) -> Result<(), BridgeError> {
        let mut policy = self.policy().await;
        policy.default_threshold = threshold;
        self.set_policy(policy).await
    }

    pub fn flagged(&self) -> Vec<FlagRecord> {
        let mut records: Vec<_> = self.flagged.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.at);
        records
    }

    pub fn is_flagged(&self, validator_id: &Address) -> bool {
        self.flagged.contains_key(validator_id)
    }

    pub fn clear_flag(&self, validator_id: &Address) -> bool {
        let cleared = self.flagged.remove(validator_id).is_some();
        metrics::set_flagged_validators(self.flagged.len());
        cleared
    }

    /// Drop the statements remembered for a transfer that will not be
    /// proven again.
    pub fn forget(&self, bridge_id: Uuid) {
        self.seen.retain(|(id, _), _| *id != bridge_id);
    }

    /// Number of (bridge id, validator) statements held for conflict checks.
    pub fn tracked_statements(&self) -> usize {
        self.seen.len()
    }

    /// Gather attestations for `claim` until the risk tier's threshold is met.
    ///
    /// Fails with `QuorumTimeout` when the deadline passes first and with
    /// `ProofRejected` once enough validators have refused that the
    /// threshold can no longer be reached.
    #[instrument(skip(self, claim), fields(bridge_id = %claim.bridge_id))]
    pub async fn collect(
        &self,
        claim: &LockClaim,
        timeout: Duration,
    ) -> Result<ThresholdProof, BridgeError> {
        let threshold = self.threshold_for(claim.amount).await;
        let digest = claim.digest();
        let deadline = Instant::now() + timeout;

        let eligible: Vec<Arc<dyn Attestor>> = self
            .validators
            .iter()
            .filter(|v| !self.is_flagged(&v.id()))
            .cloned()
            .collect();
        if threshold == 0 || eligible.len() < threshold {
            return Err(BridgeError::ProofRejected {
                bridge_id: claim.bridge_id,
                reason: format!(
                    "{} eligible validators, {} required",
                    eligible.len(),
                    threshold
                ),
            });
        }

        let mut pending: FuturesUnordered<_> = eligible
            .into_iter()
            .map(|validator| {
                let claim = claim.clone();
                async move {
                    let result = validator.attest(&claim).await;
                    (validator, result)
                }
            })
            .collect();

        let mut accepted: BTreeMap<Address, ValidatorAttestation> = BTreeMap::new();
        let mut refusals: Vec<String> = Vec::new();
        let mut already_minted = false;

        while accepted.len() < threshold {
            if accepted.len() + pending.len() < threshold {
                break;
            }
            let next = match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Quorum timed out with {}/{} attestations",
                        accepted.len(),
                        threshold
                    );
                    return Err(BridgeError::QuorumTimeout {
                        bridge_id: claim.bridge_id,
                        collected: accepted.len(),
                        required: threshold,
                    });
                }
            };

            match next {
                (validator, Ok(attestation)) => {
                    if self.admit(validator.as_ref(), claim, digest, &attestation) {
                        metrics::record_attestation(validator.name(), "accepted");
                        accepted.insert(attestation.validator_id, attestation);
                    } else {
                        metrics::record_attestation(validator.name(), "excluded");
                    }
                }
                (validator, Err(e)) => {
                    metrics::record_attestation(validator.name(), "refused");
                    warn!("Validator {} refused to attest: {}", validator.name(), e);
                    if matches!(e, AttestationError::AlreadyMinted(_)) {
                        already_minted = true;
                    }
                    refusals.push(format!("{}: {}", validator.name(), e));
                }
            }
        }

        if accepted.len() < threshold {
            let reason = if already_minted {
                "bridge id is already minted".to_string()
            } else {
                format!(
                    "{} of {} required attestations; refusals: {}",
                    accepted.len(),
                    threshold,
                    refusals.join("; ")
                )
            };
            return Err(BridgeError::ProofRejected {
                bridge_id: claim.bridge_id,
                reason,
            });
        }

        info!(
            "Quorum reached {}-of-{} for {} on {}",
            accepted.len(),
            self.validators.len(),
            claim.amount,
            claim.source_chain
        );
        Ok(ThresholdProof {
            bridge_id: claim.bridge_id,
            claim: claim.clone(),
            digest,
            threshold,
            attestations: accepted.into_values().collect(),
        })
    }

    /// Whether an attestation counts. Conflicting statements flag the signer.
    fn admit(
        &self,
        validator: &dyn Attestor,
        claim: &LockClaim,
        digest: H256,
        attestation: &ValidatorAttestation,
    ) -> bool {
        let id = validator.id();
        if attestation.validator_id != id || attestation.bridge_id != claim.bridge_id {
            self.flag(validator, claim.bridge_id, "attestation names another signer or bridge");
            return false;
        }
        if !attestation.signature_valid() {
            self.flag(validator, claim.bridge_id, "signature does not recover to the validator");
            return false;
        }

        let conflicting = match self.seen.entry((claim.bridge_id, id)) {
            Entry::Occupied(first) => *first.get() != attestation.digest,
            Entry::Vacant(slot) => {
                slot.insert(attestation.digest);
                false
            }
        };
        if conflicting {
            self.flag(validator, claim.bridge_id, "signed conflicting statements");
            return false;
        }
        if attestation.digest != digest {
            self.flag(validator, claim.bridge_id, "signed a statement that differs from the lock");
            return false;
        }
        true
    }

    fn flag(&self, validator: &dyn Attestor, bridge_id: Uuid, reason: &str) {
        warn!(
            bridge_id = %bridge_id,
            "Flagging validator {} ({:?}): {}",
            validator.name(),
            validator.id(),
            reason
        );
        self.flagged.insert(
            validator.id(),
            FlagRecord {
                validator_id: validator.id(),
                name: validator.name().to_string(),
                bridge_id,
                reason: reason.to_string(),
                at: Utc::now(),
            },
        );
        metrics::set_flagged_validators(self.flagged.len());
    }
}
