//! Validators that attest to lock claims
//!
//! A validator never trusts the claim it is handed: it re-reads the lock from
//! the source ledger, compares every field, and signs only when the ledger
//! agrees.

use super::proof::{LockClaim, ValidatorAttestation};
use crate::bridge::BridgeStatus;
use crate::error::AttestationError;
use crate::model::Amount;
use crate::registry::AdapterRegistry;
use crate::state::StateStore;

use async_trait::async_trait;
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A party whose signature counts toward a threshold proof.
#[async_trait]
pub trait Attestor: Send + Sync {
    fn id(&self) -> Address;

    fn name(&self) -> &str;

    async fn attest(&self, claim: &LockClaim) -> Result<ValidatorAttestation, AttestationError>;
}

/// Caps the total a validator attests to within one period. A bridge id is
/// counted once, so re-attesting the same transfer is free.
struct AnomalyGuard {
    threshold: Amount,
    period: Duration,
    window: Mutex<AnomalyWindow>,
}

struct AnomalyWindow {
    started: Instant,
    counted: HashMap<Uuid, Amount>,
}

impl AnomalyGuard {
    fn new(threshold: Amount, period: Duration) -> Self {
        Self {
            threshold,
            period,
            window: Mutex::new(AnomalyWindow {
                started: Instant::now(),
                counted: HashMap::new(),
            }),
        }
    }

    async fn admit(&self, bridge_id: Uuid, amount: Amount) -> Result<(), AttestationError> {
        let mut window = self.window.lock().await;
        if window.started.elapsed() >= self.period {
            window.started = Instant::now();
            window.counted.clear();
        }
        if window.counted.contains_key(&bridge_id) {
            return Ok(());
        }

        let period_total = window
            .counted
            .values()
            .fold(amount, |acc, v| acc.saturating_add(*v));
        if period_total > self.threshold {
            return Err(AttestationError::Anomalous {
                amount,
                period_total,
                threshold: self.threshold,
            });
        }
        window.counted.insert(bridge_id, amount);
        Ok(())
    }
}

/// Validator holding its signing key in process.
pub struct LocalValidator {
    name: String,
    wallet: LocalWallet,
    registry: Arc<AdapterRegistry>,
    store: Option<Arc<dyn StateStore>>,
    guard: AnomalyGuard,
}

impl LocalValidator {
    pub fn new(
        name: impl Into<String>,
        wallet: LocalWallet,
        registry: Arc<AdapterRegistry>,
        anomaly_threshold: Amount,
        anomaly_period: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            wallet,
            registry,
            store: None,
            guard: AnomalyGuard::new(anomaly_threshold, anomaly_period),
        }
    }

    /// Validator with a freshly generated key.
    pub fn generate(
        name: impl Into<String>,
        registry: Arc<AdapterRegistry>,
        anomaly_threshold: Amount,
        anomaly_period: Duration,
    ) -> Self {
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        Self::new(name, wallet, registry, anomaly_threshold, anomaly_period)
    }

    /// Consult `store` to refuse bridge ids that are already minted.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    async fn check_lock(&self, claim: &LockClaim) -> Result<(), AttestationError> {
        let adapter = self
            .registry
            .adapter(&claim.source_chain)
            .ok_or_else(|| AttestationError::SourceUnavailable(claim.source_chain.clone()))?;

        let evidence = adapter
            .verify_lock(&claim.lock_ref)
            .await
            .map_err(|_| AttestationError::SourceUnavailable(claim.source_chain.clone()))?
            .ok_or_else(|| AttestationError::LockNotFound(claim.lock_ref.clone()))?;

        if evidence.chain_id != claim.source_chain {
            return Err(AttestationError::EvidenceMismatch(format!(
                "lock lives on {}",
                evidence.chain_id
            )));
        }
        if evidence.bridge_id != claim.bridge_id {
            return Err(AttestationError::EvidenceMismatch(format!(
                "lock belongs to bridge {}",
                evidence.bridge_id
            )));
        }
        if evidence.owner != claim.owner {
            return Err(AttestationError::EvidenceMismatch(
                "lock owner differs".to_string(),
            ));
        }
        if evidence.amount != claim.amount {
            return Err(AttestationError::EvidenceMismatch(format!(
                "ledger holds {} locked, claim says {}",
                evidence.amount, claim.amount
            )));
        }
        if evidence.released {
            return Err(AttestationError::LockReleased(claim.lock_ref.clone()));
        }
        Ok(())
    }

    async fn check_replay(&self, claim: &LockClaim) -> Result<(), AttestationError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        match store.get_transfer(claim.bridge_id).await {
            Ok(Some(transfer)) if transfer.status == BridgeStatus::Minted => {
                Err(AttestationError::AlreadyMinted(claim.bridge_id))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // without the record we cannot rule out a replay
                warn!(
                    bridge_id = %claim.bridge_id,
                    "Validator {} could not read transfer state: {}", self.name, e
                );
                Err(AttestationError::SourceUnavailable(claim.target_chain.clone()))
            }
        }
    }
}

#[async_trait]
impl Attestor for LocalValidator {
    fn id(&self) -> Address {
        self.wallet.address()
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn attest(&self, claim: &LockClaim) -> Result<ValidatorAttestation, AttestationError> {
        self.check_replay(claim).await?;
        self.check_lock(claim).await?;
        self.guard.admit(claim.bridge_id, claim.amount).await?;

        let digest = claim.digest();
        let signature = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| AttestationError::Signing(e.to_string()))?;

        debug!(
            bridge_id = %claim.bridge_id,
            "Validator {} attested {} locked on {}",
            self.name, claim.amount, claim.source_chain
        );

        Ok(ValidatorAttestation {
            validator_id: self.wallet.address(),
            bridge_id: claim.bridge_id,
            digest,
            signature,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{LedgerAdapter, LockRequest, ObjectLedgerAdapter};
    use crate::config::{ChainConfig, HealthConfig};
    use crate::model::{ChainId, LedgerModel};

    const ALICE: &str = "0x00000000000000000000000000000000000000000000000000000000000000a1";

    async fn setup() -> (Arc<AdapterRegistry>, Arc<ObjectLedgerAdapter>) {
        let mut chain = ChainConfig::new("object-1", LedgerModel::ObjectOwned).with_genesis(ALICE, 1_000);
        chain.confirmation_latency_ms = 0;
        let adapter = Arc::new(ObjectLedgerAdapter::new(chain.clone()));
        adapter.initialize(&chain).await.unwrap();
        adapter.connect().await.unwrap();

        let registry = Arc::new(AdapterRegistry::new(HealthConfig::default()));
        registry
            .register(adapter.clone(), adapter.descriptor())
            .await
            .unwrap();
        (registry, adapter)
    }

    async fn locked_claim(adapter: &ObjectLedgerAdapter, amount: Amount) -> LockClaim {
        let bridge_id = Uuid::new_v4();
        let receipt = adapter
            .lock(&LockRequest {
                bridge_id,
                owner: ALICE.to_string(),
                amount,
            })
            .await
            .unwrap();
        LockClaim {
            bridge_id,
            source_chain: ChainId::from("object-1"),
            target_chain: ChainId::from("evm-1"),
            lock_ref: receipt.lock_ref,
            owner: ALICE.to_string(),
            recipient: "0x00000000000000000000000000000000000000b0".into(),
            amount,
        }
    }

    #[tokio::test]
    async fn signs_a_lock_the_ledger_confirms() {
        let (registry, adapter) = setup().await;
        let validator = LocalValidator::generate("v1", registry, 10_000, Duration::from_secs(60));
        let claim = locked_claim(&adapter, 500).await;

        let attestation = validator.attest(&claim).await.unwrap();
        assert_eq!(attestation.validator_id, validator.id());
        assert_eq!(attestation.digest, claim.digest());
        assert!(attestation.signature_valid());
    }

    #[tokio::test]
    async fn refuses_an_inflated_claim() {
        let (registry, adapter) = setup().await;
        let validator = LocalValidator::generate("v1", registry, 10_000, Duration::from_secs(60));
        let mut claim = locked_claim(&adapter, 500).await;
        claim.amount = 900;

        assert!(matches!(
            validator.attest(&claim).await,
            Err(AttestationError::EvidenceMismatch(_))
        ));
    }

    #[tokio::test]
    async fn refuses_unknown_and_released_locks() {
        let (registry, adapter) = setup().await;
        let validator = LocalValidator::generate("v1", registry, 10_000, Duration::from_secs(60));

        let mut forged = locked_claim(&adapter, 100).await;
        forged.lock_ref = "0xdeadbeef".into();
        assert!(matches!(
            validator.attest(&forged).await,
            Err(AttestationError::LockNotFound(_))
        ));

        let claim = locked_claim(&adapter, 100).await;
        adapter.refund(&claim.lock_ref).await.unwrap();
        assert!(matches!(
            validator.attest(&claim).await,
            Err(AttestationError::LockReleased(_))
        ));
    }

    #[tokio::test]
    async fn anomaly_threshold_is_cumulative_per_period() {
        let (registry, adapter) = setup().await;
        let validator = LocalValidator::generate("v1", registry, 600, Duration::from_secs(60));

        let first = locked_claim(&adapter, 400).await;
        validator.attest(&first).await.unwrap();
        // the same bridge id is not counted twice
        validator.attest(&first).await.unwrap();

        let second = locked_claim(&adapter, 300).await;
        assert_eq!(
            validator.attest(&second).await.unwrap_err(),
            AttestationError::Anomalous {
                amount: 300,
                period_total: 700,
                threshold: 600,
            }
        );
    }
}
