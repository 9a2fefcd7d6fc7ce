//! Ledger adapters - translate the universal model into native operations
//!
//! This module provides:
//! - The `LedgerAdapter` contract every ledger implements
//! - Bridge primitives (lock / mint / refund) gated on declared capabilities
//! - Three reference adapters, one per ledger model class
//!
//! Native transaction shapes stay private to each adapter; callers only ever
//! see `Outcome`, `CostEstimate` and the receipt types below.

pub mod account;
pub mod evm;
pub mod ledger;
pub mod object;

pub use account::FastFinalityAdapter;
pub use evm::VariableFeeAdapter;
pub use ledger::{Fault, LedgerBook};
pub use object::ObjectLedgerAdapter;

use crate::config::ChainConfig;
use crate::error::AdapterError;
use crate::events::{AdapterEvent, EventFilter, EventSubscription};
use crate::model::{
    Amount, Capability, CapabilitySet, ChainDescriptor, ChainId, CostEstimate, FeePayer,
    LedgerModel, Outcome, OutcomeStatus, TransactionIntent,
};
use crate::quorum::ThresholdProof;
use ledger::Settlement;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub latency: Duration,
    /// Current fee for a plain transfer, in native units.
    pub fee_sample: u64,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub bridge_id: Uuid,
    pub owner: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReceipt {
    pub chain_id: ChainId,
    pub lock_ref: String,
    pub amount: Amount,
    pub height: u64,
}

#[derive(Debug, Clone)]
pub struct MintRequest {
    pub idempotency_key: String,
    pub bridge_id: Uuid,
    pub recipient: String,
    pub amount: Amount,
    pub proof: ThresholdProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintReceipt {
    pub mint_ref: String,
    pub amount: Amount,
    /// The key had already been minted; nothing new was credited.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub lock_ref: String,
    pub amount: Amount,
    pub replayed: bool,
}

/// Canonical lock state as recorded by the source ledger itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvidence {
    pub chain_id: ChainId,
    pub lock_ref: String,
    pub bridge_id: Uuid,
    pub owner: String,
    pub amount: Amount,
    pub released: bool,
    pub height: u64,
}

/// Uniform contract over a value-transfer ledger.
///
/// Adapters never apply their own call timeouts; callers wrap calls with
/// `fallback::call_with_timeout`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Static part of the descriptor; the registry owns the live copy.
    fn descriptor(&self) -> ChainDescriptor;

    async fn initialize(&self, config: &ChainConfig) -> Result<(), AdapterError>;

    async fn connect(&self) -> Result<(), AdapterError>;

    async fn disconnect(&self) -> Result<(), AdapterError>;

    async fn is_healthy(&self) -> bool;

    async fn probe(&self) -> Result<ProbeReport, AdapterError>;

    async fn submit(
        &self,
        intent: &TransactionIntent,
        fee_payer: FeePayer,
    ) -> Result<Outcome, AdapterError>;

    async fn estimate_cost(
        &self,
        intent: &TransactionIntent,
    ) -> Result<CostEstimate, AdapterError>;

    fn subscribe_events(&self, filter: EventFilter) -> EventSubscription;

    /// Freeze value on this ledger. Idempotent per bridge id.
    async fn lock(&self, request: &LockRequest) -> Result<LockReceipt, AdapterError>;

    /// Create value on this ledger. Idempotent per idempotency key.
    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt, AdapterError>;

    /// Release a lock back to its owner.
    async fn refund(&self, lock_ref: &str) -> Result<RefundReceipt, AdapterError>;

    /// Arrange native fee sponsorship for an intent.
    async fn sponsor(&self, intent: &TransactionIntent) -> Result<FeePayer, AdapterError>;

    async fn verify_lock(&self, lock_ref: &str) -> Result<Option<LockEvidence>, AdapterError>;

    /// Look up the lock taken for a bridge id, whether or not its receipt
    /// ever reached the caller.
    async fn find_lock(&self, bridge_id: Uuid) -> Result<Option<LockReceipt>, AdapterError>;

    async fn find_mint(&self, idempotency_key: &str) -> Result<Option<MintReceipt>, AdapterError>;
}

/// Build the reference adapter for a configured chain.
pub fn build_adapter(config: &ChainConfig) -> Arc<dyn LedgerAdapter> {
    match config.model {
        LedgerModel::ObjectOwned => Arc::new(ObjectLedgerAdapter::new(config.clone())),
        LedgerModel::FastFinalityAccount => Arc::new(FastFinalityAdapter::new(config.clone())),
        LedgerModel::VariableFeeAccount => Arc::new(VariableFeeAdapter::new(config.clone())),
    }
}

/// Deterministic 32-byte reference derived from the chain, a label and a
/// sequence number.
pub(crate) fn derive_ref(chain_id: &ChainId, label: &str, seq: u64) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(chain_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(label.as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.finalize().into()
}

/// State and plumbing shared by the reference adapters.
pub(crate) struct AdapterCore {
    chain_id: ChainId,
    model: LedgerModel,
    capabilities: CapabilitySet,
    latency: Duration,
    cost_normalization: u64,
    book: Arc<LedgerBook>,
    events: broadcast::Sender<AdapterEvent>,
    connected: AtomicBool,
    initialized: AtomicBool,
}

impl AdapterCore {
    pub fn new(config: &ChainConfig, model: LedgerModel, declared: &[Capability]) -> Self {
        let chain_id = ChainId::new(config.chain_id.clone());
        let capabilities = match &config.capabilities {
            Some(overridden) => overridden.iter().copied().collect(),
            None => declared.iter().copied().collect(),
        };
        let (events, _) = broadcast::channel(1_000);

        Self {
            book: Arc::new(LedgerBook::new(chain_id.clone())),
            chain_id,
            model,
            capabilities,
            latency: config.confirmation_latency(),
            cost_normalization: config.cost_normalization.max(1),
            events,
            connected: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn book(&self) -> Arc<LedgerBook> {
        self.book.clone()
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn descriptor(&self) -> ChainDescriptor {
        ChainDescriptor::new(self.chain_id.clone(), self.model, self.capabilities.clone())
    }

    pub fn normalize(&self, native_fee: u64) -> u64 {
        native_fee.div_ceil(self.cost_normalization)
    }

    /// Seeds genesis balances and the operator float exactly once.
    pub async fn initialize(&self, config: &ChainConfig) -> Result<(), AdapterError> {
        if config.chain_id != self.chain_id.as_str() {
            return Err(AdapterError::Rejected {
                chain_id: self.chain_id.clone(),
                reason: format!("config is for chain {}", config.chain_id),
            });
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (holder, amount) in &config.genesis {
            self.book.credit(holder, *amount as Amount).await;
        }
        self.book.fund_operator(config.operator_float as Amount).await;

        info!(
            "Chain {} initialized with {} genesis accounts",
            self.chain_id,
            config.genesis.len()
        );
        Ok(())
    }

    pub async fn connect(&self) -> Result<(), AdapterError> {
        self.book.gate("connect", Duration::ZERO).await?;
        self.connected.store(true, Ordering::SeqCst);
        debug!("Connected to chain {}", self.chain_id);
        Ok(())
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Disconnected from chain {}", self.chain_id);
    }

    pub fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::Unreachable {
                chain_id: self.chain_id.clone(),
                message: "adapter is not connected".to_string(),
            })
        }
    }

    pub fn require(&self, capability: Capability) -> Result<(), AdapterError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(AdapterError::Incompatible {
                chain_id: self.chain_id.clone(),
                capability,
            })
        }
    }

    /// Capability match of an intent plus the sponsorship it asks for.
    pub fn check_intent(
        &self,
        intent: &TransactionIntent,
        fee_payer: FeePayer,
    ) -> Result<(), AdapterError> {
        for capability in intent.required_capabilities() {
            self.require(capability)?;
        }
        if fee_payer == FeePayer::Operator {
            self.require(Capability::NativeSponsorship)?;
        }
        Ok(())
    }

    pub fn invalid_address(&self, address: &str) -> AdapterError {
        AdapterError::InvalidAddress {
            chain_id: self.chain_id.clone(),
            address: address.to_string(),
        }
    }

    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription::new(self.events.subscribe(), filter)
    }

    pub async fn probe(&self, fee_sample: u64) -> Result<ProbeReport, AdapterError> {
        let started = Instant::now();
        self.book.gate("probe", Duration::ZERO).await?;
        Ok(ProbeReport {
            latency: started.elapsed(),
            fee_sample,
            height: self.book.height(),
        })
    }

    /// Checks the operator float can cover a sponsored fee.
    pub async fn sponsor(&self, native_fee: u64) -> Result<FeePayer, AdapterError> {
        self.ensure_connected()?;
        self.require(Capability::NativeSponsorship)?;
        let float = self.book.operator_float().await;
        if float < native_fee as Amount {
            return Err(AdapterError::InsufficientFunds {
                chain_id: self.chain_id.clone(),
                have: float,
                need: native_fee as Amount,
            });
        }
        Ok(FeePayer::Operator)
    }

    /// Dispatches a prepared native transaction and reports the outcome.
    pub async fn execute(
        &self,
        intent: &TransactionIntent,
        reference: String,
        native_fee: u64,
        settlement: Settlement,
    ) -> Result<Outcome, AdapterError> {
        let started = Instant::now();

        if let Err(e) = self.book.gate("submit", Duration::ZERO).await {
            self.emit_failed(intent, &e);
            return Err(e);
        }

        self.emit(AdapterEvent::Submitted {
            chain_id: self.chain_id.clone(),
            intent_id: Some(intent.id),
            reference: reference.clone(),
            at: Utc::now(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let height = match self.book.settle(&settlement).await {
            Ok(height) => height,
            Err(e) => {
                self.emit_failed(intent, &e);
                return Err(e);
            }
        };

        let cost_paid = self.normalize(native_fee);
        self.emit(AdapterEvent::Confirmed {
            chain_id: self.chain_id.clone(),
            intent_id: Some(intent.id),
            reference: reference.clone(),
            height,
            cost_paid,
            at: Utc::now(),
        });

        Ok(Outcome {
            id: reference,
            intent_id: intent.id,
            chain_id: self.chain_id.clone(),
            status: OutcomeStatus::Confirmed { height },
            cost_paid,
            fee_payer: settlement.fee_payer,
            confirmation_latency: started.elapsed(),
        })
    }

    fn emit_failed(&self, intent: &TransactionIntent, error: &AdapterError) {
        warn!(
            intent_id = %intent.id,
            "Chain {} failed intent: {}", self.chain_id, error
        );
        self.emit(AdapterEvent::Failed {
            chain_id: self.chain_id.clone(),
            intent_id: Some(intent.id),
            reason: error.to_string(),
            at: Utc::now(),
        });
    }

    pub async fn lock(
        &self,
        request: &LockRequest,
        make_ref: impl FnOnce(u64) -> String,
    ) -> Result<LockReceipt, AdapterError> {
        self.ensure_connected()?;
        self.require(Capability::Lock)?;
        if request.amount == 0 {
            return Err(AdapterError::Rejected {
                chain_id: self.chain_id.clone(),
                reason: "cannot lock a zero amount".to_string(),
            });
        }
        self.book.gate("lock", self.latency).await?;

        let locked = self
            .book
            .lock(request.bridge_id, &request.owner, request.amount, make_ref)
            .await?;

        if !locked.replayed {
            self.emit(AdapterEvent::Locked {
                chain_id: self.chain_id.clone(),
                bridge_id: request.bridge_id,
                lock_ref: locked.lock_ref.clone(),
                amount: locked.amount,
                at: Utc::now(),
            });
        }

        Ok(LockReceipt {
            chain_id: self.chain_id.clone(),
            lock_ref: locked.lock_ref,
            amount: locked.amount,
            height: locked.height,
        })
    }

    pub async fn mint(
        &self,
        request: &MintRequest,
        make_ref: impl FnOnce(u64) -> String,
    ) -> Result<MintReceipt, AdapterError> {
        self.ensure_connected()?;
        self.require(Capability::Mint)?;
        self.check_proof(request)?;
        self.book.gate("mint", self.latency).await?;

        let receipt = self
            .book
            .mint_once(
                &request.idempotency_key,
                &request.recipient,
                request.amount,
                make_ref,
            )
            .await;

        if !receipt.replayed {
            self.emit(AdapterEvent::Minted {
                chain_id: self.chain_id.clone(),
                bridge_id: request.bridge_id,
                mint_ref: receipt.mint_ref.clone(),
                amount: receipt.amount,
                at: Utc::now(),
            });
        }
        Ok(receipt)
    }

    /// Structural proof checks; signature verification belongs to the quorum.
    fn check_proof(&self, request: &MintRequest) -> Result<(), AdapterError> {
        let proof = &request.proof;
        let reject = |reason: String| AdapterError::Rejected {
            chain_id: self.chain_id.clone(),
            reason,
        };

        if proof.bridge_id != request.bridge_id || proof.claim.bridge_id != request.bridge_id {
            return Err(reject("proof is for a different bridge id".to_string()));
        }
        if proof.claim.amount != request.amount {
            return Err(reject(format!(
                "proof covers {} but mint requests {}",
                proof.claim.amount, request.amount
            )));
        }
        if proof.claim.target_chain != self.chain_id {
            return Err(reject(format!(
                "proof targets chain {}",
                proof.claim.target_chain
            )));
        }
        if proof.threshold == 0 || proof.attestations.len() < proof.threshold {
            return Err(reject(format!(
                "proof carries {} of {} attestations",
                proof.attestations.len(),
                proof.threshold
            )));
        }
        Ok(())
    }

    pub async fn refund(&self, lock_ref: &str) -> Result<RefundReceipt, AdapterError> {
        self.ensure_connected()?;
        self.require(Capability::Lock)?;
        self.book.gate("refund", self.latency).await?;

        let (amount, replayed) = self.book.release(lock_ref).await?;
        if !replayed {
            self.emit(AdapterEvent::Released {
                chain_id: self.chain_id.clone(),
                lock_ref: lock_ref.to_string(),
                amount,
                at: Utc::now(),
            });
        }
        Ok(RefundReceipt {
            lock_ref: lock_ref.to_string(),
            amount,
            replayed,
        })
    }

    pub async fn verify_lock(&self, lock_ref: &str) -> Result<Option<LockEvidence>, AdapterError> {
        self.ensure_connected()?;
        self.book.gate("verify_lock", Duration::ZERO).await?;
        Ok(self.book.lock_evidence(lock_ref).await)
    }

    pub async fn find_lock(&self, bridge_id: Uuid) -> Result<Option<LockReceipt>, AdapterError> {
        self.ensure_connected()?;
        self.book.gate("find_lock", Duration::ZERO).await?;
        Ok(self
            .book
            .lock_for_bridge(bridge_id)
            .await
            .map(|locked| LockReceipt {
                chain_id: self.chain_id.clone(),
                lock_ref: locked.lock_ref,
                amount: locked.amount,
                height: locked.height,
            }))
    }

    pub async fn find_mint(&self, idempotency_key: &str) -> Result<Option<MintReceipt>, AdapterError> {
        self.ensure_connected()?;
        self.book.gate("find_mint", Duration::ZERO).await?;
        Ok(self.book.find_mint(idempotency_key).await)
    }
}
