//! Object-owned ledger adapter
//!
//! Value lives in owned coin objects. A transaction is a programmable block
//! of commands paid from a gas object, whose owner may differ from the
//! sender: that split is what gives this ledger native sponsorship.

use super::ledger::Settlement;
use super::{
    derive_ref, AdapterCore, LedgerAdapter, LedgerBook, LockEvidence, LockReceipt, LockRequest,
    MintReceipt, MintRequest, ProbeReport, RefundReceipt,
};
use crate::config::ChainConfig;
use crate::error::AdapterError;
use crate::events::{EventFilter, EventSubscription};
use crate::model::{
    Amount, Capability, ChainDescriptor, ChainId, CostEstimate, FeePayer, IntentKind, LedgerModel,
    Outcome, TransactionIntent,
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

lazy_static! {
    static ref OBJECT_ADDRESS: Regex = Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("static pattern");
}

/// Gas units charged per command kind.
const TRANSFER_GAS_UNITS: u64 = 1_000;
const MINT_GAS_UNITS: u64 = 2_000;
const BURN_GAS_UNITS: u64 = 1_000;

const OPERATOR_GAS_OWNER: &str = "operator";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ObjectCommand {
    SplitAndTransfer { amount: Amount, recipient: String },
    MintCoin { amount: Amount, recipient: String },
    BurnCoin { amount: Amount },
}

impl ObjectCommand {
    fn gas_units(&self) -> u64 {
        match self {
            ObjectCommand::SplitAndTransfer { .. } => TRANSFER_GAS_UNITS,
            ObjectCommand::MintCoin { .. } => MINT_GAS_UNITS,
            ObjectCommand::BurnCoin { .. } => BURN_GAS_UNITS,
        }
    }
}

/// Native transaction shape; never leaves this module.
#[derive(Debug, Clone)]
struct ProgrammableTransaction {
    digest: String,
    sender: String,
    gas_owner: String,
    gas_budget: u64,
    gas_price: u64,
    commands: Vec<ObjectCommand>,
}

impl ProgrammableTransaction {
    fn fee(&self) -> u64 {
        self.gas_budget.saturating_mul(self.gas_price)
    }

    fn into_settlement(self, fee_payer: FeePayer, fee: u64) -> Settlement {
        let mut settlement = Settlement {
            debit: None,
            credit: None,
            fee_account: self.sender.clone(),
            fee,
            fee_payer,
        };
        for command in self.commands {
            match command {
                ObjectCommand::SplitAndTransfer { amount, recipient } => {
                    settlement.debit = Some((self.sender.clone(), amount));
                    settlement.credit = Some((recipient, amount));
                }
                ObjectCommand::MintCoin { amount, recipient } => {
                    settlement.credit = Some((recipient, amount));
                }
                ObjectCommand::BurnCoin { amount } => {
                    settlement.debit = Some((self.sender.clone(), amount));
                }
            }
        }
        settlement
    }
}

pub struct ObjectLedgerAdapter {
    core: AdapterCore,
    /// Reference gas price, fixed for the epoch.
    reference_gas_price: u64,
    max_fee: u64,
    seq: AtomicU64,
}

impl ObjectLedgerAdapter {
    pub fn new(config: ChainConfig) -> Self {
        let core = AdapterCore::new(
            &config,
            LedgerModel::ObjectOwned,
            &[
                Capability::Transfer,
                Capability::Lock,
                Capability::Mint,
                Capability::Burn,
                Capability::NativeSponsorship,
                Capability::AtomicMint,
            ],
        );
        Self {
            core,
            reference_gas_price: config.fee.base_fee,
            max_fee: config.fee.max_fee,
            seq: AtomicU64::new(0),
        }
    }

    /// The ledger this adapter talks to.
    pub fn book(&self) -> Arc<LedgerBook> {
        self.core.book()
    }

    fn object_ref(&self, label: &str, seq: u64) -> String {
        format!("0x{}", hex::encode(derive_ref(self.core.chain_id(), label, seq)))
    }

    fn build(&self, intent: &TransactionIntent, fee_payer: FeePayer) -> ProgrammableTransaction {
        let command = match intent.kind {
            IntentKind::Mint => ObjectCommand::MintCoin {
                amount: intent.value,
                recipient: intent.destination.clone(),
            },
            IntentKind::Burn => ObjectCommand::BurnCoin {
                amount: intent.value,
            },
            IntentKind::Transfer | IntentKind::ContractCall => ObjectCommand::SplitAndTransfer {
                amount: intent.value,
                recipient: intent.destination.clone(),
            },
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        ProgrammableTransaction {
            digest: self.object_ref("tx", seq),
            sender: intent.origin.clone(),
            gas_owner: match fee_payer {
                FeePayer::Identity => intent.origin.clone(),
                FeePayer::Operator => OPERATOR_GAS_OWNER.to_string(),
            },
            gas_budget: command.gas_units(),
            gas_price: self.reference_gas_price,
            commands: vec![command],
        }
    }

    fn native_fee(&self, intent: &TransactionIntent) -> u64 {
        self.build(intent, FeePayer::Identity).fee().min(self.max_fee)
    }

    fn validate_address(&self, address: &str) -> Result<(), AdapterError> {
        if OBJECT_ADDRESS.is_match(address) {
            Ok(())
        } else {
            Err(self.core.invalid_address(address))
        }
    }
}

#[async_trait]
impl LedgerAdapter for ObjectLedgerAdapter {
    fn chain_id(&self) -> ChainId {
        self.core.chain_id().clone()
    }

    fn descriptor(&self) -> ChainDescriptor {
        self.core.descriptor()
    }

    async fn initialize(&self, config: &ChainConfig) -> Result<(), AdapterError> {
        self.core.initialize(config).await
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.core.connect().await
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.core.disconnect();
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.core.ensure_connected().is_ok() && self.probe().await.is_ok()
    }

    async fn probe(&self) -> Result<ProbeReport, AdapterError> {
        let fee = TRANSFER_GAS_UNITS
            .saturating_mul(self.reference_gas_price)
            .min(self.max_fee);
        self.core.probe(fee).await
    }

    #[instrument(skip(self, intent), fields(intent_id = %intent.id, chain_id = %self.core.chain_id()))]
    async fn submit(
        &self,
        intent: &TransactionIntent,
        fee_payer: FeePayer,
    ) -> Result<Outcome, AdapterError> {
        self.core.ensure_connected()?;
        if intent.kind != IntentKind::Burn {
            self.validate_address(&intent.destination)?;
        }
        self.core.check_intent(intent, fee_payer)?;

        let tx = self.build(intent, fee_payer);
        let fee = tx.fee().min(self.max_fee);
        debug!(
            "Built programmable transaction {} ({} commands, gas owner {}, budget {})",
            tx.digest,
            tx.commands.len(),
            tx.gas_owner,
            tx.gas_budget
        );

        let digest = tx.digest.clone();
        self.core
            .execute(intent, digest, fee, tx.into_settlement(fee_payer, fee))
            .await
    }

    async fn estimate_cost(&self, intent: &TransactionIntent) -> Result<CostEstimate, AdapterError> {
        self.core.ensure_connected()?;
        let native_fee = self.native_fee(intent);
        Ok(CostEstimate {
            chain_id: self.core.chain_id().clone(),
            native_fee,
            normalized_cost: self.core.normalize(native_fee),
            estimated_latency: self.core.latency(),
        })
    }

    fn subscribe_events(&self, filter: EventFilter) -> EventSubscription {
        self.core.subscribe(filter)
    }

    async fn lock(&self, request: &LockRequest) -> Result<LockReceipt, AdapterError> {
        self.core
            .lock(request, |seq| self.object_ref("lock", seq))
            .await
    }

    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt, AdapterError> {
        self.validate_address(&request.recipient)?;
        self.core
            .mint(request, |seq| self.object_ref("mint", seq))
            .await
    }

    async fn refund(&self, lock_ref: &str) -> Result<RefundReceipt, AdapterError> {
        self.core.refund(lock_ref).await
    }

    async fn sponsor(&self, intent: &TransactionIntent) -> Result<FeePayer, AdapterError> {
        self.core.sponsor(self.native_fee(intent)).await
    }

    async fn verify_lock(&self, lock_ref: &str) -> Result<Option<LockEvidence>, AdapterError> {
        self.core.verify_lock(lock_ref).await
    }

    async fn find_lock(&self, bridge_id: uuid::Uuid) -> Result<Option<LockReceipt>, AdapterError> {
        self.core.find_lock(bridge_id).await
    }

    async fn find_mint(&self, idempotency_key: &str) -> Result<Option<MintReceipt>, AdapterError> {
        self.core.find_mint(idempotency_key).await
    }
}
