//! Fast-finality account ledger adapter
//!
//! Account balances with sub-second finality. Fees are a flat charge per
//! signature plus an optional priority fee; a separate fee-payer account
//! signing the message is how sponsorship works here.

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
    Outcome, TransactionIntent, Urgency,
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

lazy_static! {
    static ref BASE58_ADDRESS: Regex =
        Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("static pattern");
}

const OPERATOR_FEE_PAYER: &str = "operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Program {
    SystemTransfer,
    TokenMintTo,
    TokenBurn,
}

#[derive(Debug, Clone)]
struct Instruction {
    program: Program,
    /// Source first, then destination where the program has one.
    accounts: Vec<String>,
    amount: Amount,
}

/// Native message shape; never leaves this module.
#[derive(Debug, Clone)]
struct Message {
    signature: String,
    fee_payer: String,
    recent_blockhash: String,
    required_signatures: u64,
    compute_unit_price: u64,
    instructions: Vec<Instruction>,
}

pub struct FastFinalityAdapter {
    core: AdapterCore,
    fee_per_signature: u64,
    priority_fee: u64,
    max_fee: u64,
    seq: AtomicU64,
}

impl FastFinalityAdapter {
    pub fn new(config: ChainConfig) -> Self {
        let core = AdapterCore::new(
            &config,
            LedgerModel::FastFinalityAccount,
            &[
                Capability::Transfer,
                Capability::Lock,
                Capability::Mint,
                Capability::Burn,
                Capability::NativeSponsorship,
            ],
        );
        Self {
            core,
            fee_per_signature: config.fee.base_fee,
            priority_fee: config.fee.priority_fee,
            max_fee: config.fee.max_fee,
            seq: AtomicU64::new(0),
        }
    }

    pub fn book(&self) -> Arc<LedgerBook> {
        self.core.book()
    }

    fn hash_ref(&self, label: &str, seq: u64) -> String {
        hex::encode(derive_ref(self.core.chain_id(), label, seq))
    }

    fn priority_multiplier(urgency: Urgency) -> u64 {
        match urgency {
            Urgency::Low => 0,
            Urgency::Normal => 1,
            Urgency::High => 4,
        }
    }

    fn message_fee(&self, message: &Message) -> u64 {
        self.fee_per_signature
            .saturating_mul(message.required_signatures)
            .saturating_add(message.compute_unit_price)
            .min(self.max_fee)
    }

    fn build(&self, intent: &TransactionIntent, fee_payer: FeePayer) -> Message {
        let instruction = match intent.kind {
            IntentKind::Mint => Instruction {
                program: Program::TokenMintTo,
                accounts: vec![intent.destination.clone()],
                amount: intent.value,
            },
            IntentKind::Burn => Instruction {
                program: Program::TokenBurn,
                accounts: vec![intent.origin.clone()],
                amount: intent.value,
            },
            IntentKind::Transfer | IntentKind::ContractCall => Instruction {
                program: Program::SystemTransfer,
                accounts: vec![intent.origin.clone(), intent.destination.clone()],
                amount: intent.value,
            },
        };

        let (payer, signatures) = match fee_payer {
            FeePayer::Identity => (intent.origin.clone(), 1),
            FeePayer::Operator => (OPERATOR_FEE_PAYER.to_string(), 2),
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        Message {
            signature: self.hash_ref("sig", seq),
            fee_payer: payer,
            recent_blockhash: self.hash_ref("blockhash", self.core.book().height()),
            required_signatures: signatures,
            compute_unit_price: self
                .priority_fee
                .saturating_mul(Self::priority_multiplier(intent.urgency)),
            instructions: vec![instruction],
        }
    }

    fn lower(message: Message, fee_account: String, fee_payer: FeePayer, fee: u64) -> Settlement {
        let mut settlement = Settlement {
            debit: None,
            credit: None,
            fee_account,
            fee,
            fee_payer,
        };
        for ix in message.instructions {
            let mut accounts = ix.accounts.into_iter();
            match ix.program {
                Program::SystemTransfer => {
                    settlement.debit = accounts.next().map(|a| (a, ix.amount));
                    settlement.credit = accounts.next().map(|a| (a, ix.amount));
                }
                Program::TokenMintTo => {
                    settlement.credit = accounts.next().map(|a| (a, ix.amount));
                }
                Program::TokenBurn => {
                    settlement.debit = accounts.next().map(|a| (a, ix.amount));
                }
            }
        }
        settlement
    }

    fn validate_address(&self, address: &str) -> Result<(), AdapterError> {
        if BASE58_ADDRESS.is_match(address) {
            Ok(())
        } else {
            Err(self.core.invalid_address(address))
        }
    }
}

#[async_trait]
impl LedgerAdapter for FastFinalityAdapter {
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
        let fee = self
            .fee_per_signature
            .saturating_add(self.priority_fee)
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

        let message = self.build(intent, fee_payer);
        let fee = self.message_fee(&message);
        let signature = message.signature.clone();
        debug!(
            "Built message {} (fee payer {}, {} signatures, blockhash {})",
            signature, message.fee_payer, message.required_signatures, message.recent_blockhash
        );

        let settlement = Self::lower(message, intent.origin.clone(), fee_payer, fee);
        self.core.execute(intent, signature, fee, settlement).await
    }

    async fn estimate_cost(&self, intent: &TransactionIntent) -> Result<CostEstimate, AdapterError> {
        self.core.ensure_connected()?;
        let native_fee = self.message_fee(&self.build(intent, FeePayer::Identity));
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
        self.core.lock(request, |seq| self.hash_ref("lock", seq)).await
    }

    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt, AdapterError> {
        self.validate_address(&request.recipient)?;
        self.core.mint(request, |seq| self.hash_ref("mint", seq)).await
    }

    async fn refund(&self, lock_ref: &str) -> Result<RefundReceipt, AdapterError> {
        self.core.refund(lock_ref).await
    }

    async fn sponsor(&self, intent: &TransactionIntent) -> Result<FeePayer, AdapterError> {
        let fee = self.message_fee(&self.build(intent, FeePayer::Operator));
        self.core.sponsor(fee).await
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
