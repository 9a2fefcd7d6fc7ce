//! Variable-fee account ledger adapter
//!
//! EIP-1559 style accounts: a per-block base fee that drifts with demand,
//! a priority tip on top, both capped by the configured max fee. There is no
//! native sponsorship; the identity always pays gas.

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
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use ethers::utils::to_checksum;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

const TRANSFER_GAS: u64 = 21_000;
const MINT_GAS: u64 = 60_000;
const BURN_GAS: u64 = 45_000;
const CALL_GAS: u64 = 120_000;

/// Native transaction shape; never leaves this module.
#[derive(Debug, Clone)]
struct Eip1559Envelope {
    hash: H256,
    from: String,
    to: Option<Address>,
    nonce: u64,
    value: Amount,
    gas_limit: u64,
    max_fee_per_gas: U256,
    max_priority_fee_per_gas: U256,
    kind: IntentKind,
}

impl Eip1559Envelope {
    /// Cost in wei-equivalent units, saturated to `u64`.
    fn fee(&self, base_fee: u64) -> u64 {
        let price = (U256::from(base_fee) + self.max_priority_fee_per_gas).min(self.max_fee_per_gas);
        let cost = U256::from(self.gas_limit) * price;
        if cost > U256::from(u64::MAX) {
            u64::MAX
        } else {
            cost.as_u64()
        }
    }

    fn into_settlement(self, fee: u64) -> Settlement {
        let to = self.to.map(|a| format!("{:?}", a));
        let (debit, credit) = match self.kind {
            IntentKind::Mint => (None, to.map(|a| (a, self.value))),
            IntentKind::Burn => (Some((self.from.clone(), self.value)), None),
            IntentKind::Transfer | IntentKind::ContractCall => {
                let debit = (self.value > 0).then(|| (self.from.clone(), self.value));
                let credit = to.filter(|_| self.value > 0).map(|a| (a, self.value));
                (debit, credit)
            }
        };
        Settlement {
            debit,
            credit,
            fee_account: self.from,
            fee,
            fee_payer: FeePayer::Identity,
        }
    }
}

/// Parse a `0x` + 40 hex address, enforcing the EIP-55 checksum on
/// mixed-case input.
fn parse_address(value: &str) -> Option<Address> {
    let hex_part = value.strip_prefix("0x")?;
    if hex_part.len() != 40 {
        return None;
    }
    let address = Address::from_str(hex_part).ok()?;
    let lower = hex_part.chars().all(|c| !c.is_ascii_uppercase());
    let upper = hex_part.chars().all(|c| !c.is_ascii_lowercase());
    if lower || upper || to_checksum(&address, None) == value {
        Some(address)
    } else {
        None
    }
}

pub struct VariableFeeAdapter {
    core: AdapterCore,
    /// Current base fee per gas; moves one step per block.
    base_fee: AtomicU64,
    floor_fee: u64,
    priority_fee: u64,
    max_fee: u64,
    drift_bps: u64,
    nonces: DashMap<String, u64>,
    seq: AtomicU64,
}

impl VariableFeeAdapter {
    pub fn new(config: ChainConfig) -> Self {
        let core = AdapterCore::new(
            &config,
            LedgerModel::VariableFeeAccount,
            &[
                Capability::Transfer,
                Capability::Lock,
                Capability::Mint,
                Capability::Burn,
                Capability::ContractCall,
            ],
        );
        Self {
            core,
            base_fee: AtomicU64::new(config.fee.base_fee),
            floor_fee: (config.fee.base_fee / 4).max(1),
            priority_fee: config.fee.priority_fee,
            max_fee: config.fee.max_fee,
            drift_bps: config.fee.drift_bps as u64,
            nonces: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn book(&self) -> Arc<LedgerBook> {
        self.core.book()
    }

    pub fn base_fee(&self) -> u64 {
        self.base_fee.load(Ordering::SeqCst)
    }

    /// Moves the base fee one block: up on even heights, down on odd ones.
    fn advance_base_fee(&self) -> u64 {
        let rising = self.core.book().height() % 2 == 0;
        let drift = self.drift_bps;
        let (floor, cap) = (self.floor_fee, self.max_fee);

        self.base_fee
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let step = current.saturating_mul(drift) / 10_000;
                let next = if rising {
                    current.saturating_add(step)
                } else {
                    current.saturating_sub(step)
                };
                Some(next.clamp(floor, cap))
            })
            .unwrap_or_else(|current| current)
    }

    fn gas_limit(kind: IntentKind) -> u64 {
        match kind {
            IntentKind::Transfer => TRANSFER_GAS,
            IntentKind::Mint => MINT_GAS,
            IntentKind::Burn => BURN_GAS,
            IntentKind::ContractCall => CALL_GAS,
        }
    }

    fn next_nonce(&self, sender: &str) -> u64 {
        let mut entry = self.nonces.entry(sender.to_string()).or_insert(0);
        let nonce = *entry;
        *entry += 1;
        nonce
    }

    /// Hands back a nonce that never reached the ledger, if it is the latest.
    fn release_nonce(&self, sender: &str, nonce: u64) {
        if let Some(mut entry) = self.nonces.get_mut(sender) {
            if *entry == nonce + 1 {
                *entry = nonce;
            }
        }
    }

    fn envelope(&self, intent: &TransactionIntent, to: Option<Address>, nonce: u64) -> Eip1559Envelope {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Eip1559Envelope {
            hash: H256::from(derive_ref(self.core.chain_id(), "tx", seq)),
            from: intent.origin.clone(),
            to,
            nonce,
            value: intent.value,
            gas_limit: Self::gas_limit(intent.kind),
            max_fee_per_gas: U256::from(self.max_fee),
            max_priority_fee_per_gas: U256::from(self.priority_fee),
            kind: intent.kind,
        }
    }

    fn tx_ref(&self, label: &str, seq: u64) -> String {
        format!("0x{}", hex::encode(derive_ref(self.core.chain_id(), label, seq)))
    }
}

#[async_trait]
impl LedgerAdapter for VariableFeeAdapter {
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
        let base = self.advance_base_fee();
        let price = base.saturating_add(self.priority_fee).min(self.max_fee);
        self.core.probe(TRANSFER_GAS.saturating_mul(price)).await
    }

    #[instrument(skip(self, intent), fields(intent_id = %intent.id, chain_id = %self.core.chain_id()))]
    async fn submit(
        &self,
        intent: &TransactionIntent,
        fee_payer: FeePayer,
    ) -> Result<Outcome, AdapterError> {
        self.core.ensure_connected()?;
        let to = match intent.kind {
            IntentKind::Burn => None,
            _ => Some(
                parse_address(&intent.destination)
                    .ok_or_else(|| self.core.invalid_address(&intent.destination))?,
            ),
        };
        self.core.check_intent(intent, fee_payer)?;

        let nonce = self.next_nonce(&intent.origin);
        let envelope = self.envelope(intent, to, nonce);
        let fee = envelope.fee(self.advance_base_fee());
        let reference = format!("0x{}", hex::encode(envelope.hash.as_bytes()));
        debug!(
            "Built EIP-1559 envelope {} (nonce {}, gas limit {}, max fee {})",
            reference, envelope.nonce, envelope.gas_limit, envelope.max_fee_per_gas
        );

        let result = self
            .core
            .execute(intent, reference, fee, envelope.into_settlement(fee))
            .await;
        if result.is_err() {
            self.release_nonce(&intent.origin, nonce);
        }
        result
    }

    async fn estimate_cost(&self, intent: &TransactionIntent) -> Result<CostEstimate, AdapterError> {
        self.core.ensure_connected()?;
        let envelope = self.envelope(intent, None, 0);
        let native_fee = envelope.fee(self.base_fee());
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
        self.core.lock(request, |seq| self.tx_ref("lock", seq)).await
    }

    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt, AdapterError> {
        let recipient = parse_address(&request.recipient)
            .ok_or_else(|| self.core.invalid_address(&request.recipient))?;
        let request = MintRequest {
            recipient: format!("{:?}", recipient),
            ..request.clone()
        };
        self.core.mint(&request, |seq| self.tx_ref("mint", seq)).await
    }

    async fn refund(&self, lock_ref: &str) -> Result<RefundReceipt, AdapterError> {
        self.core.refund(lock_ref).await
    }

    async fn sponsor(&self, _intent: &TransactionIntent) -> Result<FeePayer, AdapterError> {
        self.core.require(Capability::NativeSponsorship)?;
        Ok(FeePayer::Operator)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;

    const BOB: &str = "0x00000000000000000000000000000000000000b0";

    async fn adapter(drift_bps: u32) -> VariableFeeAdapter {
        let mut config = ChainConfig::new("evm-1", LedgerModel::VariableFeeAccount)
            .with_genesis("alice", 100_000_000);
        config.confirmation_latency_ms = 0;
        config.fee = FeeConfig {
            base_fee: 20,
            priority_fee: 2,
            max_fee: 400,
            drift_bps,
        };
        let adapter = VariableFeeAdapter::new(config.clone());
        adapter.initialize(&config).await.unwrap();
        adapter.connect().await.unwrap();
        adapter
    }

    #[test]
    fn checksum_is_enforced_on_mixed_case() {
        assert!(parse_address("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").is_some());
        assert!(parse_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").is_some());
        assert!(parse_address("0x5AaEb6053F3E94C9b9A09f33669435E7Ef1BeAed").is_none());
        assert!(parse_address("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").is_none());
        assert!(parse_address("0x1234").is_none());
    }

    #[tokio::test]
    async fn transfer_pays_gas_limit_times_price() {
        let adapter = adapter(0).await;
        let intent = TransactionIntent::transfer("alice", BOB, 1_000);

        assert_eq!(adapter.estimate_cost(&intent).await.unwrap().native_fee, 21_000 * 22);
        let outcome = adapter.submit(&intent, FeePayer::Identity).await.unwrap();
        assert_eq!(outcome.cost_paid, 21_000 * 22);
        assert_eq!(adapter.book().balance(BOB).await, 1_000);
    }

    #[tokio::test]
    async fn base_fee_drifts_between_blocks() {
        let adapter = adapter(1_250).await;
        let mut samples = Vec::new();
        for _ in 0..4 {
            samples.push(adapter.probe().await.unwrap().fee_sample);
            adapter
                .submit(&TransactionIntent::transfer("alice", BOB, 1), FeePayer::Identity)
                .await
                .unwrap();
        }
        assert!(samples.windows(2).any(|w| w[0] != w[1]));
        assert!(adapter.base_fee() <= 400);
    }

    #[tokio::test]
    async fn sponsorship_is_not_native() {
        let adapter = adapter(0).await;
        let intent = TransactionIntent::transfer("alice", BOB, 1);

        assert!(matches!(
            adapter.sponsor(&intent).await,
            Err(AdapterError::Incompatible {
                capability: Capability::NativeSponsorship,
                ..
            })
        ));
        assert!(matches!(
            adapter.submit(&intent, FeePayer::Operator).await,
            Err(AdapterError::Incompatible { .. })
        ));
    }

    #[tokio::test]
    async fn failed_submission_returns_nonce() {
        let adapter = adapter(0).await;
        adapter.book().inject(crate::adapter::Fault::Timeout, 1).await;

        let intent = TransactionIntent::transfer("alice", BOB, 1);
        assert!(adapter.submit(&intent, FeePayer::Identity).await.is_err());
        assert_eq!(*adapter.nonces.get("alice").unwrap(), 0);

        adapter.submit(&intent, FeePayer::Identity).await.unwrap();
        assert_eq!(*adapter.nonces.get("alice").unwrap(), 1);
    }
}
