//! Durable state for bridge transfers and sponsorship budgets
//!
//! Handles:
//! - Bridge transfers by id, with transition history and attestations
//! - Lookup by mint idempotency key
//! - Sponsorship budgets by (identity, tier, day)
//!
//! `MemoryStore` backs tests and single-node runs; `PostgresStore` is used
//! whenever a `[database]` section is configured.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::bridge::{BridgeStatus, BridgeTransfer};
use crate::error::RelayerResult;
use crate::sponsorship::SponsorshipBudget;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a transfer.
    async fn save_transfer(&self, transfer: &BridgeTransfer) -> RelayerResult<()>;

    async fn get_transfer(&self, bridge_id: Uuid) -> RelayerResult<Option<BridgeTransfer>>;

    async fn find_by_idempotency_key(&self, key: &str) -> RelayerResult<Option<BridgeTransfer>>;

    /// Transfers that have not reached a terminal state.
    async fn active_transfers(&self) -> RelayerResult<Vec<BridgeTransfer>>;

    async fn save_budget(&self, budget: &SponsorshipBudget) -> RelayerResult<()>;

    async fn load_budgets(&self, day: NaiveDate) -> RelayerResult<Vec<SponsorshipBudget>>;

    async fn health_check(&self) -> RelayerResult<()>;

    async fn stats(&self) -> RelayerResult<TransferStats>;
}

/// Transfer counts by lifecycle phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub requested: u64,
    pub in_flight: u64,
    pub minted: u64,
    pub failed: u64,
    pub refunding: u64,
    pub refunded: u64,
}

impl TransferStats {
    pub fn count(&mut self, status: BridgeStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: BridgeStatus, n: u64) {
        let slot = match status {
            BridgeStatus::Requested => &mut self.requested,
            BridgeStatus::Minted => &mut self.minted,
            BridgeStatus::Failed => &mut self.failed,
            BridgeStatus::Refunding => &mut self.refunding,
            BridgeStatus::Refunded => &mut self.refunded,
            _ => &mut self.in_flight,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        self.requested + self.in_flight + self.minted + self.failed + self.refunding + self.refunded
    }
}
