//! In-process state store

use super::{StateStore, TransferStats};
use crate::bridge::BridgeTransfer;
use crate::error::RelayerResult;
use crate::sponsorship::{BudgetKey, SponsorshipBudget};

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    transfers: DashMap<Uuid, BridgeTransfer>,
    by_key: DashMap<String, Uuid>,
    budgets: DashMap<BudgetKey, SponsorshipBudget>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_transfer(&self, transfer: &BridgeTransfer) -> RelayerResult<()> {
        if let Some(key) = &transfer.idempotency_key {
            self.by_key.insert(key.clone(), transfer.bridge_id);
        }
        self.transfers.insert(transfer.bridge_id, transfer.clone());
        Ok(())
    }

    async fn get_transfer(&self, bridge_id: Uuid) -> RelayerResult<Option<BridgeTransfer>> {
        Ok(self.transfers.get(&bridge_id).map(|t| t.value().clone()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> RelayerResult<Option<BridgeTransfer>> {
        let Some(bridge_id) = self.by_key.get(key).map(|id| *id.value()) else {
            return Ok(None);
        };
        self.get_transfer(bridge_id).await
    }

    async fn active_transfers(&self) -> RelayerResult<Vec<BridgeTransfer>> {
        let mut active: Vec<BridgeTransfer> = self
            .transfers
            .iter()
            .filter(|t| !t.value().is_terminal())
            .map(|t| t.value().clone())
            .collect();
        active.sort_by_key(|t| t.created_at);
        Ok(active)
    }

    async fn save_budget(&self, budget: &SponsorshipBudget) -> RelayerResult<()> {
        self.budgets.insert(budget.key(), budget.clone());
        Ok(())
    }

    async fn load_budgets(&self, day: NaiveDate) -> RelayerResult<Vec<SponsorshipBudget>> {
        Ok(self
            .budgets
            .iter()
            .filter(|b| b.key().day == day)
            .map(|b| b.value().clone())
            .collect())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<TransferStats> {
        let mut stats = TransferStats::default();
        for transfer in self.transfers.iter() {
            stats.count(transfer.status);
        }
        Ok(stats)
    }
}
