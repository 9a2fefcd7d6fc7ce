//! Sponsorship manager - fronts execution cost under daily budgets
//!
//! Budgets are keyed by (identity, tier, day). A grant is decided under the
//! budget's map-entry lock, and the treasury debit is a compare-and-swap that
//! never takes the balance below the configured reserve. Usage therefore
//! never exceeds the tier limit, however many grants race for one key.

use crate::config::SponsorshipConfig;
use crate::error::SponsorshipError;
use crate::metrics;
use crate::model::IntentId;
use crate::state::StateStore;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Days between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Reset epoch of a UTC day: days since the Unix epoch.
pub fn epoch_day(day: NaiveDate) -> i64 {
    day.num_days_from_ce() as i64 - UNIX_EPOCH_DAYS_FROM_CE
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BudgetKey {
    pub identity: String,
    pub tier: String,
    pub day: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorshipBudget {
    pub identity: String,
    pub tier: String,
    pub day: NaiveDate,
    pub used_today: u64,
    pub daily_limit: u64,
    pub reset_epoch: i64,
}

impl SponsorshipBudget {
    pub fn key(&self) -> BudgetKey {
        BudgetKey {
            identity: self.identity.clone(),
            tier: self.tier.clone(),
            day: self.day,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.daily_limit.saturating_sub(self.used_today)
    }
}

/// Funds reserved for one intent. Hand back whatever is not spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SponsorshipGrant {
    pub key: BudgetKey,
    pub intent_id: IntentId,
    pub cost: u64,
    pub granted_at: DateTime<Utc>,
}

pub struct SponsorshipManager {
    tiers: DashMap<String, u64>,
    budgets: DashMap<BudgetKey, SponsorshipBudget>,
    treasury: AtomicU64,
    min_reserve: u64,
    last_reset_epoch: AtomicI64,
    store: Option<Arc<dyn StateStore>>,
}

impl SponsorshipManager {
    pub fn new(config: &SponsorshipConfig) -> Self {
        let tiers = DashMap::new();
        for (tier, limit) in &config.tiers {
            tiers.insert(tier.clone(), *limit);
        }
        metrics::set_treasury_balance(config.treasury_balance);

        Self {
            tiers,
            budgets: DashMap::new(),
            treasury: AtomicU64::new(config.treasury_balance),
            min_reserve: config.min_reserve,
            last_reset_epoch: AtomicI64::new(epoch_day(Utc::now().date_naive())),
            store: None,
        }
    }

    /// Persist every budget change to `store`.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reload today's budgets after a restart.
    pub async fn restore(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let today = Utc::now().date_naive();
        match store.load_budgets(today).await {
            Ok(budgets) => {
                let n = budgets.len();
                for budget in budgets {
                    self.budgets.insert(budget.key(), budget);
                }
                info!("Restored {} sponsorship budgets for {}", n, today);
                n
            }
            Err(e) => {
                warn!("Failed to restore sponsorship budgets: {}", e);
                0
            }
        }
    }

    /// Sponsor `cost` for an intent under today's budget.
    pub async fn sponsor(
        &self,
        identity: &str,
        tier: &str,
        intent_id: IntentId,
        cost: u64,
    ) -> Result<SponsorshipGrant, SponsorshipError> {
        self.sponsor_on(Utc::now().date_naive(), identity, tier, intent_id, cost)
            .await
    }

    pub async fn sponsor_on(
        &self,
        day: NaiveDate,
        identity: &str,
        tier: &str,
        intent_id: IntentId,
        cost: u64,
    ) -> Result<SponsorshipGrant, SponsorshipError> {
        let limit = self
            .tiers
            .get(tier)
            .map(|l| *l.value())
            .ok_or_else(|| SponsorshipError::UnknownTier(tier.to_string()))?;

        let key = BudgetKey {
            identity: identity.to_string(),
            tier: tier.to_string(),
            day,
        };

        let snapshot = {
            let mut budget = self
                .budgets
                .entry(key.clone())
                .or_insert_with(|| SponsorshipBudget {
                    identity: identity.to_string(),
                    tier: tier.to_string(),
                    day,
                    used_today: 0,
                    daily_limit: limit,
                    reset_epoch: epoch_day(day),
                });

            let within_limit = budget
                .used_today
                .checked_add(cost)
                .is_some_and(|total| total <= budget.daily_limit);
            if !within_limit {
                metrics::record_sponsorship("budget_exceeded");
                return Err(SponsorshipError::BudgetExceeded {
                    identity: identity.to_string(),
                    tier: tier.to_string(),
                    used: budget.used_today,
                    limit: budget.daily_limit,
                    requested: cost,
                });
            }

            self.debit_treasury(cost)?;
            budget.used_today += cost;
            budget.clone()
        };

        metrics::record_sponsorship("granted");
        debug!(
            intent_id = %intent_id,
            "Sponsored {} for {} ({}): used {}/{}",
            cost, identity, tier, snapshot.used_today, snapshot.daily_limit
        );
        self.persist(&snapshot).await;

        Ok(SponsorshipGrant {
            key,
            intent_id,
            cost,
            granted_at: Utc::now(),
        })
    }

    /// Return `unused` of a grant to the budget and the treasury.
    pub async fn release(&self, grant: &SponsorshipGrant, unused: u64) {
        let unused = unused.min(grant.cost);
        if unused == 0 {
            return;
        }

        let snapshot = self.budgets.get_mut(&grant.key).map(|mut budget| {
            budget.used_today = budget.used_today.saturating_sub(unused);
            budget.clone()
        });
        let balance = self.treasury.fetch_add(unused, Ordering::SeqCst) + unused;
        metrics::set_treasury_balance(balance);

        if let Some(snapshot) = snapshot {
            debug!(
                intent_id = %grant.intent_id,
                "Released {} of sponsorship for {}",
                unused, grant.key.identity
            );
            self.persist(&snapshot).await;
        }
    }

    fn debit_treasury(&self, cost: u64) -> Result<u64, SponsorshipError> {
        let reserve = self.min_reserve;
        match self
            .treasury
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |balance| {
                balance.checked_sub(cost).filter(|after| *after >= reserve)
            }) {
            Ok(previous) => {
                let balance = previous - cost;
                metrics::set_treasury_balance(balance);
                Ok(balance)
            }
            Err(balance) => {
                metrics::record_sponsorship("treasury_low");
                warn!(
                    "Treasury low: balance {}, reserve {}, requested {}",
                    balance, reserve, cost
                );
                Err(SponsorshipError::TreasuryLow {
                    balance,
                    reserve,
                    requested: cost,
                })
            }
        }
    }

    /// Whether a grant of `cost` would currently succeed.
    pub fn has_headroom(&self, identity: &str, tier: &str, cost: u64) -> bool {
        let Some(limit) = self.tiers.get(tier).map(|l| *l.value()) else {
            return false;
        };
        let key = BudgetKey {
            identity: identity.to_string(),
            tier: tier.to_string(),
            day: Utc::now().date_naive(),
        };
        let (used, limit) = self
            .budgets
            .get(&key)
            .map(|b| (b.used_today, b.daily_limit))
            .unwrap_or((0, limit));
        let balance = self.treasury.load(Ordering::SeqCst);

        used.saturating_add(cost) <= limit
            && balance
                .checked_sub(cost)
                .is_some_and(|after| after >= self.min_reserve)
    }

    /// Change a tier's daily limit. Budgets already opened today keep at
    /// least their current usage as their limit.
    pub async fn set_tier_limit(&self, tier: &str, limit: u64) {
        self.tiers.insert(tier.to_string(), limit);
        let today = Utc::now().date_naive();

        let updated: Vec<SponsorshipBudget> = self
            .budgets
            .iter_mut()
            .filter(|b| b.key().tier == tier && b.key().day == today)
            .map(|mut b| {
                b.daily_limit = limit.max(b.used_today);
                b.clone()
            })
            .collect();

        info!(
            "Sponsorship tier {} limit set to {} ({} open budgets updated)",
            tier,
            limit,
            updated.len()
        );
        for budget in &updated {
            self.persist(budget).await;
        }
    }

    pub fn tier_limit(&self, tier: &str) -> Option<u64> {
        self.tiers.get(tier).map(|l| *l.value())
    }

    pub fn deposit(&self, amount: u64) -> u64 {
        let balance = self.treasury.fetch_add(amount, Ordering::SeqCst) + amount;
        metrics::set_treasury_balance(balance);
        balance
    }

    pub fn treasury_balance(&self) -> u64 {
        self.treasury.load(Ordering::SeqCst)
    }

    pub fn budget(&self, identity: &str, tier: &str, day: NaiveDate) -> Option<SponsorshipBudget> {
        let key = BudgetKey {
            identity: identity.to_string(),
            tier: tier.to_string(),
            day,
        };
        self.budgets.get(&key).map(|b| b.value().clone())
    }

    /// Roll over to `epoch`, dropping budgets of earlier days. Running it
    /// twice for the same epoch is a no-op.
    pub fn reset(&self, epoch: i64) -> bool {
        let previous = self.last_reset_epoch.fetch_max(epoch, Ordering::SeqCst);
        if previous >= epoch {
            return false;
        }
        let before = self.budgets.len();
        self.budgets.retain(|key, _| epoch_day(key.day) >= epoch);
        info!(
            "Sponsorship reset to epoch {} ({} stale budgets dropped)",
            epoch,
            before - self.budgets.len()
        );
        true
    }

    /// Reset if the UTC day has turned since the last reset.
    pub fn reset_if_due(&self, now: DateTime<Utc>) -> bool {
        self.reset(epoch_day(now.date_naive()))
    }

    async fn persist(&self, budget: &SponsorshipBudget) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_budget(budget).await {
                warn!(
                    "Failed to persist sponsorship budget for {} ({}): {}",
                    budget.identity, budget.tier, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn config(limit: u64, treasury: u64, reserve: u64) -> SponsorshipConfig {
        let mut tiers = BTreeMap::new();
        tiers.insert("basic".to_string(), limit);
        SponsorshipConfig {
            tiers,
            treasury_balance: treasury,
            min_reserve: reserve,
            reset_check_secs: 60,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    #[test]
    fn epoch_day_counts_from_unix_epoch() {
        assert_eq!(epoch_day(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()), 0);
        assert_eq!(epoch_day(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()), 1);
    }

    #[tokio::test]
    async fn second_request_over_limit_is_denied() {
        let manager = SponsorshipManager::new(&config(1_000, 1_000_000, 0));

        manager
            .sponsor_on(day(), "alice", "basic", Uuid::new_v4(), 600)
            .await
            .unwrap();
        let err = manager
            .sponsor_on(day(), "alice", "basic", Uuid::new_v4(), 600)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SponsorshipError::BudgetExceeded {
                identity: "alice".into(),
                tier: "basic".into(),
                used: 600,
                limit: 1_000,
                requested: 600,
            }
        );
        assert_eq!(manager.budget("alice", "basic", day()).unwrap().used_today, 600);
        assert_eq!(manager.treasury_balance(), 1_000_000 - 600);
    }

    #[tokio::test]
    async fn treasury_reserve_is_respected() {
        let manager = SponsorshipManager::new(&config(10_000, 1_500, 1_000));

        manager
            .sponsor_on(day(), "alice", "basic", Uuid::new_v4(), 500)
            .await
            .unwrap();
        let err = manager
            .sponsor_on(day(), "bob", "basic", Uuid::new_v4(), 1)
            .await
            .unwrap_err();

        assert!(matches!(err, SponsorshipError::TreasuryLow { balance: 1_000, .. }));
        // the denied grant did not consume budget
        assert!(manager.budget("bob", "basic", day()).unwrap().used_today == 0);

        assert_eq!(manager.deposit(500), 1_500);
        manager
            .sponsor_on(day(), "bob", "basic", Uuid::new_v4(), 1)
            .await
            .unwrap();
        assert_eq!(manager.treasury_balance(), 1_499);
    }

    #[tokio::test]
    async fn unknown_tier() {
        let manager = SponsorshipManager::new(&config(1_000, 1_000_000, 0));
        assert_eq!(
            manager
                .sponsor("alice", "gold", Uuid::new_v4(), 1)
                .await
                .unwrap_err(),
            SponsorshipError::UnknownTier("gold".into())
        );
    }

    #[tokio::test]
    async fn release_saturates_at_zero() {
        let manager = SponsorshipManager::new(&config(1_000, 10_000, 0));
        let grant = manager
            .sponsor_on(day(), "alice", "basic", Uuid::new_v4(), 300)
            .await
            .unwrap();

        manager.release(&grant, 100).await;
        assert_eq!(manager.budget("alice", "basic", day()).unwrap().used_today, 200);
        manager.release(&grant, 5_000).await;
        assert_eq!(manager.budget("alice", "basic", day()).unwrap().used_today, 0);
    }

    #[tokio::test]
    async fn reset_is_idempotent_per_epoch() {
        let manager = SponsorshipManager::new(&config(1_000, 1_000_000, 0));
        let yesterday = Utc::now().date_naive().pred_opt().unwrap();
        manager
            .sponsor_on(yesterday, "alice", "basic", Uuid::new_v4(), 400)
            .await
            .unwrap();

        let tomorrow = epoch_day(Utc::now().date_naive()) + 1;
        assert!(manager.reset(tomorrow));
        assert!(!manager.reset(tomorrow));
        assert!(!manager.reset(tomorrow - 1));
        assert!(manager.budget("alice", "basic", yesterday).is_none());
    }

    #[tokio::test]
    async fn lowering_a_limit_never_strands_usage() {
        let manager = SponsorshipManager::new(&config(1_000, 1_000_000, 0));
        let today = Utc::now().date_naive();
        manager
            .sponsor_on(today, "alice", "basic", Uuid::new_v4(), 800)
            .await
            .unwrap();

        manager.set_tier_limit("basic", 500).await;
        let budget = manager.budget("alice", "basic", today).unwrap();
        assert_eq!(budget.daily_limit, 800);
        assert!(!manager.has_headroom("alice", "basic", 1));
        assert!(manager.has_headroom("bob", "basic", 500));
        assert!(!manager.has_headroom("bob", "basic", 501));
    }

    #[tokio::test]
    async fn budgets_are_written_through() {
        let store = Arc::new(MemoryStore::new());
        let manager =
            SponsorshipManager::new(&config(1_000, 1_000_000, 0)).with_store(store.clone());
        let today = Utc::now().date_naive();
        manager
            .sponsor("alice", "basic", Uuid::new_v4(), 250)
            .await
            .unwrap();

        let saved = store.load_budgets(today).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].used_today, 250);

        let restored =
            SponsorshipManager::new(&config(1_000, 1_000_000, 0)).with_store(store.clone());
        assert_eq!(restored.restore().await, 1);
        assert_eq!(restored.budget("alice", "basic", today).unwrap().used_today, 250);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_grants_never_exceed_limit() {
        let manager = Arc::new(SponsorshipManager::new(&config(1_000, 1_000_000, 0)));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .sponsor_on(day(), "alice", "basic", Uuid::new_v4(), 70)
                    .await
                    .is_ok()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 14);
        assert_eq!(manager.budget("alice", "basic", day()).unwrap().used_today, 980);
        assert_eq!(manager.treasury_balance(), 1_000_000 - 980);
    }
}
