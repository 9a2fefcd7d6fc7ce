//! In-process ledger book backing the reference adapters
//!
//! Each reference adapter owns one `LedgerBook`: balances, the bridge lock
//! vault, idempotent mint records and an operator float for sponsored fees.
//! A `FaultPlan` lets tests and staging environments make a ledger
//! unreachable, slow, or fail the next N calls with a given error class.

use super::{LockEvidence, MintReceipt};
use crate::error::AdapterError;
use crate::model::{Amount, ChainId, FeePayer};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Planned failure for the next gated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Unreachable,
    Timeout,
    RateLimited,
    Rejected(String),
    /// Never answers; callers' timeouts decide.
    Hang,
}

#[derive(Debug, Default)]
struct FaultPlan {
    offline: bool,
    queued: VecDeque<Fault>,
    extra_latency: Duration,
}

#[derive(Debug, Clone)]
struct LockEntry {
    bridge_id: Uuid,
    owner: String,
    amount: Amount,
    released: bool,
    height: u64,
}

#[derive(Debug, Clone)]
struct MintEntry {
    mint_ref: String,
    amount: Amount,
}

#[derive(Debug, Default)]
struct BookState {
    balances: HashMap<String, Amount>,
    locks: HashMap<String, LockEntry>,
    lock_by_bridge: HashMap<Uuid, String>,
    mints: HashMap<String, MintEntry>,
    operator_float: Amount,
    seq: u64,
}

/// A single ledger movement: optional debit, optional credit, and a fee.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub debit: Option<(String, Amount)>,
    pub credit: Option<(String, Amount)>,
    /// Account charged when the identity pays.
    pub fee_account: String,
    pub fee: u64,
    pub fee_payer: FeePayer,
}

/// Result of a lock on the book.
#[derive(Debug, Clone)]
pub struct BookLock {
    pub lock_ref: String,
    pub amount: Amount,
    pub height: u64,
    pub replayed: bool,
}

pub struct LedgerBook {
    chain_id: ChainId,
    state: Mutex<BookState>,
    faults: Mutex<FaultPlan>,
    height: AtomicU64,
}

impl LedgerBook {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            state: Mutex::new(BookState::default()),
            faults: Mutex::new(FaultPlan::default()),
            height: AtomicU64::new(0),
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    fn advance_height(&self) -> u64 {
        self.height.fetch_add(1, Ordering::SeqCst) + 1
    }

    // -- fault injection ----------------------------------------------------

    pub async fn set_offline(&self, offline: bool) {
        self.faults.lock().await.offline = offline;
    }

    pub async fn inject(&self, fault: Fault, times: usize) {
        let mut plan = self.faults.lock().await;
        for _ in 0..times {
            plan.queued.push_back(fault.clone());
        }
    }

    pub async fn set_extra_latency(&self, latency: Duration) {
        self.faults.lock().await.extra_latency = latency;
    }

    pub async fn clear_faults(&self) {
        *self.faults.lock().await = FaultPlan::default();
    }

    /// Applies the next planned fault for `operation`, then simulates
    /// `latency` of network and confirmation time.
    pub async fn gate(&self, operation: &str, latency: Duration) -> Result<(), AdapterError> {
        let (offline, fault, extra) = {
            let mut plan = self.faults.lock().await;
            (plan.offline, plan.queued.pop_front(), plan.extra_latency)
        };

        if offline {
            return Err(AdapterError::Unreachable {
                chain_id: self.chain_id.clone(),
                message: format!("{} refused: ledger offline", operation),
            });
        }

        match fault {
            Some(Fault::Unreachable) => {
                return Err(AdapterError::Unreachable {
                    chain_id: self.chain_id.clone(),
                    message: format!("{} connection reset", operation),
                })
            }
            Some(Fault::Timeout) => {
                return Err(AdapterError::Timeout {
                    chain_id: self.chain_id.clone(),
                    operation: operation.to_string(),
                })
            }
            Some(Fault::RateLimited) => {
                return Err(AdapterError::RateLimited {
                    chain_id: self.chain_id.clone(),
                })
            }
            Some(Fault::Rejected(reason)) => {
                return Err(AdapterError::Rejected {
                    chain_id: self.chain_id.clone(),
                    reason,
                })
            }
            Some(Fault::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let total = latency + extra;
        if !total.is_zero() {
            tokio::time::sleep(total).await;
        }
        Ok(())
    }

    // -- balances -----------------------------------------------------------

    pub async fn credit(&self, holder: &str, amount: Amount) {
        let mut state = self.state.lock().await;
        *state.balances.entry(holder.to_string()).or_insert(0) += amount;
    }

    pub async fn balance(&self, holder: &str) -> Amount {
        self.state
            .lock()
            .await
            .balances
            .get(holder)
            .copied()
            .unwrap_or(0)
    }

    pub async fn fund_operator(&self, amount: Amount) {
        self.state.lock().await.operator_float += amount;
    }

    pub async fn operator_float(&self) -> Amount {
        self.state.lock().await.operator_float
    }

    /// Applies a settlement atomically; nothing moves if any leg fails.
    pub async fn settle(&self, settlement: &Settlement) -> Result<u64, AdapterError> {
        let mut state = self.state.lock().await;
        let fee = settlement.fee as Amount;

        let debit_account = settlement.debit.as_ref().map(|(a, _)| a.as_str());
        let debit_amount = settlement.debit.as_ref().map(|(_, v)| *v).unwrap_or(0);

        match settlement.fee_payer {
            FeePayer::Identity => {
                let have = state
                    .balances
                    .get(&settlement.fee_account)
                    .copied()
                    .unwrap_or(0);
                let need = if debit_account == Some(settlement.fee_account.as_str()) {
                    debit_amount + fee
                } else {
                    fee
                };
                if have < need {
                    return Err(AdapterError::InsufficientFunds {
                        chain_id: self.chain_id.clone(),
                        have,
                        need,
                    });
                }
            }
            FeePayer::Operator => {
                if state.operator_float < fee {
                    return Err(AdapterError::InsufficientFunds {
                        chain_id: self.chain_id.clone(),
                        have: state.operator_float,
                        need: fee,
                    });
                }
            }
        }

        if let Some((account, amount)) = &settlement.debit {
            let have = state.balances.get(account).copied().unwrap_or(0);
            if have < *amount {
                return Err(AdapterError::InsufficientFunds {
                    chain_id: self.chain_id.clone(),
                    have,
                    need: *amount,
                });
            }
        }

        match settlement.fee_payer {
            FeePayer::Identity => {
                let entry = state
                    .balances
                    .entry(settlement.fee_account.clone())
                    .or_insert(0);
                *entry -= fee;
            }
            FeePayer::Operator => state.operator_float -= fee,
        }
        if let Some((account, amount)) = &settlement.debit {
            let entry = state.balances.entry(account.clone()).or_insert(0);
            *entry -= *amount;
        }
        if let Some((account, amount)) = &settlement.credit {
            *state.balances.entry(account.clone()).or_insert(0) += *amount;
        }
        state.seq += 1;
        drop(state);

        Ok(self.advance_height())
    }

    // -- bridge vault -------------------------------------------------------

    /// Moves `amount` from `owner` into the lock vault. Idempotent per bridge
    /// id: a repeated lock returns the original reference.
    pub async fn lock(
        &self,
        bridge_id: Uuid,
        owner: &str,
        amount: Amount,
        make_ref: impl FnOnce(u64) -> String,
    ) -> Result<BookLock, AdapterError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.lock_by_bridge.get(&bridge_id).cloned() {
            if let Some(entry) = state.locks.get(&existing) {
                return Ok(BookLock {
                    lock_ref: existing,
                    amount: entry.amount,
                    height: entry.height,
                    replayed: true,
                });
            }
        }

        let have = state.balances.get(owner).copied().unwrap_or(0);
        if have < amount {
            return Err(AdapterError::InsufficientFunds {
                chain_id: self.chain_id.clone(),
                have,
                need: amount,
            });
        }

        state.seq += 1;
        let lock_ref = make_ref(state.seq);
        let height = self.advance_height();
        if let Some(balance) = state.balances.get_mut(owner) {
            *balance -= amount;
        }
        state.locks.insert(
            lock_ref.clone(),
            LockEntry {
                bridge_id,
                owner: owner.to_string(),
                amount,
                released: false,
                height,
            },
        );
        state.lock_by_bridge.insert(bridge_id, lock_ref.clone());
        debug!(
            "Chain {} locked {} for bridge {} as {}",
            self.chain_id, amount, bridge_id, lock_ref
        );

        Ok(BookLock {
            lock_ref,
            amount,
            height,
            replayed: false,
        })
    }

    /// Returns locked funds to their owner. Releasing twice is a no-op.
    pub async fn release(&self, lock_ref: &str) -> Result<(Amount, bool), AdapterError> {
        let mut state = self.state.lock().await;
        let entry = state
            .locks
            .get_mut(lock_ref)
            .ok_or_else(|| AdapterError::Rejected {
                chain_id: self.chain_id.clone(),
                reason: format!("unknown lock {}", lock_ref),
            })?;

        if entry.released {
            return Ok((entry.amount, true));
        }
        entry.released = true;
        let (owner, amount) = (entry.owner.clone(), entry.amount);
        *state.balances.entry(owner).or_insert(0) += amount;
        drop(state);

        self.advance_height();
        Ok((amount, false))
    }

    /// Canonical lock state, read straight from the vault.
    /// The lock taken for `bridge_id`, if one ever landed.
    pub async fn lock_for_bridge(&self, bridge_id: Uuid) -> Option<BookLock> {
        let state = self.state.lock().await;
        let lock_ref = state.lock_by_bridge.get(&bridge_id)?;
        state.locks.get(lock_ref).map(|entry| BookLock {
            lock_ref: lock_ref.clone(),
            amount: entry.amount,
            height: entry.height,
            replayed: true,
        })
    }

    pub async fn lock_evidence(&self, lock_ref: &str) -> Option<LockEvidence> {
        let state = self.state.lock().await;
        state.locks.get(lock_ref).map(|entry| LockEvidence {
            chain_id: self.chain_id.clone(),
            lock_ref: lock_ref.to_string(),
            bridge_id: entry.bridge_id,
            owner: entry.owner.clone(),
            amount: entry.amount,
            released: entry.released,
            height: entry.height,
        })
    }

    /// Credits `recipient` at most once per idempotency key.
    pub async fn mint_once(
        &self,
        idempotency_key: &str,
        recipient: &str,
        amount: Amount,
        make_ref: impl FnOnce(u64) -> String,
    ) -> MintReceipt {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.mints.get(idempotency_key) {
            return MintReceipt {
                mint_ref: existing.mint_ref.clone(),
                amount: existing.amount,
                replayed: true,
            };
        }

        state.seq += 1;
        let mint_ref = make_ref(state.seq);
        *state.balances.entry(recipient.to_string()).or_insert(0) += amount;
        state.mints.insert(
            idempotency_key.to_string(),
            MintEntry {
                mint_ref: mint_ref.clone(),
                amount,
            },
        );
        drop(state);
        self.advance_height();

        MintReceipt {
            mint_ref,
            amount,
            replayed: false,
        }
    }

    pub async fn find_mint(&self, idempotency_key: &str) -> Option<MintReceipt> {
        self.state
            .lock()
            .await
            .mints
            .get(idempotency_key)
            .map(|m| MintReceipt {
                mint_ref: m.mint_ref.clone(),
                amount: m.amount,
                replayed: true,
            })
    }

    /// Sum of value still held in the vault.
    pub async fn outstanding_locked(&self) -> Amount {
        self.state
            .lock()
            .await
            .locks
            .values()
            .filter(|l| !l.released)
            .map(|l| l.amount)
            .sum()
    }

    pub async fn total_minted(&self) -> Amount {
        self.state.lock().await.mints.values().map(|m| m.amount).sum()
    }

    pub async fn mint_count(&self) -> usize {
        self.state.lock().await.mints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> LedgerBook {
        LedgerBook::new(ChainId::from("book"))
    }

    #[tokio::test]
    async fn settlement_is_all_or_nothing() {
        let book = book();
        book.credit("alice", 100).await;

        let result = book
            .settle(&Settlement {
                debit: Some(("alice".into(), 95)),
                credit: Some(("bob".into(), 95)),
                fee_account: "alice".into(),
                fee: 10,
                fee_payer: FeePayer::Identity,
            })
            .await;
        assert!(matches!(result, Err(AdapterError::InsufficientFunds { need: 105, .. })));
        assert_eq!(book.balance("alice").await, 100);
        assert_eq!(book.balance("bob").await, 0);
    }

    #[tokio::test]
    async fn operator_pays_sponsored_fee() {
        let book = book();
        book.credit("alice", 100).await;
        book.fund_operator(50).await;

        book.settle(&Settlement {
            debit: Some(("alice".into(), 100)),
            credit: Some(("bob".into(), 100)),
            fee_account: "alice".into(),
            fee: 10,
            fee_payer: FeePayer::Operator,
        })
        .await
        .unwrap();

        assert_eq!(book.balance("alice").await, 0);
        assert_eq!(book.balance("bob").await, 100);
        assert_eq!(book.operator_float().await, 40);
    }

    #[tokio::test]
    async fn lock_is_idempotent_per_bridge() {
        let book = book();
        book.credit("alice", 500).await;
        let bridge_id = Uuid::new_v4();

        let first = book
            .lock(bridge_id, "alice", 300, |seq| format!("lock-{}", seq))
            .await
            .unwrap();
        let second = book
            .lock(bridge_id, "alice", 300, |seq| format!("lock-{}", seq))
            .await
            .unwrap();

        assert_eq!(first.lock_ref, second.lock_ref);
        assert!(second.replayed);
        assert_eq!(book.balance("alice").await, 200);
        assert_eq!(book.outstanding_locked().await, 300);
    }

    #[tokio::test]
    async fn release_returns_funds_once() {
        let book = book();
        book.credit("alice", 500).await;
        let lock = book
            .lock(Uuid::new_v4(), "alice", 500, |seq| format!("lock-{}", seq))
            .await
            .unwrap();

        assert_eq!(book.release(&lock.lock_ref).await.unwrap(), (500, false));
        assert_eq!(book.release(&lock.lock_ref).await.unwrap(), (500, true));
        assert_eq!(book.balance("alice").await, 500);
        assert_eq!(book.outstanding_locked().await, 0);
    }

    #[tokio::test]
    async fn mint_once_ignores_replays() {
        let book = book();
        let first = book.mint_once("key", "bob", 500, |s| format!("m{}", s)).await;
        let replay = book.mint_once("key", "bob", 500, |s| format!("m{}", s)).await;

        assert!(!first.replayed);
        assert!(replay.replayed);
        assert_eq!(first.mint_ref, replay.mint_ref);
        assert_eq!(book.balance("bob").await, 500);
        assert_eq!(book.mint_count().await, 1);
    }

    #[tokio::test]
    async fn queued_faults_fire_in_order() {
        let book = book();
        book.inject(Fault::RateLimited, 1).await;
        book.inject(Fault::Rejected("nope".into()), 1).await;

        assert!(matches!(
            book.gate("submit", Duration::ZERO).await,
            Err(AdapterError::RateLimited { .. })
        ));
        assert!(matches!(
            book.gate("submit", Duration::ZERO).await,
            Err(AdapterError::Rejected { .. })
        ));
        assert!(book.gate("submit", Duration::ZERO).await.is_ok());

        book.set_offline(true).await;
        assert!(matches!(
            book.gate("probe", Duration::ZERO).await,
            Err(AdapterError::Unreachable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn extra_latency_delays_until_cleared() {
        let book = book();
        book.set_extra_latency(Duration::from_secs(5)).await;
        book.inject(Fault::Timeout, 3).await;

        let started = tokio::time::Instant::now();
        book.clear_faults().await;
        assert!(book.gate("submit", Duration::ZERO).await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));

        book.set_extra_latency(Duration::from_secs(5)).await;
        let started = tokio::time::Instant::now();
        assert!(book.gate("submit", Duration::ZERO).await.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
