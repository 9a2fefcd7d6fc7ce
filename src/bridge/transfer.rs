//! Bridge transfer record and its lifecycle state machine

use crate::error::BridgeError;
use crate::model::{Amount, ChainId};
use crate::quorum::{LockClaim, ThresholdProof, ValidatorAttestation};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeStatus {
    Requested,
    Locking,
    Locked,
    Proving,
    Proven,
    Minting,
    Minted,
    Failed,
    Refunding,
    Refunded,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Requested => "REQUESTED",
            BridgeStatus::Locking => "LOCKING",
            BridgeStatus::Locked => "LOCKED",
            BridgeStatus::Proving => "PROVING",
            BridgeStatus::Proven => "PROVEN",
            BridgeStatus::Minting => "MINTING",
            BridgeStatus::Minted => "MINTED",
            BridgeStatus::Failed => "FAILED",
            BridgeStatus::Refunding => "REFUNDING",
            BridgeStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "REQUESTED" => BridgeStatus::Requested,
            "LOCKING" => BridgeStatus::Locking,
            "LOCKED" => BridgeStatus::Locked,
            "PROVING" => BridgeStatus::Proving,
            "PROVEN" => BridgeStatus::Proven,
            "MINTING" => BridgeStatus::Minting,
            "MINTED" => BridgeStatus::Minted,
            "FAILED" => BridgeStatus::Failed,
            "REFUNDING" => BridgeStatus::Refunding,
            "REFUNDED" => BridgeStatus::Refunded,
            _ => return None,
        })
    }

    /// Edges of the lifecycle graph. `Failed -> Refunding` additionally
    /// requires a lock, checked by `BridgeTransfer::transition`.
    pub fn can_transition(self, to: BridgeStatus) -> bool {
        use BridgeStatus::*;
        matches!(
            (self, to),
            (Requested, Locking)
                | (Requested, Failed)
                | (Locking, Locked)
                | (Locking, Failed)
                | (Locked, Proving)
                | (Locked, Failed)
                | (Proving, Proven)
                | (Proving, Failed)
                | (Proven, Minting)
                | (Proven, Failed)
                | (Minting, Minted)
                | (Minting, Failed)
                // a mint that landed despite a failed call
                | (Failed, Minted)
                | (Failed, Refunding)
                | (Refunding, Refunded)
        )
    }

    /// Holding a lock that has neither been minted against nor refunded.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            BridgeStatus::Locking
                | BridgeStatus::Locked
                | BridgeStatus::Proving
                | BridgeStatus::Proven
                | BridgeStatus::Minting
        )
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency key of a mint: hex keccak256 of source chain and lock reference.
pub fn idempotency_key(source_chain: &ChainId, lock_ref: &str) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(source_chain.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(lock_ref.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// Supplied by callers that need a stable id across retries.
    #[serde(default)]
    pub bridge_id: Option<Uuid>,
    pub source_chain: ChainId,
    pub target_chain: ChainId,
    pub owner: String,
    pub recipient: String,
    pub amount: Amount,
}

impl BridgeRequest {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.amount == 0 {
            return Err(BridgeError::InvalidRequest("amount must be positive".into()));
        }
        if self.source_chain == self.target_chain {
            return Err(BridgeError::InvalidRequest(
                "source and target chain must differ".into(),
            ));
        }
        if self.owner.is_empty() || self.recipient.is_empty() {
            return Err(BridgeError::InvalidRequest(
                "owner and recipient are required".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: BridgeStatus,
    pub to: BridgeStatus,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTransfer {
    pub bridge_id: Uuid,
    pub source_chain: ChainId,
    pub target_chain: ChainId,
    pub owner: String,
    pub recipient: String,
    pub amount: Amount,
    pub status: BridgeStatus,
    pub lock_ref: Option<String>,
    pub idempotency_key: Option<String>,
    pub proof: Option<ThresholdProof>,
    /// Every accepted attestation, across proving attempts. Append-only.
    pub attestations: Vec<ValidatorAttestation>,
    pub locked_amount: Amount,
    pub minted_amount: Amount,
    pub refunded_amount: Amount,
    pub mint_ref: Option<String>,
    /// Set when the transfer failed mid-lock: the source ledger may hold a
    /// lock whose receipt never arrived.
    #[serde(default)]
    pub lock_unresolved: bool,
    pub last_error: Option<String>,
    pub history: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BridgeTransfer {
    pub fn new(request: BridgeRequest) -> Self {
        let now = Utc::now();
        Self {
            bridge_id: request.bridge_id.unwrap_or_else(Uuid::new_v4),
            source_chain: request.source_chain,
            target_chain: request.target_chain,
            owner: request.owner,
            recipient: request.recipient,
            amount: request.amount,
            status: BridgeStatus::Requested,
            lock_ref: None,
            idempotency_key: None,
            proof: None,
            attestations: Vec::new(),
            locked_amount: 0,
            minted_amount: 0,
            refunded_amount: 0,
            mint_ref: None,
            lock_unresolved: false,
            last_error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_lock(&self) -> bool {
        self.lock_ref.is_some() && self.locked_amount > 0
    }

    /// Terminal states: minted, refunded, or failed with no lock held or
    /// possibly held on the source ledger.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            BridgeStatus::Minted | BridgeStatus::Refunded => true,
            BridgeStatus::Failed => !self.has_lock() && !self.lock_unresolved,
            _ => false,
        }
    }

    /// Record a lock and derive the mint idempotency key from it.
    pub fn record_lock(&mut self, lock_ref: String, amount: Amount) {
        self.idempotency_key = Some(idempotency_key(&self.source_chain, &lock_ref));
        self.lock_ref = Some(lock_ref);
        self.locked_amount = amount;
        self.lock_unresolved = false;
    }

    /// The source ledger confirmed no lock exists for this transfer.
    pub fn resolve_without_lock(&mut self) {
        self.lock_unresolved = false;
        self.updated_at = Utc::now();
    }

    pub fn claim(&self) -> Option<LockClaim> {
        Some(LockClaim {
            bridge_id: self.bridge_id,
            source_chain: self.source_chain.clone(),
            target_chain: self.target_chain.clone(),
            lock_ref: self.lock_ref.clone()?,
            owner: self.owner.clone(),
            recipient: self.recipient.clone(),
            amount: self.locked_amount,
        })
    }

    pub fn transition(
        &mut self,
        to: BridgeStatus,
        detail: Option<String>,
    ) -> Result<BridgeStatus, BridgeError> {
        let from = self.status;
        let allowed = from.can_transition(to)
            && !(from == BridgeStatus::Failed && to == BridgeStatus::Refunding && !self.has_lock());
        if !allowed {
            return Err(BridgeError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        if to == BridgeStatus::Failed {
            self.last_error = detail.clone();
            if from == BridgeStatus::Locking && self.lock_ref.is_none() {
                self.lock_unresolved = true;
            }
        }
        self.history.push(TransitionRecord {
            from,
            to,
            at: now,
            detail,
        });
        self.status = to;
        self.updated_at = now;
        Ok(from)
    }

    /// Time since the transfer last changed state.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> BridgeTransfer {
        BridgeTransfer::new(BridgeRequest {
            bridge_id: None,
            source_chain: ChainId::from("object-1"),
            target_chain: ChainId::from("evm-1"),
            owner: "alice".into(),
            recipient: "0x00000000000000000000000000000000000000b0".into(),
            amount: 500,
        })
    }

    #[test]
    fn happy_path_is_linear() {
        let mut t = transfer();
        for to in [
            BridgeStatus::Locking,
            BridgeStatus::Locked,
            BridgeStatus::Proving,
            BridgeStatus::Proven,
            BridgeStatus::Minting,
            BridgeStatus::Minted,
        ] {
            t.transition(to, None).unwrap();
        }
        assert!(t.is_terminal());
        assert_eq!(t.history.len(), 6);
        assert_eq!(t.history[0].from, BridgeStatus::Requested);
    }

    #[test]
    fn cannot_skip_proving() {
        let mut t = transfer();
        t.transition(BridgeStatus::Locking, None).unwrap();
        t.transition(BridgeStatus::Locked, None).unwrap();
        assert!(matches!(
            t.transition(BridgeStatus::Minting, None),
            Err(BridgeError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn refund_requires_a_lock() {
        let mut t = transfer();
        t.transition(BridgeStatus::Locking, None).unwrap();
        t.transition(BridgeStatus::Failed, Some("lock rejected".into()))
            .unwrap();
        assert!(t.lock_unresolved);
        assert!(!t.is_terminal());
        assert!(t.transition(BridgeStatus::Refunding, None).is_err());
        assert_eq!(t.last_error.as_deref(), Some("lock rejected"));

        t.resolve_without_lock();
        assert!(t.is_terminal());
    }

    #[test]
    fn lock_found_after_failure_enables_refund() {
        let mut t = transfer();
        t.transition(BridgeStatus::Locking, None).unwrap();
        t.transition(BridgeStatus::Failed, Some("lock timed out".into()))
            .unwrap();
        assert!(!t.is_terminal());

        t.record_lock("0xlate".into(), 500);
        assert!(!t.lock_unresolved);
        assert!(!t.is_terminal());
        t.transition(BridgeStatus::Refunding, None).unwrap();
        t.transition(BridgeStatus::Refunded, None).unwrap();
        assert!(t.is_terminal());
    }

    #[test]
    fn failure_before_locking_is_terminal() {
        let mut t = transfer();
        t.transition(BridgeStatus::Failed, Some("route unavailable".into()))
            .unwrap();
        assert!(!t.lock_unresolved);
        assert!(t.is_terminal());
    }

    #[test]
    fn failed_after_lock_is_not_terminal() {
        let mut t = transfer();
        t.transition(BridgeStatus::Locking, None).unwrap();
        t.record_lock("0xlock".into(), 500);
        t.transition(BridgeStatus::Locked, None).unwrap();
        t.transition(BridgeStatus::Failed, Some("quorum timeout".into()))
            .unwrap();
        assert!(!t.is_terminal());
        t.transition(BridgeStatus::Refunding, None).unwrap();
        t.transition(BridgeStatus::Refunded, None).unwrap();
        assert!(t.is_terminal());
    }

    #[test]
    fn idempotency_key_depends_on_chain_and_lock() {
        let a = idempotency_key(&ChainId::from("a"), "lock-1");
        assert_eq!(a, idempotency_key(&ChainId::from("a"), "lock-1"));
        assert_ne!(a, idempotency_key(&ChainId::from("b"), "lock-1"));
        assert_ne!(
            idempotency_key(&ChainId::from("ab"), "c"),
            idempotency_key(&ChainId::from("a"), "bc")
        );
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&BridgeStatus::Refunding).unwrap(),
            "\"REFUNDING\""
        );
        assert_eq!(BridgeStatus::parse("MINTED"), Some(BridgeStatus::Minted));
    }
}
