//! Lifecycle and outbound event types
//!
//! Two event families flow through the relayer:
//! - `AdapterEvent`: per-ledger lifecycle notifications (submitted / confirmed
//!   / failed and the bridge primitives) emitted by each adapter.
//! - `RelayEvent`: outbound events consumed by analytics, observability and
//!   notification collaborators (`transfer.*`, `intent.*`).

use crate::bridge::BridgeStatus;
use crate::model::{Amount, ChainId, IntentId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Events emitted by a ledger adapter
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdapterEvent {
    Submitted {
        chain_id: ChainId,
        intent_id: Option<IntentId>,
        reference: String,
        at: DateTime<Utc>,
    },

    Confirmed {
        chain_id: ChainId,
        intent_id: Option<IntentId>,
        reference: String,
        height: u64,
        cost_paid: u64,
        at: DateTime<Utc>,
    },

    Failed {
        chain_id: ChainId,
        intent_id: Option<IntentId>,
        reason: String,
        at: DateTime<Utc>,
    },

    Locked {
        chain_id: ChainId,
        bridge_id: Uuid,
        lock_ref: String,
        amount: Amount,
        at: DateTime<Utc>,
    },

    Minted {
        chain_id: ChainId,
        bridge_id: Uuid,
        mint_ref: String,
        amount: Amount,
        at: DateTime<Utc>,
    },

    Released {
        chain_id: ChainId,
        lock_ref: String,
        amount: Amount,
        at: DateTime<Utc>,
    },
}

impl AdapterEvent {
    pub fn chain_id(&self) -> &ChainId {
        match self {
            AdapterEvent::Submitted { chain_id, .. }
            | AdapterEvent::Confirmed { chain_id, .. }
            | AdapterEvent::Failed { chain_id, .. }
            | AdapterEvent::Locked { chain_id, .. }
            | AdapterEvent::Minted { chain_id, .. }
            | AdapterEvent::Released { chain_id, .. } => chain_id,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            AdapterEvent::Submitted { .. } => "submitted",
            AdapterEvent::Confirmed { .. } => "confirmed",
            AdapterEvent::Failed { .. } => "failed",
            AdapterEvent::Locked { .. } => "locked",
            AdapterEvent::Minted { .. } => "minted",
            AdapterEvent::Released { .. } => "released",
        }
    }

    pub fn intent_id(&self) -> Option<IntentId> {
        match self {
            AdapterEvent::Submitted { intent_id, .. }
            | AdapterEvent::Confirmed { intent_id, .. }
            | AdapterEvent::Failed { intent_id, .. } => *intent_id,
            _ => None,
        }
    }
}

/// Selects which adapter events a subscriber receives.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Event names to deliver; empty delivers everything.
    pub names: Vec<&'static str>,
    pub intent_id: Option<IntentId>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(names: &[&'static str]) -> Self {
        Self {
            names: names.to_vec(),
            intent_id: None,
        }
    }

    pub fn for_intent(intent_id: IntentId) -> Self {
        Self {
            names: Vec::new(),
            intent_id: Some(intent_id),
        }
    }

    pub fn matches(&self, event: &AdapterEvent) -> bool {
        if !self.names.is_empty() && !self.names.contains(&event.name()) {
            return false;
        }
        match self.intent_id {
            Some(id) => event.intent_id() == Some(id),
            None => true,
        }
    }
}

/// Filtered stream of adapter events.
pub struct EventSubscription {
    rx: broadcast::Receiver<AdapterEvent>,
    filter: EventFilter,
}

impl EventSubscription {
    pub fn new(rx: broadcast::Receiver<AdapterEvent>, filter: EventFilter) -> Self {
        Self { rx, filter }
    }

    /// Next matching event, or `None` once the adapter is dropped.
    pub async fn next(&mut self) -> Option<AdapterEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEventKind {
    Locked,
    Proven,
    Minted,
    Failed,
    Refunded,
}

impl TransferEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransferEventKind::Locked => "transfer.locked",
            TransferEventKind::Proven => "transfer.proven",
            TransferEventKind::Minted => "transfer.minted",
            TransferEventKind::Failed => "transfer.failed",
            TransferEventKind::Refunded => "transfer.refunded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub bridge_id: Uuid,
    pub source_chain: ChainId,
    pub target_chain: ChainId,
    pub amount: Amount,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Outbound events published on the relay bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    Transfer(TransferEvent),

    StatusChanged {
        bridge_id: Uuid,
        from: BridgeStatus,
        to: BridgeStatus,
        at: DateTime<Utc>,
    },

    IntentExecuted {
        intent_id: IntentId,
        chain_id: ChainId,
        reference: String,
        cost_paid: u64,
        sponsored: bool,
        at: DateTime<Utc>,
    },

    IntentFailed {
        intent_id: IntentId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Transfer(t) => t.kind.name(),
            RelayEvent::StatusChanged { .. } => "transfer.status_changed",
            RelayEvent::IntentExecuted { .. } => "intent.executed",
            RelayEvent::IntentFailed { .. } => "intent.failed",
        }
    }
}

/// Fan-out bus for outbound relay events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RelayEvent) {
        // No receivers is fine; collaborators attach when they are ready.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(intent_id: Option<IntentId>) -> AdapterEvent {
        AdapterEvent::Submitted {
            chain_id: ChainId::from("a"),
            intent_id,
            reference: "tx-1".into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn filter_by_name_and_intent() {
        let id = Uuid::new_v4();
        assert!(EventFilter::all().matches(&submitted(None)));
        assert!(!EventFilter::named(&["confirmed"]).matches(&submitted(Some(id))));
        assert!(EventFilter::for_intent(id).matches(&submitted(Some(id))));
        assert!(!EventFilter::for_intent(id).matches(&submitted(Some(Uuid::new_v4()))));
    }

    #[tokio::test]
    async fn subscription_skips_unmatched_events() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = EventSubscription::new(rx, EventFilter::named(&["failed"]));
        tx.send(submitted(None)).unwrap();
        tx.send(AdapterEvent::Failed {
            chain_id: ChainId::from("a"),
            intent_id: None,
            reason: "boom".into(),
            at: Utc::now(),
        })
        .unwrap();
        drop(tx);
        let event = sub.next().await.unwrap();
        assert_eq!(event.name(), "failed");
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn transfer_event_names() {
        assert_eq!(TransferEventKind::Refunded.name(), "transfer.refunded");
        assert_eq!(TransferEventKind::Locked.name(), "transfer.locked");
    }
}
