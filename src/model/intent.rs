//! Ledger-agnostic transaction intents produced by the policy engine

use super::chain::{Capability, CapabilitySet, ChainId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub type IntentId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Transfer,
    Mint,
    Burn,
    ContractCall,
}

impl IntentKind {
    /// Capability a chain needs to execute this kind at all.
    pub fn implied_capability(&self) -> Capability {
        match self {
            IntentKind::Transfer => Capability::Transfer,
            IntentKind::Mint => Capability::Mint,
            IntentKind::Burn => Capability::Burn,
            IntentKind::ContractCall => Capability::ContractCall,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Transfer => "transfer",
            IntentKind::Mint => "mint",
            IntentKind::Burn => "burn",
            IntentKind::ContractCall => "contract_call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

/// Named scoring profiles understood by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    Balanced,
    LowestCost,
    Fastest,
    MostReliable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConstraints {
    pub required_capabilities: CapabilitySet,
    /// Upper bound on normalized cost.
    pub max_cost: Option<u64>,
    /// Empty means every chain is allowed.
    pub allow_chains: BTreeSet<ChainId>,
    pub deny_chains: BTreeSet<ChainId>,
    /// Execute only on this chain; disables re-routing.
    pub pinned_chain: Option<ChainId>,
    pub preferred_chain: Option<ChainId>,
    /// When set, the intent moves value cross-ledger to this chain.
    pub bridge_target: Option<ChainId>,
    pub sponsorship_tier: Option<String>,
    /// Whether the identity may pay its own costs when sponsorship is denied.
    pub allow_identity_pays: bool,
    pub strategy: RoutingStrategy,
}

impl Default for IntentConstraints {
    fn default() -> Self {
        Self {
            required_capabilities: CapabilitySet::new(),
            max_cost: None,
            allow_chains: BTreeSet::new(),
            deny_chains: BTreeSet::new(),
            pinned_chain: None,
            preferred_chain: None,
            bridge_target: None,
            sponsorship_tier: None,
            allow_identity_pays: true,
            strategy: RoutingStrategy::Balanced,
        }
    }
}

/// Request to move or create value, independent of the executing ledger.
///
/// Intents are immutable once submitted; components only ever borrow them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionIntent {
    pub id: IntentId,
    pub kind: IntentKind,
    /// Identity on whose behalf value moves.
    pub origin: String,
    pub destination: String,
    pub value: u128,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub constraints: IntentConstraints,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl TransactionIntent {
    pub fn new(
        kind: IntentKind,
        origin: impl Into<String>,
        destination: impl Into<String>,
        value: u128,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            origin: origin.into(),
            destination: destination.into(),
            value,
            metadata: BTreeMap::new(),
            urgency: Urgency::Normal,
            constraints: IntentConstraints::default(),
            submitted_at: Utc::now(),
        }
    }

    pub fn transfer(origin: impl Into<String>, destination: impl Into<String>, value: u128) -> Self {
        Self::new(IntentKind::Transfer, origin, destination, value)
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn requiring(mut self, capability: Capability) -> Self {
        self.constraints.required_capabilities.insert(capability);
        self
    }

    pub fn with_max_cost(mut self, max_cost: u64) -> Self {
        self.constraints.max_cost = Some(max_cost);
        self
    }

    pub fn pinned_to(mut self, chain: impl Into<ChainId>) -> Self {
        self.constraints.pinned_chain = Some(chain.into());
        self
    }

    pub fn preferring(mut self, chain: impl Into<ChainId>) -> Self {
        self.constraints.preferred_chain = Some(chain.into());
        self
    }

    pub fn allowing(mut self, chain: impl Into<ChainId>) -> Self {
        self.constraints.allow_chains.insert(chain.into());
        self
    }

    pub fn denying(mut self, chain: impl Into<ChainId>) -> Self {
        self.constraints.deny_chains.insert(chain.into());
        self
    }

    pub fn bridged_to(mut self, chain: impl Into<ChainId>) -> Self {
        self.constraints.bridge_target = Some(chain.into());
        self
    }

    pub fn sponsored_under(mut self, tier: impl Into<String>) -> Self {
        self.constraints.sponsorship_tier = Some(tier.into());
        self
    }

    pub fn identity_pays_allowed(mut self, allowed: bool) -> Self {
        self.constraints.allow_identity_pays = allowed;
        self
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.constraints.strategy = strategy;
        self
    }

    /// Declared capabilities plus those implied by the intent's kind. A
    /// cross-ledger intent additionally needs `Lock` on its source chain.
    pub fn required_capabilities(&self) -> CapabilitySet {
        let mut caps = self.constraints.required_capabilities.clone();
        if self.constraints.bridge_target.is_some() {
            caps.insert(Capability::Lock);
        } else {
            caps.insert(self.kind.implied_capability());
        }
        caps
    }

    pub fn is_cross_ledger(&self) -> bool {
        self.constraints.bridge_target.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_implies_capability() {
        let intent = TransactionIntent::new(IntentKind::Burn, "alice", "0xdead", 5)
            .requiring(Capability::NativeSponsorship);
        let caps = intent.required_capabilities();
        assert!(caps.contains(&Capability::Burn));
        assert!(caps.contains(&Capability::NativeSponsorship));
        assert!(!caps.contains(&Capability::Transfer));
    }

    #[test]
    fn bridged_intent_needs_lock_not_transfer() {
        let intent = TransactionIntent::transfer("alice", "bob", 500).bridged_to("evm-1");
        let caps = intent.required_capabilities();
        assert!(intent.is_cross_ledger());
        assert!(caps.contains(&Capability::Lock));
        assert!(!caps.contains(&Capability::Transfer));
    }

    #[test]
    fn builders_set_constraints() {
        let intent = TransactionIntent::transfer("alice", "bob", 1)
            .allowing("object-1")
            .allowing("evm-1")
            .identity_pays_allowed(false)
            .with_metadata("campaign", "spring");
        assert_eq!(intent.constraints.allow_chains.len(), 2);
        assert!(!intent.constraints.allow_identity_pays);
        assert_eq!(intent.metadata.get("campaign").map(String::as_str), Some("spring"));
    }

    #[test]
    fn intent_deserializes_with_defaults() {
        let json = r#"{
            "id": "6f1c7a4e-4c1e-4f5e-9d1e-2f8f1c0e2a11",
            "kind": "transfer",
            "origin": "alice",
            "destination": "0x00000000000000000000000000000000000000aa",
            "value": 42
        }"#;
        let intent: TransactionIntent = serde_json::from_str(json).unwrap();
        assert_eq!(intent.urgency, Urgency::Normal);
        assert!(intent.constraints.allow_identity_pays);
        assert_eq!(intent.constraints.strategy, RoutingStrategy::Balanced);
    }
}
