//! Chain identity, ledger model classes and capability descriptors

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Stable identifier of a registered ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChainId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Structural class of a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerModel {
    /// Value lives in versioned objects owned by addresses.
    ObjectOwned,
    /// Account balances with sub-second finality and flat signature fees.
    FastFinalityAccount,
    /// Account balances with a per-block base fee that moves with demand.
    VariableFeeAccount,
}

impl LedgerModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerModel::ObjectOwned => "object_owned",
            LedgerModel::FastFinalityAccount => "fast_finality_account",
            LedgerModel::VariableFeeAccount => "variable_fee_account",
        }
    }
}

/// A feature a ledger adapter declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Transfer,
    Lock,
    Mint,
    Burn,
    ContractCall,
    NativeSponsorship,
    AtomicMint,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Transfer => "transfer",
            Capability::Lock => "lock",
            Capability::Mint => "mint",
            Capability::Burn => "burn",
            Capability::ContractCall => "contract_call",
            Capability::NativeSponsorship => "native_sponsorship",
            Capability::AtomicMint => "atomic_mint",
        };
        f.write_str(s)
    }
}

pub type CapabilitySet = BTreeSet<Capability>;

/// Build a capability set from a slice.
pub fn capability_set(caps: &[Capability]) -> CapabilitySet {
    caps.iter().copied().collect()
}

/// Rolling record of recently observed fees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeStats {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl FeeStats {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, fee: u64) {
        if self.capacity == 0 {
            self.capacity = 20;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(fee);
    }

    pub fn last(&self) -> Option<u64> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|&f| f as f64).sum::<f64>() / self.samples.len() as f64
    }

    /// Coefficient of variation of the recorded fees (0 when flat or empty).
    pub fn volatility(&self) -> f64 {
        let mean = self.mean();
        if self.samples.len() < 2 || mean <= 0.0 {
            return 0.0;
        }
        let variance = self
            .samples
            .iter()
            .map(|&f| {
                let d = f as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / self.samples.len() as f64;
        variance.sqrt() / mean
    }
}

/// Live view of a registered chain. Only the health monitor mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDescriptor {
    pub chain_id: ChainId,
    pub model: LedgerModel,
    pub capabilities: CapabilitySet,
    pub health_score: f64,
    pub fee_stats: FeeStats,
}

impl ChainDescriptor {
    pub fn new(chain_id: ChainId, model: LedgerModel, capabilities: CapabilitySet) -> Self {
        Self {
            chain_id,
            model,
            capabilities,
            health_score: 1.0,
            fee_stats: FeeStats::with_capacity(20),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn supports_all(&self, required: &CapabilitySet) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// First required capability this chain lacks, if any.
    pub fn missing_capability(&self, required: &CapabilitySet) -> Option<Capability> {
        required
            .iter()
            .find(|c| !self.capabilities.contains(c))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_volatility_is_zero_for_flat_fees() {
        let mut stats = FeeStats::with_capacity(5);
        for _ in 0..5 {
            stats.push(100);
        }
        assert_eq!(stats.volatility(), 0.0);
        assert_eq!(stats.mean(), 100.0);
    }

    #[test]
    fn fee_stats_evicts_oldest() {
        let mut stats = FeeStats::with_capacity(3);
        for fee in [10, 20, 30, 40] {
            stats.push(fee);
        }
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.mean(), 30.0);
        assert!(stats.volatility() > 0.0);
    }

    #[test]
    fn superset_check() {
        let desc = ChainDescriptor::new(
            ChainId::from("a"),
            LedgerModel::ObjectOwned,
            capability_set(&[Capability::Transfer, Capability::Lock]),
        );
        assert!(desc.supports_all(&capability_set(&[Capability::Lock])));
        assert_eq!(
            desc.missing_capability(&capability_set(&[Capability::Lock, Capability::Mint])),
            Some(Capability::Mint)
        );
    }
}
