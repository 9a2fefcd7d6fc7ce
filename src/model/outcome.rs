//! Execution outcomes and cost estimates returned by adapters

use super::chain::ChainId;
use super::intent::IntentId;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who pays the execution cost of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeePayer {
    /// The originating identity pays from its own balance.
    Identity,
    /// The platform's operator float pays.
    Operator,
}

/// Tagged outcome state; callers branch on this rather than on the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Included and final at the given ledger height.
    Confirmed { height: u64 },
    /// Accepted by the ledger but not yet final.
    Submitted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Ledger-native reference of the executed transaction.
    pub id: String,
    pub intent_id: IntentId,
    pub chain_id: ChainId,
    pub status: OutcomeStatus,
    pub cost_paid: u64,
    pub fee_payer: FeePayer,
    #[serde(with = "duration_millis")]
    pub confirmation_latency: Duration,
}

impl Outcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Confirmed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub chain_id: ChainId,
    /// Fee in the ledger's native unit.
    pub native_fee: u64,
    /// Fee converted to the platform's common cost unit.
    pub normalized_cost: u64,
    #[serde(with = "duration_millis")]
    pub estimated_latency: Duration,
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
