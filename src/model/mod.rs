//! Universal transaction model
//!
//! Canonical, ledger-agnostic representation of intents, chains and
//! outcomes. Ledger-specific transaction shapes never appear above the
//! adapter boundary; everything here is shared by all components.

mod chain;
mod intent;
mod outcome;

pub use chain::{capability_set, Capability, CapabilitySet, ChainDescriptor, ChainId, FeeStats, LedgerModel};
pub use intent::{IntentConstraints, IntentId, IntentKind, RoutingStrategy, TransactionIntent, Urgency};
pub use outcome::{CostEstimate, FeePayer, Outcome, OutcomeStatus};

pub(crate) use outcome::duration_millis;

/// Native value amount. Ledgers with smaller integer widths convert at the
/// adapter boundary.
pub type Amount = u128;
