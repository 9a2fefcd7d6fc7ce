//! Error types for the Conduit relayer
//!
//! Each component owns a narrow error enum matching its recovery strategy:
//! adapter errors are recovered locally (retry / reroute), routing and
//! sponsorship errors are surfaced to the caller, and bridge errors always
//! drive a transfer toward `FAILED` or `REFUNDING`.

use crate::model::{Capability, ChainId};

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a ledger adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Chain {chain_id} unreachable: {message}")]
    Unreachable { chain_id: ChainId, message: String },

    #[error("Chain {chain_id} rejected the transaction: {reason}")]
    Rejected { chain_id: ChainId, reason: String },

    #[error("Insufficient funds on chain {chain_id}: have {have}, need {need}")]
    InsufficientFunds {
        chain_id: ChainId,
        have: u128,
        need: u128,
    },

    #[error("Timeout waiting for {operation} on chain {chain_id}")]
    Timeout { chain_id: ChainId, operation: String },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: ChainId },

    #[error("Chain {chain_id} does not support capability {capability}")]
    Incompatible {
        chain_id: ChainId,
        capability: Capability,
    },

    #[error("Address {address} is not valid on chain {chain_id}")]
    InvalidAddress { chain_id: ChainId, address: String },
}

impl AdapterError {
    /// Transient errors are retried on the same chain; everything else is
    /// permanent and triggers a re-route.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Unreachable { .. }
                | AdapterError::Timeout { .. }
                | AdapterError::RateLimited { .. }
        )
    }

    pub fn chain_id(&self) -> &ChainId {
        match self {
            AdapterError::Unreachable { chain_id, .. }
            | AdapterError::Rejected { chain_id, .. }
            | AdapterError::InsufficientFunds { chain_id, .. }
            | AdapterError::Timeout { chain_id, .. }
            | AdapterError::RateLimited { chain_id }
            | AdapterError::Incompatible { chain_id, .. }
            | AdapterError::InvalidAddress { chain_id, .. } => chain_id,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Unreachable { .. } => "unreachable",
            AdapterError::Rejected { .. } => "rejected",
            AdapterError::InsufficientFunds { .. } => "insufficient_funds",
            AdapterError::Timeout { .. } => "timeout",
            AdapterError::RateLimited { .. } => "rate_limited",
            AdapterError::Incompatible { .. } => "incompatible",
            AdapterError::InvalidAddress { .. } => "invalid_address",
        }
    }
}

/// Routing never widens constraints on its own; these go back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No compatible chain for intent {intent_id}: {reason}")]
    NoCompatibleChain { intent_id: Uuid, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SponsorshipError {
    #[error("Sponsorship budget exceeded for {identity} ({tier}): used {used}, limit {limit}, requested {requested}")]
    BudgetExceeded {
        identity: String,
        tier: String,
        used: u64,
        limit: u64,
        requested: u64,
    },

    #[error("Treasury low: balance {balance}, reserve {reserve}, requested {requested}")]
    TreasuryLow {
        balance: u64,
        reserve: u64,
        requested: u64,
    },

    #[error("Unknown sponsorship tier {0}")]
    UnknownTier(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Quorum timeout for bridge {bridge_id}: {collected}/{required} attestations")]
    QuorumTimeout {
        bridge_id: Uuid,
        collected: usize,
        required: usize,
    },

    #[error("Proof rejected for bridge {bridge_id}: {reason}")]
    ProofRejected { bridge_id: Uuid, reason: String },

    #[error("Lock failed for bridge {bridge_id}: {source}")]
    LockFailed {
        bridge_id: Uuid,
        #[source]
        source: AdapterError,
    },

    #[error("Mint failed for bridge {bridge_id}: {source}")]
    MintFailed {
        bridge_id: Uuid,
        #[source]
        source: AdapterError,
    },

    #[error("Refund failed for bridge {bridge_id}: {source}")]
    RefundFailed {
        bridge_id: Uuid,
        #[source]
        source: AdapterError,
    },

    #[error("Bridge {bridge_id} exceeded its lifecycle deadline")]
    LifecycleExpired { bridge_id: Uuid },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Bridge {bridge_id} cannot be cancelled in state {status}")]
    NotCancellable { bridge_id: Uuid, status: String },

    #[error("Bridge transfer {0} not found")]
    NotFound(Uuid),

    #[error("Invalid bridge request: {0}")]
    InvalidRequest(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Chain {0} is already registered")]
    DuplicateChain(ChainId),

    #[error("Chain {chain_id} failed {failures} consecutive registration probes")]
    ProbeFailed { chain_id: ChainId, failures: u32 },

    #[error("Chain {0} not found")]
    ChainNotFound(ChainId),

    #[error("Chain {0} is draining and accepts no new work")]
    Draining(ChainId),
}

/// Terminal failure of an intent after retries and re-routing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Sponsorship(#[from] SponsorshipError),

    #[error("Intent failed on chain {chain_id} after {attempts} attempts: {source}")]
    Exhausted {
        chain_id: ChainId,
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    #[error("Chain {chain_id} could not sponsor the intent and identity-pays is not allowed: {source}")]
    SponsorUnavailable {
        chain_id: ChainId,
        #[source]
        source: AdapterError,
    },
}

/// Reasons a validator refuses to attest to a lock claim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("Source chain {0} is not available to this validator")]
    SourceUnavailable(ChainId),

    #[error("Lock {0} not found on the source ledger")]
    LockNotFound(String),

    #[error("Lock evidence disagrees with the claim: {0}")]
    EvidenceMismatch(String),

    #[error("Lock {0} has already been released")]
    LockReleased(String),

    #[error("Bridge {0} has already been minted")]
    AlreadyMinted(Uuid),

    #[error("Amount {amount} would take the period total to {period_total}, above the anomaly threshold {threshold}")]
    Anomalous {
        amount: u128,
        period_total: u128,
        threshold: u128,
    },

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Sponsorship(#[from] SponsorshipError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::Adapter(e) => e.is_transient(),
            RelayerError::Execution(ExecutionError::Exhausted { source, .. })
            | RelayerError::Execution(ExecutionError::SponsorUnavailable { source, .. }) => {
                source.is_transient()
            }
            RelayerError::Database(_) => true,
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::Sponsorship(SponsorshipError::TreasuryLow { .. })
                | RelayerError::Bridge(BridgeError::RefundFailed { .. })
                | RelayerError::Bridge(BridgeError::LifecycleExpired { .. })
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
