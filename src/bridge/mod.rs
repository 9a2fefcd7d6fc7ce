//! Cross-ledger bridge transfers
//!
//! Lock on the source ledger, prove the lock to an m-of-n validator quorum,
//! mint on the target ledger. Failures after the lock end in a refund.

mod orchestrator;
mod transfer;

pub use orchestrator::{BridgeOrchestrator, SweepReport};
pub use transfer::{idempotency_key, BridgeRequest, BridgeStatus, BridgeTransfer, TransitionRecord};
