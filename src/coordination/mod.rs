//! Coordination engine for multi-ledger intent execution
//!
//! The coordination engine:
//! 1. Accepts transaction intents on a bounded intake channel
//! 2. Sends single-ledger intents through routing and the fallback controller
//! 3. Sends cross-ledger intents through the bridge orchestrator
//! 4. Runs the daily sponsorship reset and the bridge refund sweep

pub mod engine;

pub use engine::{CoordinationEngine, IntentOutcome};
