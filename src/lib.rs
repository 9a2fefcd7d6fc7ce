//! Conduit relayer - multi-ledger routing, fee sponsorship and bridging
//!
//! Components:
//! - `adapter`: uniform contract over heterogeneous ledgers
//! - `registry`: registered chains and their live health
//! - `router`: scores chains for each intent
//! - `sponsorship`: per-identity daily fee budgets and the operator treasury
//! - `bridge` and `quorum`: lock-prove-mint transfers under m-of-n attestation
//! - `fallback`: retry and re-route policy
//! - `coordination`: intake loop tying the components together

pub mod adapter;
pub mod api;
pub mod bridge;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod fallback;
pub mod metrics;
pub mod model;
pub mod quorum;
pub mod registry;
pub mod router;
pub mod sponsorship;
pub mod state;
