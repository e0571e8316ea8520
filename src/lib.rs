//! TradeLeague Backend Library
//!
//! Transaction orchestration for league joins, vault follows and prediction
//! placements: a local balance ledger, a chain submission client, a durable
//! transaction store and the orchestrator that ties them together.

pub mod chain;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod relay;
pub mod store;

pub use models::{Config, Intent, Transaction, TransactionKind, TransactionStatus};
pub use orchestrator::{TransactionError, TransactionOrchestrator};
