//! Chain Submission Client
//!
//! Turns an intent into an entry-function payload, hands it to a signing
//! provider and submits it to the chain. Submission is a single best-effort
//! call; nothing in this module retries.
//!
//! - `SimulatedChainClient`: random hashes after a configurable delay
//! - `FullnodeChainClient`: fullnode REST API + remote signing provider

pub mod fullnode;
pub mod payload;
pub mod simulated;

pub use fullnode::*;
pub use payload::*;
pub use simulated::*;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::Intent;

/// Status of a submitted hash as seen by the chain
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Pending,
    Success,
    Failed,
}

#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    /// Submit the intent's payload. Resolves to the chain-assigned hash once
    /// the network accepts it (not finality).
    async fn submit(&self, intent: &Intent) -> Result<String, SubmissionError>;

    /// Query a previously returned hash. Unknown hashes are `Pending`.
    async fn poll_status(&self, hash: &str) -> ChainStatus;
}

/// Why a submission did not produce a hash
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionError {
    /// Provider or node refused the payload
    Rejected(String),
    /// Node unreachable or transport failure
    Network(String),
    /// Signing provider failed
    Signing(String),
    /// No answer within the configured ceiling; the chain may still accept it
    Timeout(Duration),
}

impl std::fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(msg) => write!(f, "submission rejected: {}", msg),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Signing(msg) => write!(f, "signing failed: {}", msg),
            Self::Timeout(limit) => {
                write!(f, "submission timed out after {}ms", limit.as_millis())
            }
        }
    }
}

impl std::error::Error for SubmissionError {}
