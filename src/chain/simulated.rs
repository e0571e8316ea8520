use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};
use tracing::info;

use super::{ChainClient, ChainStatus, EntryFunctionPayload, SubmissionError};
use crate::models::Intent;

/// Simulated chain configuration
#[derive(Debug, Clone)]
pub struct SimulatedChainConfig {
    /// Fixed delay before a submission resolves
    pub delay: Duration,
    /// Probability a submission is rejected (0.0 to 1.0)
    pub reject_prob: f64,
    pub module_address: String,
}

impl Default for SimulatedChainConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(2_000),
            reject_prob: 0.0,
            module_address: "0x1".to_string(),
        }
    }
}

impl SimulatedChainConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TRADELEAGUE_SIM_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                config.delay = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("TRADELEAGUE_SIM_REJECT_PROB") {
            if let Ok(prob) = v.parse::<f64>() {
                config.reject_prob = prob.clamp(0.0, 1.0);
            }
        }
        if let Ok(v) = std::env::var("TRADELEAGUE_MODULE_ADDRESS") {
            if !v.trim().is_empty() {
                config.module_address = v;
            }
        }

        config
    }
}

/// Stand-in for the testnet: accepts payloads after a delay and hands back a
/// random 32-byte hash. Accepted hashes poll as `Success`.
#[derive(Debug)]
pub struct SimulatedChainClient {
    pub config: SimulatedChainConfig,
    submitted: RwLock<HashMap<String, ChainStatus>>,
}

impl Default for SimulatedChainClient {
    fn default() -> Self {
        Self::new(SimulatedChainConfig::from_env())
    }
}

impl SimulatedChainClient {
    pub fn new(config: SimulatedChainConfig) -> Self {
        Self {
            config,
            submitted: RwLock::new(HashMap::new()),
        }
    }

    /// Override what a hash polls as.
    pub fn set_status(&self, hash: &str, status: ChainStatus) {
        self.submitted.write().insert(hash.to_string(), status);
    }
}

#[async_trait::async_trait]
impl ChainClient for SimulatedChainClient {
    async fn submit(&self, intent: &Intent) -> Result<String, SubmissionError> {
        let payload = EntryFunctionPayload::for_intent(&self.config.module_address, intent)?;

        sleep(self.config.delay).await;

        let mut rng = StdRng::from_entropy();
        if rng.gen::<f64>() < self.config.reject_prob {
            return Err(SubmissionError::Rejected(
                "payload rejected (simulated)".to_string(),
            ));
        }

        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        let hash = format!("0x{}", hex::encode(bytes));

        self.submitted
            .write()
            .insert(hash.clone(), ChainStatus::Success);

        info!(
            hash = %hash,
            function = %payload.function,
            kind = intent.kind().as_str(),
            amount = %intent.amount(),
            target = intent.target_id(),
            "simulated testnet submission"
        );

        Ok(hash)
    }

    async fn poll_status(&self, hash: &str) -> ChainStatus {
        self.submitted
            .read()
            .get(hash)
            .copied()
            .unwrap_or(ChainStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn instant(reject_prob: f64) -> SimulatedChainClient {
        SimulatedChainClient::new(SimulatedChainConfig {
            delay: Duration::ZERO,
            reject_prob,
            ..Default::default()
        })
    }

    fn follow() -> Intent {
        Intent::VaultFollow {
            vault_id: "vault-9".to_string(),
            vault_name: "Hyperion LP Strategy".to_string(),
            amount: Decimal::from(1_000),
        }
    }

    #[tokio::test]
    async fn test_submit_returns_hash_that_polls_success() {
        let chain = instant(0.0);
        let hash = chain.submit(&follow()).await.unwrap();

        assert!(hash.starts_with("0x"));
        assert_eq!(hash.len(), 66);
        assert_eq!(chain.poll_status(&hash).await, ChainStatus::Success);
    }

    #[tokio::test]
    async fn test_unknown_hash_is_pending() {
        let chain = instant(0.0);
        assert_eq!(chain.poll_status("0xdeadbeef").await, ChainStatus::Pending);
    }

    #[tokio::test]
    async fn test_always_reject() {
        let chain = instant(1.0);
        let err = chain.submit(&follow()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_status_override() {
        let chain = instant(0.0);
        chain.set_status("0x01", ChainStatus::Failed);
        assert_eq!(chain.poll_status("0x01").await, ChainStatus::Failed);
    }
}
