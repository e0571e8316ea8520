use anyhow::Context;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{ChainClient, ChainStatus, EntryFunctionPayload, SubmissionError};
use crate::models::Intent;

pub const DEFAULT_FULLNODE_URL: &str = "https://fullnode.testnet.aptoslabs.com/v1";

const MAX_GAS_AMOUNT: &str = "2000";
const GAS_UNIT_PRICE: &str = "100";
const EXPIRATION_SECS: i64 = 600;

/// Transaction body before signing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub sender: String,
    pub sequence_number: String,
    pub max_gas_amount: String,
    pub gas_unit_price: String,
    pub expiration_timestamp_secs: String,
    pub payload: EntryFunctionPayload,
}

/// Signed transaction exactly as the fullnode expects it on `POST /transactions`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedTransaction(pub Value);

/// Wallet signing capability. Key management lives behind this trait.
#[async_trait::async_trait]
pub trait SigningProvider: Send + Sync {
    async fn sign(
        &self,
        transaction: &UnsignedTransaction,
        account: &str,
    ) -> Result<SignedTransaction, SubmissionError>;
}

/// Signing provider reached over HTTP (wallet bridge, custody service)
#[derive(Clone)]
pub struct HttpSigningProvider {
    client: Client,
    url: String,
}

impl std::fmt::Debug for HttpSigningProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSigningProvider")
            .field("url", &self.url)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    account: &'a str,
    transaction: &'a UnsignedTransaction,
}

impl HttpSigningProvider {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl SigningProvider for HttpSigningProvider {
    async fn sign(
        &self,
        transaction: &UnsignedTransaction,
        account: &str,
    ) -> Result<SignedTransaction, SubmissionError> {
        let response = self
            .client
            .post(&self.url)
            .json(&SignRequest {
                account,
                transaction,
            })
            .send()
            .await
            .map_err(|e| SubmissionError::Signing(format!("signer unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SubmissionError::Signing(format!(
                "signer refused ({}): {}",
                status, body
            )));
        }

        response
            .json::<SignedTransaction>()
            .await
            .map_err(|e| SubmissionError::Signing(format!("bad signer response: {}", e)))
    }
}

/// Live client for the chain's fullnode REST API
#[derive(Clone)]
pub struct FullnodeChainClient {
    client: Client,
    base_url: String,
    module_address: String,
    account_address: String,
    signer: Arc<dyn SigningProvider>,
}

impl std::fmt::Debug for FullnodeChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullnodeChainClient")
            .field("base_url", &self.base_url)
            .field("module_address", &self.module_address)
            .field("account_address", &self.account_address)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    sequence_number: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    hash: Option<String>,
}

impl FullnodeChainClient {
    pub fn new(
        base_url: impl Into<String>,
        module_address: impl Into<String>,
        account_address: impl Into<String>,
        signer: Arc<dyn SigningProvider>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self::with_client(
            client,
            base_url,
            module_address,
            account_address,
            signer,
        ))
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        module_address: impl Into<String>,
        account_address: impl Into<String>,
        signer: Arc<dyn SigningProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            module_address: module_address.into(),
            account_address: account_address.into(),
            signer,
        }
    }

    async fn sequence_number(&self) -> Result<String, SubmissionError> {
        let url = format!("{}/accounts/{}", self.base_url, self.account_address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SubmissionError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SubmissionError::Network(format!(
                "account lookup failed ({})",
                response.status()
            )));
        }

        let account: AccountResponse = response
            .json()
            .await
            .map_err(|e| SubmissionError::Network(format!("bad account response: {}", e)))?;
        Ok(account.sequence_number)
    }

    fn build_unsigned(
        &self,
        intent: &Intent,
        sequence_number: String,
    ) -> Result<UnsignedTransaction, SubmissionError> {
        Ok(UnsignedTransaction {
            sender: self.account_address.clone(),
            sequence_number,
            max_gas_amount: MAX_GAS_AMOUNT.to_string(),
            gas_unit_price: GAS_UNIT_PRICE.to_string(),
            expiration_timestamp_secs: (Utc::now().timestamp() + EXPIRATION_SECS).to_string(),
            payload: EntryFunctionPayload::for_intent(&self.module_address, intent)?,
        })
    }
}

#[async_trait::async_trait]
impl ChainClient for FullnodeChainClient {
    async fn submit(&self, intent: &Intent) -> Result<String, SubmissionError> {
        let start = std::time::Instant::now();

        let sequence_number = self.sequence_number().await?;
        let unsigned = self.build_unsigned(intent, sequence_number)?;

        debug!(
            function = %unsigned.payload.function,
            sequence_number = %unsigned.sequence_number,
            "signing transaction"
        );
        let signed = self.signer.sign(&unsigned, &self.account_address).await?;

        let url = format!("{}/transactions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&signed)
            .send()
            .await
            .map_err(|e| SubmissionError::Network(e.to_string()))?;

        let status = response.status();
        let latency_ms = start.elapsed().as_millis() as u64;

        if !(status == StatusCode::OK || status == StatusCode::ACCEPTED) {
            let body = response.text().await.unwrap_or_default();
            warn!(
                status = %status,
                error = %body,
                latency_ms = %latency_ms,
                "fullnode rejected transaction"
            );
            return Err(SubmissionError::Rejected(format!("{}: {}", status, body)));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| SubmissionError::Rejected(format!("bad submit response: {}", e)))?;

        let hash = body
            .hash
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SubmissionError::Rejected("no transaction hash returned".to_string()))?;

        info!(
            hash = %hash,
            latency_ms = %latency_ms,
            kind = intent.kind().as_str(),
            "transaction accepted by fullnode"
        );
        Ok(hash)
    }

    async fn poll_status(&self, hash: &str) -> ChainStatus {
        let url = format!("{}/transactions/by_hash/{}", self.base_url, hash);

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(hash, error = %e, "status poll failed; treating as pending");
                return ChainStatus::Pending;
            }
        };

        if response.status() != StatusCode::OK {
            return ChainStatus::Pending;
        }

        match response.json::<Value>().await {
            Ok(body) => status_from_body(&body),
            Err(e) => {
                debug!(hash, error = %e, "unparseable status body; treating as pending");
                ChainStatus::Pending
            }
        }
    }
}

/// Map a `GET /transactions/by_hash` body to a status.
pub fn status_from_body(body: &Value) -> ChainStatus {
    if body.get("type").and_then(|v| v.as_str()) == Some("pending_transaction") {
        return ChainStatus::Pending;
    }
    match body.get("success").and_then(|v| v.as_bool()) {
        Some(true) => ChainStatus::Success,
        Some(false) => ChainStatus::Failed,
        None => ChainStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    struct NoopSigner;

    #[async_trait::async_trait]
    impl SigningProvider for NoopSigner {
        async fn sign(
            &self,
            transaction: &UnsignedTransaction,
            _account: &str,
        ) -> Result<SignedTransaction, SubmissionError> {
            Ok(SignedTransaction(serde_json::to_value(transaction).unwrap()))
        }
    }

    #[test]
    fn test_status_from_body() {
        assert_eq!(
            status_from_body(&json!({"hash": "0x1", "success": true})),
            ChainStatus::Success
        );
        assert_eq!(
            status_from_body(&json!({"hash": "0x1", "success": false, "vm_status": "ABORTED"})),
            ChainStatus::Failed
        );
        assert_eq!(
            status_from_body(&json!({"hash": "0x1", "type": "pending_transaction"})),
            ChainStatus::Pending
        );
        assert_eq!(status_from_body(&json!({})), ChainStatus::Pending);
    }

    #[test]
    fn test_unsigned_transaction_shape() {
        let client = FullnodeChainClient::with_client(
            Client::new(),
            "https://node.example/v1/",
            "0xbeef",
            "0xa11ce",
            Arc::new(NoopSigner),
        );
        let intent = Intent::VaultFollow {
            vault_id: "v1".to_string(),
            vault_name: "Delta Neutral".to_string(),
            amount: Decimal::from(3),
        };

        let unsigned = client.build_unsigned(&intent, "7".to_string()).unwrap();
        assert_eq!(client.base_url, "https://node.example/v1");
        assert_eq!(unsigned.sender, "0xa11ce");
        assert_eq!(unsigned.sequence_number, "7");
        assert_eq!(unsigned.max_gas_amount, "2000");
        assert_eq!(unsigned.payload.function, "0xbeef::vault_manager::follow_vault");

        let expires: i64 = unsigned.expiration_timestamp_secs.parse().unwrap();
        assert!(expires > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_unreachable_node_polls_pending() {
        let client = FullnodeChainClient::with_client(
            Client::new(),
            "http://127.0.0.1:9",
            "0x1",
            "0x2",
            Arc::new(NoopSigner),
        );
        assert_eq!(client.poll_status("0xabc").await, ChainStatus::Pending);
    }
}
