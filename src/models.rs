use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const EXPLORER_BASE_URL: &str = "https://explorer.aptoslabs.com";

/// Money-moving action kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    LeagueJoin,
    VaultFollow,
    PredictionPlacement,
}

impl TransactionKind {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionKind::LeagueJoin => "league_join",
            TransactionKind::VaultFollow => "vault_follow",
            TransactionKind::PredictionPlacement => "prediction_place",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "league_join" | "league" => Some(TransactionKind::LeagueJoin),
            "vault_follow" | "vault" => Some(TransactionKind::VaultFollow),
            "prediction_place" | "prediction" => Some(TransactionKind::PredictionPlacement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
        }
    }

    /// Success and Failed never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// A user-initiated request to move money
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    LeagueJoin {
        league_id: String,
        league_name: String,
        entry_fee: Decimal,
    },
    VaultFollow {
        vault_id: String,
        vault_name: String,
        amount: Decimal,
    },
    PredictionPlacement {
        market_id: String,
        question: String,
        outcome_index: u32,
        amount: Decimal,
    },
}

impl Intent {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Intent::LeagueJoin { .. } => TransactionKind::LeagueJoin,
            Intent::VaultFollow { .. } => TransactionKind::VaultFollow,
            Intent::PredictionPlacement { .. } => TransactionKind::PredictionPlacement,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Intent::LeagueJoin { entry_fee, .. } => *entry_fee,
            Intent::VaultFollow { amount, .. } => *amount,
            Intent::PredictionPlacement { amount, .. } => *amount,
        }
    }

    /// On-chain identifier of the league, vault or market
    pub fn target_id(&self) -> &str {
        match self {
            Intent::LeagueJoin { league_id, .. } => league_id,
            Intent::VaultFollow { vault_id, .. } => vault_id,
            Intent::PredictionPlacement { market_id, .. } => market_id,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Intent::LeagueJoin { league_name, .. } => format!("Joined {}", league_name),
            Intent::VaultFollow { vault_name, .. } => format!("Followed {}", vault_name),
            Intent::PredictionPlacement { question, .. } => format!("Prediction: {}", question),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let amount = self.amount();
        if amount <= Decimal::ZERO {
            return Err(format!("amount must be positive, got {}", amount));
        }
        crate::chain::to_micro_units(amount)?;
        if self.target_id().trim().is_empty() {
            let field = match self {
                Intent::LeagueJoin { .. } => "league_id",
                Intent::VaultFollow { .. } => "vault_id",
                Intent::PredictionPlacement { .. } => "market_id",
            };
            return Err(format!("{} required", field));
        }
        Ok(())
    }
}

/// Durable record of one intent's journey to the chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    pub amount: Decimal,
    /// Empty until the chain accepts the submission
    #[serde(default)]
    pub chain_hash: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// True once the ledger deduction for this record went through
    #[serde(default)]
    pub funds_reserved: bool,
}

impl Transaction {
    /// Allocate a fresh Pending record for an intent.
    pub fn pending(intent: &Intent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: intent.kind(),
            amount: intent.amount(),
            chain_hash: String::new(),
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            description: intent.description(),
            failure_reason: None,
            funds_reserved: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    pub fn has_hash(&self) -> bool {
        !self.chain_hash.is_empty()
    }

    /// Record the accepted hash and settle as Success.
    pub fn mark_succeeded(&mut self, chain_hash: impl Into<String>) {
        self.chain_hash = chain_hash.into();
        self.status = TransactionStatus::Success;
        self.failure_reason = None;
    }

    /// Settle as Failed. The label switches to `Failed: <name>`.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.description = self.failure_description();
        self.status = TransactionStatus::Failed;
        self.failure_reason = Some(reason.into());
    }

    fn failure_description(&self) -> String {
        let name = match self.kind {
            TransactionKind::LeagueJoin => self.description.strip_prefix("Joined "),
            TransactionKind::VaultFollow => self.description.strip_prefix("Followed "),
            TransactionKind::PredictionPlacement => Some("Prediction"),
        };
        format!("Failed: {}", name.unwrap_or(&self.description))
    }

    pub fn explorer_url(&self) -> Option<String> {
        if !self.has_hash() {
            return None;
        }
        Some(format!(
            "{}/txn/{}?network=testnet",
            EXPLORER_BASE_URL, self.chain_hash
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Simulated,
    Fullnode,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub initial_balance: Decimal,
    pub submission_timeout: Option<Duration>,
    pub chain_mode: ChainMode,
    pub fullnode_url: String,
    pub module_address: String,
    pub wallet_address: String,
    pub signer_url: Option<String>,
    pub stream_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("TRADELEAGUE_DB_PATH")
            .unwrap_or_else(|_| "./tradeleague.db".to_string());

        let initial_balance = std::env::var("TRADELEAGUE_INITIAL_BALANCE")
            .ok()
            .and_then(|v| v.trim().parse::<Decimal>().ok())
            .filter(|v| *v >= Decimal::ZERO)
            .unwrap_or_else(|| Decimal::from(12_500));

        // Unset means the submission wait is unbounded.
        let submission_timeout = std::env::var("TRADELEAGUE_SUBMIT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);

        let chain_mode = match std::env::var("TRADELEAGUE_CHAIN_MODE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "fullnode" | "live" => ChainMode::Fullnode,
            _ => ChainMode::Simulated,
        };

        let fullnode_url = std::env::var("TRADELEAGUE_FULLNODE_URL")
            .unwrap_or_else(|_| crate::chain::DEFAULT_FULLNODE_URL.to_string());

        let module_address =
            std::env::var("TRADELEAGUE_MODULE_ADDRESS").unwrap_or_else(|_| "0x1".to_string());

        let wallet_address = std::env::var("TRADELEAGUE_WALLET_ADDRESS").unwrap_or_else(|_| {
            "0x1c2cf8c859fc98c4bc8ebaeec177489b191574000bd961db1b51670fb5e7b155".to_string()
        });

        let signer_url = std::env::var("TRADELEAGUE_SIGNER_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let stream_url = std::env::var("TRADELEAGUE_STREAM_URL")
            .unwrap_or_else(|_| "wss://fullnode.testnet.aptoslabs.com/v1/stream".to_string());

        Ok(Self {
            database_path,
            initial_balance,
            submission_timeout,
            chain_mode,
            fullnode_url,
            module_address,
            wallet_address,
            signer_url,
            stream_url,
        })
    }
}
