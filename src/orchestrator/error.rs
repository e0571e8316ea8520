use rust_decimal::Decimal;

use crate::chain::SubmissionError;

/// Why a transaction could not be settled at restart
#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationError {
    /// Never got a hash, so there is nothing to poll
    MissingHash,
    /// The chain still reports the hash as pending (or does not know it yet)
    StillPending { chain_hash: String },
}

impl std::fmt::Display for ReconciliationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHash => write!(f, "status unknown: no chain hash recorded"),
            Self::StillPending { chain_hash } => {
                write!(f, "status unknown: {} still pending on chain", chain_hash)
            }
        }
    }
}

impl std::error::Error for ReconciliationError {}

#[derive(Debug)]
pub enum TransactionError {
    /// Rejected before any record was created
    InvalidIntent(String),
    InsufficientBalance {
        transaction_id: String,
        available: Decimal,
        required: Decimal,
    },
    /// Funds were returned and the record marked Failed
    Submission {
        transaction_id: String,
        source: SubmissionError,
    },
    Reconciliation {
        transaction_id: String,
        source: ReconciliationError,
    },
    /// No pending transaction with this id
    NotPending(String),
    Storage(anyhow::Error),
}

impl TransactionError {
    /// Id of the persisted record describing this failure, if one exists.
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Self::InsufficientBalance { transaction_id, .. }
            | Self::Submission { transaction_id, .. }
            | Self::Reconciliation { transaction_id, .. } => Some(transaction_id),
            Self::InvalidIntent(_) | Self::NotPending(_) | Self::Storage(_) => None,
        }
    }
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIntent(msg) => write!(f, "invalid intent: {}", msg),
            Self::InsufficientBalance {
                available,
                required,
                ..
            } => write!(
                f,
                "insufficient balance: available {}, required {}",
                available, required
            ),
            Self::Submission { source, .. } => write!(f, "{}", source),
            Self::Reconciliation {
                transaction_id,
                source,
            } => write!(f, "transaction {}: {}", transaction_id, source),
            Self::NotPending(id) => write!(f, "no pending transaction {}", id),
            Self::Storage(e) => write!(f, "storage error: {:#}", e),
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Submission { source, .. } => Some(source),
            Self::Reconciliation { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TransactionError {
    fn from(e: anyhow::Error) -> Self {
        Self::Storage(e)
    }
}
