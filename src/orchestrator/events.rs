use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::TransactionKind;

/// One event per state transition, broadcast to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransactionEvent {
    Created {
        transaction_id: String,
        kind: TransactionKind,
        amount: Decimal,
    },
    Pending {
        transaction_id: String,
    },
    FundsReserved {
        transaction_id: String,
        balance_after: Decimal,
    },
    Submitted {
        transaction_id: String,
        chain_hash: String,
    },
    Succeeded {
        transaction_id: String,
        chain_hash: String,
    },
    Failed {
        transaction_id: String,
        reason: String,
    },
    Refunded {
        transaction_id: String,
        amount: Decimal,
        balance_after: Decimal,
    },
    ReconciliationUnknown {
        transaction_id: String,
        reason: String,
    },
}

impl TransactionEvent {
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Created { transaction_id, .. }
            | Self::Pending { transaction_id }
            | Self::FundsReserved { transaction_id, .. }
            | Self::Submitted { transaction_id, .. }
            | Self::Succeeded { transaction_id, .. }
            | Self::Failed { transaction_id, .. }
            | Self::Refunded { transaction_id, .. }
            | Self::ReconciliationUnknown { transaction_id, .. } => transaction_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Pending { .. } => "pending",
            Self::FundsReserved { .. } => "funds_reserved",
            Self::Submitted { .. } => "submitted",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Refunded { .. } => "refunded",
            Self::ReconciliationUnknown { .. } => "reconciliation_unknown",
        }
    }
}

/// Timestamped envelope as written to the watch stream
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord<'a> {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: &'a TransactionEvent,
}

impl<'a> EventRecord<'a> {
    pub fn now(event: &'a TransactionEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = TransactionEvent::Refunded {
            transaction_id: "t-1".to_string(),
            amount: Decimal::from(30),
            balance_after: Decimal::from(100),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "refunded");
        assert_eq!(json["amount"], "30");
        assert_eq!(event.transaction_id(), "t-1");
        assert_eq!(event.name(), "refunded");
    }

    #[test]
    fn test_record_flattens_event() {
        let event = TransactionEvent::Pending {
            transaction_id: "t-2".to_string(),
        };
        let json = serde_json::to_value(EventRecord::now(&event)).unwrap();
        assert_eq!(json["event"], "pending");
        assert!(json.get("at").is_some());
    }
}
