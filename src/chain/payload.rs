use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SubmissionError;
use crate::models::Intent;

/// 1 USDC = 1_000_000 micro-USDC on chain
pub const MICRO_UNITS_PER_USDC: u64 = 1_000_000;

/// Entry-function call executed on chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFunctionPayload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub function: String,
    pub type_arguments: Vec<String>,
    pub arguments: Vec<Value>,
}

impl EntryFunctionPayload {
    /// Build the call for an intent. Amounts that have no exact micro-unit
    /// form are rejected rather than rounded.
    pub fn for_intent(module_address: &str, intent: &Intent) -> Result<Self, SubmissionError> {
        let units = to_micro_units(intent.amount()).map_err(SubmissionError::Rejected)?;
        let (function, arguments) = match intent {
            Intent::LeagueJoin { league_id, .. } => (
                "league_registry::join_league",
                vec![
                    Value::String(league_id.clone()),
                    Value::String(units.to_string()),
                ],
            ),
            Intent::VaultFollow { vault_id, .. } => (
                "vault_manager::follow_vault",
                vec![
                    Value::String(vault_id.clone()),
                    Value::String(units.to_string()),
                ],
            ),
            Intent::PredictionPlacement {
                market_id,
                outcome_index,
                ..
            } => (
                "prediction_market::place_prediction",
                vec![
                    Value::String(market_id.clone()),
                    Value::String(outcome_index.to_string()),
                    Value::String(units.to_string()),
                ],
            ),
        };

        Ok(Self {
            payload_type: "entry_function_payload".to_string(),
            function: format!("{}::{}", module_address, function),
            type_arguments: Vec::new(),
            arguments,
        })
    }
}

/// Currency amount to chain base units. The amount must be a positive whole
/// number of micro-units that fits in a `u64`.
pub fn to_micro_units(amount: Decimal) -> Result<u64, String> {
    let scaled = amount
        .checked_mul(Decimal::from(MICRO_UNITS_PER_USDC))
        .ok_or_else(|| format!("amount {} is out of range", amount))?;
    if scaled <= Decimal::ZERO {
        return Err(format!("amount {} is below one micro-unit", amount));
    }
    if scaled.fract() != Decimal::ZERO {
        return Err(format!("amount {} has more than 6 decimal places", amount));
    }
    scaled
        .to_u64()
        .ok_or_else(|| format!("amount {} exceeds the on-chain maximum", amount))
}
