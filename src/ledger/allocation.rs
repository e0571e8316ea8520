use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::TransactionKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAllocation {
    pub symbol: String,
    pub name: String,
    /// Share of the spendable balance, 0..=100
    pub percentage: Decimal,
    pub amount: Decimal,
}

/// Funds currently committed to open positions, per category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommittedFunds {
    #[serde(default)]
    pub league: Decimal,
    #[serde(default)]
    pub vault: Decimal,
    #[serde(default)]
    pub prediction: Decimal,
}

impl CommittedFunds {
    pub fn get(&self, category: TransactionKind) -> Decimal {
        match category {
            TransactionKind::LeagueJoin => self.league,
            TransactionKind::VaultFollow => self.vault,
            TransactionKind::PredictionPlacement => self.prediction,
        }
    }

    fn slot_mut(&mut self, category: TransactionKind) -> &mut Decimal {
        match category {
            TransactionKind::LeagueJoin => &mut self.league,
            TransactionKind::VaultFollow => &mut self.vault,
            TransactionKind::PredictionPlacement => &mut self.prediction,
        }
    }

    pub fn add(&mut self, category: TransactionKind, amount: Decimal) {
        *self.slot_mut(category) += amount;
    }

    /// Saturates at zero.
    pub fn release(&mut self, category: TransactionKind, amount: Decimal) {
        let slot = self.slot_mut(category);
        *slot = (*slot - amount).max(Decimal::ZERO);
    }

    pub fn total(&self) -> Decimal {
        self.league + self.vault + self.prediction
    }
}

/// Derived breakdown of the user's balance, recomputed on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAllocation {
    pub tokens: Vec<TokenAllocation>,
    pub total_value: Decimal,
    pub committed: CommittedFunds,
}

impl PortfolioAllocation {
    pub fn new(balance: Decimal, committed: CommittedFunds) -> Self {
        let mut allocation = Self {
            tokens: default_tokens(),
            total_value: Decimal::ZERO,
            committed,
        };
        allocation.recompute(balance);
        allocation
    }

    pub fn recompute(&mut self, balance: Decimal) {
        let hundred = Decimal::from(100);
        for token in &mut self.tokens {
            token.amount = (token.percentage / hundred * balance).round_dp(2);
        }
        self.total_value = balance;
    }
}

fn token(symbol: &str, name: &str, percentage: i64) -> TokenAllocation {
    TokenAllocation {
        symbol: symbol.to_string(),
        name: name.to_string(),
        percentage: Decimal::from(percentage),
        amount: Decimal::ZERO,
    }
}

fn default_tokens() -> Vec<TokenAllocation> {
    vec![
        token("APT", "Aptos", 25),
        token("USDC", "USDC (on Aptos)", 20),
        token("EKID", "Ekiden", 15),
        token("PORA", "Panora", 20),
        token("RION", "Hyperion", 20),
    ]
}
