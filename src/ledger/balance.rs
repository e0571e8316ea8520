use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::allocation::{CommittedFunds, PortfolioAllocation};
use crate::models::TransactionKind;

/// Persisted form of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub balance: Decimal,
    #[serde(default)]
    pub committed: CommittedFunds,
    /// Bumped on every deduct/credit
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug)]
struct LedgerState {
    current_balance: Decimal,
    allocation: PortfolioAllocation,
    version: u64,
}

/// Spendable balance of the local wallet.
///
/// The only mutators are [`BalanceLedger::deduct`] and
/// [`BalanceLedger::credit`]; each holds the lock for the check and the
/// increment only, never across an await.
#[derive(Debug)]
pub struct BalanceLedger {
    state: Mutex<LedgerState>,
}

impl BalanceLedger {
    pub fn new(initial_balance: Decimal) -> Self {
        Self::from_snapshot(BalanceSnapshot {
            balance: initial_balance,
            committed: CommittedFunds::default(),
            version: 0,
        })
    }

    pub fn from_snapshot(snapshot: BalanceSnapshot) -> Self {
        let balance = snapshot.balance.max(Decimal::ZERO);
        Self {
            state: Mutex::new(LedgerState {
                current_balance: balance,
                allocation: PortfolioAllocation::new(balance, snapshot.committed),
                version: snapshot.version,
            }),
        }
    }

    /// Atomically check `balance >= amount` and subtract.
    ///
    /// Returns false, leaving the balance untouched, when funds are short or
    /// the amount is not positive.
    pub fn deduct(&self, amount: Decimal, category: TransactionKind) -> bool {
        if amount <= Decimal::ZERO {
            return false;
        }

        let mut state = self.state.lock();
        if state.current_balance < amount {
            warn!(
                available = %state.current_balance,
                required = %amount,
                category = category.as_str(),
                "insufficient balance"
            );
            return false;
        }

        let previous = state.current_balance;
        state.current_balance -= amount;
        state.version += 1;
        let balance = state.current_balance;
        state.allocation.committed.add(category, amount);
        state.allocation.recompute(balance);

        debug!(
            previous = %previous,
            current = %balance,
            category = category.as_str(),
            "balance deducted"
        );
        true
    }

    /// Return funds taken by a deduction that did not go through.
    pub fn credit(&self, amount: Decimal, category: TransactionKind) {
        if amount <= Decimal::ZERO {
            warn!(amount = %amount, "ignoring non-positive credit");
            return;
        }

        let mut state = self.state.lock();
        state.current_balance += amount;
        state.version += 1;
        let balance = state.current_balance;
        state.allocation.committed.release(category, amount);
        state.allocation.recompute(balance);

        debug!(
            current = %balance,
            credited = %amount,
            category = category.as_str(),
            "balance credited"
        );
    }

    pub fn current_balance(&self) -> Decimal {
        self.state.lock().current_balance
    }

    pub fn allocation(&self) -> PortfolioAllocation {
        self.state.lock().allocation.clone()
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        let state = self.state.lock();
        BalanceSnapshot {
            balance: state.current_balance,
            committed: state.allocation.committed.clone(),
            version: state.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_deduct_and_credit() {
        let ledger = BalanceLedger::new(Decimal::from(100));

        assert!(ledger.deduct(Decimal::from(30), TransactionKind::LeagueJoin));
        assert_eq!(ledger.current_balance(), Decimal::from(70));
        assert_eq!(
            ledger.allocation().committed.get(TransactionKind::LeagueJoin),
            Decimal::from(30)
        );

        ledger.credit(Decimal::from(30), TransactionKind::LeagueJoin);
        assert_eq!(ledger.current_balance(), Decimal::from(100));
        assert_eq!(ledger.allocation().committed.total(), Decimal::ZERO);
        assert_eq!(ledger.snapshot().version, 2);
    }

    #[test]
    fn test_insufficient_balance_leaves_state_unchanged() {
        let ledger = BalanceLedger::new(Decimal::from(20));
        let before = ledger.snapshot();

        assert!(!ledger.deduct(Decimal::from(30), TransactionKind::LeagueJoin));
        assert_eq!(ledger.snapshot(), before);
    }

    #[test]
    fn test_exact_balance_can_be_spent() {
        let ledger = BalanceLedger::new(Decimal::new(2550, 2));
        assert!(ledger.deduct(Decimal::new(2550, 2), TransactionKind::VaultFollow));
        assert_eq!(ledger.current_balance(), Decimal::ZERO);
        assert!(!ledger.deduct(Decimal::new(1, 2), TransactionKind::VaultFollow));
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        let ledger = BalanceLedger::new(Decimal::from(10));
        assert!(!ledger.deduct(Decimal::ZERO, TransactionKind::LeagueJoin));
        assert!(!ledger.deduct(Decimal::from(-1), TransactionKind::LeagueJoin));
        ledger.credit(Decimal::from(-5), TransactionKind::LeagueJoin);
        assert_eq!(ledger.current_balance(), Decimal::from(10));
    }

    #[test]
    fn test_concurrent_deducts_never_overdraw() {
        let ledger = Arc::new(BalanceLedger::new(Decimal::from(100)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.deduct(Decimal::from(30), TransactionKind::LeagueJoin))
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 3);
        assert_eq!(ledger.current_balance(), Decimal::from(10));
    }

    #[test]
    fn test_restore_from_snapshot() {
        let ledger = BalanceLedger::new(Decimal::from(500));
        ledger.deduct(Decimal::from(125), TransactionKind::PredictionPlacement);

        let restored = BalanceLedger::from_snapshot(ledger.snapshot());
        assert_eq!(restored.current_balance(), Decimal::from(375));
        assert_eq!(restored.snapshot(), ledger.snapshot());
        assert_eq!(restored.allocation().total_value, Decimal::from(375));
    }
}
