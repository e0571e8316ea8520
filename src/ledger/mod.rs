//! Balance Ledger - Local Spendable Balance
//!
//! Holds the wallet's spendable balance and its portfolio allocation.
//! Deduct is a critical section: check-then-subtract under one lock.

pub mod allocation;
pub mod balance;

pub use allocation::*;
pub use balance::*;
