//! Transaction Store
//!
//! SQLite-backed key-value table holding the serialized transaction list
//! and the ledger snapshot under fixed keys.

pub mod kv;
pub mod transactions;

pub use kv::KvStore;
pub use transactions::*;
