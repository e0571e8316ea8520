use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::kv::KvStore;
use crate::ledger::BalanceSnapshot;
use crate::models::{Transaction, TransactionKind};

/// Fixed key of the serialized transaction list
pub const TRANSACTIONS_KEY: &str = "transactions";
/// Fixed key of the ledger snapshot
pub const BALANCE_KEY: &str = "balance";

const FORMAT_VERSION: u32 = 1;

/// Self-describing envelope around the ordered list
#[derive(Debug, Serialize, Deserialize)]
struct TransactionLog {
    format_version: u32,
    /// Most recent first
    transactions: Vec<Transaction>,
}

struct StoreState {
    kv: KvStore,
    records: Vec<Transaction>,
    /// Version of the stored balance snapshot
    balance_version: Option<u64>,
}

/// Durable mapping from transaction id to its current record.
///
/// All writes go through one lock, so writes to the same id are serialized
/// and a record and the ledger snapshot taken with it land together.
pub struct TransactionStore {
    state: Mutex<StoreState>,
}

/// Exclusive write access to the store
pub struct StoreWriter<'a> {
    state: MutexGuard<'a, StoreState>,
}

impl TransactionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        Self::from_kv(KvStore::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_kv(KvStore::open_in_memory()?)
    }

    fn from_kv(kv: KvStore) -> Result<Self> {
        let records = match kv.get(TRANSACTIONS_KEY)? {
            Some(raw) => decode_log(&raw)?,
            None => Vec::new(),
        };

        let balance_version = match kv.get(BALANCE_KEY)? {
            Some(raw) => Some(decode_balance(&raw)?.version),
            None => None,
        };

        info!(count = records.len(), "loaded transactions from storage");

        Ok(Self {
            state: Mutex::new(StoreState {
                kv,
                records,
                balance_version,
            }),
        })
    }

    pub async fn begin(&self) -> StoreWriter<'_> {
        StoreWriter {
            state: self.state.lock().await,
        }
    }

    /// Append a new record or replace the stored one with the same id.
    pub async fn upsert(&self, tx: &Transaction) -> Result<()> {
        self.begin().await.save(tx, None)
    }

    /// Every record, most recent first.
    pub async fn load_all(&self) -> Vec<Transaction> {
        self.state.lock().await.records.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Transaction> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub async fn of_kind(&self, kind: TransactionKind) -> Vec<Transaction> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .filter(|t| t.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn load_balance(&self) -> Result<Option<BalanceSnapshot>> {
        let state = self.state.lock().await;
        match state.kv.get(BALANCE_KEY)? {
            Some(raw) => Ok(Some(decode_balance(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store a ledger snapshot unless a newer one is already stored.
    pub async fn save_balance(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_stale(snapshot) {
            return Ok(());
        }
        let raw = serde_json::to_string(snapshot)?;
        state.kv.put(BALANCE_KEY, raw)?;
        state.balance_version = Some(snapshot.version);
        Ok(())
    }

    /// Rewrite the current list unchanged.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let raw = encode_log(&state.records)?;
        state.kv.put(TRANSACTIONS_KEY, raw)
    }

    /// Drop every record. The balance snapshot is left alone.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.kv.delete(TRANSACTIONS_KEY)?;
        let cleared = state.records.len();
        state.records.clear();
        info!(cleared, "cleared all transactions");
        Ok(())
    }
}

impl StoreWriter<'_> {
    /// Persist `tx`, plus the ledger snapshot when given, in one write.
    ///
    /// Rejects changes to a settled record and changes to `kind` or
    /// `amount`. The in-memory list only changes once the write commits.
    pub fn save(&mut self, tx: &Transaction, balance: Option<&BalanceSnapshot>) -> Result<()> {
        let mut records = self.state.records.clone();

        match records.iter().position(|t| t.id == tx.id) {
            Some(idx) => {
                check_update(&records[idx], tx)?;
                records[idx] = tx.clone();
            }
            None => records.insert(0, tx.clone()),
        }

        let balance = balance.filter(|snapshot| !self.state.is_stale(snapshot));

        let mut entries = vec![(TRANSACTIONS_KEY, encode_log(&records)?)];
        if let Some(snapshot) = balance {
            entries.push((BALANCE_KEY, serde_json::to_string(snapshot)?));
        }
        self.state.kv.put_all(&entries)?;
        self.state.records = records;
        if let Some(snapshot) = balance {
            self.state.balance_version = Some(snapshot.version);
        }

        debug!(
            tx_id = %tx.id,
            status = tx.status.as_str(),
            with_balance = balance.is_some(),
            "transaction persisted"
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.state.records.iter().find(|t| t.id == id)
    }
}

impl StoreState {
    fn is_stale(&self, snapshot: &BalanceSnapshot) -> bool {
        matches!(self.balance_version, Some(stored) if stored > snapshot.version)
    }
}

fn decode_balance(raw: &str) -> Result<BalanceSnapshot> {
    serde_json::from_str(raw).context("decode balance snapshot")
}

fn check_update(current: &Transaction, next: &Transaction) -> Result<()> {
    if current.kind != next.kind || current.amount != next.amount {
        bail!("transaction {} kind/amount are immutable", current.id);
    }
    if current.status.is_terminal() && current != next {
        return Err(anyhow!(
            "transaction {} already settled as {}",
            current.id,
            current.status.as_str()
        ));
    }
    Ok(())
}

fn encode_log(records: &[Transaction]) -> Result<String> {
    let log = TransactionLog {
        format_version: FORMAT_VERSION,
        transactions: records.to_vec(),
    };
    serde_json::to_string(&log).context("encode transaction log")
}

fn decode_log(raw: &str) -> Result<Vec<Transaction>> {
    let log: TransactionLog = serde_json::from_str(raw).context("decode transaction log")?;
    if log.format_version != FORMAT_VERSION {
        bail!(
            "unsupported transaction log version {} (expected {})",
            log.format_version,
            FORMAT_VERSION
        );
    }
    Ok(log.transactions)
}
