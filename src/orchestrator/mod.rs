//! Transaction Orchestrator
//!
//! Sequences ledger deduction, chain submission and commit/rollback for
//! every intent kind:
//!
//! ```text
//! Created -> Pending -> Success
//!                  \--> Failed (insufficient balance | submission failure)
//! ```
//!
//! Funds are reserved before the network call. A failed submission is
//! always credited back before the record reaches `Failed`.

pub mod error;
pub mod events;
pub mod reconcile;

pub use error::*;
pub use events::*;
pub use reconcile::*;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::chain::{ChainClient, SubmissionError};
use crate::ledger::{BalanceLedger, PortfolioAllocation};
use crate::models::{Config, Intent, Transaction, TransactionKind};
use crate::store::TransactionStore;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ceiling on the submission wait. `None` waits indefinitely.
    pub submission_timeout: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            submission_timeout: None,
            event_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            submission_timeout: config.submission_timeout,
            ..Default::default()
        }
    }
}

pub struct TransactionOrchestrator {
    ledger: Arc<BalanceLedger>,
    chain: Arc<dyn ChainClient>,
    store: Arc<TransactionStore>,
    /// Exactly the records currently in `Pending`
    pending: RwLock<HashMap<String, Transaction>>,
    /// Ids owned by a running `execute`; reconciliation leaves them alone
    in_flight: Mutex<HashSet<String>>,
    events: broadcast::Sender<TransactionEvent>,
    config: OrchestratorConfig,
}

/// Releases an in-flight claim when `execute` returns on any path.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl TransactionOrchestrator {
    pub fn new(
        ledger: Arc<BalanceLedger>,
        chain: Arc<dyn ChainClient>,
        store: Arc<TransactionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            ledger,
            chain,
            store,
            pending: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            events,
            config,
        }
    }

    /// Build the service and reconcile whatever the last run left Pending.
    pub async fn start(
        ledger: Arc<BalanceLedger>,
        chain: Arc<dyn ChainClient>,
        store: Arc<TransactionStore>,
        config: OrchestratorConfig,
    ) -> Result<(Arc<Self>, ReconciliationReport), TransactionError> {
        let orchestrator = Arc::new(Self::new(ledger, chain, store, config));
        let report = orchestrator.reconcile_pending().await?;
        Ok((orchestrator, report))
    }

    pub async fn join_league(
        &self,
        league_id: &str,
        league_name: &str,
        entry_fee: Decimal,
    ) -> Result<Transaction, TransactionError> {
        self.execute(Intent::LeagueJoin {
            league_id: league_id.to_string(),
            league_name: league_name.to_string(),
            entry_fee,
        })
        .await
    }

    pub async fn follow_vault(
        &self,
        vault_id: &str,
        vault_name: &str,
        amount: Decimal,
    ) -> Result<Transaction, TransactionError> {
        self.execute(Intent::VaultFollow {
            vault_id: vault_id.to_string(),
            vault_name: vault_name.to_string(),
            amount,
        })
        .await
    }

    pub async fn place_prediction(
        &self,
        market_id: &str,
        question: &str,
        outcome_index: u32,
        amount: Decimal,
    ) -> Result<Transaction, TransactionError> {
        self.execute(Intent::PredictionPlacement {
            market_id: market_id.to_string(),
            question: question.to_string(),
            outcome_index,
            amount,
        })
        .await
    }

    /// Drive one intent to `Success` or `Failed`.
    ///
    /// Returns the settled record on success. Every error except
    /// `InvalidIntent` leaves a persisted record describing the failure.
    pub async fn execute(&self, intent: Intent) -> Result<Transaction, TransactionError> {
        intent.validate().map_err(TransactionError::InvalidIntent)?;

        let mut tx = Transaction::pending(&intent);
        let _claim = self.claim(&tx.id);

        self.emit(TransactionEvent::Created {
            transaction_id: tx.id.clone(),
            kind: tx.kind,
            amount: tx.amount,
        });

        self.store.upsert(&tx).await?;
        self.pending.write().insert(tx.id.clone(), tx.clone());

        info!(
            tx_id = %tx.id,
            kind = tx.kind.as_str(),
            amount = %tx.amount,
            "transaction pending"
        );
        self.emit(TransactionEvent::Pending {
            transaction_id: tx.id.clone(),
        });

        self.reserve_funds(&mut tx).await?;

        let outcome = self.submit(&tx, &intent).await;
        match outcome {
            Ok(hash) => self.settle_success(tx, hash).await,
            Err(e) => {
                let transaction_id = tx.id.clone();
                self.settle_failure(tx, e.to_string()).await?;
                Err(TransactionError::Submission {
                    transaction_id,
                    source: e,
                })
            }
        }
    }

    async fn reserve_funds(&self, tx: &mut Transaction) -> Result<(), TransactionError> {
        // Ledger mutations and the snapshot that follows them happen under
        // the store writer, so disk and memory always move together.
        let mut writer = self.store.begin().await;
        let available = self.ledger.current_balance();

        if !self.ledger.deduct(tx.amount, tx.kind) {
            let reason = format!(
                "insufficient balance: available {}, required {}",
                available, tx.amount
            );
            tx.mark_failed(reason.clone());
            writer.save(tx, None)?;
            drop(writer);

            self.pending.write().remove(&tx.id);
            info!(tx_id = %tx.id, reason = %reason, "transaction failed");
            self.emit(TransactionEvent::Failed {
                transaction_id: tx.id.clone(),
                reason,
            });

            return Err(TransactionError::InsufficientBalance {
                transaction_id: tx.id.clone(),
                available,
                required: tx.amount,
            });
        }

        tx.funds_reserved = true;
        if let Err(e) = writer.save(tx, Some(&self.ledger.snapshot())) {
            // Disk still shows the record without a reservation.
            self.ledger.credit(tx.amount, tx.kind);
            tx.funds_reserved = false;
            error!(tx_id = %tx.id, error = %e, "failed to persist reservation; funds restored");
            return Err(TransactionError::Storage(e));
        }
        drop(writer);

        let balance_after = self.ledger.current_balance();
        self.pending.write().insert(tx.id.clone(), tx.clone());
        info!(
            tx_id = %tx.id,
            amount = %tx.amount,
            balance_after = %balance_after,
            "funds reserved"
        );
        self.emit(TransactionEvent::FundsReserved {
            transaction_id: tx.id.clone(),
            balance_after,
        });
        Ok(())
    }

    async fn submit(&self, tx: &Transaction, intent: &Intent) -> Result<String, SubmissionError> {
        let Some(limit) = self.config.submission_timeout else {
            return self.chain.submit(intent).await;
        };

        match tokio::time::timeout(limit, self.chain.submit(intent)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    tx_id = %tx.id,
                    timeout_ms = limit.as_millis() as u64,
                    "submission timed out; refunding, though the chain may still accept it"
                );
                Err(SubmissionError::Timeout(limit))
            }
        }
    }

    /// Commit a hash. The hash is checkpointed on the Pending record first
    /// so a crash before the final write can still be reconciled.
    pub(crate) async fn settle_success(
        &self,
        mut tx: Transaction,
        chain_hash: String,
    ) -> Result<Transaction, TransactionError> {
        if tx.chain_hash != chain_hash {
            tx.chain_hash = chain_hash.clone();
            self.store.upsert(&tx).await?;
            self.pending.write().insert(tx.id.clone(), tx.clone());
            info!(tx_id = %tx.id, chain_hash = %chain_hash, "transaction submitted");
            self.emit(TransactionEvent::Submitted {
                transaction_id: tx.id.clone(),
                chain_hash: chain_hash.clone(),
            });
        }

        tx.mark_succeeded(chain_hash.clone());
        self.store.upsert(&tx).await?;
        self.pending.write().remove(&tx.id);

        info!(
            tx_id = %tx.id,
            kind = tx.kind.as_str(),
            amount = %tx.amount,
            chain_hash = %chain_hash,
            "transaction succeeded"
        );
        self.emit(TransactionEvent::Succeeded {
            transaction_id: tx.id.clone(),
            chain_hash,
        });
        Ok(tx)
    }

    /// Credit back any reserved funds and mark the record Failed, as one
    /// durable write.
    pub(crate) async fn settle_failure(
        &self,
        mut tx: Transaction,
        reason: String,
    ) -> Result<Transaction, TransactionError> {
        let mut writer = self.store.begin().await;

        let refund = tx.funds_reserved;
        if refund {
            self.ledger.credit(tx.amount, tx.kind);
        }

        let mut settled = tx.clone();
        settled.mark_failed(reason.clone());
        let snapshot = refund.then(|| self.ledger.snapshot());

        if let Err(e) = writer.save(&settled, snapshot.as_ref()) {
            // Keep memory in line with the still-reserved record on disk.
            if refund && !self.ledger.deduct(tx.amount, tx.kind) {
                error!(
                    tx_id = %tx.id,
                    amount = %tx.amount,
                    "could not re-reserve funds after failed write; ledger and disk disagree"
                );
            }
            error!(tx_id = %tx.id, error = %e, "failed to persist failure; record left pending");
            return Err(TransactionError::Storage(e));
        }
        drop(writer);
        tx = settled;

        self.pending.write().remove(&tx.id);

        if refund {
            let balance_after = self.ledger.current_balance();
            info!(
                tx_id = %tx.id,
                amount = %tx.amount,
                balance_after = %balance_after,
                "funds refunded"
            );
            self.emit(TransactionEvent::Refunded {
                transaction_id: tx.id.clone(),
                amount: tx.amount,
                balance_after,
            });
        }

        warn!(tx_id = %tx.id, reason = %reason, "transaction failed");
        self.emit(TransactionEvent::Failed {
            transaction_id: tx.id.clone(),
            reason,
        });
        Ok(tx)
    }

    fn claim(&self, id: &str) -> InFlightGuard<'_> {
        self.in_flight.lock().insert(id.to_string());
        InFlightGuard {
            set: &self.in_flight,
            id: id.to_string(),
        }
    }

    pub(crate) fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.lock().contains(id)
    }

    pub(crate) fn emit(&self, event: TransactionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.events.subscribe()
    }

    pub fn balance(&self) -> Decimal {
        self.ledger.current_balance()
    }

    pub fn allocation(&self) -> PortfolioAllocation {
        self.ledger.allocation()
    }

    /// Full history, most recent first.
    pub async fn transactions(&self) -> Vec<Transaction> {
        self.store.load_all().await
    }

    pub async fn transactions_of_kind(&self, kind: TransactionKind) -> Vec<Transaction> {
        self.store.of_kind(kind).await
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        let mut pending: Vec<_> = self.pending.read().values().cloned().collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pending
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.read().contains_key(id)
    }

    /// Drop the whole history and the pending set. Balance is untouched.
    pub async fn clear_history(&self) -> Result<(), TransactionError> {
        self.store.clear().await?;
        self.pending.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainStatus;
    use crate::models::TransactionStatus;

    /// Chain that answers every submission the same way
    struct FixedChain {
        result: Result<String, SubmissionError>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ChainClient for FixedChain {
        async fn submit(&self, _intent: &Intent) -> Result<String, SubmissionError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }

        async fn poll_status(&self, _hash: &str) -> ChainStatus {
            ChainStatus::Pending
        }
    }

    fn orchestrator(
        balance: i64,
        result: Result<String, SubmissionError>,
        config: OrchestratorConfig,
    ) -> TransactionOrchestrator {
        TransactionOrchestrator::new(
            Arc::new(BalanceLedger::new(Decimal::from(balance))),
            Arc::new(FixedChain {
                result,
                delay: Duration::from_millis(20),
            }),
            Arc::new(TransactionStore::open_in_memory().unwrap()),
            config,
        )
    }

    fn drain(rx: &mut broadcast::Receiver<TransactionEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_success_emits_every_transition() {
        let orch = orchestrator(100, Ok("0xabc".to_string()), Default::default());
        let mut rx = orch.subscribe();

        let tx = orch
            .join_league("l-1", "Global League", Decimal::from(30))
            .await
            .unwrap();

        assert_eq!(tx.status, TransactionStatus::Success);
        assert_eq!(tx.chain_hash, "0xabc");
        assert_eq!(tx.description, "Joined Global League");
        assert_eq!(orch.balance(), Decimal::from(70));
        assert!(orch.pending_transactions().is_empty());
        assert_eq!(
            drain(&mut rx),
            vec!["created", "pending", "funds_reserved", "submitted", "succeeded"]
        );
    }

    #[tokio::test]
    async fn test_insufficient_balance_skips_network() {
        let orch = orchestrator(20, Ok("0xabc".to_string()), Default::default());
        let mut rx = orch.subscribe();

        let err = orch
            .follow_vault("v-1", "Delta Vault", Decimal::from(30))
            .await
            .unwrap_err();

        assert!(matches!(err, TransactionError::InsufficientBalance { .. }));
        let id = err.transaction_id().unwrap().to_string();
        let stored = orch.store.get(&id).await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert!(stored.chain_hash.is_empty());
        assert!(!stored.funds_reserved);
        assert_eq!(stored.description, "Failed: Delta Vault");
        assert_eq!(
            stored.failure_reason.as_deref(),
            Some("insufficient balance: available 20, required 30")
        );
        assert_eq!(orch.balance(), Decimal::from(20));
        assert_eq!(drain(&mut rx), vec!["created", "pending", "failed"]);
    }

    #[tokio::test]
    async fn test_submission_failure_refunds() {
        let orch = orchestrator(
            100,
            Err(SubmissionError::Network("connection reset".to_string())),
            Default::default(),
        );
        let mut rx = orch.subscribe();

        let err = orch
            .place_prediction("m-1", "APT above $10?", 0, Decimal::from(40))
            .await
            .unwrap_err();

        assert!(matches!(err, TransactionError::Submission { .. }));
        assert_eq!(orch.balance(), Decimal::from(100));
        assert_eq!(orch.allocation().committed.total(), Decimal::ZERO);

        let stored = orch.transactions().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, TransactionStatus::Failed);
        assert_eq!(stored[0].description, "Failed: Prediction");
        assert_eq!(
            drain(&mut rx),
            vec!["created", "pending", "funds_reserved", "refunded", "failed"]
        );

        let snapshot = orch.store.load_balance().await.unwrap().unwrap();
        assert_eq!(snapshot.balance, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_timeout_is_treated_as_failure() {
        let orch = TransactionOrchestrator::new(
            Arc::new(BalanceLedger::new(Decimal::from(100))),
            Arc::new(FixedChain {
                result: Ok("0xlate".to_string()),
                delay: Duration::from_secs(5),
            }),
            Arc::new(TransactionStore::open_in_memory().unwrap()),
            OrchestratorConfig {
                submission_timeout: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );

        let err = orch
            .join_league("l-1", "Slow League", Decimal::from(10))
            .await
            .unwrap_err();

        match err {
            TransactionError::Submission { source, .. } => {
                assert_eq!(source, SubmissionError::Timeout(Duration::from_millis(10)))
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(orch.balance(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_invalid_intent_leaves_no_record() {
        let orch = orchestrator(100, Ok("0xabc".to_string()), Default::default());

        let err = orch
            .join_league("", "Nameless", Decimal::from(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidIntent(_)));

        let err = orch
            .join_league("l-1", "Free", Decimal::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidIntent(_)));

        assert!(orch.transactions().await.is_empty());
        assert_eq!(orch.balance(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_unrepresentable_amount_is_invalid() {
        let orch = orchestrator(100, Ok("0xabc".to_string()), Default::default());
        let mut rx = orch.subscribe();

        let err = orch
            .join_league("l-1", "Dust League", Decimal::new(5, 7))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidIntent(_)));

        let err = orch
            .follow_vault("v-1", "Whale Vault", Decimal::from(20_000_000_000_000u64))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidIntent(_)));

        let err = orch
            .place_prediction("m-1", "Max?", 0, Decimal::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidIntent(_)));

        assert!(orch.transactions().await.is_empty());
        assert_eq!(orch.balance(), Decimal::from(100));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_failed_reservation_write_restores_funds() {
        let orch = orchestrator(100, Ok("0xabc".to_string()), Default::default());
        orch.store.save_balance(&orch.ledger.snapshot()).await.unwrap();
        let stored_before = orch.store.load_balance().await.unwrap();

        let mut tx = Transaction::pending(&Intent::LeagueJoin {
            league_id: "l-1".to_string(),
            league_name: "Locked League".to_string(),
            entry_fee: Decimal::from(30),
        });
        // A settled copy on disk makes the reservation write fail.
        let mut settled = tx.clone();
        settled.mark_failed("settled elsewhere".to_string());
        orch.store.upsert(&settled).await.unwrap();
        orch.pending.write().insert(tx.id.clone(), tx.clone());

        let err = orch.reserve_funds(&mut tx).await.unwrap_err();

        assert!(matches!(err, TransactionError::Storage(_)));
        assert!(!tx.funds_reserved);
        assert_eq!(orch.balance(), Decimal::from(100));
        assert_eq!(orch.allocation().committed.total(), Decimal::ZERO);
        assert_eq!(orch.store.load_balance().await.unwrap(), stored_before);
        assert_eq!(orch.store.get(&tx.id).await.unwrap(), settled);
        assert!(!orch.pending.read()[&tx.id].funds_reserved);
    }

    #[tokio::test]
    async fn test_failed_refund_write_keeps_reservation() {
        let orch = orchestrator(100, Ok("0xabc".to_string()), Default::default());

        let mut tx = Transaction::pending(&Intent::VaultFollow {
            vault_id: "v-1".to_string(),
            vault_name: "Delta Vault".to_string(),
            amount: Decimal::from(30),
        });
        assert!(orch.ledger.deduct(tx.amount, tx.kind));
        tx.funds_reserved = true;
        orch.store.save_balance(&orch.ledger.snapshot()).await.unwrap();
        let stored_before = orch.store.load_balance().await.unwrap();

        let mut settled = tx.clone();
        settled.mark_succeeded("0xdone".to_string());
        orch.store.upsert(&settled).await.unwrap();
        orch.pending.write().insert(tx.id.clone(), tx.clone());
        let mut rx = orch.subscribe();

        let err = orch
            .settle_failure(tx.clone(), "operator gave up".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, TransactionError::Storage(_)));
        assert_eq!(orch.balance(), Decimal::from(70));
        assert_eq!(
            orch.allocation().committed.get(TransactionKind::VaultFollow),
            Decimal::from(30)
        );
        assert_eq!(orch.store.load_balance().await.unwrap(), stored_before);
        assert_eq!(orch.store.get(&tx.id).await.unwrap(), settled);
        assert!(orch.is_pending(&tx.id));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_clear_history_keeps_balance() {
        let orch = orchestrator(100, Ok("0xabc".to_string()), Default::default());
        orch.join_league("l-1", "Global League", Decimal::from(30))
            .await
            .unwrap();

        orch.clear_history().await.unwrap();

        assert!(orch.transactions().await.is_empty());
        assert!(orch.pending_transactions().is_empty());
        assert_eq!(orch.balance(), Decimal::from(70));
    }

    #[tokio::test]
    async fn test_history_by_kind() {
        let orch = orchestrator(1_000, Ok("0xabc".to_string()), Default::default());
        orch.join_league("l-1", "A", Decimal::from(1)).await.unwrap();
        orch.follow_vault("v-1", "B", Decimal::from(2)).await.unwrap();
        orch.follow_vault("v-2", "C", Decimal::from(3)).await.unwrap();

        let vaults = orch.transactions_of_kind(TransactionKind::VaultFollow).await;
        assert_eq!(vaults.len(), 2);
        assert_eq!(vaults[0].description, "Followed C");
        assert_eq!(
            orch.allocation().committed.get(TransactionKind::VaultFollow),
            Decimal::from(5)
        );
    }
}
