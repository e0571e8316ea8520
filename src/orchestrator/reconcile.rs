//! Restart reconciliation
//!
//! A record found `Pending` in the store means the previous run stopped
//! mid-flight. Records with a hash are polled on the chain; records without
//! one cannot be resolved automatically and are reported as unknown until
//! an operator settles them with [`TransactionOrchestrator::resolve_unknown`].

use serde::Serialize;
use tracing::{info, warn};

use super::{ReconciliationError, TransactionError, TransactionEvent, TransactionOrchestrator};
use crate::chain::ChainStatus;
use crate::models::Transaction;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    Succeeded { chain_hash: String },
    Failed { refunded: bool },
    Unknown { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciledTransaction {
    pub transaction_id: String,
    pub outcome: ReconciliationOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub entries: Vec<ReconciledTransaction>,
}

impl ReconciliationReport {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, ReconciliationOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ReconciliationOutcome::Failed { .. }))
    }

    pub fn unknown(&self) -> usize {
        self.count(|o| matches!(o, ReconciliationOutcome::Unknown { .. }))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn count(&self, pred: impl Fn(&ReconciliationOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

/// Operator decision for a transaction reconciliation could not settle
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Succeeded { chain_hash: String },
    Failed { reason: String },
}

impl TransactionOrchestrator {
    /// Rebuild the pending set from the store and try to settle each entry.
    pub async fn reconcile_pending(&self) -> Result<ReconciliationReport, TransactionError> {
        let stale: Vec<Transaction> = self
            .store
            .load_all()
            .await
            .into_iter()
            .filter(|t| t.is_pending() && !self.is_in_flight(&t.id))
            .collect();

        {
            let mut pending = self.pending.write();
            for tx in &stale {
                pending.insert(tx.id.clone(), tx.clone());
            }
        }

        let mut report = ReconciliationReport::default();
        if stale.is_empty() {
            return Ok(report);
        }

        info!(count = stale.len(), "reconciling pending transactions");

        for tx in stale {
            let transaction_id = tx.id.clone();
            let outcome = self.reconcile_one(tx).await?;
            report.entries.push(ReconciledTransaction {
                transaction_id,
                outcome,
            });
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            unknown = report.unknown(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_one(&self, tx: Transaction) -> Result<ReconciliationOutcome, TransactionError> {
        if !tx.has_hash() {
            return Ok(self.report_unknown(&tx, ReconciliationError::MissingHash));
        }

        let chain_hash = tx.chain_hash.clone();
        match self.chain.poll_status(&chain_hash).await {
            ChainStatus::Success => {
                self.settle_success(tx, chain_hash.clone()).await?;
                Ok(ReconciliationOutcome::Succeeded { chain_hash })
            }
            ChainStatus::Failed => {
                let refunded = tx.funds_reserved;
                self.settle_failure(tx, format!("chain reported {} as failed", chain_hash))
                    .await?;
                Ok(ReconciliationOutcome::Failed { refunded })
            }
            ChainStatus::Pending => Ok(self.report_unknown(
                &tx,
                ReconciliationError::StillPending { chain_hash },
            )),
        }
    }

    fn report_unknown(&self, tx: &Transaction, reason: ReconciliationError) -> ReconciliationOutcome {
        let reason = reason.to_string();
        warn!(
            tx_id = %tx.id,
            funds_reserved = tx.funds_reserved,
            reason = %reason,
            "transaction status unknown; left pending"
        );
        self.emit(TransactionEvent::ReconciliationUnknown {
            transaction_id: tx.id.clone(),
            reason: reason.clone(),
        });
        ReconciliationOutcome::Unknown { reason }
    }

    /// Settle a transaction reconciliation reported as unknown.
    ///
    /// Applies the same rules as a live run: success keeps the deduction,
    /// failure credits it back if it was taken.
    pub async fn resolve_unknown(
        &self,
        id: &str,
        resolution: Resolution,
    ) -> Result<Transaction, TransactionError> {
        if self.is_in_flight(id) {
            return Err(TransactionError::NotPending(id.to_string()));
        }
        let tx = self
            .pending
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TransactionError::NotPending(id.to_string()))?;

        info!(tx_id = %id, resolution = ?resolution, "resolving transaction by hand");

        match resolution {
            Resolution::Succeeded { .. } if !tx.funds_reserved => {
                // Submission only happens after the reservation is durable.
                Err(TransactionError::InvalidIntent(format!(
                    "transaction {} never reserved funds and cannot have succeeded",
                    id
                )))
            }
            Resolution::Succeeded { chain_hash } => self.settle_success(tx, chain_hash).await,
            Resolution::Failed { reason } => self.settle_failure(tx, reason).await,
        }
    }

    /// Current unknown entries as errors, for callers that want to surface them.
    pub fn unresolved(&self) -> Vec<TransactionError> {
        self.pending_transactions()
            .into_iter()
            .filter(|t| !self.is_in_flight(&t.id))
            .map(|t| TransactionError::Reconciliation {
                source: if t.has_hash() {
                    ReconciliationError::StillPending {
                        chain_hash: t.chain_hash.clone(),
                    }
                } else {
                    ReconciliationError::MissingHash
                },
                transaction_id: t.id,
            })
            .collect()
    }
}
