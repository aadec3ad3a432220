use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::LedgerError;
use crate::models::transaction::{
    DisbursementClaim, LedgerState, NewTransaction, PaymentStatus, Transaction, TransitionFields,
};
use crate::services::ledger::TransactionLedger;

#[derive(Default)]
struct Tables {
    rows: HashMap<Uuid, Transaction>,
    by_reference: HashMap<String, Uuid>,
    by_provider_reference: HashMap<String, Uuid>,
}

impl Tables {
    fn insert(&mut self, tx: Transaction) -> Result<Transaction, LedgerError> {
        if self.by_reference.contains_key(&tx.transaction_reference) {
            return Err(LedgerError::DuplicateReference(tx.transaction_reference));
        }
        self.by_reference
            .insert(tx.transaction_reference.clone(), tx.id);
        self.rows.insert(tx.id, tx.clone());
        Ok(tx)
    }

    fn row(&self, id: Uuid) -> Result<&Transaction, LedgerError> {
        self.rows.get(&id).ok_or(LedgerError::NotFound(id))
    }
}

/// A ledger held in process memory, with hash indexes for both reference lookups.
///
/// A single write lock serializes mutations, which gives the same
/// compare-and-set semantics as the MongoDB ledger. Used by tests and local runs.
#[derive(Default, Clone)]
pub struct InMemoryLedger {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TransactionLedger for InMemoryLedger {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, LedgerError> {
        let mut tables = self.tables.write().await;
        tables.insert(Transaction::new(new, Utc::now()))
    }

    async fn insert_settled_entry(
        &self,
        entry: NewTransaction,
        source_id: Uuid,
    ) -> Result<Transaction, LedgerError> {
        let mut tables = self.tables.write().await;
        tables.row(source_id)?;
        tables.insert(Transaction::settled_entry(entry, source_id, Utc::now()))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables.rows.get(&id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Transaction>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_reference
            .get(reference)
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    async fn find_by_provider_reference(
        &self,
        mobile_money_reference: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_provider_reference
            .get(mobile_money_reference)
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    async fn find_by_source(&self, source_id: Uuid) -> Result<Vec<Transaction>, LedgerError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Transaction> = tables
            .rows
            .values()
            .filter(|tx| tx.source_transaction_id == Some(source_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: LedgerState,
        next: LedgerState,
        fields: TransitionFields,
    ) -> Result<Transaction, LedgerError> {
        let mut tables = self.tables.write().await;
        let updated = tables.row(id)?.advanced(expected, next, &fields, Utc::now())?;

        if let Some(reference) = &fields.mobile_money_reference {
            if tables.by_provider_reference.contains_key(reference) {
                return Err(LedgerError::DuplicateProviderReference(reference.clone()));
            }
            tables.by_provider_reference.insert(reference.clone(), id);
        }

        tables.rows.insert(id, updated.clone());
        Ok(updated)
    }

    async fn reserve_collection_reference(
        &self,
        id: Uuid,
        provider_reference: &str,
    ) -> Result<Transaction, LedgerError> {
        let mut tables = self.tables.write().await;
        let reserved = tables.row(id)?.reserved(provider_reference, Utc::now())?;
        tables.rows.insert(id, reserved.clone());
        Ok(reserved)
    }

    async fn claim_disbursement(
        &self,
        id: Uuid,
        claim: &DisbursementClaim,
    ) -> Result<Transaction, LedgerError> {
        let mut tables = self.tables.write().await;
        let claimed = tables.row(id)?.claimed(claim, Utc::now())?;
        tables.rows.insert(id, claimed.clone());
        Ok(claimed)
    }

    async fn record_disbursement_reference(
        &self,
        id: Uuid,
        claim_reference: &str,
        provider_reference: &str,
    ) -> Result<Transaction, LedgerError> {
        let mut tables = self.tables.write().await;
        let recorded = tables.row(id)?.with_disbursement_reference(
            claim_reference,
            provider_reference,
            Utc::now(),
        )?;
        tables.rows.insert(id, recorded.clone());
        Ok(recorded)
    }

    async fn release_disbursement_claim(
        &self,
        id: Uuid,
        reference: &str,
    ) -> Result<Transaction, LedgerError> {
        let mut tables = self.tables.write().await;
        let released = tables.row(id)?.unclaimed(reference, Utc::now())?;
        tables.rows.insert(id, released.clone());
        Ok(released)
    }

    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let tables = self.tables.read().await;
        let mut stale: Vec<Transaction> = tables
            .rows
            .values()
            .filter(|tx| tx.payment_status == PaymentStatus::Processing)
            .filter(|tx| tx.processing_since.is_some_and(|since| since <= older_than))
            .cloned()
            .collect();
        stale.sort_by_key(|tx| tx.processing_since);
        stale.truncate(limit);
        Ok(stale)
    }
}
