// services/ledger.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::LedgerError;
use crate::models::transaction::{
    DisbursementClaim, LedgerState, NewTransaction, Transaction, TransitionFields,
};

/// The durable record of every money movement attempt.
///
/// Rows are never deleted, and every mutation of lifecycle fields goes
/// through [`TransactionLedger::transition`], a compare-and-set on the
/// `(payment_status, escrow_status)` pair. Concurrent webhook handlers and
/// the reconciliation sweep rely on it: whoever loses the race gets
/// [`LedgerError::StaleState`] and re-reads.
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Inserts a new row in `pending`. The reference must be unused.
    async fn create(&self, new: NewTransaction) -> Result<Transaction, LedgerError>;

    /// Inserts a commission or refund row, already settled and linked to its source.
    async fn insert_settled_entry(
        &self,
        entry: NewTransaction,
        source_id: Uuid,
    ) -> Result<Transaction, LedgerError>;

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, LedgerError>;

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Transaction>, LedgerError>;

    /// Hot path for webhook ingestion.
    async fn find_by_provider_reference(
        &self,
        mobile_money_reference: &str,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// Rows whose `source_transaction_id` points at `source_id`.
    async fn find_by_source(&self, source_id: Uuid) -> Result<Vec<Transaction>, LedgerError>;

    async fn transition(
        &self,
        id: Uuid,
        expected: LedgerState,
        next: LedgerState,
        fields: TransitionFields,
    ) -> Result<Transaction, LedgerError>;

    /// Records the provider reference of a `pending` row's collection before it is sent.
    ///
    /// Set-if-absent: a second reservation fails with [`LedgerError::ClaimUnavailable`].
    async fn reserve_collection_reference(
        &self,
        id: Uuid,
        provider_reference: &str,
    ) -> Result<Transaction, LedgerError>;

    /// Reserves the single disbursement slot of a held row.
    ///
    /// Succeeds only while the row is `completed/held` and carries no claim.
    async fn claim_disbursement(
        &self,
        id: Uuid,
        claim: &DisbursementClaim,
    ) -> Result<Transaction, LedgerError>;

    /// Records the provider reference a claimed disbursement is sent under, before it is sent.
    async fn record_disbursement_reference(
        &self,
        id: Uuid,
        claim_reference: &str,
        provider_reference: &str,
    ) -> Result<Transaction, LedgerError>;

    /// Gives a claim back once the provider is known not to have paid it.
    async fn release_disbursement_claim(
        &self,
        id: Uuid,
        reference: &str,
    ) -> Result<Transaction, LedgerError>;

    /// `processing` rows that entered that state at or before `older_than`, oldest first.
    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError>;
}
