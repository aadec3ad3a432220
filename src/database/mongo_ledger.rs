use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::TryStreamExt;
use rust_decimal::Decimal;
use mongodb::{
    bson::{doc, Bson, Document},
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument},
    Collection, Database, IndexModel,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::LedgerError;
use crate::models::transaction::{
    DisbursementClaim, DisbursementPurpose, EscrowStatus, LedgerState, NewTransaction,
    PaymentMethod, PaymentStatus, Transaction, TransactionType, TransitionFields,
};
use crate::services::ledger::TransactionLedger;

const COLLECTION: &str = "transactions";
const DUPLICATE_KEY: i32 = 11000;

/// Stored shape of a [`Transaction`]. Ids are strings and timestamps are epoch millis
/// so range queries on `processing_since` compare numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub transaction_reference: String,
    pub renter_id: String,
    pub landlord_id: String,
    pub property_id: String,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub escrow_status: Option<EscrowStatus>,

    #[serde(default)]
    pub reserved_provider_reference: Option<String>,
    // sparse unique index: absent, never null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_money_reference: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub callback_received: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub source_transaction_id: Option<String>,
    #[serde(default)]
    pub disbursement_reference: Option<String>,
    #[serde(default)]
    pub disbursement_provider_reference: Option<String>,
    #[serde(default)]
    pub disbursement_purpose: Option<DisbursementPurpose>,
    #[serde(default)]
    pub disbursement_amount: Option<i64>,
    /// Decimal as a string.
    #[serde(default)]
    pub disbursement_rate: Option<String>,
    #[serde(default)]
    pub disbursement_claimed_at: Option<i64>,
    #[serde(default)]
    pub disbursement_attempts: i64,

    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub processing_since: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| LedgerError::Storage(format!("invalid timestamp {}", ms)))
}

fn parse_rate(raw: &str) -> Result<Decimal, LedgerError> {
    raw.parse()
        .map_err(|e| LedgerError::Storage(format!("invalid rate {}: {}", raw, e)))
}

fn parse_id(raw: &str) -> Result<Uuid, LedgerError> {
    Uuid::parse_str(raw).map_err(|e| LedgerError::Storage(format!("invalid id {}: {}", raw, e)))
}

impl From<&Transaction> for TransactionDocument {
    fn from(tx: &Transaction) -> Self {
        TransactionDocument {
            id: tx.id.to_string(),
            transaction_reference: tx.transaction_reference.clone(),
            renter_id: tx.renter_id.clone(),
            landlord_id: tx.landlord_id.clone(),
            property_id: tx.property_id.clone(),
            transaction_type: tx.transaction_type,
            amount: tx.amount,
            currency: tx.currency.clone(),
            payment_method: tx.payment_method,
            payment_status: tx.payment_status,
            escrow_status: tx.escrow_status,
            reserved_provider_reference: tx.reserved_provider_reference.clone(),
            mobile_money_reference: tx.mobile_money_reference.clone(),
            external_id: tx.external_id.clone(),
            callback_received: tx.callback_received,
            failure_reason: tx.failure_reason.clone(),
            source_transaction_id: tx.source_transaction_id.map(|id| id.to_string()),
            disbursement_reference: tx.disbursement_reference.clone(),
            disbursement_provider_reference: tx.disbursement_provider_reference.clone(),
            disbursement_purpose: tx.disbursement_purpose,
            disbursement_amount: tx.disbursement_amount,
            disbursement_rate: tx.disbursement_rate.map(|rate| rate.to_string()),
            disbursement_claimed_at: tx.disbursement_claimed_at.map(millis),
            disbursement_attempts: i64::from(tx.disbursement_attempts),
            created_at: millis(tx.created_at),
            updated_at: millis(tx.updated_at),
            processing_since: tx.processing_since.map(millis),
            completed_at: tx.completed_at.map(millis),
        }
    }
}

impl TryFrom<TransactionDocument> for Transaction {
    type Error = LedgerError;

    fn try_from(doc: TransactionDocument) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: parse_id(&doc.id)?,
            transaction_reference: doc.transaction_reference,
            renter_id: doc.renter_id,
            landlord_id: doc.landlord_id,
            property_id: doc.property_id,
            transaction_type: doc.transaction_type,
            amount: doc.amount,
            currency: doc.currency,
            payment_method: doc.payment_method,
            payment_status: doc.payment_status,
            escrow_status: doc.escrow_status,
            reserved_provider_reference: doc.reserved_provider_reference,
            mobile_money_reference: doc.mobile_money_reference,
            external_id: doc.external_id,
            callback_received: doc.callback_received,
            failure_reason: doc.failure_reason,
            source_transaction_id: doc
                .source_transaction_id
                .as_deref()
                .map(parse_id)
                .transpose()?,
            disbursement_reference: doc.disbursement_reference,
            disbursement_provider_reference: doc.disbursement_provider_reference,
            disbursement_purpose: doc.disbursement_purpose,
            disbursement_amount: doc.disbursement_amount,
            disbursement_rate: doc.disbursement_rate.as_deref().map(parse_rate).transpose()?,
            disbursement_claimed_at: doc.disbursement_claimed_at.map(from_millis).transpose()?,
            disbursement_attempts: u32::try_from(doc.disbursement_attempts).unwrap_or(u32::MAX),
            created_at: from_millis(doc.created_at)?,
            updated_at: from_millis(doc.updated_at)?,
            processing_since: doc.processing_since.map(from_millis).transpose()?,
            completed_at: doc.completed_at.map(from_millis).transpose()?,
        })
    }
}

fn escrow_bson(escrow: Option<EscrowStatus>) -> Bson {
    match escrow {
        Some(status) => Bson::String(status.as_str().to_string()),
        None => Bson::Null,
    }
}

/// Filter matching one row in exactly the given state.
fn state_filter(id: Uuid, state: LedgerState) -> Document {
    doc! {
        "_id": id.to_string(),
        "payment_status": state.payment_status.as_str(),
        "escrow_status": escrow_bson(state.escrow_status),
    }
}

/// Why a filtered update matched nothing, from the same check the in-memory ledger runs.
fn missed(id: Uuid, check: Result<Transaction, LedgerError>) -> LedgerError {
    match check {
        Err(e) => e,
        Ok(_) => LedgerError::ClaimUnavailable {
            id,
            reason: "row changed during the update".to_string(),
        },
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// `$set` document for the fields a transition actually writes.
///
/// Only these fields are written; anything else on the row (the disbursement
/// claim in particular) may have changed concurrently without a state change.
fn transition_update(before: &Transaction, after: &Transaction, fields: &TransitionFields) -> Document {
    let mut set = doc! {
        "payment_status": after.payment_status.as_str(),
        "escrow_status": escrow_bson(after.escrow_status),
        "updated_at": millis(after.updated_at),
    };
    if let Some(reference) = &fields.mobile_money_reference {
        set.insert("mobile_money_reference", reference.clone());
    }
    if let Some(external_id) = &fields.external_id {
        set.insert("external_id", external_id.clone());
    }
    if fields.callback_received {
        set.insert("callback_received", true);
    }
    if let Some(reason) = &fields.failure_reason {
        set.insert("failure_reason", reason.clone());
    }
    if after.processing_since != before.processing_since {
        if let Some(since) = after.processing_since {
            set.insert("processing_since", millis(since));
        }
    }
    if after.completed_at != before.completed_at {
        if let Some(at) = after.completed_at {
            set.insert("completed_at", millis(at));
        }
    }
    doc! { "$set": set }
}

#[derive(Clone)]
pub struct MongoLedger {
    collection: Collection<TransactionDocument>,
}

impl MongoLedger {
    pub fn new(db: &Database) -> Self {
        MongoLedger {
            collection: db.collection(COLLECTION),
        }
    }

    /// Creates the uniqueness and sweep indexes. Safe to run on every boot.
    pub async fn ensure_indexes(&self) -> Result<(), LedgerError> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "transaction_reference": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "mobile_money_reference": 1 })
                .options(IndexOptions::builder().unique(true).sparse(true).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "payment_status": 1, "processing_since": 1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "source_transaction_id": 1 })
                .build(),
        ];
        self.collection.create_indexes(indexes).await?;
        info!(collection = COLLECTION, "Ledger indexes ensured");
        Ok(())
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Transaction>, LedgerError> {
        match self.collection.find_one(filter).await? {
            Some(doc) => Ok(Some(Transaction::try_from(doc)?)),
            None => Ok(None),
        }
    }

    async fn require(&self, id: Uuid) -> Result<Transaction, LedgerError> {
        self.get(id).await?.ok_or(LedgerError::NotFound(id))
    }

    async fn insert(&self, tx: Transaction) -> Result<Transaction, LedgerError> {
        match self.collection.insert_one(TransactionDocument::from(&tx)).await {
            Ok(_) => Ok(tx),
            Err(e) if is_duplicate_key(&e) => {
                Err(LedgerError::DuplicateReference(tx.transaction_reference))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TransactionLedger for MongoLedger {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, LedgerError> {
        self.insert(Transaction::new(new, Utc::now())).await
    }

    async fn insert_settled_entry(
        &self,
        entry: NewTransaction,
        source_id: Uuid,
    ) -> Result<Transaction, LedgerError> {
        self.require(source_id).await?;
        self.insert(Transaction::settled_entry(entry, source_id, Utc::now()))
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, LedgerError> {
        self.find_one(doc! { "_id": id.to_string() }).await
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Transaction>, LedgerError> {
        self.find_one(doc! { "transaction_reference": reference }).await
    }

    async fn find_by_provider_reference(
        &self,
        mobile_money_reference: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.find_one(doc! { "mobile_money_reference": mobile_money_reference })
            .await
    }

    async fn find_by_source(&self, source_id: Uuid) -> Result<Vec<Transaction>, LedgerError> {
        let cursor = self
            .collection
            .find(doc! { "source_transaction_id": source_id.to_string() })
            .sort(doc! { "created_at": 1 })
            .await?;
        let docs: Vec<TransactionDocument> = cursor.try_collect().await?;
        docs.into_iter().map(Transaction::try_from).collect()
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: LedgerState,
        next: LedgerState,
        fields: TransitionFields,
    ) -> Result<Transaction, LedgerError> {
        let current = self.require(id).await?;
        let after = current.advanced(expected, next, &fields, Utc::now())?;
        let update = transition_update(&current, &after, &fields);

        let result = self
            .collection
            .find_one_and_update(state_filter(id, expected), update)
            .return_document(ReturnDocument::After)
            .await;

        match result {
            Ok(Some(doc)) => Transaction::try_from(doc),
            Ok(None) => {
                // someone else moved the row between our read and the write
                let actual = self.require(id).await?.state();
                Err(LedgerError::StaleState {
                    id,
                    expected,
                    actual,
                })
            }
            Err(e) if is_duplicate_key(&e) => Err(LedgerError::DuplicateProviderReference(
                fields.mobile_money_reference.unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn reserve_collection_reference(
        &self,
        id: Uuid,
        provider_reference: &str,
    ) -> Result<Transaction, LedgerError> {
        let mut filter = state_filter(id, LedgerState::PENDING);
        filter.insert("reserved_provider_reference", Bson::Null);
        let update = doc! {
            "$set": {
                "reserved_provider_reference": provider_reference,
                "updated_at": millis(Utc::now()),
            },
        };

        match self
            .collection
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await?
        {
            Some(doc) => Transaction::try_from(doc),
            None => {
                let tx = self.require(id).await?;
                Err(missed(id, tx.reserved(provider_reference, Utc::now())))
            }
        }
    }

    async fn claim_disbursement(
        &self,
        id: Uuid,
        claim: &DisbursementClaim,
    ) -> Result<Transaction, LedgerError> {
        let now = Utc::now();
        let mut filter = state_filter(id, LedgerState::HELD);
        filter.insert("disbursement_reference", Bson::Null);
        let rate = match claim.commission_rate {
            Some(rate) => Bson::String(rate.to_string()),
            None => Bson::Null,
        };
        let update = doc! {
            "$set": {
                "disbursement_reference": &claim.reference,
                "disbursement_provider_reference": Bson::Null,
                "disbursement_purpose": claim.purpose.as_str(),
                "disbursement_amount": claim.amount,
                "disbursement_rate": rate,
                "disbursement_claimed_at": millis(now),
                "updated_at": millis(now),
            },
            "$inc": { "disbursement_attempts": 1_i64 },
        };

        match self
            .collection
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await?
        {
            Some(doc) => Transaction::try_from(doc),
            None => {
                let tx = self.require(id).await?;
                Err(missed(id, tx.claimed(claim, now)))
            }
        }
    }

    async fn record_disbursement_reference(
        &self,
        id: Uuid,
        claim_reference: &str,
        provider_reference: &str,
    ) -> Result<Transaction, LedgerError> {
        let filter = doc! {
            "_id": id.to_string(),
            "disbursement_reference": claim_reference,
            "disbursement_provider_reference": Bson::Null,
        };
        let update = doc! {
            "$set": {
                "disbursement_provider_reference": provider_reference,
                "updated_at": millis(Utc::now()),
            },
        };

        match self
            .collection
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await?
        {
            Some(doc) => Transaction::try_from(doc),
            None => {
                let tx = self.require(id).await?;
                Err(missed(
                    id,
                    tx.with_disbursement_reference(claim_reference, provider_reference, Utc::now()),
                ))
            }
        }
    }

    async fn release_disbursement_claim(
        &self,
        id: Uuid,
        reference: &str,
    ) -> Result<Transaction, LedgerError> {
        let mut filter = state_filter(id, LedgerState::HELD);
        filter.insert("disbursement_reference", reference);
        let update = doc! {
            "$set": {
                "disbursement_reference": Bson::Null,
                "disbursement_provider_reference": Bson::Null,
                "disbursement_purpose": Bson::Null,
                "disbursement_amount": Bson::Null,
                "disbursement_rate": Bson::Null,
                "disbursement_claimed_at": Bson::Null,
                "updated_at": millis(Utc::now()),
            },
        };

        match self
            .collection
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await?
        {
            Some(doc) => Transaction::try_from(doc),
            None => {
                let tx = self.require(id).await?;
                Err(missed(id, tx.unclaimed(reference, Utc::now())))
            }
        }
    }

    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let filter = doc! {
            "payment_status": PaymentStatus::Processing.as_str(),
            "processing_since": { "$lte": millis(older_than) },
        };
        let cursor = self
            .collection
            .find(filter)
            .sort(doc! { "processing_since": 1 })
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await?;
        let docs: Vec<TransactionDocument> = cursor.try_collect().await?;
        docs.into_iter().map(Transaction::try_from).collect()
    }
}
