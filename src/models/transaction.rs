// models/transaction.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    RentPayment,
    Deposit,
    Commission,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::RentPayment => "rent_payment",
            TransactionType::Deposit => "deposit",
            TransactionType::Commission => "commission",
            TransactionType::Refund => "refund",
        }
    }

    /// Completed rent payments enter escrow; every other type settles directly.
    pub fn is_escrow_eligible(&self) -> bool {
        matches!(self, TransactionType::RentPayment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    ProviderA,
    ProviderB,
    BankTransfer,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::ProviderA => "provider_a",
            PaymentMethod::ProviderB => "provider_b",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Cash => "cash",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Failed | PaymentStatus::Refunded
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Held => "held",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        }
    }
}

/// What a disbursement claim pays out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisbursementPurpose {
    /// Landlord net of a release.
    Release,
    /// Full amount back to the renter.
    Refund,
}

impl DisbursementPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisbursementPurpose::Release => "release",
            DisbursementPurpose::Refund => "refund",
        }
    }
}

/// The single disbursement slot of a held row, as written by a claim.
#[derive(Debug, Clone, PartialEq)]
pub struct DisbursementClaim {
    pub reference: String,
    pub purpose: DisbursementPurpose,
    pub amount: i64,
    /// Commission rate a release was priced at.
    pub commission_rate: Option<Decimal>,
}

/// The pair the ledger compares-and-sets on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub payment_status: PaymentStatus,
    pub escrow_status: Option<EscrowStatus>,
}

impl LedgerState {
    pub const PENDING: LedgerState = LedgerState::new(PaymentStatus::Pending, None);
    pub const PROCESSING: LedgerState = LedgerState::new(PaymentStatus::Processing, None);
    pub const FAILED: LedgerState = LedgerState::new(PaymentStatus::Failed, None);
    pub const HELD: LedgerState =
        LedgerState::new(PaymentStatus::Completed, Some(EscrowStatus::Held));
    pub const RELEASED: LedgerState =
        LedgerState::new(PaymentStatus::Completed, Some(EscrowStatus::Released));
    pub const REFUNDED: LedgerState =
        LedgerState::new(PaymentStatus::Refunded, Some(EscrowStatus::Refunded));

    pub const fn new(payment_status: PaymentStatus, escrow_status: Option<EscrowStatus>) -> Self {
        LedgerState {
            payment_status,
            escrow_status,
        }
    }

    /// Completed state for a collection of the given type.
    pub fn completed_for(transaction_type: TransactionType) -> Self {
        if transaction_type.is_escrow_eligible() {
            LedgerState::HELD
        } else {
            LedgerState::new(PaymentStatus::Completed, None)
        }
    }

    /// Every edge the state machine allows. Anything else is rejected by the ledger.
    pub fn can_advance_to(&self, next: &LedgerState, transaction_type: TransactionType) -> bool {
        use EscrowStatus as E;
        use PaymentStatus as P;

        match (
            self.payment_status,
            self.escrow_status,
            next.payment_status,
            next.escrow_status,
        ) {
            (P::Pending, None, P::Processing, None) => true,
            (P::Pending, None, P::Failed, None) => true,
            (P::Processing, None, P::Failed, None) => true,
            (P::Processing, None, P::Completed, escrow) => {
                escrow == LedgerState::completed_for(transaction_type).escrow_status
            }
            (P::Completed, Some(E::Held), P::Completed, Some(E::Released)) => true,
            (P::Completed, Some(E::Held), P::Refunded, Some(E::Refunded)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LedgerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.escrow_status {
            Some(escrow) => write!(f, "{}/{}", self.payment_status, escrow.as_str()),
            None => write!(f, "{}", self.payment_status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub transaction_reference: String,

    pub renter_id: String,
    pub landlord_id: String,
    pub property_id: String,

    pub transaction_type: TransactionType,
    pub amount: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,

    // Lifecycle
    pub payment_status: PaymentStatus,
    pub escrow_status: Option<EscrowStatus>,

    // Provider correlation
    /// Reserved before the collection is first sent, so a retry can look it up.
    pub reserved_provider_reference: Option<String>,
    pub mobile_money_reference: Option<String>,
    pub external_id: Option<String>,
    pub callback_received: bool,
    pub failure_reason: Option<String>,

    // Commission and refund rows point back at their source
    pub source_transaction_id: Option<Uuid>,

    // Disbursement claim
    pub disbursement_reference: Option<String>,
    pub disbursement_provider_reference: Option<String>,
    pub disbursement_purpose: Option<DisbursementPurpose>,
    pub disbursement_amount: Option<i64>,
    pub disbursement_rate: Option<Decimal>,
    pub disbursement_claimed_at: Option<DateTime<Utc>>,
    pub disbursement_attempts: u32,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_since: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything a caller supplies when a row is inserted.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_reference: String,
    pub renter_id: String,
    pub landlord_id: String,
    pub property_id: String,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
}

/// Optional field writes that ride along with a state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    pub mobile_money_reference: Option<String>,
    pub external_id: Option<String>,
    pub callback_received: bool,
    pub failure_reason: Option<String>,
}

impl Transaction {
    pub fn new(new: NewTransaction, now: DateTime<Utc>) -> Self {
        Transaction {
            id: Uuid::new_v4(),
            transaction_reference: new.transaction_reference,
            renter_id: new.renter_id,
            landlord_id: new.landlord_id,
            property_id: new.property_id,
            transaction_type: new.transaction_type,
            amount: new.amount,
            currency: new.currency,
            payment_method: new.payment_method,
            payment_status: PaymentStatus::Pending,
            escrow_status: None,
            reserved_provider_reference: None,
            mobile_money_reference: None,
            external_id: None,
            callback_received: false,
            failure_reason: None,
            source_transaction_id: None,
            disbursement_reference: None,
            disbursement_provider_reference: None,
            disbursement_purpose: None,
            disbursement_amount: None,
            disbursement_rate: None,
            disbursement_claimed_at: None,
            disbursement_attempts: 0,
            created_at: now,
            updated_at: now,
            processing_since: None,
            completed_at: None,
        }
    }

    /// A row that is recorded already settled (commission, refund), linked to its source.
    pub fn settled_entry(new: NewTransaction, source_id: Uuid, now: DateTime<Utc>) -> Self {
        let mut tx = Transaction::new(new, now);
        tx.payment_status = PaymentStatus::Completed;
        tx.source_transaction_id = Some(source_id);
        tx.completed_at = Some(now);
        tx
    }

    pub fn state(&self) -> LedgerState {
        LedgerState::new(self.payment_status, self.escrow_status)
    }

    /// Checks a transition against this row and returns the row after it.
    /// Storage implementations use the result to decide what to write.
    pub fn advanced(
        &self,
        expected: LedgerState,
        next: LedgerState,
        fields: &TransitionFields,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        let current = self.state();
        if current != expected {
            return Err(LedgerError::StaleState {
                id: self.id,
                expected,
                actual: current,
            });
        }
        if !current.can_advance_to(&next, self.transaction_type) {
            return Err(LedgerError::IllegalTransition {
                id: self.id,
                from: current,
                to: next,
            });
        }

        if fields.mobile_money_reference.is_some() && next != LedgerState::PROCESSING {
            return Err(LedgerError::InvalidFields(
                "mobile_money_reference is only written on entry to processing".to_string(),
            ));
        }
        if fields.mobile_money_reference.is_some() && self.mobile_money_reference.is_some() {
            return Err(LedgerError::InvalidFields(
                "mobile_money_reference is already set".to_string(),
            ));
        }
        if fields.external_id.is_some() && next.payment_status != PaymentStatus::Completed {
            return Err(LedgerError::InvalidFields(
                "external_id is only written on entry to completed".to_string(),
            ));
        }

        let mut tx = self.clone();
        tx.payment_status = next.payment_status;
        tx.escrow_status = next.escrow_status;
        tx.updated_at = now;

        if let Some(reference) = &fields.mobile_money_reference {
            tx.mobile_money_reference = Some(reference.clone());
        }
        if let Some(external_id) = &fields.external_id {
            tx.external_id = Some(external_id.clone());
        }
        if fields.callback_received {
            tx.callback_received = true;
        }
        if let Some(reason) = &fields.failure_reason {
            tx.failure_reason = Some(reason.clone());
        }

        if next.payment_status == PaymentStatus::Processing {
            tx.processing_since = Some(now);
        }
        let entering_terminal = matches!(
            next.payment_status,
            PaymentStatus::Completed | PaymentStatus::Failed
        ) && !current.payment_status.is_terminal();
        if entering_terminal && tx.completed_at.is_none() {
            tx.completed_at = Some(now);
        }

        Ok(tx)
    }

    pub fn commission_reference(&self) -> String {
        format!("COM-{}", self.transaction_reference)
    }

    pub fn refund_reference(&self) -> String {
        format!("RFD-{}", self.transaction_reference)
    }

    /// The row after a collection reference is reserved. Written once, while `pending`.
    pub fn reserved(&self, provider_reference: &str, now: DateTime<Utc>) -> Result<Transaction, LedgerError> {
        if self.state() != LedgerState::PENDING {
            return Err(LedgerError::StaleState {
                id: self.id,
                expected: LedgerState::PENDING,
                actual: self.state(),
            });
        }
        if let Some(existing) = &self.reserved_provider_reference {
            return Err(LedgerError::ClaimUnavailable {
                id: self.id,
                reason: format!("collection already reserved under {}", existing),
            });
        }

        let mut tx = self.clone();
        tx.reserved_provider_reference = Some(provider_reference.to_string());
        tx.updated_at = now;
        Ok(tx)
    }

    /// The row after `claim` takes its disbursement slot.
    pub fn claimed(&self, claim: &DisbursementClaim, now: DateTime<Utc>) -> Result<Transaction, LedgerError> {
        if self.state() != LedgerState::HELD {
            return Err(LedgerError::StaleState {
                id: self.id,
                expected: LedgerState::HELD,
                actual: self.state(),
            });
        }
        if let Some(existing) = &self.disbursement_reference {
            return Err(LedgerError::ClaimUnavailable {
                id: self.id,
                reason: format!("already claimed by {}", existing),
            });
        }

        let mut tx = self.clone();
        tx.disbursement_reference = Some(claim.reference.clone());
        tx.disbursement_provider_reference = None;
        tx.disbursement_purpose = Some(claim.purpose);
        tx.disbursement_amount = Some(claim.amount);
        tx.disbursement_rate = claim.commission_rate;
        tx.disbursement_claimed_at = Some(now);
        tx.disbursement_attempts += 1;
        tx.updated_at = now;
        Ok(tx)
    }

    /// The row after the provider reference of a claimed disbursement is recorded.
    pub fn with_disbursement_reference(
        &self,
        claim_reference: &str,
        provider_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        if self.disbursement_reference.as_deref() != Some(claim_reference) {
            return Err(LedgerError::ClaimUnavailable {
                id: self.id,
                reason: format!("claim {} is not held", claim_reference),
            });
        }
        if self.disbursement_provider_reference.is_some() {
            return Err(LedgerError::InvalidFields(format!(
                "claim {} already has a provider reference",
                claim_reference
            )));
        }

        let mut tx = self.clone();
        tx.disbursement_provider_reference = Some(provider_reference.to_string());
        tx.updated_at = now;
        Ok(tx)
    }

    /// The row after the claim `reference` is given back. The attempt count stays.
    pub fn unclaimed(&self, reference: &str, now: DateTime<Utc>) -> Result<Transaction, LedgerError> {
        if self.disbursement_reference.as_deref() != Some(reference) {
            return Err(LedgerError::ClaimUnavailable {
                id: self.id,
                reason: format!("claim {} is not held", reference),
            });
        }
        if self.state() != LedgerState::HELD {
            return Err(LedgerError::StaleState {
                id: self.id,
                expected: LedgerState::HELD,
                actual: self.state(),
            });
        }

        let mut tx = self.clone();
        tx.disbursement_reference = None;
        tx.disbursement_provider_reference = None;
        tx.disbursement_purpose = None;
        tx.disbursement_amount = None;
        tx.disbursement_rate = None;
        tx.disbursement_claimed_at = None;
        tx.updated_at = now;
        Ok(tx)
    }

    /// Commission implied by a recorded release: the amount minus what the landlord was sent.
    pub fn released_commission(&self) -> Option<i64> {
        match (self.disbursement_purpose, self.disbursement_amount) {
            (Some(DisbursementPurpose::Release), Some(net)) => Some(self.amount - net),
            _ => None,
        }
    }
}
