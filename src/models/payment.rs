use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::transaction::{
    EscrowStatus, PaymentMethod, PaymentStatus, Transaction, TransactionType,
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RequestPayment {
    #[validate(length(min = 1, message = "property_id is required"))]
    pub property_id: String,
    #[validate(length(min = 1, message = "renter_id is required"))]
    pub renter_id: String,
    #[validate(range(min = 1, message = "amount must be a positive integer"))]
    pub amount: i64,
    #[validate(length(equal = 3, message = "currency must be a 3-letter code"))]
    pub currency: String,
    #[validate(length(min = 6, message = "payer_handle is required"))]
    pub payer_handle: String,
    pub method: PaymentMethod,
    #[serde(default)]
    pub transaction_type: Option<TransactionType>,
    #[serde(default)]
    pub transaction_reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ProcessPayment {
    #[validate(length(min = 6, message = "payer_handle is required"))]
    pub payer_handle: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommissionRateUpdate {
    pub rate: Decimal,
}

/// What the status endpoint exposes. Internal claim fields stay private.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransactionStatusView {
    pub id: Uuid,
    pub transaction_reference: String,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub escrow_status: Option<EscrowStatus>,
    pub mobile_money_reference: Option<String>,
    pub external_id: Option<String>,
    pub callback_received: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Transaction> for TransactionStatusView {
    fn from(tx: &Transaction) -> Self {
        TransactionStatusView {
            id: tx.id,
            transaction_reference: tx.transaction_reference.clone(),
            transaction_type: tx.transaction_type,
            amount: tx.amount,
            currency: tx.currency.clone(),
            payment_method: tx.payment_method,
            payment_status: tx.payment_status,
            escrow_status: tx.escrow_status,
            mobile_money_reference: tx.mobile_money_reference.clone(),
            external_id: tx.external_id.clone(),
            callback_received: tx.callback_received,
            failure_reason: tx.failure_reason.clone(),
            created_at: tx.created_at,
            completed_at: tx.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReceipt {
    pub transaction: TransactionStatusView,
    pub commission_transaction: Option<TransactionStatusView>,
    pub landlord_net: i64,
    pub commission: i64,
    pub commission_rate: Decimal,
    pub disbursement_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundReceipt {
    pub transaction: TransactionStatusView,
    pub refund_transaction: TransactionStatusView,
    pub disbursement_reference: String,
}

/// A transaction together with the commission and refund rows recorded against it.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionDetails {
    pub transaction: TransactionStatusView,
    pub related: Vec<TransactionStatusView>,
}
