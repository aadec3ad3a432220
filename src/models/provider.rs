// models/provider.rs
use serde::{Deserialize, Serialize};

use crate::models::transaction::PaymentMethod;

/// The automated providers. Manual methods have no adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    ProviderA,
    ProviderB,
}

impl ProviderKind {
    pub fn from_method(method: PaymentMethod) -> Option<Self> {
        match method {
            PaymentMethod::ProviderA => Some(ProviderKind::ProviderA),
            PaymentMethod::ProviderB => Some(ProviderKind::ProviderB),
            PaymentMethod::BankTransfer | PaymentMethod::Cash => None,
        }
    }

    pub fn method(&self) -> PaymentMethod {
        match self {
            ProviderKind::ProviderA => PaymentMethod::ProviderA,
            ProviderKind::ProviderB => PaymentMethod::ProviderB,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.method().as_str()
    }
}

/// The two money movements a provider performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Collection,
    Disbursement,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Collection => "collection",
            Operation::Disbursement => "disbursement",
        }
    }
}

/// `provider_reference` comes from [`reserve_reference`] and is reused on every re-send.
///
/// [`reserve_reference`]: crate::services::providers::PaymentProvider::reserve_reference
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRequest {
    pub amount: i64,
    pub currency: String,
    pub payer_handle: String,
    pub transaction_reference: String,
    pub provider_reference: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisbursementRequest {
    pub amount: i64,
    pub currency: String,
    pub payee_handle: String,
    pub transaction_reference: String,
    pub provider_reference: String,
}

/// Acknowledgment of an initiation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderAck {
    pub provider_reference: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    Pending,
    Successful,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: ProviderStatus,
    pub settlement_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleCheck {
    pub valid: bool,
    pub display_name: Option<String>,
}

/// Where a provider outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSource {
    Webhook,
    Poll,
}

/// A normalized provider verdict for one provider reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutcome {
    pub provider: ProviderKind,
    pub provider_reference: String,
    pub order_reference: Option<String>,
    pub status: ProviderStatus,
    pub settlement_id: Option<String>,
    pub reason: Option<String>,
}
