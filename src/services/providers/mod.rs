// services/providers/mod.rs
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;

use crate::errors::{PaymentError, ProviderError};
use crate::models::provider::{
    CollectionRequest, DisbursementRequest, HandleCheck, Operation, ProviderAck, ProviderKind,
    StatusReport,
};
use crate::models::transaction::PaymentMethod;

pub mod momo;
pub mod orange_money;
pub mod token_cache;

pub use momo::MomoProvider;
pub use orange_money::OrangeMoneyProvider;
pub use token_cache::{AccessToken, TokenCache};

const COUNTRY_CODE: &str = "237";

/// One contract for every mobile-money provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// The provider reference an operation will be sent under. Moves no money.
    ///
    /// Callers persist it before the first send, so a retry after a lost
    /// response can ask the provider about it instead of sending a second operation.
    async fn reserve_reference(&self, operation: Operation) -> Result<String, ProviderError>;

    /// Status of the operation sent under `provider_reference`, `None` when the
    /// provider never received it. Read-only.
    async fn find_operation(
        &self,
        operation: Operation,
        provider_reference: &str,
    ) -> Result<Option<StatusReport>, ProviderError>;

    async fn initiate_collection(
        &self,
        request: &CollectionRequest,
    ) -> Result<ProviderAck, ProviderError>;

    /// Read-only, safe to repeat.
    async fn check_status(&self, provider_reference: &str) -> Result<StatusReport, ProviderError>;

    async fn initiate_disbursement(
        &self,
        request: &DisbursementRequest,
    ) -> Result<ProviderAck, ProviderError>;

    /// Advisory. Callers never block a payment on it.
    async fn validate_payer_handle(&self, handle: &str) -> Result<HandleCheck, ProviderError>;
}

/// The closed set of automated providers, keyed by payment method.
#[derive(Clone)]
pub struct ProviderRegistry {
    provider_a: Arc<dyn PaymentProvider>,
    provider_b: Arc<dyn PaymentProvider>,
}

impl ProviderRegistry {
    pub fn new(provider_a: Arc<dyn PaymentProvider>, provider_b: Arc<dyn PaymentProvider>) -> Self {
        ProviderRegistry {
            provider_a,
            provider_b,
        }
    }

    pub fn get(&self, kind: ProviderKind) -> &Arc<dyn PaymentProvider> {
        match kind {
            ProviderKind::ProviderA => &self.provider_a,
            ProviderKind::ProviderB => &self.provider_b,
        }
    }

    pub fn for_method(&self, method: PaymentMethod) -> Result<&Arc<dyn PaymentProvider>, PaymentError> {
        ProviderKind::from_method(method)
            .map(|kind| self.get(kind))
            .ok_or(PaymentError::UnsupportedMethod(method))
    }
}

/// A subscriber number, stored without country code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msisdn {
    subscriber: String,
}

impl Msisdn {
    /// Accepts `+237…`, `00237…`, `237…` and nine-digit local numbers.
    pub fn parse(raw: &str) -> Result<Self, ProviderError> {
        let digits: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
            .collect();

        let local = digits
            .strip_prefix('+')
            .and_then(|d| d.strip_prefix(COUNTRY_CODE))
            .or_else(|| {
                digits
                    .strip_prefix("00")
                    .and_then(|d| d.strip_prefix(COUNTRY_CODE))
            })
            .or_else(|| {
                if digits.len() == 12 {
                    digits.strip_prefix(COUNTRY_CODE)
                } else {
                    None
                }
            })
            .unwrap_or(&digits);

        if local.len() != 9 || !local.chars().all(|c| c.is_ascii_digit()) {
            return Err(ProviderError::Rejected(format!("invalid phone number '{}'", raw)));
        }

        Ok(Msisdn {
            subscriber: local.to_string(),
        })
    }

    /// `2376XXXXXXXX`
    pub fn international(&self) -> String {
        format!("{}{}", COUNTRY_CODE, self.subscriber)
    }

    /// `6XXXXXXXX`
    pub fn local(&self) -> &str {
        &self.subscriber
    }
}

/// Error for a non-success response that is not a 401.
pub(crate) fn error_for_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{} - {}", status, truncate(body, 200));
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ProviderError::Authentication(detail)
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Unavailable(detail)
    } else if status.is_client_error() {
        ProviderError::Rejected(detail)
    } else {
        ProviderError::Unavailable(detail)
    }
}

fn truncate(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
