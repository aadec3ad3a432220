// services/providers/momo.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{error_for_status, AccessToken, Msisdn, PaymentProvider, TokenCache};
use crate::config::MomoConfig;
use crate::errors::{AppError, ProviderError};
use crate::models::provider::{
    CollectionRequest, DisbursementRequest, HandleCheck, Operation, ProviderAck, ProviderKind,
    ProviderStatus, StatusReport,
};

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const REFERENCE_ID_HEADER: &str = "X-Reference-Id";
const TARGET_ENVIRONMENT_HEADER: &str = "X-Target-Environment";
const CALLBACK_URL_HEADER: &str = "X-Callback-Url";

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub party_id_type: &'static str,
    pub party_id: String,
}

/// Shared body of `requesttopay` and `transfer`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneyRequest {
    pub amount: String,
    pub currency: String,
    pub external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<Party>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payee: Option<Party>,
    pub payer_message: String,
    pub payee_note: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub status: String,
    #[serde(default)]
    pub financial_transaction_id: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub reason: Option<serde_json::Value>,
}

impl OperationStatus {
    fn report(self) -> Result<StatusReport, ProviderError> {
        let status = map_status(&self.status).ok_or_else(|| {
            ProviderError::Malformed(format!("unknown status '{}'", self.status))
        })?;
        Ok(StatusReport {
            status,
            settlement_id: self.financial_transaction_id,
            reason: self.reason.as_ref().and_then(reason_text),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct BasicUserInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
}

/// provider_a vocabulary.
pub fn map_status(raw: &str) -> Option<ProviderStatus> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "PENDING" => Some(ProviderStatus::Pending),
        "SUCCESSFUL" => Some(ProviderStatus::Successful),
        "FAILED" | "REJECTED" | "TIMEOUT" | "EXPIRED" => Some(ProviderStatus::Failed),
        _ => None,
    }
}

/// `reason` is a bare string in callbacks and an object with `message` in status bodies.
pub fn reason_text(reason: &serde_json::Value) -> Option<String> {
    match reason {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("code"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Product {
    Collection,
    Disbursement,
}

impl From<Operation> for Product {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Collection => Product::Collection,
            Operation::Disbursement => Product::Disbursement,
        }
    }
}

impl Product {
    fn path(&self) -> &'static str {
        match self {
            Product::Collection => "collection",
            Product::Disbursement => "disbursement",
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Product::Collection => "requesttopay",
            Product::Disbursement => "transfer",
        }
    }
}

pub struct MomoProvider {
    config: MomoConfig,
    client: Client,
    collection_token: TokenCache,
    disbursement_token: TokenCache,
    max_retries: u32,
}

impl MomoProvider {
    pub fn new(config: MomoConfig, timeout: Duration, max_retries: u32) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(MomoProvider {
            config,
            client,
            collection_token: TokenCache::new("provider_a.collection"),
            disbursement_token: TokenCache::new("provider_a.disbursement"),
            max_retries,
        })
    }

    fn cache(&self, product: Product) -> &TokenCache {
        match product {
            Product::Collection => &self.collection_token,
            Product::Disbursement => &self.disbursement_token,
        }
    }

    fn subscription_key(&self, product: Product) -> &str {
        match product {
            Product::Collection => &self.config.collection_subscription_key,
            Product::Disbursement => &self.config.disbursement_subscription_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn access_token(&self, product: Product) -> Result<String, ProviderError> {
        self.cache(product)
            .get_or_refresh(|| self.fetch_token(product))
            .await
    }

    async fn fetch_token(&self, product: Product) -> Result<AccessToken, ProviderError> {
        let credentials = base64.encode(format!("{}:{}", self.config.api_user, self.config.api_key));

        let response = self
            .client
            .post(self.url(&format!("/{}/token/", product.path())))
            .header(header::AUTHORIZATION, format!("Basic {}", credentials))
            .header(SUBSCRIPTION_KEY_HEADER, self.subscription_key(product))
            .header(header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(product = product.path(), %status, "Failed to get provider_a token: {}", body);
            return Err(ProviderError::Authentication(format!("token request failed: {}", status)));
        }

        let token: TokenResponse = response.json().await?;
        Ok(AccessToken::expiring_in(token.access_token, token.expires_in))
    }

    /// Sends with the cached token; a 401 invalidates it and sends once more.
    async fn send_authorized<B>(&self, product: Product, build: B) -> Result<Response, ProviderError>
    where
        B: Fn(&str) -> RequestBuilder,
    {
        let token = self.access_token(product).await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(product = product.path(), "provider_a returned 401, refreshing token");
        self.cache(product).invalidate(&token).await;
        let token = self.access_token(product).await?;
        let response = build(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Authentication(
                "token rejected after refresh".to_string(),
            ));
        }
        Ok(response)
    }

    fn authorized(&self, product: Product, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(SUBSCRIPTION_KEY_HEADER, self.subscription_key(product))
            .header(TARGET_ENVIRONMENT_HEADER, self.config.target_environment())
    }

    async fn post_operation(
        &self,
        product: Product,
        reference_id: &str,
        body: &MoneyRequest,
    ) -> Result<(), ProviderError> {
        let url = self.url(&format!("/{}/v1_0/{}", product.path(), product.operation()));

        let response = self
            .send_authorized(product, |token| {
                self.authorized(product, self.client.post(&url), token)
                    .header(REFERENCE_ID_HEADER, reference_id)
                    .header(CALLBACK_URL_HEADER, &self.config.callback_url)
                    .header(header::CONTENT_TYPE, "application/json")
                    .json(body)
            })
            .await?;

        let status = response.status();
        // 409: this X-Reference-Id already exists, so an earlier send went through.
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        error!(product = product.path(), %status, reference_id, "provider_a {} failed: {}", product.operation(), body);
        Err(error_for_status(status, &body))
    }

    /// `None` when the provider has no record of the reference.
    async fn lookup(
        &self,
        product: Product,
        reference_id: &str,
    ) -> Result<Option<OperationStatus>, ProviderError> {
        let url = self.url(&format!(
            "/{}/v1_0/{}/{}",
            product.path(),
            product.operation(),
            reference_id
        ));

        let response = self
            .send_authorized(product, |token| {
                self.authorized(product, self.client.get(&url), token)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body));
        }

        Ok(Some(response.json().await?))
    }

    /// Sends an operation under `reference_id`, checking the status endpoint before any re-send.
    async fn initiate(
        &self,
        product: Product,
        reference_id: &str,
        body: MoneyRequest,
    ) -> Result<ProviderAck, ProviderError> {
        let mut attempt: u32 = 0;

        loop {
            let err = match self.post_operation(product, reference_id, &body).await {
                Ok(()) => {
                    info!(
                        product = product.path(),
                        reference_id = %reference_id,
                        transaction_reference = %body.external_id,
                        "✅ provider_a {} accepted",
                        product.operation()
                    );
                    return Ok(accepted(reference_id));
                }
                Err(err) if !err.is_ambiguous() => return Err(err),
                Err(err) => err,
            };

            warn!(
                product = product.path(),
                reference_id = %reference_id,
                attempt,
                "provider_a {} outcome unknown ({}), checking status",
                product.operation(),
                err
            );

            match self.lookup(product, reference_id).await {
                Ok(Some(_)) => return Ok(accepted(reference_id)),
                Ok(None) if attempt < self.max_retries => attempt += 1,
                Ok(None) => return Err(err),
                Err(lookup) => {
                    return Err(ProviderError::Unavailable(format!(
                        "{}; status check failed: {}",
                        err, lookup
                    )))
                }
            }
        }
    }

    fn money_request(
        &self,
        amount: i64,
        currency: &str,
        transaction_reference: &str,
        handle: &str,
        product: Product,
    ) -> Result<MoneyRequest, ProviderError> {
        let party = Party {
            party_id_type: "MSISDN",
            party_id: Msisdn::parse(handle)?.international(),
        };
        let (payer, payee, message) = match product {
            Product::Collection => (Some(party), None, "Rent payment"),
            Product::Disbursement => (None, Some(party), "Rent payout"),
        };

        Ok(MoneyRequest {
            amount: amount.to_string(),
            currency: currency.to_string(),
            external_id: transaction_reference.to_string(),
            payer,
            payee,
            payer_message: message.to_string(),
            payee_note: transaction_reference.to_string(),
        })
    }
}

fn accepted(provider_reference: &str) -> ProviderAck {
    ProviderAck {
        provider_reference: provider_reference.to_string(),
        accepted: true,
    }
}

#[async_trait]
impl PaymentProvider for MomoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ProviderA
    }

    /// `X-Reference-Id` is chosen by the client, so nothing is sent yet.
    async fn reserve_reference(&self, _operation: Operation) -> Result<String, ProviderError> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn find_operation(
        &self,
        operation: Operation,
        provider_reference: &str,
    ) -> Result<Option<StatusReport>, ProviderError> {
        self.lookup(Product::from(operation), provider_reference)
            .await?
            .map(OperationStatus::report)
            .transpose()
    }

    async fn initiate_collection(
        &self,
        request: &CollectionRequest,
    ) -> Result<ProviderAck, ProviderError> {
        info!(
            transaction_reference = %request.transaction_reference,
            amount = request.amount,
            "provider_a: request to pay"
        );
        let body = self.money_request(
            request.amount,
            &request.currency,
            &request.transaction_reference,
            &request.payer_handle,
            Product::Collection,
        )?;
        self.initiate(Product::Collection, &request.provider_reference, body)
            .await
    }

    async fn check_status(&self, provider_reference: &str) -> Result<StatusReport, ProviderError> {
        self.find_operation(Operation::Collection, provider_reference)
            .await?
            .ok_or_else(|| {
                ProviderError::Rejected(format!("unknown payment {}", provider_reference))
            })
    }

    async fn initiate_disbursement(
        &self,
        request: &DisbursementRequest,
    ) -> Result<ProviderAck, ProviderError> {
        info!(
            transaction_reference = %request.transaction_reference,
            amount = request.amount,
            "provider_a: transfer"
        );
        let body = self.money_request(
            request.amount,
            &request.currency,
            &request.transaction_reference,
            &request.payee_handle,
            Product::Disbursement,
        )?;
        self.initiate(Product::Disbursement, &request.provider_reference, body)
            .await
    }

    async fn validate_payer_handle(&self, handle: &str) -> Result<HandleCheck, ProviderError> {
        let msisdn = match Msisdn::parse(handle) {
            Ok(m) => m,
            Err(_) => {
                return Ok(HandleCheck {
                    valid: false,
                    display_name: None,
                })
            }
        };

        let url = self.url(&format!(
            "/collection/v1_0/accountholder/msisdn/{}/basicuserinfo",
            msisdn.international()
        ));
        let response = self
            .send_authorized(Product::Collection, |token| {
                self.authorized(Product::Collection, self.client.get(&url), token)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(HandleCheck {
                valid: false,
                display_name: None,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body));
        }

        let info: BasicUserInfo = response.json().await?;
        let display_name = info.name.or_else(|| {
            match (info.given_name, info.family_name) {
                (Some(given), Some(family)) => Some(format!("{} {}", given, family)),
                (given, family) => given.or(family),
            }
        });

        Ok(HandleCheck {
            valid: true,
            display_name,
        })
    }
}
