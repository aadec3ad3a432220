// services/providers/orange_money.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{error_for_status, AccessToken, Msisdn, PaymentProvider, TokenCache};
use crate::config::OrangeConfig;
use crate::errors::{AppError, ProviderError};
use crate::models::provider::{
    CollectionRequest, DisbursementRequest, HandleCheck, Operation, ProviderAck, ProviderKind,
    ProviderStatus, StatusReport,
};

const API_PREFIX: &str = "/omcoreapis/1.0.2";
const AUTH_TOKEN_HEADER: &str = "X-AUTH-TOKEN";
const REQUEST_ID_HEADER: &str = "X-Request-Id";

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub message: Option<String>,
    pub data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
    pub pay_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayRequest {
    pub notif_url: String,
    pub channel_user_msisdn: String,
    pub amount: String,
    pub subscriber_msisdn: String,
    pub pin: String,
    pub order_id: String,
    pub description: String,
    pub pay_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentData {
    #[serde(default)]
    pub pay_token: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub txnid: Option<String>,
    #[serde(default)]
    pub inittxnmessage: Option<String>,
    #[serde(default)]
    pub confirmtxnmessage: Option<String>,
}

impl PaymentData {
    fn reason(&self) -> Option<String> {
        self.confirmtxnmessage
            .clone()
            .or_else(|| self.inittxnmessage.clone())
    }

    fn raw_status(&self) -> &str {
        self.status.as_deref().unwrap_or("")
    }

    /// A pay token that was reserved but never paid.
    fn is_unpaid(&self) -> bool {
        let raw = self.raw_status().trim();
        raw.is_empty() || raw.eq_ignore_ascii_case("INITIATED")
    }

    fn report(self) -> Result<StatusReport, ProviderError> {
        let status = map_status(self.raw_status()).ok_or_else(|| {
            ProviderError::Malformed(format!("unknown status '{}'", self.raw_status()))
        })?;
        Ok(StatusReport {
            status,
            reason: self.reason(),
            settlement_id: self.txnid,
        })
    }
}

/// provider_b vocabulary. `SUCCESSFULL` is the provider's own spelling.
pub fn map_status(raw: &str) -> Option<ProviderStatus> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "INITIATED" | "PENDING" => Some(ProviderStatus::Pending),
        "SUCCESSFULL" | "SUCCESSFUL" | "SUCCESS" => Some(ProviderStatus::Successful),
        "FAILED" | "EXPIRED" | "CANCELLED" => Some(ProviderStatus::Failed),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Product {
    WebPayment,
    CashIn,
}

impl From<Operation> for Product {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Collection => Product::WebPayment,
            Operation::Disbursement => Product::CashIn,
        }
    }
}

impl Product {
    fn path(&self) -> &'static str {
        match self {
            Product::WebPayment => "mp",
            Product::CashIn => "cashin",
        }
    }
}

pub struct OrangeMoneyProvider {
    config: OrangeConfig,
    client: Client,
    token: TokenCache,
    max_retries: u32,
}

impl OrangeMoneyProvider {
    pub fn new(config: OrangeConfig, timeout: Duration, max_retries: u32) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(OrangeMoneyProvider {
            config,
            client,
            token: TokenCache::new("provider_b"),
            max_retries,
        })
    }

    fn url(&self, product: Product, operation: &str) -> String {
        format!("{}{}/{}/{}", self.config.base_url, API_PREFIX, product.path(), operation)
    }

    fn merchant_key(&self) -> String {
        base64.encode(format!(
            "{}:{}",
            self.config.channel_user, self.config.channel_password
        ))
    }

    async fn fetch_token(&self) -> Result<AccessToken, ProviderError> {
        let credentials = base64.encode(format!(
            "{}:{}",
            self.config.client_id, self.config.client_secret
        ));

        let response = self
            .client
            .post(format!("{}/token", self.config.base_url))
            .header(header::AUTHORIZATION, format!("Basic {}", credentials))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "Failed to get provider_b token: {}", body);
            return Err(ProviderError::Authentication(format!("token request failed: {}", status)));
        }

        let token: TokenResponse = response.json().await?;
        Ok(AccessToken::expiring_in(token.access_token, token.expires_in))
    }

    /// Every send carries its own `X-Request-Id`.
    async fn send_authorized<B>(&self, build: B) -> Result<Response, ProviderError>
    where
        B: Fn() -> RequestBuilder,
    {
        let merchant_key = self.merchant_key();
        let send = |token: &str| {
            build()
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(AUTH_TOKEN_HEADER, &merchant_key)
                .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string())
                .send()
        };

        let token = self.token.get_or_refresh(|| self.fetch_token()).await?;
        let response = send(&token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("provider_b returned 401, refreshing token");
        self.token.invalidate(&token).await;
        let token = self.token.get_or_refresh(|| self.fetch_token()).await?;
        let response = send(&token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Authentication(
                "token rejected after refresh".to_string(),
            ));
        }
        Ok(response)
    }

    async fn read_envelope<T>(response: Response) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body));
        }
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    /// Reserves a pay token. Moves no money, so ambiguous failures are simply retried.
    async fn init(&self, product: Product) -> Result<String, ProviderError> {
        let url = self.url(product, "init");
        let mut attempt: u32 = 0;
        loop {
            let result = match self.send_authorized(|| self.client.post(&url)).await {
                Ok(response) => Self::read_envelope::<InitData>(response).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(data) => return Ok(data.pay_token),
                Err(err) if err.is_ambiguous() && attempt < self.max_retries => {
                    warn!(product = product.path(), attempt, "provider_b init failed ({}), retrying", err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn pay(&self, product: Product, body: &PayRequest) -> Result<PaymentData, ProviderError> {
        let url = self.url(product, "pay");
        let response = self
            .send_authorized(|| {
                self.client
                    .post(&url)
                    .header(header::CONTENT_TYPE, "application/json")
                    .json(body)
            })
            .await?;
        Self::read_envelope(response).await
    }

    /// `None` when the provider has no record of the pay token.
    async fn lookup(
        &self,
        product: Product,
        pay_token: &str,
    ) -> Result<Option<PaymentData>, ProviderError> {
        let url = self.url(product, &format!("paymentstatus/{}", pay_token));
        let response = self.send_authorized(|| self.client.get(&url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read_envelope(response).await.map(Some)
    }

    /// Pays a reserved token, checking its status before any re-send.
    async fn initiate(
        &self,
        product: Product,
        pay_token: &str,
        order_id: &str,
        amount: i64,
        handle: &str,
        description: &str,
    ) -> Result<ProviderAck, ProviderError> {
        let subscriber = Msisdn::parse(handle)?;
        let pay_token = pay_token.to_string();

        let body = PayRequest {
            notif_url: self.config.callback_url.clone(),
            channel_user_msisdn: self.config.channel_msisdn.clone(),
            amount: amount.to_string(),
            subscriber_msisdn: subscriber.local().to_string(),
            pin: self.config.pin.clone(),
            order_id: order_id.to_string(),
            description: description.to_string(),
            pay_token: pay_token.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            let err = match self.pay(product, &body).await {
                Ok(data) => {
                    let accepted = map_status(data.raw_status()) != Some(ProviderStatus::Failed);
                    info!(
                        product = product.path(),
                        pay_token = %pay_token,
                        order_id,
                        status = data.raw_status(),
                        accepted,
                        "provider_b pay submitted"
                    );
                    return Ok(ProviderAck {
                        provider_reference: pay_token,
                        accepted,
                    });
                }
                Err(err) if !err.is_ambiguous() => return Err(err),
                Err(err) => err,
            };

            warn!(
                product = product.path(),
                pay_token = %pay_token,
                attempt,
                "provider_b pay outcome unknown ({}), checking status",
                err
            );

            match self.lookup(product, &pay_token).await {
                Ok(Some(data)) if !data.is_unpaid() => {
                    let accepted = map_status(data.raw_status()) != Some(ProviderStatus::Failed);
                    return Ok(ProviderAck {
                        provider_reference: pay_token,
                        accepted,
                    });
                }
                Ok(_) if attempt < self.max_retries => attempt += 1,
                Ok(_) => return Err(err),
                Err(lookup) => {
                    return Err(ProviderError::Unavailable(format!(
                        "{}; status check failed: {}",
                        err, lookup
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl PaymentProvider for OrangeMoneyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ProviderB
    }

    /// The `init` step: the returned pay token is the provider reference.
    async fn reserve_reference(&self, operation: Operation) -> Result<String, ProviderError> {
        let pay_token = self.init(Product::from(operation)).await?;
        info!(operation = operation.as_str(), pay_token = %pay_token, "provider_b pay token reserved");
        Ok(pay_token)
    }

    async fn find_operation(
        &self,
        operation: Operation,
        provider_reference: &str,
    ) -> Result<Option<StatusReport>, ProviderError> {
        match self.lookup(Product::from(operation), provider_reference).await? {
            Some(data) if !data.is_unpaid() => data.report().map(Some),
            _ => Ok(None),
        }
    }

    async fn initiate_collection(
        &self,
        request: &CollectionRequest,
    ) -> Result<ProviderAck, ProviderError> {
        info!(
            transaction_reference = %request.transaction_reference,
            amount = request.amount,
            "provider_b: web payment"
        );
        self.initiate(
            Product::WebPayment,
            &request.provider_reference,
            &request.transaction_reference,
            request.amount,
            &request.payer_handle,
            "Rent payment",
        )
        .await
    }

    async fn check_status(&self, provider_reference: &str) -> Result<StatusReport, ProviderError> {
        let Some(data) = self.lookup(Product::WebPayment, provider_reference).await? else {
            return Err(ProviderError::Rejected(format!(
                "unknown payment {}",
                provider_reference
            )));
        };
        data.report()
    }

    async fn initiate_disbursement(
        &self,
        request: &DisbursementRequest,
    ) -> Result<ProviderAck, ProviderError> {
        info!(
            transaction_reference = %request.transaction_reference,
            amount = request.amount,
            "provider_b: cash in"
        );
        self.initiate(
            Product::CashIn,
            &request.provider_reference,
            &request.transaction_reference,
            request.amount,
            &request.payee_handle,
            "Rent payout",
        )
        .await
    }

    /// provider_b has no account lookup; a well-formed number is all we can check.
    async fn validate_payer_handle(&self, handle: &str) -> Result<HandleCheck, ProviderError> {
        Ok(HandleCheck {
            valid: Msisdn::parse(handle).is_ok(),
            display_name: None,
        })
    }
}
