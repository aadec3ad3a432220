// services/webhook_gateway.rs
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::errors::{PaymentError, WebhookError};
use crate::models::provider::{OutcomeSource, ProviderKind, ProviderOutcome, ProviderStatus};
use crate::models::transaction::{PaymentStatus, Transaction};
use crate::services::orchestrator::{ApplyResult, PaymentOrchestrator};
use crate::services::providers::{momo, orange_money};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";
pub const NONCE_HEADER: &str = "x-signature-nonce";

/// How an accepted callback was handled. Every variant is acknowledged with 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Processed,
    Duplicate,
    StillPending,
    UnknownReference,
    Ignored,
    Conflict,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Processed => "processed",
            Disposition::Duplicate => "duplicate",
            Disposition::StillPending => "pending",
            Disposition::UnknownReference => "unknown_reference",
            Disposition::Ignored => "ignored",
            Disposition::Conflict => "conflict",
        }
    }
}

/// provider_a callback body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderACallback {
    pub reference_id: String,
    pub status: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub financial_transaction_id: Option<String>,
    #[serde(default)]
    pub reason: Option<serde_json::Value>,
}

/// provider_b callback body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderBCallback {
    pub pay_token: String,
    pub status: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub txnid: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct WebhookSecrets {
    pub provider_a: String,
    pub provider_b: String,
}

/// Verify, deduplicate, apply, acknowledge.
#[derive(Clone)]
pub struct WebhookGateway {
    orchestrator: PaymentOrchestrator,
    secrets: WebhookSecrets,
    tolerance: Duration,
}

impl WebhookGateway {
    pub fn new(orchestrator: PaymentOrchestrator, secrets: WebhookSecrets, tolerance: Duration) -> Self {
        WebhookGateway {
            orchestrator,
            secrets,
            tolerance,
        }
    }

    pub async fn ingest(
        &self,
        provider: ProviderKind,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Disposition, WebhookError> {
        let verified = match provider {
            ProviderKind::ProviderA => verify_triple(
                &self.secrets.provider_a,
                headers,
                body,
                Utc::now().timestamp(),
                self.tolerance,
            ),
            ProviderKind::ProviderB => verify_body_hmac(&self.secrets.provider_b, headers, body),
        };
        if let Err(e) = verified {
            warn!(
                security_event = true,
                provider = provider.as_str(),
                "🚨 Webhook signature rejected: {}",
                e
            );
            return Err(e);
        }

        let outcome = parse_outcome(provider, body)?;
        info!(
            provider = provider.as_str(),
            provider_reference = %outcome.provider_reference,
            status = ?outcome.status,
            "📥 Webhook received"
        );

        let tx = self
            .orchestrator
            .find_for_outcome(&outcome)
            .await
            .map_err(internal)?;
        let Some(tx) = tx else {
            warn!(
                provider = provider.as_str(),
                provider_reference = %outcome.provider_reference,
                "Webhook for unknown reference acknowledged, the sweep will reconcile"
            );
            return Ok(Disposition::UnknownReference);
        };

        if tx.callback_received && status_matches(&tx, outcome.status) {
            info!(transaction_id = %tx.id, "Duplicate webhook acknowledged");
            return Ok(Disposition::Duplicate);
        }

        let applied = self
            .orchestrator
            .apply_provider_outcome(tx, &outcome, OutcomeSource::Webhook)
            .await
            .map_err(internal)?;

        Ok(match applied.result {
            ApplyResult::Applied => Disposition::Processed,
            ApplyResult::Duplicate => Disposition::Duplicate,
            ApplyResult::StillPending => Disposition::StillPending,
            ApplyResult::Ignored => Disposition::Ignored,
            ApplyResult::Conflict => Disposition::Conflict,
        })
    }
}

fn internal(err: PaymentError) -> WebhookError {
    error!("Webhook could not be applied: {}", err);
    WebhookError::Internal(err.to_string())
}

fn status_matches(tx: &Transaction, status: ProviderStatus) -> bool {
    matches!(
        (status, tx.payment_status),
        (
            ProviderStatus::Successful,
            PaymentStatus::Completed | PaymentStatus::Refunded
        ) | (ProviderStatus::Failed, PaymentStatus::Failed)
    )
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WebhookError::InvalidSignature(format!("missing {} header", name)))
}

fn check_mac(mac: HmacSha256, signature: &str) -> Result<(), WebhookError> {
    let expected = hex::decode(signature)
        .map_err(|_| WebhookError::InvalidSignature("signature is not hex".to_string()))?;
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature("signature mismatch".to_string()))
}

fn keyed(secret: &str) -> Result<HmacSha256, WebhookError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Internal(format!("invalid webhook secret: {}", e)))
}

/// provider_a: `hex(HMAC-SHA256(secret, "{timestamp}.{nonce}.{body}"))` with a fresh timestamp.
pub fn verify_triple(
    secret: &str,
    headers: &HeaderMap,
    body: &[u8],
    now: i64,
    tolerance: Duration,
) -> Result<(), WebhookError> {
    let timestamp = header(headers, TIMESTAMP_HEADER)?;
    let nonce = header(headers, NONCE_HEADER)?;
    let signature = header(headers, SIGNATURE_HEADER)?;

    let sent_at: i64 = timestamp
        .parse()
        .map_err(|_| WebhookError::InvalidSignature("timestamp is not a number".to_string()))?;
    let tolerance = tolerance.as_secs();
    if now.abs_diff(sent_at) > tolerance {
        return Err(WebhookError::InvalidSignature(format!(
            "timestamp {} outside the {}s window",
            sent_at, tolerance
        )));
    }

    let mut mac = keyed(secret)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(nonce.as_bytes());
    mac.update(b".");
    mac.update(body);
    check_mac(mac, signature)
}

/// provider_b: `hex(HMAC-SHA256(secret, body))`.
pub fn verify_body_hmac(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
    let signature = header(headers, SIGNATURE_HEADER)?;
    let mut mac = keyed(secret)?;
    mac.update(body);
    check_mac(mac, signature)
}

pub fn parse_outcome(provider: ProviderKind, body: &[u8]) -> Result<ProviderOutcome, WebhookError> {
    let malformed = |e: serde_json::Error| WebhookError::MalformedPayload(e.to_string());
    let unknown = |raw: &str| WebhookError::MalformedPayload(format!("unknown status '{}'", raw));

    match provider {
        ProviderKind::ProviderA => {
            let callback: ProviderACallback = serde_json::from_slice(body).map_err(malformed)?;
            let status = momo::map_status(&callback.status).ok_or_else(|| unknown(&callback.status))?;
            Ok(ProviderOutcome {
                provider,
                provider_reference: callback.reference_id,
                order_reference: callback.external_id,
                status,
                settlement_id: callback.financial_transaction_id,
                reason: callback.reason.as_ref().and_then(momo::reason_text),
            })
        }
        ProviderKind::ProviderB => {
            let callback: ProviderBCallback = serde_json::from_slice(body).map_err(malformed)?;
            let status = orange_money::map_status(&callback.status)
                .ok_or_else(|| unknown(&callback.status))?;
            Ok(ProviderOutcome {
                provider,
                provider_reference: callback.pay_token,
                order_reference: callback.order_id,
                status,
                settlement_id: callback.txnid,
                reason: callback.message,
            })
        }
    }
}
