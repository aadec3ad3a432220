// src/services/notification_emitter.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::models::notification::{Notification, NotificationKind};
use crate::models::transaction::Transaction;
use crate::services::directory::IdentityDirectory;
use crate::services::escrow::Split;

/// "Send user X a message of type Y with payload Z."
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<()>;
}

pub struct HttpNotificationDispatcher {
    client: Client,
    base_url: String,
}

impl HttpNotificationDispatcher {
    pub fn new(base_url: &str, timeout: Duration) -> std::result::Result<Self, AppError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for HttpNotificationDispatcher {
    async fn dispatch(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/notifications", self.base_url))
            .json(notification)
            .send()
            .await
            .map_err(|e| anyhow!("notification request failed: {}", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow!(
                "notification dispatch failed with status: {}",
                response.status()
            ))
        }
    }
}

/// Turns ledger outcomes into one message per affected party.
/// Failures are logged and swallowed.
#[derive(Clone)]
pub struct NotificationEmitter {
    dispatcher: Arc<dyn NotificationDispatcher>,
    directory: Arc<dyn IdentityDirectory>,
}

impl NotificationEmitter {
    pub fn new(
        dispatcher: Arc<dyn NotificationDispatcher>,
        directory: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self {
            dispatcher,
            directory,
        }
    }

    pub async fn payment_completed(&self, tx: &Transaction) {
        let amount = format_amount(tx.amount, &tx.currency);
        let data = transaction_data(tx);

        self.send(
            &tx.renter_id,
            NotificationKind::PaymentCompleted,
            "Payment successful",
            format!("Your payment of {} ({}) was received.", amount, tx.transaction_reference),
            data.clone(),
        )
        .await;

        let held = if tx.transaction_type.is_escrow_eligible() {
            " It is held in escrow until release."
        } else {
            ""
        };
        self.send(
            &tx.landlord_id,
            NotificationKind::PaymentReceived,
            "Payment received",
            format!("A renter paid {} for property {}.{}", amount, tx.property_id, held),
            data,
        )
        .await;
    }

    pub async fn payment_failed(&self, tx: &Transaction) {
        let reason = tx.failure_reason.as_deref().unwrap_or("declined by provider");
        self.send(
            &tx.renter_id,
            NotificationKind::PaymentFailed,
            "Payment failed",
            format!(
                "Your payment of {} could not be completed: {}.",
                format_amount(tx.amount, &tx.currency),
                reason
            ),
            transaction_data(tx),
        )
        .await;
    }

    pub async fn escrow_released(&self, tx: &Transaction, split: &Split) {
        let mut data = transaction_data(tx);
        data["landlord_net"] = json!(split.landlord_net);
        data["commission"] = json!(split.commission);

        self.send(
            &tx.landlord_id,
            NotificationKind::PayoutSent,
            "Payout sent",
            format!(
                "{} has been sent to you for property {}.",
                format_amount(split.landlord_net, &tx.currency),
                tx.property_id
            ),
            data.clone(),
        )
        .await;

        self.send(
            &tx.renter_id,
            NotificationKind::EscrowReleased,
            "Payment released",
            format!(
                "Your payment {} has been released to the landlord.",
                tx.transaction_reference
            ),
            data,
        )
        .await;
    }

    pub async fn escrow_refunded(&self, tx: &Transaction) {
        let amount = format_amount(tx.amount, &tx.currency);
        let data = transaction_data(tx);

        self.send(
            &tx.renter_id,
            NotificationKind::EscrowRefunded,
            "Payment refunded",
            format!("{} has been refunded to you.", amount),
            data.clone(),
        )
        .await;

        self.send(
            &tx.landlord_id,
            NotificationKind::EscrowRefunded,
            "Payment refunded",
            format!(
                "The payment {} for property {} was refunded to the renter.",
                tx.transaction_reference, tx.property_id
            ),
            data,
        )
        .await;
    }

    async fn target_for(&self, party_id: &str) -> String {
        match self.directory.resolve_party(party_id).await {
            Ok(profile) => profile.notification_target,
            Err(e) => {
                warn!(party_id, "Could not resolve notification target, using party id: {}", e);
                party_id.to_string()
            }
        }
    }

    async fn send(
        &self,
        party_id: &str,
        kind: NotificationKind,
        title: &str,
        body: String,
        data: serde_json::Value,
    ) {
        let notification = Notification {
            user_id: party_id.to_string(),
            target: self.target_for(party_id).await,
            notification_type: kind,
            title: title.to_string(),
            body,
            data,
        };

        match self.dispatcher.dispatch(&notification).await {
            Ok(()) => info!(party_id, kind = kind.as_str(), "📨 Notification sent"),
            Err(e) => warn!(party_id, kind = kind.as_str(), "Notification dispatch failed: {}", e),
        }
    }
}

fn transaction_data(tx: &Transaction) -> serde_json::Value {
    json!({
        "transaction_id": tx.id,
        "transaction_reference": tx.transaction_reference,
        "property_id": tx.property_id,
        "amount": tx.amount,
        "currency": tx.currency,
        "payment_status": tx.payment_status,
        "escrow_status": tx.escrow_status,
    })
}

fn format_amount(amount: i64, currency: &str) -> String {
    format!("{} {}", amount, currency)
}
