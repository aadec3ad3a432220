use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentCompleted,
    PaymentReceived,
    PaymentFailed,
    EscrowReleased,
    PayoutSent,
    EscrowRefunded,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentCompleted => "payment_completed",
            NotificationKind::PaymentReceived => "payment_received",
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::EscrowReleased => "escrow_released",
            NotificationKind::PayoutSent => "payout_sent",
            NotificationKind::EscrowRefunded => "escrow_refunded",
        }
    }
}

/// One message for one party, as handed to the dispatcher.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Notification {
    pub user_id: String,
    pub target: String,
    pub notification_type: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}
