//! Fan-out of payment status changes to live subscribers.

use bankd_core::{Payment, PaymentStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub payment_id: Uuid,
    pub user_id: Uuid,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub payee: String,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl From<&Payment> for PaymentEvent {
    fn from(payment: &Payment) -> Self {
        Self {
            payment_id: payment.id,
            user_id: payment.user_id,
            status: payment.status,
            amount: payment.amount,
            payee: payment.payee.clone(),
            failure_reason: payment.failure_reason.clone(),
            at: payment.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct PaymentEvents {
    sender: broadcast::Sender<PaymentEvent>,
}

impl Default for PaymentEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentEvents {
    pub const CAPACITY: usize = 256;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: PaymentEvent) {
        // no subscribers is not an error
        let receivers = self.sender.send(event).unwrap_or(0);
        tracing::trace!(receivers, "payment event published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PaymentEvent> {
        self.sender.subscribe()
    }
}
