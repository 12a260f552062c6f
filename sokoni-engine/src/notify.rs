//! Best-effort notification sink.
//!
//! Notifications are written strictly after the state-change transaction
//! commits. Every failure is caught and logged; nothing here ever
//! propagates an error into a lifecycle operation.

use std::sync::Arc;

use serde_json::Value;
use sokoni_common::ids::{EscrowId, UserId};
use tracing::warn;

use crate::models::NewNotification;
use crate::store::EscrowStore;

/// Dot-delimited notification categories.
pub mod kinds {
    pub const ESCROW_CREATED: &str = "escrow.created";
    pub const PAYMENT_CONFIRMED: &str = "payment.confirmed";
    pub const ESCROW_FUNDED: &str = "escrow.funded";
    pub const WORK_STARTED: &str = "escrow.work_started";
    pub const ESCROW_DELIVERED: &str = "escrow.delivered";
    pub const ESCROW_RELEASED: &str = "escrow.released";
    pub const PAYOUT_SENT: &str = "payout.sent";
    pub const PAYOUT_FAILED: &str = "payout.failed";
    pub const ESCROW_DISPUTED: &str = "escrow.disputed";
    pub const DISPUTE_RESOLVED: &str = "escrow.dispute_resolved";
    pub const ESCROW_REFUNDED: &str = "escrow.refunded";
    pub const ESCROW_CANCELLED: &str = "escrow.cancelled";
    pub const AUTO_RELEASE_WARNING: &str = "escrow.auto_release_warning";
    pub const MILESTONE_DELIVERED: &str = "escrow.milestone_delivered";
    pub const MILESTONE_RELEASED: &str = "escrow.milestone_released";
}

#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn EscrowStore>,
}

impl Notifier {
    pub fn new(store: Arc<dyn EscrowStore>) -> Self {
        Self { store }
    }

    /// Fire and forget: failures are logged, never rethrown.
    pub async fn notify(
        &self,
        user_id: UserId,
        kind: &str,
        title: &str,
        message: &str,
        escrow_id: Option<EscrowId>,
        metadata: Option<Value>,
    ) {
        let result = self
            .store
            .insert_notification(NewNotification {
                user_id,
                notification_type: kind.to_owned(),
                title: title.to_owned(),
                message: message.to_owned(),
                escrow_id,
                metadata,
            })
            .await;
        if let Err(e) = result {
            warn!(%user_id, kind, "failed to write notification: {e}");
        }
    }

    /// Fan out one record to each party.
    pub async fn notify_both_parties(
        &self,
        buyer_id: UserId,
        seller_id: UserId,
        kind: &str,
        title: &str,
        message: &str,
        escrow_id: EscrowId,
    ) {
        self.notify(buyer_id, kind, title, message, Some(escrow_id), None)
            .await;
        self.notify(seller_id, kind, title, message, Some(escrow_id), None)
            .await;
    }

    pub async fn notify_many(
        &self,
        user_ids: impl IntoIterator<Item = UserId>,
        kind: &str,
        title: &str,
        message: &str,
        escrow_id: Option<EscrowId>,
    ) {
        for user_id in user_ids {
            self.notify(user_id, kind, title, message, escrow_id, None)
                .await;
        }
    }
}
