//! Webhook ingestion and provider-event handlers.
//!
//! Flow: verify the raw-body HMAC, register the delivery in `webhook_logs`
//! (the unique key on provider/event/reference makes duplicates a no-op),
//! ack 200 immediately, then process on a spawned task. Handlers acquire
//! the same row locks as user-initiated lifecycle calls, so a webhook and
//! a concurrent API call can never double-apply a transition.

use std::sync::Arc;

use chrono::Utc;
use ring::hmac;
use sokoni_api::types::{DisputeResolution, EscrowStatus};
use sokoni_common::hexstr;
use sokoni_common::ids::WebhookLogId;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::manager::EscrowManager;
use crate::models::{EscrowUpdate, EventType, NewEvent, NewWebhookLog};
use crate::notify::kinds;
use crate::store::WebhookInsert;

/// Provider name under which deliveries are registered.
pub const PROVIDER_NAME: &str = "paystack";

/// Header carrying the hex HMAC-SHA512 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// A parsed `{event, data}` webhook payload.
#[derive(Clone, Debug)]
pub struct WebhookEvent {
    pub event_type: String,
    pub reference: String,
    pub data: serde_json::Value,
}

/// A registered delivery awaiting processing.
#[derive(Clone, Debug)]
pub struct PendingWebhook {
    pub log_id: WebhookLogId,
    pub event: WebhookEvent,
}

/// Outcome of registering a delivery.
#[derive(Clone, Debug)]
pub enum WebhookAck {
    /// Signature mismatch. No side effects; respond 401.
    Rejected,
    /// Already registered; respond 200 and do nothing else.
    Duplicate,
    /// Registered; respond 200 and hand [`PendingWebhook`] to
    /// [`WebhookIngester::process`] on a spawned task.
    Accepted(PendingWebhook),
}

pub struct WebhookIngester {
    manager: Arc<EscrowManager>,
    secret_key: String,
}

impl WebhookIngester {
    pub fn new(manager: Arc<EscrowManager>, secret_key: String) -> Self {
        Self {
            manager,
            secret_key,
        }
    }

    /// Constant-time check of the signature header against
    /// `HMAC-SHA512(raw_body, provider_secret)`.
    pub fn verify_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        let key = hmac::Key::new(hmac::HMAC_SHA512, self.secret_key.as_bytes());
        let tag = hmac::sign(&key, raw_body);
        let expected = hexstr::encode(tag.as_ref());
        let given = signature.trim().to_ascii_lowercase();
        ring::constant_time::verify_slices_are_equal(
            expected.as_bytes(),
            given.as_bytes(),
        )
        .is_ok()
    }

    /// Verify and register a delivery. Everything that can respond to the
    /// provider quickly happens here; the actual state changes run in
    /// [`process`](Self::process) after the 200 goes out.
    #[instrument(skip_all, name = "(webhook-ingest)")]
    pub async fn ingest(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> EngineResult<WebhookAck> {
        let Some(signature) = signature else {
            return Ok(WebhookAck::Rejected);
        };
        if !self.verify_signature(raw_body, signature) {
            warn!("webhook signature mismatch");
            return Ok(WebhookAck::Rejected);
        }

        let event = parse_event(raw_body)?;
        let insert = self
            .manager
            .store
            .insert_webhook_log(NewWebhookLog {
                provider: PROVIDER_NAME.to_owned(),
                event_type: event.event_type.clone(),
                reference: event.reference.clone(),
                payload: String::from_utf8_lossy(raw_body).into_owned(),
            })
            .await?;

        match insert {
            WebhookInsert::Duplicate => {
                info!(
                    event_type = %event.event_type,
                    reference = %event.reference,
                    "duplicate webhook delivery"
                );
                Ok(WebhookAck::Duplicate)
            }
            WebhookInsert::Inserted(log_id) =>
                Ok(WebhookAck::Accepted(PendingWebhook { log_id, event })),
        }
    }

    /// Process a registered delivery and mark the log row accordingly.
    /// Never fails; errors end up on the log row and in the logs.
    #[instrument(skip_all, name = "(webhook-process)",
                 fields(event_type = %pending.event.event_type))]
    pub async fn process(&self, pending: PendingWebhook) {
        let result = self.dispatch(&pending.event).await;
        let error = match &result {
            Ok(()) => None,
            Err(e) => {
                warn!("webhook processing failed: {e}");
                Some(e.to_string())
            }
        };
        if let Err(e) = self
            .manager
            .store
            .mark_webhook_processed(pending.log_id, error)
            .await
        {
            warn!("could not mark webhook log: {e}");
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> EngineResult<()> {
        match event.event_type.as_str() {
            "charge.success" =>
                self.handle_charge_success(&event.reference).await,
            "transfer.success" =>
                self.handle_transfer_success(&event.reference).await,
            "transfer.failed" | "transfer.reversed" =>
                self.handle_transfer_failure(
                    &event.reference,
                    &event.event_type,
                )
                .await,
            "refund.processed" =>
                self.handle_refund_processed(&event.reference).await,
            other => {
                info!("ignoring unhandled webhook event {other}");
                Ok(())
            }
        }
    }

    /// The provider confirmed an inbound payment.
    async fn handle_charge_success(
        &self,
        reference: &str,
    ) -> EngineResult<()> {
        let escrow = self
            .manager
            .store
            .escrow_by_payment_ref(reference)
            .await?
            .ok_or(EngineError::NotFound("escrow"))?;
        if escrow.status != EscrowStatus::Pending {
            // A buyer-initiated verify got there first.
            return Ok(());
        }
        self.manager.verify_and_fund(&escrow, None).await?;
        Ok(())
    }

    /// A payout transfer settled.
    async fn handle_transfer_success(
        &self,
        reference: &str,
    ) -> EngineResult<()> {
        if let Some(escrow) = self
            .manager
            .store
            .escrow_by_transfer_ref(reference)
            .await?
        {
            let update = EscrowUpdate {
                transfer_confirmed_at: Some(Utc::now()),
                ..Default::default()
            };
            let event = NewEvent::new(
                EventType::TransferConfirmed,
                "Payout transfer confirmed",
            );
            let escrow = self
                .manager
                .store
                .update_escrow(escrow.id, update, Some(event))
                .await?
                .ok_or(EngineError::NotFound("escrow"))?;
            self.manager
                .notifier
                .notify(
                    escrow.seller_id,
                    kinds::PAYOUT_SENT,
                    "Payout sent",
                    &format!(
                        "Your payout of {} for \"{}\" has been sent.",
                        escrow.seller_amount.format(&escrow.currency),
                        escrow.title
                    ),
                    Some(escrow.id),
                    None,
                )
                .await;
            return Ok(());
        }

        if let Some(milestone) = self
            .manager
            .store
            .milestone_by_transfer_ref(reference)
            .await?
        {
            let escrow =
                self.manager.escrow_required(milestone.escrow_id).await?;
            let event = NewEvent::new(
                EventType::TransferConfirmed,
                format!(
                    "Payout for milestone \"{}\" confirmed",
                    milestone.title
                ),
            )
            .milestone(milestone.id);
            self.manager.store.append_event(escrow.id, event).await?;
            self.manager
                .notifier
                .notify(
                    escrow.seller_id,
                    kinds::PAYOUT_SENT,
                    "Milestone payout sent",
                    &format!(
                        "Your payout for milestone \"{}\" has been sent.",
                        milestone.title
                    ),
                    Some(escrow.id),
                    None,
                )
                .await;
            return Ok(());
        }

        Err(EngineError::NotFound("transfer reference"))
    }

    /// A payout transfer failed or was reversed after the fact: put the
    /// money back under escrow and alert the seller and the admins.
    async fn handle_transfer_failure(
        &self,
        reference: &str,
        event_type: &str,
    ) -> EngineResult<()> {
        let reason = format!("provider reported {event_type}");

        if let Some(escrow) = self
            .manager
            .store
            .escrow_by_transfer_ref(reference)
            .await?
        {
            let reverted = self
                .manager
                .revert_failed_transfer(&escrow, &reason)
                .await?;
            self.manager.notify_transfer_failure(&reverted).await;
            return Ok(());
        }

        if let Some(milestone) = self
            .manager
            .store
            .milestone_by_transfer_ref(reference)
            .await?
        {
            let escrow =
                self.manager.escrow_required(milestone.escrow_id).await?;
            // If the parent released off the back of this milestone, the
            // reversal takes the parent back with it.
            let parent_released = escrow.status == EscrowStatus::Released;
            self.manager
                .revert_failed_milestone_transfer(
                    &escrow,
                    &milestone,
                    parent_released,
                    &reason,
                )
                .await?;
            self.manager.notify_transfer_failure(&escrow).await;
            return Ok(());
        }

        Err(EngineError::NotFound("transfer reference"))
    }

    /// The provider finished processing a refund.
    async fn handle_refund_processed(
        &self,
        reference: &str,
    ) -> EngineResult<()> {
        let escrow = self
            .manager
            .store
            .escrow_by_payment_ref(reference)
            .await?
            .ok_or(EngineError::NotFound("escrow"))?;

        // A RELEASED partial-split escrow keeps its status; the refund leg
        // only confirms. Everything else lands on REFUNDED.
        let keep_status = escrow.status == EscrowStatus::Released
            && escrow.dispute_resolution
                == Some(DisputeResolution::PartialSplit);
        let update = EscrowUpdate {
            status: (!keep_status).then_some(EscrowStatus::Refunded),
            refund_confirmed_at: Some(Utc::now()),
            ..Default::default()
        };
        let event =
            NewEvent::new(EventType::RefundConfirmed, "Refund processed");
        let escrow = self
            .manager
            .store
            .update_escrow(escrow.id, update, Some(event))
            .await?
            .ok_or(EngineError::NotFound("escrow"))?;

        self.manager
            .notifier
            .notify(
                escrow.buyer_id,
                kinds::ESCROW_REFUNDED,
                "Refund processed",
                &format!(
                    "Your refund for \"{}\" has been processed.",
                    escrow.title
                ),
                Some(escrow.id),
                None,
            )
            .await;
        Ok(())
    }
}

fn parse_event(raw_body: &[u8]) -> EngineResult<WebhookEvent> {
    let value: serde_json::Value =
        serde_json::from_slice(raw_body).map_err(|e| {
            EngineError::Validation(format!("malformed webhook body: {e}"))
        })?;
    let event_type = value
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            EngineError::Validation("webhook body missing event".to_owned())
        })?
        .to_owned();
    let data = value.get("data").cloned().unwrap_or_default();
    let reference = data
        .get("reference")
        .or_else(|| data.get("transaction_reference"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            EngineError::Validation(
                "webhook body missing reference".to_owned(),
            )
        })?
        .to_owned();
    Ok(WebhookEvent {
        event_type,
        reference,
        data,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_event_accepts_both_reference_fields() {
        let body = br#"{"event": "charge.success",
                        "data": {"reference": "PAY-1-2-abc"}}"#;
        let event = parse_event(body).unwrap();
        assert_eq!(event.event_type, "charge.success");
        assert_eq!(event.reference, "PAY-1-2-abc");

        let body = br#"{"event": "transfer.success",
                        "data": {"transaction_reference": "TRF-1-2-abc"}}"#;
        let event = parse_event(body).unwrap();
        assert_eq!(event.reference, "TRF-1-2-abc");
    }

    #[test]
    fn parse_event_rejects_garbage() {
        assert!(parse_event(b"not json").is_err());
        assert!(parse_event(br#"{"data": {}}"#).is_err());
        assert!(parse_event(br#"{"event": "x", "data": {}}"#).is_err());
    }
}
