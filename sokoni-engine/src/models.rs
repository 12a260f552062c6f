//! Engine-side data shapes: audit event types, insert / update structs, and
//! query filters. The serializable entity views live in `sokoni_api::types`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sokoni_api::types::{
    DisputeResolution, Escrow, EscrowStatus, MilestonePayment, MilestoneStatus,
    PayoutMethod, SourceRef,
};
use sokoni_common::ids::{EscrowId, MilestoneId, SourceId, UserId};
use sokoni_common::money::{Amount, Currency};

// --- Audit event types --- //

/// Every kind of audit event the engine appends. Persisted as snake_case
/// text; the log itself is append-only and never parsed back into this enum.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventType {
    Created,
    Funded,
    WorkStarted,
    Delivered,
    Released,
    AutoReleased,
    TransferConfirmed,
    TransferFailed,
    DisputeRaised,
    DisputeResolved,
    Refunded,
    RefundConfirmed,
    RefundFailed,
    Cancelled,
    MilestoneDelivered,
    MilestoneReleased,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::WorkStarted => "work_started",
            Self::Delivered => "delivered",
            Self::Released => "released",
            Self::AutoReleased => "auto_released",
            Self::TransferConfirmed => "transfer_confirmed",
            Self::TransferFailed => "transfer_failed",
            Self::DisputeRaised => "dispute_raised",
            Self::DisputeResolved => "dispute_resolved",
            Self::Refunded => "refunded",
            Self::RefundConfirmed => "refund_confirmed",
            Self::RefundFailed => "refund_failed",
            Self::Cancelled => "cancelled",
            Self::MilestoneDelivered => "milestone_delivered",
            Self::MilestoneReleased => "milestone_released",
        }
    }
}

/// An audit event to append. The escrow id comes from the store call the
/// event rides on.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub event_type: EventType,
    pub description: String,
    pub milestone_id: Option<MilestoneId>,
    /// `None` for system events (auto-release, webhooks).
    pub actor_id: Option<UserId>,
    pub metadata: Option<Value>,
    pub ip_address: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: EventType, description: impl Into<String>) -> Self {
        Self {
            event_type,
            description: description.into(),
            milestone_id: None,
            actor_id: None,
            metadata: None,
            ip_address: None,
        }
    }

    pub fn actor(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn milestone(mut self, id: MilestoneId) -> Self {
        self.milestone_id = Some(id);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }
}

// --- Inserts --- //

/// A new escrow row; always starts PENDING.
#[derive(Clone, Debug)]
pub struct NewEscrow {
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub source: SourceRef,
    pub title: String,
    pub currency: Currency,
    pub total_amount: Amount,
    pub fee_amount: Amount,
    pub seller_amount: Amount,
    pub inspection_period_days: i32,
    pub terms: Option<String>,
    pub metadata: Option<Value>,
}

/// A milestone row inserted with its parent escrow; always starts PENDING.
/// Milestone schedules are immutable once an escrow references them.
#[derive(Clone, Debug)]
pub struct NewMilestone {
    pub source_milestone_id: Option<i64>,
    pub title: String,
    pub amount: Amount,
    pub order_index: i32,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct NewPayoutAccount {
    pub user_id: UserId,
    pub payout_method: PayoutMethod,
    pub mobile_money_number: Option<String>,
    pub bank_account_number: Option<String>,
    pub bank_code: Option<String>,
    pub bank_account_name: Option<String>,
    pub provider_recipient_code: String,
}

#[derive(Clone, Debug)]
pub struct NewWebhookLog {
    pub provider: String,
    pub event_type: String,
    pub reference: String,
    pub payload: String,
}

#[derive(Clone, Debug)]
pub struct NewNotification {
    pub user_id: UserId,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub escrow_id: Option<EscrowId>,
    pub metadata: Option<Value>,
}

// --- Updates --- //

/// Field updates applied to an escrow row under its row lock. `Some` means
/// "set"; fields are never cleared back to NULL by the engine.
#[derive(Clone, Debug, Default)]
pub struct EscrowUpdate {
    pub status: Option<EscrowStatus>,
    pub payment_ref: Option<String>,
    pub payment_access_code: Option<String>,
    pub transfer_ref: Option<String>,
    pub seller_recipient_code: Option<String>,
    pub seller_payout_method: Option<PayoutMethod>,
    pub delivery_note: Option<String>,
    pub dispute_reason: Option<String>,
    pub dispute_raised_by: Option<UserId>,
    pub dispute_resolution: Option<DisputeResolution>,
    pub split_percent: Option<i32>,
    pub cancelled_by: Option<UserId>,
    pub cancellation_reason: Option<String>,
    pub transfer_fail_reason: Option<String>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    pub delivery_confirmed_at: Option<DateTime<Utc>>,
    pub auto_release_at: Option<DateTime<Utc>>,
    pub funds_released_at: Option<DateTime<Utc>>,
    pub transfer_confirmed_at: Option<DateTime<Utc>>,
    pub transfer_failed_at: Option<DateTime<Utc>>,
    pub refund_confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub dispute_resolved_at: Option<DateTime<Utc>>,
}

impl EscrowUpdate {
    /// Apply the set fields to an in-memory row, stamping `updated_at`.
    /// Shared by both store implementations so their semantics can't drift.
    pub fn apply_to(&self, escrow: &mut Escrow, now: DateTime<Utc>) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $( if let Some(v) = self.$field.clone() {
                    escrow.$field = Some(v);
                } )*
            };
        }
        if let Some(status) = self.status {
            escrow.status = status;
        }
        set!(
            payment_ref,
            payment_access_code,
            transfer_ref,
            seller_recipient_code,
            seller_payout_method,
            delivery_note,
            dispute_reason,
            dispute_raised_by,
            dispute_resolution,
            split_percent,
            cancelled_by,
            cancellation_reason,
            transfer_fail_reason,
            payment_confirmed_at,
            delivery_confirmed_at,
            auto_release_at,
            funds_released_at,
            transfer_confirmed_at,
            transfer_failed_at,
            refund_confirmed_at,
            cancelled_at,
            dispute_resolved_at,
        );
        escrow.updated_at = now;
    }
}

/// Field updates applied to a milestone row under the parent row lock.
#[derive(Clone, Debug, Default)]
pub struct MilestoneUpdate {
    pub status: Option<MilestoneStatus>,
    pub transfer_ref: Option<String>,
    pub delivery_note: Option<String>,
    pub rejection_reason: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl MilestoneUpdate {
    pub fn apply_to(&self, milestone: &mut MilestonePayment) {
        if let Some(status) = self.status {
            milestone.status = status;
        }
        if let Some(v) = self.transfer_ref.clone() {
            milestone.transfer_ref = Some(v);
        }
        if let Some(v) = self.delivery_note.clone() {
            milestone.delivery_note = Some(v);
        }
        if let Some(v) = self.rejection_reason.clone() {
            milestone.rejection_reason = Some(v);
        }
        if let Some(v) = self.delivered_at {
            milestone.delivered_at = Some(v);
        }
        if let Some(v) = self.released_at {
            milestone.released_at = Some(v);
        }
    }
}

// --- Queries --- //

/// Filter for escrow listings. Party filters are mutually exclusive in
/// practice: `either_party` for a user's combined view, `buyer` / `seller`
/// for one side only, none for admin listings.
#[derive(Clone, Debug, Default)]
pub struct EscrowFilter {
    pub status: Option<EscrowStatus>,
    pub buyer: Option<UserId>,
    pub seller: Option<UserId>,
    pub either_party: Option<UserId>,
    /// 1-based page.
    pub page: u32,
    pub limit: u32,
}

/// Scope of a stats query.
#[derive(Copy, Clone, Debug)]
pub enum StatsScope {
    All,
    /// Escrows where the user is buyer or seller.
    User(UserId),
}

// --- Sources --- //

/// What the engine needs from a source object (job proposal, campaign,
/// service request) to create an escrow. Produced by [`Directory`]
/// implementations.
///
/// [`Directory`]: crate::store::Directory
#[derive(Clone, Debug)]
pub struct SourceSpec {
    pub source: SourceRef,
    pub title: String,
    pub buyer_id: UserId,
    /// Known up-front for job proposals; supplied by the caller for
    /// campaigns and service requests.
    pub seller_id: Option<UserId>,
    /// The budget exactly as the source records it, in major units.
    pub amount: String,
    pub terms: Option<String>,
    pub milestones: Vec<MilestoneSpec>,
}

/// One entry of a campaign's milestone schedule.
#[derive(Clone, Debug)]
pub struct MilestoneSpec {
    pub source_milestone_id: Option<i64>,
    pub title: String,
    pub amount: String,
    pub order_index: i32,
    pub due_date: Option<DateTime<Utc>>,
}

/// Convenience for tests and directory implementations.
impl SourceSpec {
    pub fn job_proposal(
        proposal_id: SourceId,
        job_id: Option<SourceId>,
        title: impl Into<String>,
        buyer_id: UserId,
        seller_id: UserId,
        amount: impl Into<String>,
    ) -> Self {
        Self {
            source: SourceRef::JobProposal {
                proposal_id,
                job_id,
            },
            title: title.into(),
            buyer_id,
            seller_id: Some(seller_id),
            amount: amount.into(),
            terms: None,
            milestones: Vec::new(),
        }
    }
}
