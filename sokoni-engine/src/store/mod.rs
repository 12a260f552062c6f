//! Storage traits and implementations.
//!
//! [`EscrowStore`] exposes unit-of-work primitives rather than raw queries:
//! `transition_*` acquires the row lock, re-reads the status, applies the
//! update, and appends the audit event in one transaction. A state change
//! therefore cannot commit without its event, and every lifecycle operation
//! gets its in-lock idempotency re-check from the same place.
//!
//! Two implementations: [`PgStore`] (Postgres via sqlx, `SELECT … FOR
//! UPDATE`) and [`MemStore`] (one async mutex over all tables; the lock
//! serializes unit-of-works, which is exactly the semantics tests need).
//!
//! [`PgStore`]: crate::store::pg::PgStore
//! [`MemStore`]: crate::store::mem::MemStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sokoni_api::models::EscrowStats;
use sokoni_api::types::{
    Escrow, EscrowEvent, EscrowStatus, MilestonePayment, MilestoneStatus,
    Notification, SellerPayoutAccount, User,
};
use sokoni_common::ids::{EscrowId, MilestoneId, SourceId, UserId, WebhookLogId};

use crate::models::{
    EscrowFilter, EscrowUpdate, MilestoneUpdate, NewEscrow, NewEvent,
    NewMilestone, NewNotification, NewPayoutAccount, NewWebhookLog, SourceSpec,
    StatsScope,
};

/// In-memory store and directory, used by tests and local development.
pub mod mem;
/// Postgres store and directory.
pub mod pg;

/// Errors from either store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
}

/// Outcome of a guarded escrow transition.
#[derive(Clone, Debug)]
pub enum Transition {
    /// The row was in an allowed source state; update + event committed.
    Applied(Escrow),
    /// The row already held the target status. Nothing written.
    Already(Escrow),
    /// The row was in some other state. Nothing written.
    Conflict(Escrow),
    NotFound,
}

/// Outcome of a guarded milestone transition.
#[derive(Clone, Debug)]
pub enum MilestoneTransition {
    Applied {
        milestone: MilestonePayment,
        escrow: Escrow,
        /// Whether this transition released the last milestone and the
        /// parent escrow transitioned to RELEASED in the same transaction.
        parent_released: bool,
    },
    Already(MilestonePayment),
    Conflict(MilestonePayment),
    NotFound,
}

/// Unit-of-work primitives over the relational tables.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    // --- Escrows --- //

    /// Insert an escrow (PENDING), its milestone schedule, and the `created`
    /// event in one transaction.
    async fn create_escrow(
        &self,
        new: NewEscrow,
        milestones: Vec<NewMilestone>,
        event: NewEvent,
    ) -> Result<Escrow, StoreError>;

    async fn get_escrow(
        &self,
        id: EscrowId,
    ) -> Result<Option<Escrow>, StoreError>;

    async fn escrow_by_payment_ref(
        &self,
        reference: &str,
    ) -> Result<Option<Escrow>, StoreError>;

    async fn escrow_by_transfer_ref(
        &self,
        reference: &str,
    ) -> Result<Option<Escrow>, StoreError>;

    /// Lock the row, re-read the status, and apply `update` + `event` iff
    /// the current status is in `allowed_from`. Reports [`Transition::Already`]
    /// when the row already holds `update.status`.
    async fn transition_escrow(
        &self,
        id: EscrowId,
        allowed_from: &[EscrowStatus],
        update: EscrowUpdate,
        event: NewEvent,
    ) -> Result<Transition, StoreError>;

    /// Unguarded field update (external confirmations, payment session
    /// attachment); optionally appends an event in the same transaction.
    async fn update_escrow(
        &self,
        id: EscrowId,
        update: EscrowUpdate,
        event: Option<NewEvent>,
    ) -> Result<Option<Escrow>, StoreError>;

    /// Page of escrows plus the total match count, newest first.
    async fn list_escrows(
        &self,
        filter: EscrowFilter,
    ) -> Result<(Vec<Escrow>, u64), StoreError>;

    async fn escrow_stats(
        &self,
        scope: StatsScope,
    ) -> Result<EscrowStats, StoreError>;

    /// DELIVERED escrows whose inspection window has lapsed.
    async fn due_for_auto_release(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EscrowId>, StoreError>;

    /// DELIVERED escrows auto-releasing within `(now, until]`.
    async fn releasing_soon(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Escrow>, StoreError>;

    // --- Milestones --- //

    async fn milestones_for(
        &self,
        escrow_id: EscrowId,
    ) -> Result<Vec<MilestonePayment>, StoreError>;

    async fn get_milestone(
        &self,
        escrow_id: EscrowId,
        id: MilestoneId,
    ) -> Result<Option<MilestonePayment>, StoreError>;

    async fn milestone_by_transfer_ref(
        &self,
        reference: &str,
    ) -> Result<Option<MilestonePayment>, StoreError>;

    /// Guarded milestone transition under the parent escrow's row lock.
    /// When `parent_on_all_released` is set and every milestone (including
    /// this one) is RELEASED after the update, the parent update + event are
    /// applied in the same transaction.
    async fn transition_milestone(
        &self,
        escrow_id: EscrowId,
        id: MilestoneId,
        allowed_from: &[MilestoneStatus],
        update: MilestoneUpdate,
        event: NewEvent,
        parent_on_all_released: Option<(EscrowUpdate, NewEvent)>,
    ) -> Result<MilestoneTransition, StoreError>;

    // --- Audit events --- //

    /// Events for an escrow, ascending by time.
    async fn events_for(
        &self,
        escrow_id: EscrowId,
    ) -> Result<Vec<EscrowEvent>, StoreError>;

    /// Append an event outside any transition (external confirmations that
    /// change no escrow column).
    async fn append_event(
        &self,
        escrow_id: EscrowId,
        event: NewEvent,
    ) -> Result<EscrowEvent, StoreError>;

    // --- Payout accounts --- //

    async fn active_payout_account(
        &self,
        user_id: UserId,
    ) -> Result<Option<SellerPayoutAccount>, StoreError>;

    /// Deactivate every active account for this user, returning them.
    async fn deactivate_payout_accounts(
        &self,
        user_id: UserId,
    ) -> Result<Vec<SellerPayoutAccount>, StoreError>;

    async fn insert_payout_account(
        &self,
        new: NewPayoutAccount,
    ) -> Result<SellerPayoutAccount, StoreError>;

    // --- Webhook logs --- //

    /// Register a webhook delivery. The unique key on
    /// (provider, event_type, reference) makes this the idempotency gate.
    async fn insert_webhook_log(
        &self,
        new: NewWebhookLog,
    ) -> Result<WebhookInsert, StoreError>;

    async fn mark_webhook_processed(
        &self,
        id: WebhookLogId,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    // --- Notifications --- //

    async fn insert_notification(
        &self,
        new: NewNotification,
    ) -> Result<Notification, StoreError>;

    /// Whether a notification of this type for this escrow and user exists
    /// at or after `since`. Used to suppress duplicate warnings.
    async fn notification_exists_since(
        &self,
        user_id: UserId,
        escrow_id: EscrowId,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn notifications_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Notification>, StoreError>;
}

/// Outcome of registering a webhook delivery.
#[derive(Clone, Debug)]
pub enum WebhookInsert {
    Inserted(WebhookLogId),
    /// The (provider, event_type, reference) triple was already registered.
    Duplicate,
}

/// User and source lookups. Profile and source CRUD are external
/// collaborators; the engine only reads through this seam.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Admin users to notify about payout failures.
    async fn admins(&self) -> Result<Vec<User>, StoreError>;

    async fn job_proposal(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError>;

    async fn campaign(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError>;

    async fn service_request(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError>;
}
