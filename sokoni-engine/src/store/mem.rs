//! In-memory [`EscrowStore`] and [`Directory`].
//!
//! One async mutex guards all tables, so every unit-of-work is serialized:
//! the same per-escrow ordering the Postgres store gets from row locks,
//! just coarser. Used by the engine's tests and local development.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sokoni_api::models::EscrowStats;
use sokoni_api::types::{
    Escrow, EscrowEvent, EscrowStatus, MilestonePayment, MilestoneStatus,
    Notification, SellerPayoutAccount, User, WebhookLog,
};
use sokoni_common::ids::{
    EscrowId, EventId, MilestoneId, NotificationId, PayoutAccountId, SourceId,
    UserId, WebhookLogId,
};
use tokio::sync::Mutex;

use crate::models::{
    EscrowFilter, EscrowUpdate, MilestoneUpdate, NewEscrow, NewEvent,
    NewMilestone, NewNotification, NewPayoutAccount, NewWebhookLog, SourceSpec,
    StatsScope,
};
use crate::store::{
    Directory, EscrowStore, MilestoneTransition, StoreError, Transition,
    WebhookInsert,
};

#[derive(Default)]
struct Tables {
    escrows: BTreeMap<i64, Escrow>,
    milestones: BTreeMap<i64, MilestonePayment>,
    events: Vec<EscrowEvent>,
    payout_accounts: Vec<SellerPayoutAccount>,
    webhook_logs: Vec<WebhookLog>,
    webhook_keys: HashSet<(String, String, String)>,
    notifications: Vec<Notification>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_event(
        &mut self,
        escrow_id: EscrowId,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> EscrowEvent {
        let row = EscrowEvent {
            id: EventId(self.next_id()),
            escrow_id,
            milestone_payment_id: event.milestone_id,
            actor_id: event.actor_id,
            event_type: event.event_type.as_str().to_owned(),
            description: event.description,
            metadata: event.metadata,
            ip_address: event.ip_address,
            created_at: now,
        };
        self.events.push(row.clone());
        row
    }
}

/// The in-memory store.
#[derive(Default)]
pub struct MemStore {
    tables: Mutex<Tables>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscrowStore for MemStore {
    async fn create_escrow(
        &self,
        new: NewEscrow,
        milestones: Vec<NewMilestone>,
        event: NewEvent,
    ) -> Result<Escrow, StoreError> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let id = EscrowId(t.next_id());
        let escrow = Escrow {
            id,
            buyer_id: new.buyer_id,
            seller_id: new.seller_id,
            source: new.source,
            title: new.title,
            currency: new.currency,
            total_amount: new.total_amount,
            fee_amount: new.fee_amount,
            seller_amount: new.seller_amount,
            status: EscrowStatus::Pending,
            inspection_period_days: new.inspection_period_days,
            payment_ref: None,
            payment_access_code: None,
            transfer_ref: None,
            seller_recipient_code: None,
            seller_payout_method: None,
            delivery_note: None,
            terms: new.terms,
            metadata: new.metadata,
            dispute_reason: None,
            dispute_raised_by: None,
            dispute_resolution: None,
            split_percent: None,
            cancelled_by: None,
            cancellation_reason: None,
            transfer_fail_reason: None,
            created_at: now,
            updated_at: now,
            payment_confirmed_at: None,
            delivery_confirmed_at: None,
            auto_release_at: None,
            funds_released_at: None,
            transfer_confirmed_at: None,
            transfer_failed_at: None,
            refund_confirmed_at: None,
            cancelled_at: None,
            dispute_resolved_at: None,
        };
        debug_assert!(escrow.amounts_consistent());
        t.escrows.insert(id.to_i64(), escrow.clone());

        for m in milestones {
            let mid = t.next_id();
            t.milestones.insert(
                mid,
                MilestonePayment {
                    id: MilestoneId(mid),
                    escrow_id: id,
                    source_milestone_id: m.source_milestone_id,
                    title: m.title,
                    amount: m.amount,
                    order_index: m.order_index,
                    status: MilestoneStatus::Pending,
                    transfer_ref: None,
                    delivery_note: None,
                    rejection_reason: None,
                    due_date: m.due_date,
                    delivered_at: None,
                    released_at: None,
                },
            );
        }

        t.push_event(id, event, now);
        Ok(escrow)
    }

    async fn get_escrow(
        &self,
        id: EscrowId,
    ) -> Result<Option<Escrow>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.escrows.get(&id.to_i64()).cloned())
    }

    async fn escrow_by_payment_ref(
        &self,
        reference: &str,
    ) -> Result<Option<Escrow>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.escrows
            .values()
            .find(|e| e.payment_ref.as_deref() == Some(reference))
            .cloned())
    }

    async fn escrow_by_transfer_ref(
        &self,
        reference: &str,
    ) -> Result<Option<Escrow>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.escrows
            .values()
            .find(|e| e.transfer_ref.as_deref() == Some(reference))
            .cloned())
    }

    async fn transition_escrow(
        &self,
        id: EscrowId,
        allowed_from: &[EscrowStatus],
        update: EscrowUpdate,
        event: NewEvent,
    ) -> Result<Transition, StoreError> {
        let target = update
            .status
            .expect("transition_escrow requires a target status");
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let Some(current) = t.escrows.get(&id.to_i64()).cloned() else {
            return Ok(Transition::NotFound);
        };
        if current.status == target {
            return Ok(Transition::Already(current));
        }
        if !allowed_from.contains(&current.status) {
            return Ok(Transition::Conflict(current));
        }
        let mut next = current;
        update.apply_to(&mut next, now);
        t.escrows.insert(id.to_i64(), next.clone());
        t.push_event(id, event, now);
        Ok(Transition::Applied(next))
    }

    async fn update_escrow(
        &self,
        id: EscrowId,
        update: EscrowUpdate,
        event: Option<NewEvent>,
    ) -> Result<Option<Escrow>, StoreError> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let Some(mut next) = t.escrows.get(&id.to_i64()).cloned() else {
            return Ok(None);
        };
        update.apply_to(&mut next, now);
        t.escrows.insert(id.to_i64(), next.clone());
        if let Some(event) = event {
            t.push_event(id, event, now);
        }
        Ok(Some(next))
    }

    async fn list_escrows(
        &self,
        filter: EscrowFilter,
    ) -> Result<(Vec<Escrow>, u64), StoreError> {
        let t = self.tables.lock().await;
        let mut matches = t
            .escrows
            .values()
            .filter(|e| {
                filter.status.is_none_or(|s| e.status == s)
                    && filter.buyer.is_none_or(|u| e.buyer_id == u)
                    && filter.seller.is_none_or(|u| e.seller_id == u)
                    && filter
                        .either_party
                        .is_none_or(|u| e.buyer_id == u || e.seller_id == u)
            })
            .cloned()
            .collect::<Vec<_>>();
        // Newest first; id breaks created_at ties.
        matches.sort_by(|a, b| {
            (b.created_at, b.id.to_i64()).cmp(&(a.created_at, a.id.to_i64()))
        });
        let total = matches.len() as u64;
        let page = filter.page.max(1) as usize;
        let offset = (page - 1).saturating_mul(filter.limit as usize);
        let items = matches
            .into_iter()
            .skip(offset)
            .take(filter.limit as usize)
            .collect();
        Ok((items, total))
    }

    async fn escrow_stats(
        &self,
        scope: StatsScope,
    ) -> Result<EscrowStats, StoreError> {
        let t = self.tables.lock().await;
        let mut stats = EscrowStats::default();
        let mut total_minor = 0i64;
        let mut released_minor = 0i64;
        let mut in_escrow_minor = 0i64;
        for e in t.escrows.values() {
            if let StatsScope::User(user) = scope {
                if e.buyer_id != user && e.seller_id != user {
                    continue;
                }
            }
            stats.total += 1;
            match e.status {
                EscrowStatus::Pending => stats.pending += 1,
                EscrowStatus::Funded => stats.funded += 1,
                EscrowStatus::InProgress => stats.in_progress += 1,
                EscrowStatus::Delivered => stats.delivered += 1,
                EscrowStatus::Released => stats.released += 1,
                EscrowStatus::Disputed => stats.disputed += 1,
                EscrowStatus::Refunded => stats.refunded += 1,
                EscrowStatus::Cancelled => stats.cancelled += 1,
            }
            total_minor += e.total_amount.minor();
            match e.status {
                EscrowStatus::Released =>
                    released_minor += e.total_amount.minor(),
                EscrowStatus::Funded
                | EscrowStatus::InProgress
                | EscrowStatus::Delivered
                | EscrowStatus::Disputed =>
                    in_escrow_minor += e.total_amount.minor(),
                _ => {}
            }
        }
        stats.total_amount = amount(total_minor)?;
        stats.released_amount = amount(released_minor)?;
        stats.in_escrow_amount = amount(in_escrow_minor)?;
        Ok(stats)
    }

    async fn due_for_auto_release(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EscrowId>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.escrows
            .values()
            .filter(|e| {
                e.status == EscrowStatus::Delivered
                    && e.auto_release_at.is_some_and(|at| at <= now)
            })
            .take(limit as usize)
            .map(|e| e.id)
            .collect())
    }

    async fn releasing_soon(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Escrow>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.escrows
            .values()
            .filter(|e| {
                e.status == EscrowStatus::Delivered
                    && e.auto_release_at
                        .is_some_and(|at| at > now && at <= until)
            })
            .cloned()
            .collect())
    }

    // --- Milestones --- //

    async fn milestones_for(
        &self,
        escrow_id: EscrowId,
    ) -> Result<Vec<MilestonePayment>, StoreError> {
        let t = self.tables.lock().await;
        let mut rows = t
            .milestones
            .values()
            .filter(|m| m.escrow_id == escrow_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|m| m.order_index);
        Ok(rows)
    }

    async fn get_milestone(
        &self,
        escrow_id: EscrowId,
        id: MilestoneId,
    ) -> Result<Option<MilestonePayment>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.milestones
            .get(&id.to_i64())
            .filter(|m| m.escrow_id == escrow_id)
            .cloned())
    }

    async fn milestone_by_transfer_ref(
        &self,
        reference: &str,
    ) -> Result<Option<MilestonePayment>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.milestones
            .values()
            .find(|m| m.transfer_ref.as_deref() == Some(reference))
            .cloned())
    }

    async fn transition_milestone(
        &self,
        escrow_id: EscrowId,
        id: MilestoneId,
        allowed_from: &[MilestoneStatus],
        update: MilestoneUpdate,
        event: NewEvent,
        parent_on_all_released: Option<(EscrowUpdate, NewEvent)>,
    ) -> Result<MilestoneTransition, StoreError> {
        let target = update
            .status
            .expect("transition_milestone requires a target status");
        let mut t = self.tables.lock().await;
        let now = Utc::now();

        let Some(current) = t
            .milestones
            .get(&id.to_i64())
            .filter(|m| m.escrow_id == escrow_id)
            .cloned()
        else {
            return Ok(MilestoneTransition::NotFound);
        };
        let Some(escrow) = t.escrows.get(&escrow_id.to_i64()).cloned() else {
            return Ok(MilestoneTransition::NotFound);
        };
        if current.status == target {
            return Ok(MilestoneTransition::Already(current));
        }
        if !allowed_from.contains(&current.status) {
            return Ok(MilestoneTransition::Conflict(current));
        }

        let mut next = current;
        update.apply_to(&mut next);
        t.milestones.insert(id.to_i64(), next.clone());
        let event = event.milestone(id);
        t.push_event(escrow_id, event, now);

        let mut escrow = escrow;
        let mut parent_released = false;
        if let Some((parent_update, parent_event)) = parent_on_all_released {
            let all_released = t
                .milestones
                .values()
                .filter(|m| m.escrow_id == escrow_id)
                .all(|m| m.status == MilestoneStatus::Released);
            if all_released && escrow.status != EscrowStatus::Released {
                parent_update.apply_to(&mut escrow, now);
                t.escrows.insert(escrow_id.to_i64(), escrow.clone());
                t.push_event(escrow_id, parent_event, now);
                parent_released = true;
            }
        }

        Ok(MilestoneTransition::Applied {
            milestone: next,
            escrow,
            parent_released,
        })
    }

    // --- Audit events --- //

    async fn events_for(
        &self,
        escrow_id: EscrowId,
    ) -> Result<Vec<EscrowEvent>, StoreError> {
        let t = self.tables.lock().await;
        let mut rows = t
            .events
            .iter()
            .filter(|e| e.escrow_id == escrow_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|e| (e.created_at, e.id.to_i64()));
        Ok(rows)
    }

    async fn append_event(
        &self,
        escrow_id: EscrowId,
        event: NewEvent,
    ) -> Result<EscrowEvent, StoreError> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        Ok(t.push_event(escrow_id, event, now))
    }

    // --- Payout accounts --- //

    async fn active_payout_account(
        &self,
        user_id: UserId,
    ) -> Result<Option<SellerPayoutAccount>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.payout_accounts
            .iter()
            .find(|a| a.user_id == user_id && a.is_active)
            .cloned())
    }

    async fn deactivate_payout_accounts(
        &self,
        user_id: UserId,
    ) -> Result<Vec<SellerPayoutAccount>, StoreError> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let mut deactivated = Vec::new();
        for account in t.payout_accounts.iter_mut() {
            if account.user_id == user_id && account.is_active {
                account.is_active = false;
                account.updated_at = now;
                deactivated.push(account.clone());
            }
        }
        Ok(deactivated)
    }

    async fn insert_payout_account(
        &self,
        new: NewPayoutAccount,
    ) -> Result<SellerPayoutAccount, StoreError> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        if t.payout_accounts
            .iter()
            .any(|a| a.user_id == new.user_id && a.is_active)
        {
            return Err(StoreError::Database(
                "active payout account already exists".to_owned(),
            ));
        }
        let account = SellerPayoutAccount {
            id: PayoutAccountId(t.next_id()),
            user_id: new.user_id,
            payout_method: new.payout_method,
            mobile_money_number: new.mobile_money_number,
            bank_account_number: new.bank_account_number,
            bank_code: new.bank_code,
            bank_account_name: new.bank_account_name,
            provider_recipient_code: new.provider_recipient_code,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        t.payout_accounts.push(account.clone());
        Ok(account)
    }

    // --- Webhook logs --- //

    async fn insert_webhook_log(
        &self,
        new: NewWebhookLog,
    ) -> Result<WebhookInsert, StoreError> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let key = (
            new.provider.clone(),
            new.event_type.clone(),
            new.reference.clone(),
        );
        if !t.webhook_keys.insert(key) {
            return Ok(WebhookInsert::Duplicate);
        }
        let id = WebhookLogId(t.next_id());
        t.webhook_logs.push(WebhookLog {
            id,
            provider: new.provider,
            event_type: new.event_type,
            reference: new.reference,
            payload: new.payload,
            processed: false,
            error: None,
            created_at: now,
        });
        Ok(WebhookInsert::Inserted(id))
    }

    async fn mark_webhook_processed(
        &self,
        id: WebhookLogId,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        if let Some(log) = t.webhook_logs.iter_mut().find(|l| l.id == id) {
            log.processed = error.is_none();
            log.error = error;
        }
        Ok(())
    }

    // --- Notifications --- //

    async fn insert_notification(
        &self,
        new: NewNotification,
    ) -> Result<Notification, StoreError> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let row = Notification {
            id: NotificationId(t.next_id()),
            user_id: new.user_id,
            notification_type: new.notification_type,
            title: new.title,
            message: new.message,
            escrow_id: new.escrow_id,
            metadata: new.metadata,
            is_read: false,
            created_at: now,
        };
        t.notifications.push(row.clone());
        Ok(row)
    }

    async fn notification_exists_since(
        &self,
        user_id: UserId,
        escrow_id: EscrowId,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.notifications.iter().any(|n| {
            n.user_id == user_id
                && n.escrow_id == Some(escrow_id)
                && n.notification_type == notification_type
                && n.created_at >= since
        }))
    }

    async fn notifications_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Notification>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }
}

// --- MemDirectory --- //

#[derive(Default)]
struct DirectoryTables {
    users: HashMap<i64, User>,
    job_proposals: HashMap<i64, SourceSpec>,
    campaigns: HashMap<i64, SourceSpec>,
    service_requests: HashMap<i64, SourceSpec>,
}

/// In-memory [`Directory`] seeded by tests.
#[derive(Default)]
pub struct MemDirectory {
    tables: std::sync::Mutex<DirectoryTables>,
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: User) {
        let mut t = self.tables.lock().unwrap();
        t.users.insert(user.id.to_i64(), user);
    }

    pub fn add_job_proposal(&self, id: SourceId, spec: SourceSpec) {
        let mut t = self.tables.lock().unwrap();
        t.job_proposals.insert(id.to_i64(), spec);
    }

    pub fn add_campaign(&self, id: SourceId, spec: SourceSpec) {
        let mut t = self.tables.lock().unwrap();
        t.campaigns.insert(id.to_i64(), spec);
    }

    pub fn add_service_request(&self, id: SourceId, spec: SourceSpec) {
        let mut t = self.tables.lock().unwrap();
        t.service_requests.insert(id.to_i64(), spec);
    }
}

#[async_trait]
impl Directory for MemDirectory {
    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.users.get(&id.to_i64()).cloned())
    }

    async fn admins(&self) -> Result<Vec<User>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.users
            .values()
            .filter(|u| u.role == sokoni_api::types::Role::Admin)
            .cloned()
            .collect())
    }

    async fn job_proposal(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.job_proposals.get(&id.to_i64()).cloned())
    }

    async fn campaign(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.campaigns.get(&id.to_i64()).cloned())
    }

    async fn service_request(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.service_requests.get(&id.to_i64()).cloned())
    }
}

fn amount(minor: i64) -> Result<sokoni_common::money::Amount, StoreError> {
    sokoni_common::money::Amount::from_minor(minor)
        .map_err(|e| StoreError::Database(e.to_string()))
}
