//! Postgres [`EscrowStore`] and [`Directory`] on sqlx.
//!
//! Per-escrow serialization comes from `SELECT … FOR UPDATE` on the escrow
//! row; milestone transitions lock the parent row, so webhook handlers,
//! user-initiated calls, and the scheduler all contend on the same lock.
//! The audit event insert rides the same transaction as the state change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sokoni_api::models::EscrowStats;
use sokoni_api::types::{
    Escrow, EscrowEvent, EscrowStatus, MilestonePayment, MilestoneStatus,
    Notification, SellerPayoutAccount, SourceRef, User,
};
use sokoni_common::ids::{
    EscrowId, EventId, MilestoneId, NotificationId, PayoutAccountId, SourceId,
    UserId, WebhookLogId,
};
use sokoni_common::money::{Amount, Currency};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{QueryBuilder, Row};

use crate::models::{
    EscrowFilter, EscrowUpdate, MilestoneUpdate, NewEscrow, NewEvent,
    NewMilestone, NewNotification, NewPayoutAccount, NewWebhookLog,
    MilestoneSpec, SourceSpec, StatsScope,
};
use crate::store::{
    Directory, EscrowStore, MilestoneTransition, StoreError, Transition,
    WebhookInsert,
};

/// Embedded schema migrations for the engine's tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the engine's migrations; idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

// --- Row decoding --- //

fn decode<T, E: std::fmt::Display>(
    result: Result<T, E>,
    what: &str,
) -> Result<T, StoreError> {
    result.map_err(|e| StoreError::Database(format!("decode {what}: {e}")))
}

fn amount_col(row: &PgRow, col: &str) -> Result<Amount, StoreError> {
    let minor: i64 = row.try_get(col)?;
    decode(Amount::from_minor(minor), col)
}

fn escrow_from_row(row: &PgRow) -> Result<Escrow, StoreError> {
    let status: String = row.try_get("status")?;
    let currency: String = row.try_get("currency")?;
    let payout_method: Option<String> = row.try_get("seller_payout_method")?;
    let resolution: Option<String> = row.try_get("dispute_resolution")?;
    let source = SourceRef::from_columns(
        row.try_get("job_proposal_id")?,
        row.try_get("job_id")?,
        row.try_get("campaign_id")?,
        row.try_get("service_request_id")?,
    )
    .ok_or_else(|| {
        StoreError::Database("escrow row has no unambiguous source".to_owned())
    })?;

    Ok(Escrow {
        id: EscrowId(row.try_get("id")?),
        buyer_id: UserId(row.try_get("buyer_id")?),
        seller_id: UserId(row.try_get("seller_id")?),
        source,
        title: row.try_get("title")?,
        currency: decode(Currency::new(&currency), "currency")?,
        total_amount: amount_col(row, "total_amount")?,
        fee_amount: amount_col(row, "fee_amount")?,
        seller_amount: amount_col(row, "seller_amount")?,
        status: decode(status.parse(), "status")?,
        inspection_period_days: row.try_get("inspection_period_days")?,
        payment_ref: row.try_get("payment_ref")?,
        payment_access_code: row.try_get("payment_access_code")?,
        transfer_ref: row.try_get("transfer_ref")?,
        seller_recipient_code: row.try_get("seller_recipient_code")?,
        seller_payout_method: payout_method
            .map(|m| decode(m.parse(), "seller_payout_method"))
            .transpose()?,
        delivery_note: row.try_get("delivery_note")?,
        terms: row.try_get("terms")?,
        metadata: row.try_get("metadata")?,
        dispute_reason: row.try_get("dispute_reason")?,
        dispute_raised_by: row
            .try_get::<Option<i64>, _>("dispute_raised_by")?
            .map(UserId),
        dispute_resolution: resolution
            .map(|r| decode(r.parse(), "dispute_resolution"))
            .transpose()?,
        split_percent: row.try_get("split_percent")?,
        cancelled_by: row.try_get::<Option<i64>, _>("cancelled_by")?.map(UserId),
        cancellation_reason: row.try_get("cancellation_reason")?,
        transfer_fail_reason: row.try_get("transfer_fail_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        payment_confirmed_at: row.try_get("payment_confirmed_at")?,
        delivery_confirmed_at: row.try_get("delivery_confirmed_at")?,
        auto_release_at: row.try_get("auto_release_at")?,
        funds_released_at: row.try_get("funds_released_at")?,
        transfer_confirmed_at: row.try_get("transfer_confirmed_at")?,
        transfer_failed_at: row.try_get("transfer_failed_at")?,
        refund_confirmed_at: row.try_get("refund_confirmed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        dispute_resolved_at: row.try_get("dispute_resolved_at")?,
    })
}

fn milestone_from_row(row: &PgRow) -> Result<MilestonePayment, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(MilestonePayment {
        id: MilestoneId(row.try_get("id")?),
        escrow_id: EscrowId(row.try_get("escrow_id")?),
        source_milestone_id: row.try_get("source_milestone_id")?,
        title: row.try_get("title")?,
        amount: amount_col(row, "amount")?,
        order_index: row.try_get("order_index")?,
        status: decode(status.parse(), "status")?,
        transfer_ref: row.try_get("transfer_ref")?,
        delivery_note: row.try_get("delivery_note")?,
        rejection_reason: row.try_get("rejection_reason")?,
        due_date: row.try_get("due_date")?,
        delivered_at: row.try_get("delivered_at")?,
        released_at: row.try_get("released_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<EscrowEvent, StoreError> {
    Ok(EscrowEvent {
        id: EventId(row.try_get("id")?),
        escrow_id: EscrowId(row.try_get("escrow_id")?),
        milestone_payment_id: row
            .try_get::<Option<i64>, _>("milestone_payment_id")?
            .map(MilestoneId),
        actor_id: row.try_get::<Option<i64>, _>("actor_id")?.map(UserId),
        event_type: row.try_get("event_type")?,
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        ip_address: row.try_get("ip_address")?,
        created_at: row.try_get("created_at")?,
    })
}

fn payout_account_from_row(
    row: &PgRow,
) -> Result<SellerPayoutAccount, StoreError> {
    let method: String = row.try_get("payout_method")?;
    Ok(SellerPayoutAccount {
        id: PayoutAccountId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        payout_method: decode(method.parse(), "payout_method")?,
        mobile_money_number: row.try_get("mobile_money_number")?,
        bank_account_number: row.try_get("bank_account_number")?,
        bank_code: row.try_get("bank_code")?,
        bank_account_name: row.try_get("bank_account_name")?,
        provider_recipient_code: row.try_get("provider_recipient_code")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, StoreError> {
    Ok(Notification {
        id: NotificationId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        notification_type: row.try_get("notification_type")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        escrow_id: row.try_get::<Option<i64>, _>("escrow_id")?.map(EscrowId),
        metadata: row.try_get("metadata")?,
        is_read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}

// --- Writes shared between methods --- //

/// Full-column UPDATE of an escrow row. Both guarded and unguarded updates
/// go through here so column coverage can't drift between them.
async fn write_escrow(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    e: &Escrow,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE escrows SET \
            status = $2, payment_ref = $3, payment_access_code = $4, \
            transfer_ref = $5, seller_recipient_code = $6, \
            seller_payout_method = $7, delivery_note = $8, \
            dispute_reason = $9, dispute_raised_by = $10, \
            dispute_resolution = $11, split_percent = $12, \
            cancelled_by = $13, cancellation_reason = $14, \
            transfer_fail_reason = $15, payment_confirmed_at = $16, \
            delivery_confirmed_at = $17, auto_release_at = $18, \
            funds_released_at = $19, transfer_confirmed_at = $20, \
            transfer_failed_at = $21, refund_confirmed_at = $22, \
            cancelled_at = $23, dispute_resolved_at = $24, updated_at = $25 \
         WHERE id = $1",
    )
    .bind(e.id.to_i64())
    .bind(e.status.as_str())
    .bind(&e.payment_ref)
    .bind(&e.payment_access_code)
    .bind(&e.transfer_ref)
    .bind(&e.seller_recipient_code)
    .bind(e.seller_payout_method.map(|m| m.as_str()))
    .bind(&e.delivery_note)
    .bind(&e.dispute_reason)
    .bind(e.dispute_raised_by.map(UserId::to_i64))
    .bind(e.dispute_resolution.map(|r| r.as_str()))
    .bind(e.split_percent)
    .bind(e.cancelled_by.map(UserId::to_i64))
    .bind(&e.cancellation_reason)
    .bind(&e.transfer_fail_reason)
    .bind(e.payment_confirmed_at)
    .bind(e.delivery_confirmed_at)
    .bind(e.auto_release_at)
    .bind(e.funds_released_at)
    .bind(e.transfer_confirmed_at)
    .bind(e.transfer_failed_at)
    .bind(e.refund_confirmed_at)
    .bind(e.cancelled_at)
    .bind(e.dispute_resolved_at)
    .bind(e.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_milestone(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    m: &MilestonePayment,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE milestone_payments SET \
            status = $2, transfer_ref = $3, delivery_note = $4, \
            rejection_reason = $5, delivered_at = $6, released_at = $7 \
         WHERE id = $1",
    )
    .bind(m.id.to_i64())
    .bind(m.status.as_str())
    .bind(&m.transfer_ref)
    .bind(&m.delivery_note)
    .bind(&m.rejection_reason)
    .bind(m.delivered_at)
    .bind(m.released_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    escrow_id: EscrowId,
    event: NewEvent,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO escrow_events \
            (escrow_id, milestone_payment_id, actor_id, event_type, \
             description, metadata, ip_address, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(escrow_id.to_i64())
    .bind(event.milestone_id.map(MilestoneId::to_i64))
    .bind(event.actor_id.map(UserId::to_i64))
    .bind(event.event_type.as_str())
    .bind(&event.description)
    .bind(&event.metadata)
    .bind(&event.ip_address)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn lock_escrow(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: EscrowId,
) -> Result<Option<Escrow>, StoreError> {
    let row = sqlx::query("SELECT * FROM escrows WHERE id = $1 FOR UPDATE")
        .bind(id.to_i64())
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(escrow_from_row).transpose()
}

fn push_filter(qb: &mut QueryBuilder<'_, sqlx::Postgres>, f: &EscrowFilter) {
    if let Some(status) = f.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(buyer) = f.buyer {
        qb.push(" AND buyer_id = ").push_bind(buyer.to_i64());
    }
    if let Some(seller) = f.seller {
        qb.push(" AND seller_id = ").push_bind(seller.to_i64());
    }
    if let Some(party) = f.either_party {
        qb.push(" AND (buyer_id = ")
            .push_bind(party.to_i64())
            .push(" OR seller_id = ")
            .push_bind(party.to_i64())
            .push(")");
    }
}

#[async_trait]
impl EscrowStore for PgStore {
    async fn create_escrow(
        &self,
        new: NewEscrow,
        milestones: Vec<NewMilestone>,
        event: NewEvent,
    ) -> Result<Escrow, StoreError> {
        let now = Utc::now();
        let (job_proposal_id, job_id, campaign_id, service_request_id) =
            new.source.columns();

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO escrows \
                (buyer_id, seller_id, job_proposal_id, job_id, campaign_id, \
                 service_request_id, title, currency, total_amount, \
                 fee_amount, seller_amount, status, inspection_period_days, \
                 terms, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
                     $13, $14, $15, $16, $16) \
             RETURNING *",
        )
        .bind(new.buyer_id.to_i64())
        .bind(new.seller_id.to_i64())
        .bind(job_proposal_id)
        .bind(job_id)
        .bind(campaign_id)
        .bind(service_request_id)
        .bind(&new.title)
        .bind(new.currency.as_str())
        .bind(new.total_amount.minor())
        .bind(new.fee_amount.minor())
        .bind(new.seller_amount.minor())
        .bind(EscrowStatus::Pending.as_str())
        .bind(new.inspection_period_days)
        .bind(&new.terms)
        .bind(&new.metadata)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let escrow = escrow_from_row(&row)?;

        for m in milestones {
            sqlx::query(
                "INSERT INTO milestone_payments \
                    (escrow_id, source_milestone_id, title, amount, \
                     order_index, status, due_date) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(escrow.id.to_i64())
            .bind(m.source_milestone_id)
            .bind(&m.title)
            .bind(m.amount.minor())
            .bind(m.order_index)
            .bind(MilestoneStatus::Pending.as_str())
            .bind(m.due_date)
            .execute(&mut *tx)
            .await?;
        }

        insert_event(&mut tx, escrow.id, event, now).await?;
        tx.commit().await?;
        Ok(escrow)
    }

    async fn get_escrow(
        &self,
        id: EscrowId,
    ) -> Result<Option<Escrow>, StoreError> {
        let row = sqlx::query("SELECT * FROM escrows WHERE id = $1")
            .bind(id.to_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(escrow_from_row).transpose()
    }

    async fn escrow_by_payment_ref(
        &self,
        reference: &str,
    ) -> Result<Option<Escrow>, StoreError> {
        let row = sqlx::query("SELECT * FROM escrows WHERE payment_ref = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(escrow_from_row).transpose()
    }

    async fn escrow_by_transfer_ref(
        &self,
        reference: &str,
    ) -> Result<Option<Escrow>, StoreError> {
        let row = sqlx::query("SELECT * FROM escrows WHERE transfer_ref = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(escrow_from_row).transpose()
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
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let Some(current) = lock_escrow(&mut tx, id).await? else {
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
        write_escrow(&mut tx, &next).await?;
        insert_event(&mut tx, id, event, now).await?;
        tx.commit().await?;
        Ok(Transition::Applied(next))
    }

    async fn update_escrow(
        &self,
        id: EscrowId,
        update: EscrowUpdate,
        event: Option<NewEvent>,
    ) -> Result<Option<Escrow>, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let Some(current) = lock_escrow(&mut tx, id).await? else {
            return Ok(None);
        };
        let mut next = current;
        update.apply_to(&mut next, now);
        write_escrow(&mut tx, &next).await?;
        if let Some(event) = event {
            insert_event(&mut tx, id, event, now).await?;
        }
        tx.commit().await?;
        Ok(Some(next))
    }

    async fn list_escrows(
        &self,
        filter: EscrowFilter,
    ) -> Result<(Vec<Escrow>, u64), StoreError> {
        let mut count_qb =
            QueryBuilder::new("SELECT COUNT(*) FROM escrows WHERE TRUE");
        push_filter(&mut count_qb, &filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        let page = filter.page.max(1);
        let offset = i64::from(page - 1) * i64::from(filter.limit);
        let mut qb = QueryBuilder::new("SELECT * FROM escrows WHERE TRUE");
        push_filter(&mut qb, &filter);
        qb.push(" ORDER BY created_at DESC, id DESC");
        qb.push(" LIMIT ").push_bind(i64::from(filter.limit));
        qb.push(" OFFSET ").push_bind(offset);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(escrow_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, total as u64))
    }

    async fn escrow_stats(
        &self,
        scope: StatsScope,
    ) -> Result<EscrowStats, StoreError> {
        let user = match scope {
            StatsScope::All => None,
            StatsScope::User(user) => Some(user.to_i64()),
        };
        let row = sqlx::query(
            "SELECT \
                COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending, \
                COUNT(*) FILTER (WHERE status = 'FUNDED') AS funded, \
                COUNT(*) FILTER (WHERE status = 'IN_PROGRESS') AS in_progress, \
                COUNT(*) FILTER (WHERE status = 'DELIVERED') AS delivered, \
                COUNT(*) FILTER (WHERE status = 'RELEASED') AS released, \
                COUNT(*) FILTER (WHERE status = 'DISPUTED') AS disputed, \
                COUNT(*) FILTER (WHERE status = 'REFUNDED') AS refunded, \
                COUNT(*) FILTER (WHERE status = 'CANCELLED') AS cancelled, \
                COALESCE(SUM(total_amount), 0)::BIGINT AS total_amount, \
                COALESCE(SUM(total_amount) \
                    FILTER (WHERE status = 'RELEASED'), 0)::BIGINT \
                    AS released_amount, \
                COALESCE(SUM(total_amount) FILTER (WHERE status IN \
                    ('FUNDED', 'IN_PROGRESS', 'DELIVERED', 'DISPUTED')), \
                    0)::BIGINT AS in_escrow_amount \
             FROM escrows \
             WHERE $1::BIGINT IS NULL OR buyer_id = $1 OR seller_id = $1",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await?;

        let count = |col: &str| -> Result<u64, StoreError> {
            Ok(row.try_get::<i64, _>(col)? as u64)
        };
        Ok(EscrowStats {
            total: count("total")?,
            pending: count("pending")?,
            funded: count("funded")?,
            in_progress: count("in_progress")?,
            delivered: count("delivered")?,
            released: count("released")?,
            disputed: count("disputed")?,
            refunded: count("refunded")?,
            cancelled: count("cancelled")?,
            total_amount: amount_col(&row, "total_amount")?,
            released_amount: amount_col(&row, "released_amount")?,
            in_escrow_amount: amount_col(&row, "in_escrow_amount")?,
        })
    }

    async fn due_for_auto_release(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EscrowId>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM escrows \
             WHERE status = 'DELIVERED' AND auto_release_at <= $1 \
             ORDER BY auto_release_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(EscrowId(row.try_get("id")?)))
            .collect()
    }

    async fn releasing_soon(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Escrow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM escrows \
             WHERE status = 'DELIVERED' \
               AND auto_release_at > $1 AND auto_release_at <= $2",
        )
        .bind(now)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(escrow_from_row).collect()
    }

    // --- Milestones --- //

    async fn milestones_for(
        &self,
        escrow_id: EscrowId,
    ) -> Result<Vec<MilestonePayment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM milestone_payments WHERE escrow_id = $1 \
             ORDER BY order_index ASC",
        )
        .bind(escrow_id.to_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(milestone_from_row).collect()
    }

    async fn get_milestone(
        &self,
        escrow_id: EscrowId,
        id: MilestoneId,
    ) -> Result<Option<MilestonePayment>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM milestone_payments \
             WHERE id = $1 AND escrow_id = $2",
        )
        .bind(id.to_i64())
        .bind(escrow_id.to_i64())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(milestone_from_row).transpose()
    }

    async fn milestone_by_transfer_ref(
        &self,
        reference: &str,
    ) -> Result<Option<MilestonePayment>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM milestone_payments WHERE transfer_ref = $1")
                .bind(reference)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(milestone_from_row).transpose()
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
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        // The parent row lock serializes all milestone ops for this escrow.
        let Some(mut escrow) = lock_escrow(&mut tx, escrow_id).await? else {
            return Ok(MilestoneTransition::NotFound);
        };
        let row = sqlx::query(
            "SELECT * FROM milestone_payments \
             WHERE id = $1 AND escrow_id = $2",
        )
        .bind(id.to_i64())
        .bind(escrow_id.to_i64())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = row.as_ref().map(milestone_from_row).transpose()?
        else {
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
        write_milestone(&mut tx, &next).await?;
        insert_event(&mut tx, escrow_id, event.milestone(id), now).await?;

        let mut parent_released = false;
        if let Some((parent_update, parent_event)) = parent_on_all_released {
            let remaining: i64 = sqlx::query(
                "SELECT COUNT(*) FROM milestone_payments \
                 WHERE escrow_id = $1 AND status <> 'RELEASED'",
            )
            .bind(escrow_id.to_i64())
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
            if remaining == 0 && escrow.status != EscrowStatus::Released {
                parent_update.apply_to(&mut escrow, now);
                write_escrow(&mut tx, &escrow).await?;
                insert_event(&mut tx, escrow_id, parent_event, now).await?;
                parent_released = true;
            }
        }

        tx.commit().await?;
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
        let rows = sqlx::query(
            "SELECT * FROM escrow_events WHERE escrow_id = $1 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(escrow_id.to_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn append_event(
        &self,
        escrow_id: EscrowId,
        event: NewEvent,
    ) -> Result<EscrowEvent, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO escrow_events \
                (escrow_id, milestone_payment_id, actor_id, event_type, \
                 description, metadata, ip_address, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING *",
        )
        .bind(escrow_id.to_i64())
        .bind(event.milestone_id.map(MilestoneId::to_i64))
        .bind(event.actor_id.map(UserId::to_i64))
        .bind(event.event_type.as_str())
        .bind(&event.description)
        .bind(&event.metadata)
        .bind(&event.ip_address)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        event_from_row(&row)
    }

    // --- Payout accounts --- //

    async fn active_payout_account(
        &self,
        user_id: UserId,
    ) -> Result<Option<SellerPayoutAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM seller_payout_accounts \
             WHERE user_id = $1 AND is_active",
        )
        .bind(user_id.to_i64())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payout_account_from_row).transpose()
    }

    async fn deactivate_payout_accounts(
        &self,
        user_id: UserId,
    ) -> Result<Vec<SellerPayoutAccount>, StoreError> {
        let rows = sqlx::query(
            "UPDATE seller_payout_accounts \
             SET is_active = FALSE, updated_at = $2 \
             WHERE user_id = $1 AND is_active \
             RETURNING *",
        )
        .bind(user_id.to_i64())
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payout_account_from_row).collect()
    }

    async fn insert_payout_account(
        &self,
        new: NewPayoutAccount,
    ) -> Result<SellerPayoutAccount, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO seller_payout_accounts \
                (user_id, payout_method, mobile_money_number, \
                 bank_account_number, bank_code, bank_account_name, \
                 provider_recipient_code, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $8) \
             RETURNING *",
        )
        .bind(new.user_id.to_i64())
        .bind(new.payout_method.as_str())
        .bind(&new.mobile_money_number)
        .bind(&new.bank_account_number)
        .bind(&new.bank_code)
        .bind(&new.bank_account_name)
        .bind(&new.provider_recipient_code)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        payout_account_from_row(&row)
    }

    // --- Webhook logs --- //

    async fn insert_webhook_log(
        &self,
        new: NewWebhookLog,
    ) -> Result<WebhookInsert, StoreError> {
        let row = sqlx::query(
            "INSERT INTO webhook_logs \
                (provider, event_type, reference, payload, processed, \
                 created_at) \
             VALUES ($1, $2, $3, $4, FALSE, $5) \
             ON CONFLICT (provider, event_type, reference) DO NOTHING \
             RETURNING id",
        )
        .bind(&new.provider)
        .bind(&new.event_type)
        .bind(&new.reference)
        .bind(&new.payload)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(WebhookInsert::Inserted(WebhookLogId(
                row.try_get("id")?,
            ))),
            None => Ok(WebhookInsert::Duplicate),
        }
    }

    async fn mark_webhook_processed(
        &self,
        id: WebhookLogId,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE webhook_logs SET processed = $2, error = $3 WHERE id = $1",
        )
        .bind(id.to_i64())
        .bind(error.is_none())
        .bind(&error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Notifications --- //

    async fn insert_notification(
        &self,
        new: NewNotification,
    ) -> Result<Notification, StoreError> {
        let row = sqlx::query(
            "INSERT INTO notifications \
                (user_id, notification_type, title, message, escrow_id, \
                 metadata, is_read, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7) \
             RETURNING *",
        )
        .bind(new.user_id.to_i64())
        .bind(&new.notification_type)
        .bind(&new.title)
        .bind(&new.message)
        .bind(new.escrow_id.map(EscrowId::to_i64))
        .bind(&new.metadata)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        notification_from_row(&row)
    }

    async fn notification_exists_since(
        &self,
        user_id: UserId,
        escrow_id: EscrowId,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS( \
                SELECT 1 FROM notifications \
                WHERE user_id = $1 AND escrow_id = $2 \
                  AND notification_type = $3 AND created_at >= $4)",
        )
        .bind(user_id.to_i64())
        .bind(escrow_id.to_i64())
        .bind(notification_type)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get(0)?)
    }

    async fn notifications_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id.to_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }
}

// --- PgDirectory --- //

/// Postgres [`Directory`] over the platform's user and source tables. The
/// engine does not own these tables; it only reads the handful of columns
/// it needs. Budget columns are cast to text so numeric and text schemas
/// both work.
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let account_type: String = row.try_get("account_type")?;
    let role: String = row.try_get("role")?;
    Ok(User {
        id: UserId(row.try_get("id")?),
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        account_type: decode(account_type.parse(), "account_type")?,
        role: decode(role.parse(), "role")?,
    })
}

#[async_trait]
impl Directory for PgDirectory {
    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, name, account_type, role \
             FROM users WHERE id = $1",
        )
        .bind(id.to_i64())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn admins(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, email, name, account_type, role \
             FROM users WHERE role = 'admin'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn job_proposal(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError> {
        let row = sqlx::query(
            "SELECT p.id AS proposal_id, p.job_id, p.creator_id, \
                    p.proposed_budget::TEXT AS proposed_budget, \
                    j.title, j.brand_id \
             FROM job_proposals p JOIN jobs j ON j.id = p.job_id \
             WHERE p.id = $1",
        )
        .bind(id.to_i64())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(SourceSpec {
            source: SourceRef::JobProposal {
                proposal_id: SourceId(row.try_get("proposal_id")?),
                job_id: Some(SourceId(row.try_get("job_id")?)),
            },
            title: row.try_get("title")?,
            buyer_id: UserId(row.try_get("brand_id")?),
            seller_id: Some(UserId(row.try_get("creator_id")?)),
            amount: row.try_get("proposed_budget")?,
            terms: None,
            milestones: Vec::new(),
        }))
    }

    async fn campaign(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, brand_id, budget::TEXT AS budget \
             FROM campaigns WHERE id = $1",
        )
        .bind(id.to_i64())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };

        let milestone_rows = sqlx::query(
            "SELECT id, title, amount::TEXT AS amount, order_index, due_date \
             FROM campaign_milestones WHERE campaign_id = $1 \
             ORDER BY order_index ASC",
        )
        .bind(id.to_i64())
        .fetch_all(&self.pool)
        .await?;
        let milestones = milestone_rows
            .iter()
            .map(|m| {
                Ok(MilestoneSpec {
                    source_milestone_id: Some(m.try_get::<i64, _>("id")?),
                    title: m.try_get("title")?,
                    amount: m.try_get("amount")?,
                    order_index: m.try_get("order_index")?,
                    due_date: m.try_get("due_date")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Some(SourceSpec {
            source: SourceRef::Campaign {
                campaign_id: SourceId(row.try_get("id")?),
            },
            title: row.try_get("title")?,
            buyer_id: UserId(row.try_get("brand_id")?),
            // The caller names the creator being contracted.
            seller_id: None,
            amount: row.try_get("budget")?,
            terms: None,
            milestones,
        }))
    }

    async fn service_request(
        &self,
        id: SourceId,
    ) -> Result<Option<SourceSpec>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, requester_id, budget::TEXT AS budget \
             FROM service_requests WHERE id = $1",
        )
        .bind(id.to_i64())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(SourceSpec {
            source: SourceRef::ServiceRequest {
                request_id: SourceId(row.try_get("id")?),
            },
            title: row.try_get("title")?,
            buyer_id: UserId(row.try_get("requester_id")?),
            seller_id: None,
            amount: row.try_get("budget")?,
            terms: None,
            milestones: Vec::new(),
        }))
    }
}
