//! The escrow state machine and its lifecycle operations.
//!
//! Allowed transitions:
//!
//! ```text
//! PENDING     -> FUNDED        (verify payment, either path)
//! PENDING     -> CANCELLED     (cancel with reason)
//! FUNDED      -> IN_PROGRESS   (seller: start)
//! FUNDED      -> DELIVERED     (seller: deliver, skipping start allowed)
//! FUNDED      -> DISPUTED      (either party)
//! FUNDED      -> REFUNDED      (buyer/admin pre-delivery)
//! IN_PROGRESS -> DELIVERED     (seller: deliver)
//! IN_PROGRESS -> DISPUTED
//! IN_PROGRESS -> REFUNDED
//! DELIVERED   -> RELEASED      (buyer/admin/auto)
//! DELIVERED   -> DISPUTED
//! DISPUTED    -> RELEASED      (admin: release_to_seller | partial_split)
//! DISPUTED    -> REFUNDED      (admin: refund_buyer)
//! ```
//!
//! RELEASED, REFUNDED, and CANCELLED are terminal. Anything outside the
//! table fails with an invalid-transition error. The FUNDED -> DELIVERED
//! shortcut (deliver without start) is deliberate.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use sokoni_api::types::{
    Actor, DisputeResolution, Escrow, EscrowStatus, User,
};
use sokoni_common::ids::{EscrowId, SourceId, UserId};
use sokoni_common::money::{Amount, Currency};
use sokoni_common::refs;
use sokoni_common::rng::SysRng;
use sokoni_provider::{
    InitializePayment, InitiateTransfer, PaymentSession, PaymentStatus,
    ProviderApi, RefundTransaction,
};
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::{
    EscrowUpdate, EventType, NewEscrow, NewEvent, NewMilestone, SourceSpec,
};
use crate::notify::{kinds, Notifier};
use crate::store::{Directory, EscrowStore, Transition};

/// Disputes must come with a substantive reason.
pub const MIN_DISPUTE_REASON_LEN: usize = 10;

/// Engine-wide configuration, from the environment.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Platform commission as a fraction of the total, within [0, 1).
    pub fee_rate: Decimal,
    pub currency: Currency,
    /// Inspection window granted to the buyer after delivery.
    pub auto_release_days: i64,
    /// Where the provider sends the buyer after checkout.
    pub payment_callback_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_rate: dec!(0.02),
            currency: Currency::kes(),
            auto_release_days: 7,
            payment_callback_url: None,
        }
    }
}

/// The top-level actor exposing every lifecycle operation. Shared behind an
/// [`Arc`] by the HTTP handlers, the webhook ingester, and the scheduler.
/// Holds no escrow state of its own; the database is the only shared
/// mutable state.
pub struct EscrowManager {
    pub(crate) store: Arc<dyn EscrowStore>,
    pub(crate) directory: Arc<dyn Directory>,
    pub(crate) provider: Arc<dyn ProviderApi>,
    pub(crate) notifier: Notifier,
    pub(crate) cfg: EngineConfig,
    rng: StdMutex<SysRng>,
}

impl EscrowManager {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        directory: Arc<dyn Directory>,
        provider: Arc<dyn ProviderApi>,
        cfg: EngineConfig,
    ) -> Self {
        let notifier = Notifier::new(store.clone());
        Self {
            store,
            directory,
            provider,
            notifier,
            cfg,
            rng: StdMutex::new(SysRng::new()),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // --- Creation --- //

    /// Create an escrow from an accepted job proposal. The proposal fixes
    /// both parties and the budget.
    #[instrument(skip_all, name = "(create-from-proposal)")]
    pub async fn create_from_job_proposal(
        &self,
        actor: &Actor,
        proposal_id: SourceId,
    ) -> EngineResult<(Escrow, PaymentSession)> {
        let spec = self
            .directory
            .job_proposal(proposal_id)
            .await?
            .ok_or(EngineError::NotFound("job proposal"))?;
        self.create_from_source(actor, spec).await
    }

    /// Create an escrow from a campaign; the caller names the creator being
    /// contracted. The campaign's milestone schedule is snapshotted and is
    /// immutable from here on.
    #[instrument(skip_all, name = "(create-from-campaign)")]
    pub async fn create_from_campaign(
        &self,
        actor: &Actor,
        campaign_id: SourceId,
        seller_id: UserId,
    ) -> EngineResult<(Escrow, PaymentSession)> {
        let mut spec = self
            .directory
            .campaign(campaign_id)
            .await?
            .ok_or(EngineError::NotFound("campaign"))?;
        spec.seller_id = Some(seller_id);
        self.create_from_source(actor, spec).await
    }

    #[instrument(skip_all, name = "(create-from-service-request)")]
    pub async fn create_from_service_request(
        &self,
        actor: &Actor,
        request_id: SourceId,
        seller_id: UserId,
    ) -> EngineResult<(Escrow, PaymentSession)> {
        let mut spec = self
            .directory
            .service_request(request_id)
            .await?
            .ok_or(EngineError::NotFound("service request"))?;
        spec.seller_id = Some(seller_id);
        self.create_from_source(actor, spec).await
    }

    async fn create_from_source(
        &self,
        actor: &Actor,
        spec: SourceSpec,
    ) -> EngineResult<(Escrow, PaymentSession)> {
        // The caller must own the source object.
        if !actor.is_admin() && actor.user_id != spec.buyer_id {
            return Err(EngineError::Unauthorized(
                "only the source owner may open an escrow".to_owned(),
            ));
        }
        let seller_id = spec.seller_id.ok_or_else(|| {
            EngineError::Validation("a seller is required".to_owned())
        })?;
        if seller_id == spec.buyer_id {
            return Err(EngineError::Validation(
                "buyer and seller must be distinct".to_owned(),
            ));
        }
        let buyer = self.user_required(spec.buyer_id, "buyer").await?;
        let _seller = self.user_required(seller_id, "seller").await?;

        let total = Amount::parse_major(&spec.amount)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        if total.is_zero() {
            return Err(EngineError::Validation(
                "amount must be positive".to_owned(),
            ));
        }
        let split = total
            .split(self.cfg.fee_rate)
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        // Milestone schedule: amounts must cover the total exactly.
        let mut milestones = Vec::with_capacity(spec.milestones.len());
        let mut scheduled = Amount::ZERO;
        for m in &spec.milestones {
            let amount = Amount::parse_major(&m.amount).map_err(|e| {
                EngineError::Validation(format!(
                    "milestone \"{}\": {e}",
                    m.title
                ))
            })?;
            scheduled = scheduled.checked_add(amount).ok_or_else(|| {
                EngineError::Validation("milestone amounts overflow".to_owned())
            })?;
            milestones.push(NewMilestone {
                source_milestone_id: m.source_milestone_id,
                title: m.title.clone(),
                amount,
                order_index: m.order_index,
                due_date: m.due_date,
            });
        }
        if !milestones.is_empty() && scheduled != total {
            return Err(EngineError::Validation(format!(
                "milestone amounts must sum to the total ({scheduled} != {total})"
            )));
        }

        let new = NewEscrow {
            buyer_id: spec.buyer_id,
            seller_id,
            source: spec.source,
            title: spec.title.clone(),
            currency: self.cfg.currency.clone(),
            total_amount: total,
            fee_amount: split.fee,
            seller_amount: split.seller,
            inspection_period_days: self.cfg.auto_release_days as i32,
            terms: spec.terms,
            metadata: None,
        };
        let event = NewEvent::new(
            EventType::Created,
            format!("Escrow created for \"{}\"", spec.title),
        )
        .actor(actor.user_id)
        .ip(actor.ip.clone());
        let escrow = self.store.create_escrow(new, milestones, event).await?;
        info!(escrow_id = %escrow.id, "created escrow");

        // Initialize the hosted payment. This is a pre-commit provider call
        // from the funding flow's perspective: failures propagate, and the
        // escrow stays PENDING without a payment reference.
        let reference = self.next_ref(refs::RefPrefix::Payment, escrow.id);
        let metadata = json!({
            "escrow_id": escrow.id,
            "callback_url": self.cfg.payment_callback_url,
        });
        let session = self
            .provider
            .initialize_payment(InitializePayment {
                email: buyer.email.clone(),
                amount: total,
                reference,
                metadata: Some(metadata),
            })
            .await?;

        let escrow = self
            .store
            .update_escrow(
                escrow.id,
                EscrowUpdate {
                    payment_ref: Some(session.reference.clone()),
                    payment_access_code: Some(session.access_code.clone()),
                    ..Default::default()
                },
                None,
            )
            .await?
            .ok_or(EngineError::NotFound("escrow"))?;

        self.notifier
            .notify_both_parties(
                escrow.buyer_id,
                escrow.seller_id,
                kinds::ESCROW_CREATED,
                "Escrow created",
                &format!(
                    "Escrow for \"{}\" was created and awaits funding.",
                    escrow.title
                ),
                escrow.id,
            )
            .await;

        Ok((escrow, session))
    }

    // --- Funding --- //

    /// Buyer-initiated payment confirmation.
    #[instrument(skip_all, name = "(verify-payment)", fields(escrow_id = %escrow_id))]
    pub async fn verify_payment(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
    ) -> EngineResult<Escrow> {
        let escrow = self.escrow_required(escrow_id).await?;

        // Idempotent: already confirmed at some point.
        if matches!(
            escrow.status,
            EscrowStatus::Funded
                | EscrowStatus::InProgress
                | EscrowStatus::Delivered
                | EscrowStatus::Released
        ) {
            return Ok(escrow);
        }
        self.ensure_buyer_or_admin(actor, &escrow, "verify payment for")?;
        if escrow.status != EscrowStatus::Pending {
            return Err(EngineError::invalid_transition(
                "verify payment for",
                escrow.status,
            ));
        }
        self.verify_and_fund(&escrow, Some(actor)).await
    }

    /// The verify-and-fund path, shared by the buyer call and the
    /// `charge.success` webhook. The provider round-trip happens strictly
    /// outside the locked transaction.
    pub(crate) async fn verify_and_fund(
        &self,
        escrow: &Escrow,
        actor: Option<&Actor>,
    ) -> EngineResult<Escrow> {
        let reference = escrow.payment_ref.as_deref().ok_or_else(|| {
            EngineError::Validation(
                "escrow has no payment reference".to_owned(),
            )
        })?;

        let verification = self.provider.verify_payment(reference).await?;
        if verification.status != PaymentStatus::Success {
            return Err(EngineError::Validation(
                "payment has not completed successfully".to_owned(),
            ));
        }

        let mut event = NewEvent::new(
            EventType::Funded,
            format!("Payment confirmed ({reference})"),
        );
        if let Some(actor) = actor {
            event = event.actor(actor.user_id).ip(actor.ip.clone());
        }
        let update = EscrowUpdate {
            status: Some(EscrowStatus::Funded),
            payment_confirmed_at: Some(Utc::now()),
            ..Default::default()
        };
        let transition = self
            .store
            .transition_escrow(
                escrow.id,
                &[EscrowStatus::Pending],
                update,
                event,
            )
            .await?;

        match transition {
            Transition::Applied(escrow) => {
                info!(escrow_id = %escrow.id, "escrow funded");
                self.notifier
                    .notify(
                        escrow.buyer_id,
                        kinds::PAYMENT_CONFIRMED,
                        "Payment confirmed",
                        &format!(
                            "Your payment of {} is now held in escrow.",
                            escrow.total_amount.format(&escrow.currency)
                        ),
                        Some(escrow.id),
                        None,
                    )
                    .await;
                self.notifier
                    .notify(
                        escrow.seller_id,
                        kinds::ESCROW_FUNDED,
                        "Escrow funded",
                        &format!(
                            "\"{}\" is funded; you can start work.",
                            escrow.title
                        ),
                        Some(escrow.id),
                        None,
                    )
                    .await;
                Ok(escrow)
            }
            // A concurrent verify or webhook won the race.
            Transition::Already(escrow) => Ok(escrow),
            Transition::Conflict(escrow)
                if escrow.status.is_funded_or_later() =>
                Ok(escrow),
            Transition::Conflict(escrow) => Err(
                EngineError::invalid_transition("fund", escrow.status),
            ),
            Transition::NotFound => Err(EngineError::NotFound("escrow")),
        }
    }

    // --- Work lifecycle --- //

    #[instrument(skip_all, name = "(start-work)", fields(escrow_id = %escrow_id))]
    pub async fn start_work(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
    ) -> EngineResult<Escrow> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_seller(actor, &escrow, "start work on")?;
        if escrow.status == EscrowStatus::InProgress {
            return Ok(escrow);
        }
        if escrow.status != EscrowStatus::Funded {
            return Err(EngineError::invalid_transition(
                "start work on",
                escrow.status,
            ));
        }

        let update = EscrowUpdate {
            status: Some(EscrowStatus::InProgress),
            ..Default::default()
        };
        let event = NewEvent::new(EventType::WorkStarted, "Work started")
            .actor(actor.user_id)
            .ip(actor.ip.clone());
        let escrow = self
            .expect_applied(
                self.store
                    .transition_escrow(
                        escrow_id,
                        &[EscrowStatus::Funded],
                        update,
                        event,
                    )
                    .await?,
                "start work on",
            )?;

        self.notifier
            .notify(
                escrow.buyer_id,
                kinds::WORK_STARTED,
                "Work started",
                &format!("Work on \"{}\" has started.", escrow.title),
                Some(escrow.id),
                None,
            )
            .await;
        Ok(escrow)
    }

    /// Seller marks the work delivered. Delivering straight from FUNDED
    /// (without `start_work`) is allowed. Starts the buyer's inspection
    /// window.
    #[instrument(skip_all, name = "(deliver)", fields(escrow_id = %escrow_id))]
    pub async fn deliver(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
        delivery_note: Option<String>,
    ) -> EngineResult<Escrow> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_seller(actor, &escrow, "deliver")?;
        if escrow.status == EscrowStatus::Delivered {
            return Ok(escrow);
        }
        let allowed = [EscrowStatus::Funded, EscrowStatus::InProgress];
        if !allowed.contains(&escrow.status) {
            return Err(EngineError::invalid_transition(
                "deliver",
                escrow.status,
            ));
        }

        let now = Utc::now();
        let auto_release_at =
            now + Duration::days(i64::from(escrow.inspection_period_days));
        let update = EscrowUpdate {
            status: Some(EscrowStatus::Delivered),
            delivery_confirmed_at: Some(now),
            auto_release_at: Some(auto_release_at),
            delivery_note,
            ..Default::default()
        };
        let event = NewEvent::new(EventType::Delivered, "Work delivered")
            .actor(actor.user_id)
            .ip(actor.ip.clone())
            .metadata(json!({ "auto_release_at": auto_release_at }));
        let escrow = self
            .expect_applied(
                self.store
                    .transition_escrow(escrow_id, &allowed, update, event)
                    .await?,
                "deliver",
            )?;

        self.notifier
            .notify(
                escrow.buyer_id,
                kinds::ESCROW_DELIVERED,
                "Work delivered",
                &format!(
                    "\"{}\" was delivered. Review it within {} days or the \
                     funds release automatically.",
                    escrow.title, escrow.inspection_period_days
                ),
                Some(escrow.id),
                None,
            )
            .await;
        Ok(escrow)
    }

    // --- Release --- //

    /// Buyer (or admin) releases the funds to the seller.
    ///
    /// The provider transfer happens strictly after the transition commits;
    /// a transfer failure reverts the status to FUNDED in a new transaction
    /// and leaves the funds on the provider balance for a retry.
    #[instrument(skip_all, name = "(release)", fields(escrow_id = %escrow_id))]
    pub async fn release(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
    ) -> EngineResult<Escrow> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_buyer_or_admin(actor, &escrow, "release")?;
        // Idempotent: no new event, no new transfer.
        if escrow.status == EscrowStatus::Released {
            return Ok(escrow);
        }
        if escrow.status != EscrowStatus::Delivered {
            return Err(EngineError::invalid_transition(
                "release",
                escrow.status,
            ));
        }

        let event = NewEvent::new(EventType::Released, "Funds released")
            .actor(actor.user_id)
            .ip(actor.ip.clone());
        self.perform_release(
            &escrow,
            &[EscrowStatus::Delivered],
            EscrowUpdate::default(),
            event,
            escrow.seller_amount,
        )
        .await
    }

    /// Scheduler-driven release once the inspection window lapses. The
    /// event carries no actor.
    pub async fn auto_release(
        &self,
        escrow_id: EscrowId,
    ) -> EngineResult<Escrow> {
        let escrow = self.escrow_required(escrow_id).await?;
        if escrow.status == EscrowStatus::Released {
            return Ok(escrow);
        }
        if escrow.status != EscrowStatus::Delivered {
            return Err(EngineError::invalid_transition(
                "auto-release",
                escrow.status,
            ));
        }
        let event = NewEvent::new(
            EventType::AutoReleased,
            "Funds auto-released after the inspection period",
        );
        self.perform_release(
            &escrow,
            &[EscrowStatus::Delivered],
            EscrowUpdate::default(),
            event,
            escrow.seller_amount,
        )
        .await
    }

    /// Shared release path: snapshot the payout destination, transition
    /// under the row lock, then (post-commit) initiate the transfer.
    pub(crate) async fn perform_release(
        &self,
        escrow: &Escrow,
        allowed_from: &[EscrowStatus],
        mut update: EscrowUpdate,
        event: NewEvent,
        transfer_amount: Amount,
    ) -> EngineResult<Escrow> {
        let account = self
            .store
            .active_payout_account(escrow.seller_id)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(
                    "seller has no active payout account".to_owned(),
                )
            })?;

        let transfer_ref =
            self.next_ref(refs::RefPrefix::Transfer, escrow.id);
        update.status = Some(EscrowStatus::Released);
        update.funds_released_at = Some(Utc::now());
        update.transfer_ref = Some(transfer_ref.clone());
        update.seller_recipient_code =
            Some(account.provider_recipient_code.clone());
        update.seller_payout_method = Some(account.payout_method);

        let released = match self
            .store
            .transition_escrow(escrow.id, allowed_from, update, event)
            .await?
        {
            Transition::Applied(e) => e,
            // Raced with another release; no second transfer.
            Transition::Already(e) => return Ok(e),
            Transition::Conflict(e) =>
                return Err(EngineError::invalid_transition(
                    "release",
                    e.status,
                )),
            Transition::NotFound =>
                return Err(EngineError::NotFound("escrow")),
        };
        info!(escrow_id = %released.id, %transfer_ref, "escrow released");

        self.execute_escrow_transfer(
            released,
            transfer_amount,
            account.provider_recipient_code,
            transfer_ref,
        )
        .await
    }

    /// Post-commit transfer. Failure is absorbed: the escrow reverts to
    /// FUNDED with a `transfer_failed` event, both the seller and the
    /// admins hear about it, and the caller still gets the escrow back.
    async fn execute_escrow_transfer(
        &self,
        escrow: Escrow,
        amount: Amount,
        recipient_code: String,
        transfer_ref: String,
    ) -> EngineResult<Escrow> {
        let result = self
            .provider
            .initiate_transfer(InitiateTransfer {
                amount,
                recipient_code,
                reference: transfer_ref.clone(),
                reason: escrow.title.clone(),
            })
            .await;

        match result {
            Ok(receipt) => {
                info!(
                    escrow_id = %escrow.id,
                    transfer_code = %receipt.transfer_code,
                    "payout transfer initiated"
                );
                self.notifier
                    .notify_both_parties(
                        escrow.buyer_id,
                        escrow.seller_id,
                        kinds::ESCROW_RELEASED,
                        "Funds released",
                        &format!(
                            "Funds for \"{}\" were released; {} is on its \
                             way to the seller.",
                            escrow.title,
                            amount.format(&escrow.currency)
                        ),
                        escrow.id,
                    )
                    .await;
                Ok(escrow)
            }
            Err(e) => {
                warn!(
                    escrow_id = %escrow.id,
                    "payout transfer failed, reverting to FUNDED: {e}"
                );
                let reverted =
                    self.revert_failed_transfer(&escrow, &e.to_string()).await?;
                self.notify_transfer_failure(&reverted).await;
                Ok(reverted)
            }
        }
    }

    /// Revert RELEASED -> FUNDED after a failed payout; the funds never
    /// left the provider balance.
    pub(crate) async fn revert_failed_transfer(
        &self,
        escrow: &Escrow,
        reason: &str,
    ) -> EngineResult<Escrow> {
        let update = EscrowUpdate {
            status: Some(EscrowStatus::Funded),
            transfer_failed_at: Some(Utc::now()),
            transfer_fail_reason: Some(reason.to_owned()),
            ..Default::default()
        };
        let event = NewEvent::new(
            EventType::TransferFailed,
            "Payout transfer failed; funds remain in escrow",
        )
        .metadata(json!({
            "transfer_ref": escrow.transfer_ref,
            "reason": reason,
        }));
        match self
            .store
            .transition_escrow(
                escrow.id,
                &[EscrowStatus::Released],
                update,
                event,
            )
            .await?
        {
            Transition::Applied(e) => Ok(e),
            Transition::Already(e) | Transition::Conflict(e) => Ok(e),
            Transition::NotFound => Err(EngineError::NotFound("escrow")),
        }
    }

    pub(crate) async fn notify_transfer_failure(&self, escrow: &Escrow) {
        self.notifier
            .notify(
                escrow.seller_id,
                kinds::PAYOUT_FAILED,
                "Payout failed",
                &format!(
                    "The payout for \"{}\" failed; it will be retried. \
                     Your funds remain safely in escrow.",
                    escrow.title
                ),
                Some(escrow.id),
                None,
            )
            .await;
        let admins = match self.directory.admins().await {
            Ok(admins) => admins,
            Err(e) => {
                warn!("could not look up admins to notify: {e}");
                return;
            }
        };
        self.notifier
            .notify_many(
                admins.into_iter().map(|a: User| a.id),
                kinds::PAYOUT_FAILED,
                "Payout failed",
                &format!(
                    "Transfer for escrow {} failed and needs attention.",
                    escrow.id
                ),
                Some(escrow.id),
            )
            .await;
    }

    // --- Disputes --- //

    #[instrument(skip_all, name = "(dispute)", fields(escrow_id = %escrow_id))]
    pub async fn dispute(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
        reason: String,
    ) -> EngineResult<Escrow> {
        let reason = reason.trim().to_owned();
        if reason.len() < MIN_DISPUTE_REASON_LEN {
            return Err(EngineError::Validation(format!(
                "dispute reason must be at least {MIN_DISPUTE_REASON_LEN} \
                 characters"
            )));
        }
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_party(actor, &escrow, "dispute")?;
        let allowed = [
            EscrowStatus::Funded,
            EscrowStatus::InProgress,
            EscrowStatus::Delivered,
        ];
        if escrow.status == EscrowStatus::Disputed {
            return Ok(escrow);
        }
        if !allowed.contains(&escrow.status) {
            return Err(EngineError::invalid_transition(
                "dispute",
                escrow.status,
            ));
        }

        let update = EscrowUpdate {
            status: Some(EscrowStatus::Disputed),
            dispute_reason: Some(reason.clone()),
            dispute_raised_by: Some(actor.user_id),
            ..Default::default()
        };
        let event = NewEvent::new(EventType::DisputeRaised, "Dispute raised")
            .actor(actor.user_id)
            .ip(actor.ip.clone())
            .metadata(json!({ "reason": reason }));
        let escrow = self
            .expect_applied(
                self.store
                    .transition_escrow(escrow_id, &allowed, update, event)
                    .await?,
                "dispute",
            )?;

        self.notifier
            .notify_both_parties(
                escrow.buyer_id,
                escrow.seller_id,
                kinds::ESCROW_DISPUTED,
                "Dispute raised",
                &format!(
                    "A dispute was raised on \"{}\". An admin will review it.",
                    escrow.title
                ),
                escrow.id,
            )
            .await;
        Ok(escrow)
    }

    /// Admin resolves a dispute: release to the seller, refund the buyer,
    /// or split the total.
    #[instrument(skip_all, name = "(resolve-dispute)", fields(escrow_id = %escrow_id))]
    pub async fn resolve_dispute(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
        resolution: DisputeResolution,
        split_percent: Option<i32>,
    ) -> EngineResult<Escrow> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized(
                "only an admin may resolve a dispute".to_owned(),
            ));
        }
        let escrow = self.escrow_required(escrow_id).await?;
        if escrow.status != EscrowStatus::Disputed {
            return Err(EngineError::invalid_transition(
                "resolve",
                escrow.status,
            ));
        }

        let now = Utc::now();
        match resolution {
            DisputeResolution::ReleaseToSeller => {
                let update = EscrowUpdate {
                    dispute_resolution: Some(resolution),
                    dispute_resolved_at: Some(now),
                    ..Default::default()
                };
                let event = NewEvent::new(
                    EventType::DisputeResolved,
                    "Dispute resolved in the seller's favor",
                )
                .actor(actor.user_id)
                .ip(actor.ip.clone())
                .metadata(json!({ "resolution": resolution }));
                let escrow = self
                    .perform_release(
                        &escrow,
                        &[EscrowStatus::Disputed],
                        update,
                        event,
                        escrow.seller_amount,
                    )
                    .await?;
                self.notify_resolution(&escrow).await;
                Ok(escrow)
            }
            DisputeResolution::RefundBuyer => {
                let update = EscrowUpdate {
                    status: Some(EscrowStatus::Refunded),
                    dispute_resolution: Some(resolution),
                    dispute_resolved_at: Some(now),
                    ..Default::default()
                };
                let event = NewEvent::new(
                    EventType::DisputeResolved,
                    "Dispute resolved in the buyer's favor",
                )
                .actor(actor.user_id)
                .ip(actor.ip.clone())
                .metadata(json!({ "resolution": resolution }));
                let escrow = self
                    .expect_applied(
                        self.store
                            .transition_escrow(
                                escrow_id,
                                &[EscrowStatus::Disputed],
                                update,
                                event,
                            )
                            .await?,
                        "resolve",
                    )?;
                self.execute_refund(&escrow, None).await;
                self.notify_resolution(&escrow).await;
                Ok(escrow)
            }
            DisputeResolution::PartialSplit => {
                let percent = split_percent.ok_or_else(|| {
                    EngineError::Validation(
                        "split_percent is required for a partial split"
                            .to_owned(),
                    )
                })?;
                if !(0..=100).contains(&percent) {
                    return Err(EngineError::Validation(
                        "split_percent must be within [0, 100]".to_owned(),
                    ));
                }

                // The seller's gross share, with the platform fee applied
                // proportionally; the buyer is refunded the remainder of
                // the gross split.
                let fraction = Decimal::from(percent) / dec!(100);
                let gross = escrow
                    .total_amount
                    .checked_mul(fraction)
                    .ok_or_else(|| {
                        EngineError::Integrity("split overflow".to_owned())
                    })?;
                let seller_net = gross
                    .split(self.cfg.fee_rate)
                    .map_err(|e| EngineError::Integrity(e.to_string()))?
                    .seller;
                let buyer_refund = escrow
                    .total_amount
                    .checked_sub(gross)
                    .ok_or_else(|| {
                        EngineError::Integrity("split underflow".to_owned())
                    })?;

                let update = EscrowUpdate {
                    dispute_resolution: Some(resolution),
                    split_percent: Some(percent),
                    dispute_resolved_at: Some(now),
                    ..Default::default()
                };
                let event = NewEvent::new(
                    EventType::DisputeResolved,
                    format!(
                        "Dispute resolved with a {percent}% split to the \
                         seller"
                    ),
                )
                .actor(actor.user_id)
                .ip(actor.ip.clone())
                .metadata(json!({
                    "resolution": resolution,
                    "split_percent": percent,
                    "seller_net": seller_net,
                    "buyer_refund": buyer_refund,
                }));
                let escrow = self
                    .perform_release(
                        &escrow,
                        &[EscrowStatus::Disputed],
                        update,
                        event,
                        seller_net,
                    )
                    .await?;
                if !buyer_refund.is_zero() {
                    self.execute_refund(&escrow, Some(buyer_refund)).await;
                }
                self.notify_resolution(&escrow).await;
                Ok(escrow)
            }
        }
    }

    async fn notify_resolution(&self, escrow: &Escrow) {
        self.notifier
            .notify_both_parties(
                escrow.buyer_id,
                escrow.seller_id,
                kinds::DISPUTE_RESOLVED,
                "Dispute resolved",
                &format!(
                    "The dispute on \"{}\" has been resolved by an admin.",
                    escrow.title
                ),
                escrow.id,
            )
            .await;
    }

    // --- Refunds & cancellation --- //

    /// Pre-delivery refund to the buyer.
    #[instrument(skip_all, name = "(refund)", fields(escrow_id = %escrow_id))]
    pub async fn refund(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
    ) -> EngineResult<Escrow> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_buyer_or_admin(actor, &escrow, "refund")?;
        if escrow.status == EscrowStatus::Refunded {
            return Ok(escrow);
        }
        let allowed = [EscrowStatus::Funded, EscrowStatus::InProgress];
        if !allowed.contains(&escrow.status) {
            return Err(EngineError::invalid_transition(
                "refund",
                escrow.status,
            ));
        }

        let update = EscrowUpdate {
            status: Some(EscrowStatus::Refunded),
            ..Default::default()
        };
        let event = NewEvent::new(EventType::Refunded, "Escrow refunded")
            .actor(actor.user_id)
            .ip(actor.ip.clone());
        let escrow = self
            .expect_applied(
                self.store
                    .transition_escrow(escrow_id, &allowed, update, event)
                    .await?,
                "refund",
            )?;

        self.execute_refund(&escrow, None).await;
        self.notifier
            .notify_both_parties(
                escrow.buyer_id,
                escrow.seller_id,
                kinds::ESCROW_REFUNDED,
                "Escrow refunded",
                &format!("\"{}\" was refunded to the buyer.", escrow.title),
                escrow.id,
            )
            .await;
        Ok(escrow)
    }

    /// Post-commit refund call. Failure is absorbed: the refund is retried
    /// out-of-band once the provider reports via webhook or an admin steps
    /// in, so this logs, appends a `refund_failed` event, and alerts the
    /// admins.
    pub(crate) async fn execute_refund(
        &self,
        escrow: &Escrow,
        amount: Option<Amount>,
    ) {
        let Some(reference) = escrow.payment_ref.clone() else {
            warn!(escrow_id = %escrow.id, "refund without payment reference");
            return;
        };
        let result = self
            .provider
            .refund_transaction(RefundTransaction {
                payment_reference: reference,
                amount,
            })
            .await;
        if let Err(e) = result {
            warn!(escrow_id = %escrow.id, "refund request failed: {e}");
            let event = NewEvent::new(
                EventType::RefundFailed,
                "Refund request to the provider failed",
            )
            .metadata(json!({ "error": e.to_string() }));
            if let Err(e) =
                self.store.append_event(escrow.id, event).await
            {
                warn!(escrow_id = %escrow.id, "could not log refund failure: {e}");
            }
            let admins = self.directory.admins().await.unwrap_or_default();
            self.notifier
                .notify_many(
                    admins.into_iter().map(|a| a.id),
                    kinds::PAYOUT_FAILED,
                    "Refund failed",
                    &format!(
                        "Refund for escrow {} failed and needs attention.",
                        escrow.id
                    ),
                    Some(escrow.id),
                )
                .await;
        }
    }

    /// Cancel an escrow that was never funded.
    #[instrument(skip_all, name = "(cancel)", fields(escrow_id = %escrow_id))]
    pub async fn cancel(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
        reason: String,
    ) -> EngineResult<Escrow> {
        let reason = reason.trim().to_owned();
        if reason.is_empty() {
            return Err(EngineError::Validation(
                "a cancellation reason is required".to_owned(),
            ));
        }
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_buyer_or_admin(actor, &escrow, "cancel")?;
        if escrow.status == EscrowStatus::Cancelled {
            return Ok(escrow);
        }
        if escrow.status != EscrowStatus::Pending {
            return Err(EngineError::invalid_transition(
                "cancel",
                escrow.status,
            ));
        }

        let update = EscrowUpdate {
            status: Some(EscrowStatus::Cancelled),
            cancelled_by: Some(actor.user_id),
            cancellation_reason: Some(reason.clone()),
            cancelled_at: Some(Utc::now()),
            ..Default::default()
        };
        let event = NewEvent::new(EventType::Cancelled, "Escrow cancelled")
            .actor(actor.user_id)
            .ip(actor.ip.clone())
            .metadata(json!({ "reason": reason }));
        let escrow = self
            .expect_applied(
                self.store
                    .transition_escrow(
                        escrow_id,
                        &[EscrowStatus::Pending],
                        update,
                        event,
                    )
                    .await?,
                "cancel",
            )?;

        self.notifier
            .notify_both_parties(
                escrow.buyer_id,
                escrow.seller_id,
                kinds::ESCROW_CANCELLED,
                "Escrow cancelled",
                &format!("\"{}\" was cancelled.", escrow.title),
                escrow.id,
            )
            .await;
        Ok(escrow)
    }

    // --- Shared helpers --- //

    pub(crate) async fn escrow_required(
        &self,
        id: EscrowId,
    ) -> EngineResult<Escrow> {
        self.store
            .get_escrow(id)
            .await?
            .ok_or(EngineError::NotFound("escrow"))
    }

    pub(crate) async fn user_required(
        &self,
        id: UserId,
        what: &'static str,
    ) -> EngineResult<User> {
        self.directory
            .user(id)
            .await?
            .ok_or(EngineError::NotFound(what))
    }

    pub(crate) fn ensure_buyer_or_admin(
        &self,
        actor: &Actor,
        escrow: &Escrow,
        op: &str,
    ) -> EngineResult<()> {
        if actor.is_admin() || actor.user_id == escrow.buyer_id {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(format!(
                "only the buyer may {op} this escrow"
            )))
        }
    }

    pub(crate) fn ensure_seller(
        &self,
        actor: &Actor,
        escrow: &Escrow,
        op: &str,
    ) -> EngineResult<()> {
        if actor.user_id == escrow.seller_id {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(format!(
                "only the seller may {op} this escrow"
            )))
        }
    }

    pub(crate) fn ensure_party(
        &self,
        actor: &Actor,
        escrow: &Escrow,
        op: &str,
    ) -> EngineResult<()> {
        if actor.user_id == escrow.buyer_id
            || actor.user_id == escrow.seller_id
        {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(format!(
                "only a party to the escrow may {op} it"
            )))
        }
    }

    /// Unwrap a [`Transition`] whose pre-checks already ran; `Already` is
    /// an idempotent success, `Conflict` means a concurrent writer got
    /// there first.
    fn expect_applied(
        &self,
        transition: Transition,
        op: &'static str,
    ) -> EngineResult<Escrow> {
        match transition {
            Transition::Applied(e) | Transition::Already(e) => Ok(e),
            Transition::Conflict(e) =>
                Err(EngineError::invalid_transition(op, e.status)),
            Transition::NotFound => Err(EngineError::NotFound("escrow")),
        }
    }

    pub(crate) fn next_ref(
        &self,
        prefix: refs::RefPrefix,
        escrow_id: EscrowId,
    ) -> String {
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        refs::reference(
            prefix,
            escrow_id,
            sokoni_common::time::now_ms(),
            &mut *rng,
        )
    }
}
