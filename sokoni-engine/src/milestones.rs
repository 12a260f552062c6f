//! Milestone deliver / release operations.
//!
//! Each milestone runs its own small state machine, independent of the
//! parent escrow except in one direction: when the last milestone releases,
//! the parent transitions to RELEASED in the same transaction.

use chrono::Utc;
use serde_json::json;
use sokoni_api::types::{
    Actor, Escrow, EscrowStatus, MilestonePayment, MilestoneStatus,
};
use sokoni_common::ids::{EscrowId, MilestoneId};
use sokoni_common::refs;
use sokoni_provider::InitiateTransfer;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::manager::EscrowManager;
use crate::models::{EscrowUpdate, EventType, MilestoneUpdate, NewEvent};
use crate::notify::kinds;
use crate::store::MilestoneTransition;

impl EscrowManager {
    /// Seller marks one milestone delivered. The parent escrow must be
    /// holding funds.
    #[instrument(skip_all, name = "(milestone-deliver)",
                 fields(escrow_id = %escrow_id, milestone_id = %milestone_id))]
    pub async fn deliver_milestone(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
        milestone_id: MilestoneId,
        delivery_note: Option<String>,
    ) -> EngineResult<MilestonePayment> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_seller(actor, &escrow, "deliver a milestone of")?;
        let holding = [
            EscrowStatus::Funded,
            EscrowStatus::InProgress,
            EscrowStatus::Delivered,
        ];
        if !holding.contains(&escrow.status) {
            return Err(EngineError::invalid_transition(
                "deliver a milestone of",
                escrow.status,
            ));
        }
        let milestone = self.milestone_required(escrow_id, milestone_id).await?;
        if milestone.status == MilestoneStatus::Delivered {
            return Ok(milestone);
        }

        let update = MilestoneUpdate {
            status: Some(MilestoneStatus::Delivered),
            delivered_at: Some(Utc::now()),
            delivery_note,
            ..Default::default()
        };
        let event = NewEvent::new(
            EventType::MilestoneDelivered,
            format!("Milestone \"{}\" delivered", milestone.title),
        )
        .actor(actor.user_id)
        .ip(actor.ip.clone());

        let milestone = match self
            .store
            .transition_milestone(
                escrow_id,
                milestone_id,
                &[MilestoneStatus::Pending, MilestoneStatus::InProgress],
                update,
                event,
                None,
            )
            .await?
        {
            MilestoneTransition::Applied { milestone, .. } => milestone,
            MilestoneTransition::Already(m) => return Ok(m),
            MilestoneTransition::Conflict(m) =>
                return Err(EngineError::Validation(format!(
                    "cannot deliver a milestone in status {}",
                    m.status
                ))),
            MilestoneTransition::NotFound =>
                return Err(EngineError::NotFound("milestone")),
        };

        self.notifier
            .notify(
                escrow.buyer_id,
                kinds::MILESTONE_DELIVERED,
                "Milestone delivered",
                &format!(
                    "Milestone \"{}\" of \"{}\" was delivered.",
                    milestone.title, escrow.title
                ),
                Some(escrow.id),
                None,
            )
            .await;
        Ok(milestone)
    }

    /// Buyer (or admin) releases one milestone. Pays out the milestone
    /// amount less the proportional platform fee; when this was the last
    /// unreleased milestone, the parent escrow releases in the same
    /// transaction.
    #[instrument(skip_all, name = "(milestone-release)",
                 fields(escrow_id = %escrow_id, milestone_id = %milestone_id))]
    pub async fn release_milestone(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
        milestone_id: MilestoneId,
    ) -> EngineResult<MilestonePayment> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_buyer_or_admin(actor, &escrow, "release a milestone of")?;
        let milestone = self.milestone_required(escrow_id, milestone_id).await?;
        if milestone.status == MilestoneStatus::Released {
            return Ok(milestone);
        }
        if milestone.status != MilestoneStatus::Delivered {
            return Err(EngineError::Validation(format!(
                "cannot release a milestone in status {}",
                milestone.status
            )));
        }

        let account = self
            .store
            .active_payout_account(escrow.seller_id)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(
                    "seller has no active payout account".to_owned(),
                )
            })?;
        let payout = milestone
            .amount
            .split(self.cfg.fee_rate)
            .map_err(|e| EngineError::Integrity(e.to_string()))?
            .seller;

        let now = Utc::now();
        let transfer_ref =
            self.next_ref(refs::RefPrefix::MilestoneTransfer, escrow.id);
        let update = MilestoneUpdate {
            status: Some(MilestoneStatus::Released),
            released_at: Some(now),
            transfer_ref: Some(transfer_ref.clone()),
            ..Default::default()
        };
        let event = NewEvent::new(
            EventType::MilestoneReleased,
            format!("Milestone \"{}\" released", milestone.title),
        )
        .actor(actor.user_id)
        .ip(actor.ip.clone())
        .metadata(json!({ "payout": payout, "transfer_ref": transfer_ref }));

        // When every milestone has released, the parent releases too, in
        // the same transaction, snapshotting the payout destination.
        let parent_update = EscrowUpdate {
            status: Some(EscrowStatus::Released),
            funds_released_at: Some(now),
            seller_recipient_code: Some(account.provider_recipient_code.clone()),
            seller_payout_method: Some(account.payout_method),
            ..Default::default()
        };
        let parent_event = NewEvent::new(
            EventType::Released,
            "All milestones released; escrow complete",
        )
        .actor(actor.user_id);

        let (milestone, escrow, parent_released) = match self
            .store
            .transition_milestone(
                escrow_id,
                milestone_id,
                &[MilestoneStatus::Delivered],
                update,
                event,
                Some((parent_update, parent_event)),
            )
            .await?
        {
            MilestoneTransition::Applied {
                milestone,
                escrow,
                parent_released,
            } => (milestone, escrow, parent_released),
            MilestoneTransition::Already(m) => return Ok(m),
            MilestoneTransition::Conflict(m) =>
                return Err(EngineError::Validation(format!(
                    "cannot release a milestone in status {}",
                    m.status
                ))),
            MilestoneTransition::NotFound =>
                return Err(EngineError::NotFound("milestone")),
        };
        info!(%transfer_ref, parent_released, "milestone released");

        // Post-commit transfer of the milestone payout.
        let result = self
            .provider
            .initiate_transfer(InitiateTransfer {
                amount: payout,
                recipient_code: account.provider_recipient_code,
                reference: transfer_ref.clone(),
                reason: format!("{}: {}", escrow.title, milestone.title),
            })
            .await;

        match result {
            Ok(_) => {
                self.notifier
                    .notify_both_parties(
                        escrow.buyer_id,
                        escrow.seller_id,
                        kinds::MILESTONE_RELEASED,
                        "Milestone released",
                        &format!(
                            "Milestone \"{}\" was released; {} is on its way \
                             to the seller.",
                            milestone.title,
                            payout.format(&escrow.currency)
                        ),
                        escrow.id,
                    )
                    .await;
                Ok(milestone)
            }
            Err(e) => {
                warn!(
                    milestone_id = %milestone.id,
                    "milestone payout failed, reverting: {e}"
                );
                let milestone = self
                    .revert_failed_milestone_transfer(
                        &escrow,
                        &milestone,
                        parent_released,
                        &e.to_string(),
                    )
                    .await?;
                self.notify_transfer_failure(&escrow).await;
                Ok(milestone)
            }
        }
    }

    /// Revert a milestone to DELIVERED after a failed payout; when the
    /// parent had released off the back of it, revert the parent too.
    pub(crate) async fn revert_failed_milestone_transfer(
        &self,
        escrow: &Escrow,
        milestone: &MilestonePayment,
        parent_released: bool,
        reason: &str,
    ) -> EngineResult<MilestonePayment> {
        let update = MilestoneUpdate {
            status: Some(MilestoneStatus::Delivered),
            ..Default::default()
        };
        let event = NewEvent::new(
            EventType::TransferFailed,
            format!(
                "Payout for milestone \"{}\" failed; funds remain in escrow",
                milestone.title
            ),
        )
        .metadata(json!({
            "transfer_ref": milestone.transfer_ref,
            "reason": reason,
        }));
        let reverted = match self
            .store
            .transition_milestone(
                escrow.id,
                milestone.id,
                &[MilestoneStatus::Released],
                update,
                event,
                None,
            )
            .await?
        {
            MilestoneTransition::Applied { milestone, .. } => milestone,
            MilestoneTransition::Already(m)
            | MilestoneTransition::Conflict(m) => m,
            MilestoneTransition::NotFound =>
                return Err(EngineError::NotFound("milestone")),
        };

        if parent_released {
            let update = EscrowUpdate {
                status: Some(EscrowStatus::Funded),
                transfer_failed_at: Some(Utc::now()),
                transfer_fail_reason: Some(reason.to_owned()),
                ..Default::default()
            };
            let event = NewEvent::new(
                EventType::TransferFailed,
                "Escrow release rolled back after a milestone payout failure",
            );
            if let Err(e) = self
                .store
                .transition_escrow(
                    escrow.id,
                    &[EscrowStatus::Released],
                    update,
                    event,
                )
                .await
            {
                warn!(escrow_id = %escrow.id, "parent revert failed: {e}");
            }
        }
        Ok(reverted)
    }

    pub(crate) async fn milestone_required(
        &self,
        escrow_id: EscrowId,
        id: MilestoneId,
    ) -> EngineResult<MilestonePayment> {
        self.store
            .get_milestone(escrow_id, id)
            .await?
            .ok_or(EngineError::NotFound("milestone"))
    }
}
