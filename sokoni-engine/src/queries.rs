//! Read-side operations: listings, detail, audit log, dashboard stats.

use sokoni_api::models::{
    EscrowStats, ListEscrowsQuery, Paginated, PartyRole,
};
use sokoni_api::types::{Actor, Escrow, EscrowEvent, MilestonePayment};
use sokoni_common::ids::EscrowId;

use crate::error::{EngineError, EngineResult};
use crate::manager::EscrowManager;
use crate::models::{EscrowFilter, StatsScope};

const DEFAULT_PAGE_LIMIT: u32 = 20;
const MAX_PAGE_LIMIT: u32 = 100;

impl EscrowManager {
    /// Escrows the caller is a party to, newest first.
    pub async fn list_escrows(
        &self,
        actor: &Actor,
        query: ListEscrowsQuery,
    ) -> EngineResult<Paginated<Escrow>> {
        let mut filter = filter_from_query(&query)?;
        match query.role {
            Some(PartyRole::Buyer) => filter.buyer = Some(actor.user_id),
            Some(PartyRole::Seller) => filter.seller = Some(actor.user_id),
            None => filter.either_party = Some(actor.user_id),
        }
        self.run_list(filter).await
    }

    /// Admin listing across all parties.
    pub async fn list_escrows_admin(
        &self,
        actor: &Actor,
        query: ListEscrowsQuery,
    ) -> EngineResult<Paginated<Escrow>> {
        self.ensure_admin(actor)?;
        let filter = filter_from_query(&query)?;
        self.run_list(filter).await
    }

    async fn run_list(
        &self,
        filter: EscrowFilter,
    ) -> EngineResult<Paginated<Escrow>> {
        let page = filter.page;
        let limit = filter.limit;
        let (items, total) = self.store.list_escrows(filter).await?;
        Ok(Paginated {
            items,
            page,
            limit,
            total,
        })
    }

    /// Escrow detail; only a party or an admin may read it.
    pub async fn get_escrow(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
    ) -> EngineResult<Escrow> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_party_or_admin(actor, &escrow)?;
        Ok(escrow)
    }

    /// The milestone schedule of an escrow.
    pub async fn list_milestones(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
    ) -> EngineResult<Vec<MilestonePayment>> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_party_or_admin(actor, &escrow)?;
        Ok(self.store.milestones_for(escrow_id).await?)
    }

    /// Audit log, ascending by time.
    pub async fn list_events(
        &self,
        actor: &Actor,
        escrow_id: EscrowId,
    ) -> EngineResult<Vec<EscrowEvent>> {
        let escrow = self.escrow_required(escrow_id).await?;
        self.ensure_party_or_admin(actor, &escrow)?;
        Ok(self.store.events_for(escrow_id).await?)
    }

    /// Dashboard stats over the caller's escrows.
    pub async fn stats(&self, actor: &Actor) -> EngineResult<EscrowStats> {
        Ok(self
            .store
            .escrow_stats(StatsScope::User(actor.user_id))
            .await?)
    }

    /// Platform-wide stats for admins.
    pub async fn stats_admin(
        &self,
        actor: &Actor,
    ) -> EngineResult<EscrowStats> {
        self.ensure_admin(actor)?;
        Ok(self.store.escrow_stats(StatsScope::All).await?)
    }

    fn ensure_admin(&self, actor: &Actor) -> EngineResult<()> {
        if actor.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(
                "admin role required".to_owned(),
            ))
        }
    }

    fn ensure_party_or_admin(
        &self,
        actor: &Actor,
        escrow: &Escrow,
    ) -> EngineResult<()> {
        if actor.is_admin()
            || actor.user_id == escrow.buyer_id
            || actor.user_id == escrow.seller_id
        {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(
                "only a party to the escrow may view it".to_owned(),
            ))
        }
    }
}

fn filter_from_query(query: &ListEscrowsQuery) -> EngineResult<EscrowFilter> {
    let page = query.page.unwrap_or(1);
    if page == 0 {
        return Err(EngineError::Validation("page starts at 1".to_owned()));
    }
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(EngineError::Validation(format!(
            "limit must be within [1, {MAX_PAGE_LIMIT}]"
        )));
    }
    Ok(EscrowFilter {
        status: query.status,
        page,
        limit,
        ..Default::default()
    })
}
