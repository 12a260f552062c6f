use axum::extract::{Path, Query, State};
use axum::Json;
use sokoni_api::error::{ApiError, ApiOk};
use sokoni_api::models::{
    EscrowStats, ListEscrowsQuery, Paginated, ResolveDisputeRequest,
};
use sokoni_api::types::Escrow;
use sokoni_common::ids::EscrowId;

use crate::extract::AuthActor;
use crate::server::AppState;

pub(super) async fn list(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Query(query): Query<ListEscrowsQuery>,
) -> Result<Json<ApiOk<Paginated<Escrow>>>, ApiError> {
    let page = state.manager.list_escrows_admin(&actor, query).await?;
    Ok(Json(ApiOk::new(page)))
}

pub(super) async fn stats(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
) -> Result<Json<ApiOk<EscrowStats>>, ApiError> {
    let stats = state.manager.stats_admin(&actor).await?;
    Ok(Json(ApiOk::new(stats)))
}

pub(super) async fn resolve_dispute(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
    Json(req): Json<ResolveDisputeRequest>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let escrow = state
        .manager
        .resolve_dispute(
            &actor,
            EscrowId(id),
            req.resolution,
            req.split_percent,
        )
        .await?;
    Ok(Json(ApiOk::new(escrow)))
}
