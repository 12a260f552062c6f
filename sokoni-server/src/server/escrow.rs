use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use sokoni_api::error::{ApiError, ApiOk};
use sokoni_api::models::{
    CancelRequest, CreateWithSeller, DeliverRequest, DisputeRequest,
    EscrowStats, ListEscrowsQuery,
};
use sokoni_api::types::{Escrow, EscrowEvent, MilestonePayment};
use sokoni_common::ids::{EscrowId, MilestoneId, SourceId};
use sokoni_provider::PaymentSession;

use crate::extract::AuthActor;
use crate::server::AppState;

/// Body of the create responses: the new escrow plus the hosted checkout
/// session the buyer is sent to.
#[derive(Serialize)]
struct EscrowCreated {
    escrow: Escrow,
    payment: PaymentSession,
}

fn created(
    (escrow, payment): (Escrow, PaymentSession),
) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(ApiOk::new(EscrowCreated { escrow, payment })),
    )
}

pub(super) async fn create_from_job_proposal(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .manager
        .create_from_job_proposal(&actor, SourceId(id))
        .await
        .map(created)
        .map_err(ApiError::from)
}

pub(super) async fn create_from_campaign(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
    Json(req): Json<CreateWithSeller>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .manager
        .create_from_campaign(&actor, SourceId(id), req.seller_id)
        .await
        .map(created)
        .map_err(ApiError::from)
}

pub(super) async fn create_from_service_request(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
    Json(req): Json<CreateWithSeller>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .manager
        .create_from_service_request(&actor, SourceId(id), req.seller_id)
        .await
        .map(created)
        .map_err(ApiError::from)
}

pub(super) async fn verify_payment(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let escrow = state.manager.verify_payment(&actor, EscrowId(id)).await?;
    Ok(Json(ApiOk::new(escrow)))
}

pub(super) async fn start_work(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let escrow = state.manager.start_work(&actor, EscrowId(id)).await?;
    Ok(Json(ApiOk::new(escrow)))
}

pub(super) async fn deliver(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
    body: Option<Json<DeliverRequest>>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let note = body.and_then(|Json(req)| req.delivery_note);
    let escrow = state.manager.deliver(&actor, EscrowId(id), note).await?;
    Ok(Json(ApiOk::new(escrow)))
}

pub(super) async fn release(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let escrow = state.manager.release(&actor, EscrowId(id)).await?;
    Ok(Json(ApiOk::new(escrow)))
}

pub(super) async fn dispute(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
    Json(req): Json<DisputeRequest>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let escrow = state
        .manager
        .dispute(&actor, EscrowId(id), req.reason)
        .await?;
    Ok(Json(ApiOk::new(escrow)))
}

pub(super) async fn refund(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let escrow = state.manager.refund(&actor, EscrowId(id)).await?;
    Ok(Json(ApiOk::new(escrow)))
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let escrow = state
        .manager
        .cancel(&actor, EscrowId(id), req.reason)
        .await?;
    Ok(Json(ApiOk::new(escrow)))
}

pub(super) async fn deliver_milestone(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path((id, mid)): Path<(i64, i64)>,
    body: Option<Json<DeliverRequest>>,
) -> Result<Json<ApiOk<MilestonePayment>>, ApiError> {
    let note = body.and_then(|Json(req)| req.delivery_note);
    let milestone = state
        .manager
        .deliver_milestone(&actor, EscrowId(id), MilestoneId(mid), note)
        .await?;
    Ok(Json(ApiOk::new(milestone)))
}

pub(super) async fn release_milestone(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path((id, mid)): Path<(i64, i64)>,
) -> Result<Json<ApiOk<MilestonePayment>>, ApiError> {
    let milestone = state
        .manager
        .release_milestone(&actor, EscrowId(id), MilestoneId(mid))
        .await?;
    Ok(Json(ApiOk::new(milestone)))
}

pub(super) async fn list(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Query(query): Query<ListEscrowsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state.manager.list_escrows(&actor, query).await?;
    Ok(Json(ApiOk::new(page)))
}

pub(super) async fn stats(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
) -> Result<Json<ApiOk<EscrowStats>>, ApiError> {
    let stats = state.manager.stats(&actor).await?;
    Ok(Json(ApiOk::new(stats)))
}

pub(super) async fn detail(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
) -> Result<Json<ApiOk<Escrow>>, ApiError> {
    let escrow = state.manager.get_escrow(&actor, EscrowId(id)).await?;
    Ok(Json(ApiOk::new(escrow)))
}

pub(super) async fn events(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
) -> Result<Json<ApiOk<Vec<EscrowEvent>>>, ApiError> {
    let events = state.manager.list_events(&actor, EscrowId(id)).await?;
    Ok(Json(ApiOk::new(events)))
}

pub(super) async fn milestones(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Path(id): Path<i64>,
) -> Result<Json<ApiOk<Vec<MilestonePayment>>>, ApiError> {
    let milestones =
        state.manager.list_milestones(&actor, EscrowId(id)).await?;
    Ok(Json(ApiOk::new(milestones)))
}
