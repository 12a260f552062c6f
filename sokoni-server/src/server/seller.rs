use axum::extract::State;
use axum::Json;
use sokoni_api::error::{ApiError, ApiOk};
use sokoni_api::models::{SetupPayoutAccountRequest, VerifyBankAccountRequest};
use sokoni_api::types::SellerPayoutAccount;
use sokoni_provider::{Bank, ResolvedAccount};

use crate::extract::AuthActor;
use crate::server::AppState;

pub(super) async fn setup_payout_account(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    Json(req): Json<SetupPayoutAccountRequest>,
) -> Result<Json<ApiOk<SellerPayoutAccount>>, ApiError> {
    let account = state.payouts.setup(&actor, req).await?;
    Ok(Json(ApiOk::new(account)))
}

pub(super) async fn get_payout_account(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
) -> Result<Json<ApiOk<SellerPayoutAccount>>, ApiError> {
    let account = state.payouts.get(&actor).await?;
    Ok(Json(ApiOk::new(account)))
}

pub(super) async fn remove_payout_account(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
) -> Result<Json<ApiOk<()>>, ApiError> {
    state.payouts.remove(&actor).await?;
    Ok(Json(ApiOk::new(())))
}

pub(super) async fn list_banks(
    State(state): State<AppState>,
    AuthActor(_actor): AuthActor,
) -> Result<Json<ApiOk<Vec<Bank>>>, ApiError> {
    let banks = state.payouts.list_banks().await?;
    Ok(Json(ApiOk::new(banks)))
}

pub(super) async fn verify_account(
    State(state): State<AppState>,
    AuthActor(_actor): AuthActor,
    Json(req): Json<VerifyBankAccountRequest>,
) -> Result<Json<ApiOk<ResolvedAccount>>, ApiError> {
    let resolved = state
        .payouts
        .verify_account(req.account_number, req.bank_code)
        .await?;
    Ok(Json(ApiOk::new(resolved)))
}
