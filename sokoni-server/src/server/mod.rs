//! Router assembly. Handlers are thin: extract the actor, call the engine,
//! wrap the result in the `{ok, data}` envelope.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use sokoni_api::error::ApiOk;
use sokoni_engine::payout::PayoutManager;
use sokoni_engine::webhook::WebhookIngester;
use sokoni_engine::EscrowManager;
use tower_http::trace::TraceLayer;

/// Admin-only queries and dispute resolution.
mod admin;
/// Escrow lifecycle and queries.
mod escrow;
/// Payout accounts and bank helpers.
mod seller;
/// Provider webhook intake.
mod webhook;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<EscrowManager>,
    pub payouts: Arc<PayoutManager>,
    pub webhooks: Arc<WebhookIngester>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Escrow lifecycle
        .route(
            "/escrow/from-job-proposal/{id}",
            post(escrow::create_from_job_proposal),
        )
        .route(
            "/escrow/from-campaign/{id}",
            post(escrow::create_from_campaign),
        )
        .route(
            "/escrow/from-service-request/{id}",
            post(escrow::create_from_service_request),
        )
        .route("/escrow/{id}/verify-payment", post(escrow::verify_payment))
        .route("/escrow/{id}/start", post(escrow::start_work))
        .route("/escrow/{id}/deliver", post(escrow::deliver))
        .route("/escrow/{id}/release", post(escrow::release))
        .route("/escrow/{id}/dispute", post(escrow::dispute))
        .route("/escrow/{id}/refund", post(escrow::refund))
        .route("/escrow/{id}/cancel", post(escrow::cancel))
        .route(
            "/escrow/{id}/milestones/{mid}/deliver",
            post(escrow::deliver_milestone),
        )
        .route(
            "/escrow/{id}/milestones/{mid}/release",
            post(escrow::release_milestone),
        )
        // Escrow queries
        .route("/escrow", get(escrow::list))
        .route("/escrow/stats", get(escrow::stats))
        .route("/escrow/{id}", get(escrow::detail))
        .route("/escrow/{id}/events", get(escrow::events))
        .route("/escrow/{id}/milestones", get(escrow::milestones))
        // Seller payout accounts
        .route(
            "/seller/payout-account",
            post(seller::setup_payout_account)
                .get(seller::get_payout_account)
                .delete(seller::remove_payout_account),
        )
        .route("/seller/banks", get(seller::list_banks))
        .route("/seller/verify-account", post(seller::verify_account))
        // Admin
        .route("/admin/escrow", get(admin::list))
        .route("/admin/escrow/stats", get(admin::stats))
        .route("/admin/escrow/{id}/resolve", post(admin::resolve_dispute))
        // Provider webhooks (raw body, signature-checked, unauthenticated)
        .route("/webhooks/payment-provider", post(webhook::payment_provider))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<ApiOk<&'static str>> {
    Json(ApiOk::new("ok"))
}
