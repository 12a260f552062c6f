use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use sokoni_api::error::{ApiError, ApiOk};
use sokoni_engine::webhook::{WebhookAck, SIGNATURE_HEADER};

use crate::server::AppState;

/// Raw-body webhook intake. The 200 goes out as soon as the delivery is
/// verified and registered; processing happens on a spawned task so the
/// provider sees a fast ack.
pub(super) async fn payment_provider(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.webhooks.ingest(&body, signature).await {
        Ok(WebhookAck::Rejected) => StatusCode::UNAUTHORIZED.into_response(),
        Ok(WebhookAck::Duplicate) =>
            Json(ApiOk::new("duplicate")).into_response(),
        Ok(WebhookAck::Accepted(pending)) => {
            let webhooks = state.webhooks.clone();
            tokio::spawn(async move {
                webhooks.process(pending).await;
            });
            Json(ApiOk::new("accepted")).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
