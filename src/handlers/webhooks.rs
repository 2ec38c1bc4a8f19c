use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::routes::AppState;
use crate::services::webhook::{self, WebhookEvent};
use crate::utils::error::AppError;
use crate::utils::response::empty_success;

pub const SIGNATURE_HEADER: &str = "tessera-signature";

/// Takes the raw body bytes; signature verification operates over the exact
/// bytes the provider signed, so nothing may parse the body first.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let now_ts = Utc::now().timestamp();
    if !webhook::verify_signature(&body, signature, &state.config.webhook_secret, now_ts) {
        return AppError::ValidationError("invalid webhook signature".to_string()).into_response();
    }

    // The signature is valid, so the provider gets a success acknowledgment
    // from here on no matter what; local failures must not cause an endless
    // redelivery loop.
    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Validly signed webhook with unparseable body");
            return empty_success("Event acknowledged").into_response();
        }
    };

    if let Err(e) = webhook::handle_event(&state.pool, &event).await {
        tracing::error!(error = ?e, event_id = %event.id, "Webhook processing failed");
    }

    empty_success("Event acknowledged").into_response()
}
