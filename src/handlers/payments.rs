use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::MaybeAuthUser;
use crate::routes::AppState;
use crate::services::payment_intent::{self, CreateIntentRequest};
use crate::utils::error::AppError;
use crate::utils::response::success;

pub async fn create_intent(
    State(state): State<AppState>,
    MaybeAuthUser(caller): MaybeAuthUser,
    Json(req): Json<CreateIntentRequest>,
) -> Result<Response, AppError> {
    let result =
        payment_intent::create_or_get_intent(&state.pool, &state.provider, caller.as_ref(), &req)
            .await?;

    Ok(success(result, "Payment intent ready").into_response())
}
