use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::MaybeAuthUser;
use crate::routes::AppState;
use crate::services::registration::{self, CreateRegistrationRequest};
use crate::utils::error::AppError;
use crate::utils::response::{created, empty_success, success};

pub async fn create(
    State(state): State<AppState>,
    MaybeAuthUser(caller): MaybeAuthUser,
    Json(req): Json<CreateRegistrationRequest>,
) -> Result<Response, AppError> {
    let result = registration::create_registration(&state.pool, caller.as_ref(), &req).await?;
    Ok(created(result, "Registration created").into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowParams {
    pub guest_token: Option<String>,
}

pub async fn show(
    State(state): State<AppState>,
    Path(registration_id): Path<Uuid>,
    MaybeAuthUser(caller): MaybeAuthUser,
    Query(params): Query<ShowParams>,
) -> Result<Response, AppError> {
    let detail = registration::fetch_registration_detail(
        &state.pool,
        registration_id,
        caller.as_ref(),
        params.guest_token.as_deref(),
    )
    .await?;

    Ok(success(detail, "Registration details").into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub guest_token: Option<String>,
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(registration_id): Path<Uuid>,
    MaybeAuthUser(caller): MaybeAuthUser,
    body: Option<Json<CancelRequest>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    registration::cancel_registration(
        &state.pool,
        registration_id,
        caller.as_ref(),
        body.guest_token.as_deref(),
    )
    .await?;

    Ok(empty_success("Registration cancelled").into_response())
}
