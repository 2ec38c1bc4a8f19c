use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routes::AppState;
use crate::utils::error::AppError;

pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: String,
    pub exp: usize,
}

/// An authenticated caller, decoded from a bearer token minted by the auth
/// subsystem (out of scope here; we only verify).
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// Extractor for routes that accept both authenticated and anonymous
/// callers. A missing Authorization header yields `None`; a present but
/// invalid one is rejected outright.
pub struct MaybeAuthUser(pub Option<AuthUser>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeAuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(header_value) = parts.headers.get(header::AUTHORIZATION) else {
            return Ok(MaybeAuthUser(None));
        };

        let token = header_value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::AuthError("Malformed Authorization header".to_string()))?;

        let user = verify_jwt(token, &state.config.jwt_secret)?;
        Ok(MaybeAuthUser(Some(user)))
    }
}

pub fn verify_jwt(token: &str, secret: &str) -> Result<AuthUser, AppError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::AuthError("Invalid or expired token".to_string()))?;

    Ok(AuthUser {
        user_id: data.claims.sub,
        role: data.claims.role,
    })
}

pub fn issue_jwt(
    user_id: Uuid,
    role: &str,
    secret: &str,
    ttl: Duration,
) -> Result<String, AppError> {
    let exp = (Utc::now() + ttl).timestamp() as usize;
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        exp,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::InternalServerError(format!("Failed to sign token: {e}")))
}
