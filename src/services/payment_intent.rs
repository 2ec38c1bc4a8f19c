//! Creates or retrieves the provider-side payment transaction for a
//! registration. Provider calls are made without any open database
//! transaction; row locks must not wait on network latency.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::models::payment::{Payment, PaymentStatus};
use crate::services::provider::PaymentProvider;
use crate::services::{access, registration};
use crate::utils::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentRequest {
    pub registration_id: Uuid,
    pub guest_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub client_secret: String,
    pub payment_id: Uuid,
}

pub async fn create_or_get_intent(
    pool: &PgPool,
    provider: &PaymentProvider,
    caller: Option<&AuthUser>,
    req: &CreateIntentRequest,
) -> Result<IntentResponse, AppError> {
    let reg = registration::fetch_registration(pool, req.registration_id).await?;
    let purchase = registration::fetch_purchase(pool, req.registration_id).await?;

    access::ensure_can_transact(
        &reg,
        purchase.as_ref(),
        caller,
        req.guest_token.as_deref(),
        Utc::now(),
    )?;

    let is_free: bool = sqlx::query_scalar("SELECT is_free FROM events WHERE id = $1")
        .bind(reg.event_id)
        .fetch_one(pool)
        .await?;
    if is_free {
        return Err(AppError::ValidationError(
            "this event is free; no payment is applicable".to_string(),
        ));
    }

    let purchase = purchase.ok_or_else(|| {
        AppError::InternalServerError("paid registration is missing its purchase".to_string())
    })?;

    if reg.status != crate::models::registration::RegistrationStatus::Pending {
        return Err(AppError::Conflict(
            "registration is not awaiting payment".to_string(),
        ));
    }

    let existing = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE purchase_id = $1")
        .bind(purchase.id)
        .fetch_optional(pool)
        .await?;

    match existing {
        Some(payment) if payment.status == PaymentStatus::Completed
            || payment.status == PaymentStatus::Refunded =>
        {
            Err(AppError::Conflict("payment already settled".to_string()))
        }
        Some(payment) if payment.status == PaymentStatus::Pending => {
            // Idempotent retry: never create a second provider transaction
            // for the same purchase.
            let intent = provider.get_intent(&payment.provider_intent_id).await?;
            tracing::info!(payment_id = %payment.id, "Returning existing payment intent");
            Ok(IntentResponse {
                client_secret: intent.client_secret,
                payment_id: payment.id,
            })
        }
        Some(payment) => {
            // Failed settlement is terminal for that attempt; a retry means
            // a fresh provider transaction behind the same local mirror.
            let intent = provider
                .create_intent(purchase.total_price_minor, &purchase.currency, purchase.id)
                .await?;

            sqlx::query(
                "UPDATE payments
                 SET provider_intent_id = $2, status = 'pending', updated_at = now()
                 WHERE id = $1",
            )
            .bind(payment.id)
            .bind(&intent.id)
            .execute(pool)
            .await?;

            tracing::info!(payment_id = %payment.id, "Created fresh payment intent after failure");
            Ok(IntentResponse {
                client_secret: intent.client_secret,
                payment_id: payment.id,
            })
        }
        None => {
            let intent = provider
                .create_intent(purchase.total_price_minor, &purchase.currency, purchase.id)
                .await?;

            let payment_id: Uuid = sqlx::query_scalar(
                "INSERT INTO payments (purchase_id, provider_intent_id, amount_minor, currency, status)
                 VALUES ($1, $2, $3, $4, 'pending')
                 RETURNING id",
            )
            .bind(purchase.id)
            .bind(&intent.id)
            .bind(purchase.total_price_minor)
            .bind(&purchase.currency)
            .fetch_one(pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db) = &e {
                    if db.is_unique_violation() {
                        return AppError::Conflict(
                            "a payment intent for this registration is already being created"
                                .to_string(),
                        );
                    }
                }
                AppError::DatabaseError(e)
            })?;

            tracing::info!(payment_id = %payment_id, purchase_id = %purchase.id, "Payment intent created");
            Ok(IntentResponse {
                client_secret: intent.client_secret,
                payment_id,
            })
        }
    }
}
