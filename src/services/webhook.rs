//! Webhook settlement. Verifies provider signatures over the exact raw
//! request bytes, then advances Payment/Registration state idempotently.
//! Terminal payment states admit no further transition, which is the only
//! safeguard needed against duplicated or reordered deliveries.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;

use crate::models::payment::{Payment, PaymentStatus};
use crate::utils::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Signed deliveries older than this are treated as replays.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

pub const EVENT_PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const EVENT_PAYMENT_FAILED: &str = "payment_intent.payment_failed";

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: IntentObject,
}

#[derive(Debug, Deserialize)]
pub struct IntentObject {
    pub id: String,
}

/// Verify a `t=<unix>,v1=<hex hmac>` signature header against the raw
/// payload bytes. Pure; independent of the web framework.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &str, now_ts: i64) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut provided: Option<Vec<u8>> = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => provided = hex::decode(value).ok(),
            _ => {}
        }
    }

    let (Some(timestamp), Some(provided)) = (timestamp, provided) else {
        return false;
    };
    if (now_ts - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        return false;
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Succeeded,
    Failed,
}

/// The whole state machine: `pending -> completed` and `pending -> failed`.
/// `None` means no transition is defined and the event must be a no-op.
pub fn next_status(current: PaymentStatus, outcome: SettlementOutcome) -> Option<PaymentStatus> {
    if current.is_terminal() {
        return None;
    }
    Some(match outcome {
        SettlementOutcome::Succeeded => PaymentStatus::Completed,
        SettlementOutcome::Failed => PaymentStatus::Failed,
    })
}

/// Process one verified provider event. Unrecognized event types are logged
/// and acknowledged without mutation.
pub async fn handle_event(pool: &PgPool, event: &WebhookEvent) -> Result<(), AppError> {
    let outcome = match event.event_type.as_str() {
        EVENT_PAYMENT_SUCCEEDED => SettlementOutcome::Succeeded,
        EVENT_PAYMENT_FAILED => SettlementOutcome::Failed,
        other => {
            tracing::warn!(event_id = %event.id, event_type = %other, "Unhandled webhook event type");
            return Ok(());
        }
    };

    settle(pool, &event.data.object.id, outcome).await
}

async fn settle(
    pool: &PgPool,
    provider_intent_id: &str,
    outcome: SettlementOutcome,
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    let payment = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE provider_intent_id = $1 FOR UPDATE",
    )
    .bind(provider_intent_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(payment) = payment else {
        tracing::warn!(%provider_intent_id, "Webhook for unknown payment intent");
        return Ok(());
    };

    let Some(next) = next_status(payment.status, outcome) else {
        tracing::info!(
            payment_id = %payment.id,
            status = ?payment.status,
            "Duplicate settlement event ignored"
        );
        return Ok(());
    };

    sqlx::query("UPDATE payments SET status = $2, updated_at = now() WHERE id = $1")
        .bind(payment.id)
        .bind(next)
        .execute(&mut *tx)
        .await?;

    if next == PaymentStatus::Completed {
        // Inventory was decremented at reservation time; confirming the
        // registration is the only remaining mutation. Only a pending
        // registration can be confirmed: a cancelled one has already
        // released its stock and must not be resurrected.
        let confirmed = sqlx::query(
            "UPDATE registrations SET status = 'confirmed', updated_at = now()
             WHERE id = (SELECT registration_id FROM purchases WHERE id = $1)
               AND status = 'pending'",
        )
        .bind(payment.purchase_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if confirmed == 0 {
            tracing::warn!(
                payment_id = %payment.id,
                "Payment settled for a registration that is no longer pending; registration left unchanged"
            );
        }
    }
    // On failure the registration stays pending so the participant can
    // retry payment; reserved stock is kept (release happens only through
    // cancellation).

    tx.commit().await?;

    tracing::info!(
        payment_id = %payment.id,
        outcome = ?outcome,
        "Payment settled"
    );
    Ok(())
}
