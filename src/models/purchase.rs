use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// 1:1 with a paid registration. For guest checkouts it also carries the
/// salted hash of the one-time payment token; the plaintext is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Purchase {
    pub id: Uuid,
    pub registration_id: Uuid,
    pub total_price_minor: i64,
    pub currency: String,
    #[serde(skip_serializing, default)]
    pub payment_token_hash: Option<String>,
    pub payment_token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Line item carrying the unit price frozen at purchase time. Later price
/// changes on the ticket type must not drift the amount owed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PurchaseItem {
    pub id: Uuid,
    pub purchase_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub unit_price_minor: i64,
}
