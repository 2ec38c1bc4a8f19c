use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price_minor: i64,
    pub currency: String,
    pub total_quantity: i32,
    pub sold_quantity: i32,
    pub sales_start: DateTime<Utc>,
    pub sales_end: DateTime<Utc>,
    pub status: TicketTypeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketTypeStatus {
    Active,
    Inactive,
    SoldOut,
}

impl TicketType {
    pub fn remaining(&self) -> i32 {
        self.total_quantity - self.sold_quantity
    }
}
