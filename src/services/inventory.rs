//! The inventory ledger. All `sold_quantity` mutation in the system goes
//! through `reserve` and `release`, so the `sold <= total` invariant is
//! enforced in exactly one place.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use thiserror::Error;
use uuid::Uuid;

use crate::models::event::EventStatus;
use crate::models::ticket::{TicketType, TicketTypeStatus};
use crate::utils::error::AppError;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Ticket type {0} not found")]
    NotFound(Uuid),

    #[error("Not enough '{name}' tickets left ({remaining} remaining)")]
    Insufficient { name: String, remaining: i32 },

    #[error("'{name}' tickets are not on sale: {reason}")]
    NotOnSale { name: String, reason: NotOnSaleReason },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotOnSaleReason {
    EventNotBookable,
    TicketNotActive,
    OutsideSalesWindow,
}

impl std::fmt::Display for NotOnSaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NotOnSaleReason::EventNotBookable => "the event is not open for registration",
            NotOnSaleReason::TicketNotActive => "this ticket type is not active",
            NotOnSaleReason::OutsideSalesWindow => "the sales window is closed",
        };
        f.write_str(text)
    }
}

impl From<InventoryError> for AppError {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::NotFound(id) => {
                AppError::NotFound(format!("Ticket type {id} not found"))
            }
            e @ InventoryError::Insufficient { .. } | e @ InventoryError::NotOnSale { .. } => {
                AppError::Conflict(e.to_string())
            }
            InventoryError::Database(e) => AppError::DatabaseError(e),
        }
    }
}

#[derive(FromRow)]
struct LockedTicket {
    #[sqlx(flatten)]
    ticket: TicketType,
    event_status: EventStatus,
}

/// Pure admission check, evaluated against row state re-read under the lock.
pub fn sale_gate(
    ticket_status: TicketTypeStatus,
    sales_start: DateTime<Utc>,
    sales_end: DateTime<Utc>,
    event_status: EventStatus,
    now: DateTime<Utc>,
) -> Result<(), NotOnSaleReason> {
    if !event_status.is_bookable() {
        return Err(NotOnSaleReason::EventNotBookable);
    }
    if ticket_status != TicketTypeStatus::Active {
        return Err(NotOnSaleReason::TicketNotActive);
    }
    if now < sales_start || now > sales_end {
        return Err(NotOnSaleReason::OutsideSalesWindow);
    }
    Ok(())
}

/// Atomically reserve `quantity` units inside the caller's transaction.
///
/// The ticket row is locked with `FOR UPDATE` and re-validated under that
/// lock, so two concurrent registrations for the last unit cannot both
/// succeed. Returns the ticket as read under the lock, which callers use to
/// freeze the unit price.
pub async fn reserve(
    conn: &mut PgConnection,
    ticket_type_id: Uuid,
    quantity: i32,
    now: DateTime<Utc>,
) -> Result<TicketType, InventoryError> {
    let row = sqlx::query_as::<_, LockedTicket>(
        "SELECT t.*, e.status AS event_status
         FROM ticket_types t
         JOIN events e ON e.id = t.event_id
         WHERE t.id = $1
         FOR UPDATE OF t",
    )
    .bind(ticket_type_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(InventoryError::NotFound(ticket_type_id))?;

    let ticket = row.ticket;

    sale_gate(
        ticket.status,
        ticket.sales_start,
        ticket.sales_end,
        row.event_status,
        now,
    )
    .map_err(|reason| InventoryError::NotOnSale {
        name: ticket.name.clone(),
        reason,
    })?;

    if ticket.sold_quantity + quantity > ticket.total_quantity {
        return Err(InventoryError::Insufficient {
            name: ticket.name.clone(),
            remaining: ticket.remaining(),
        });
    }

    sqlx::query(
        "UPDATE ticket_types SET sold_quantity = sold_quantity + $2, updated_at = now()
         WHERE id = $1",
    )
    .bind(ticket_type_id)
    .bind(quantity)
    .execute(&mut *conn)
    .await?;

    Ok(ticket)
}

/// Return `quantity` units to the pool. Callers guard this behind their own
/// status transition so a reservation is never released twice.
pub async fn release(
    conn: &mut PgConnection,
    ticket_type_id: Uuid,
    quantity: i32,
) -> Result<(), InventoryError> {
    sqlx::query(
        "UPDATE ticket_types
         SET sold_quantity = GREATEST(sold_quantity - $2, 0), updated_at = now()
         WHERE id = $1",
    )
    .bind(ticket_type_id)
    .bind(quantity)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
