//! The registration aggregate builder. One request reserves inventory,
//! resolves participant profiles, and writes the whole registration
//! aggregate (registration, purchase, line items, attendees, responses)
//! inside a single transaction. Payment happens in a later, separate step.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::models::event::{Event, Question};
use crate::models::participant::Participant;
use crate::models::payment::{Payment, PaymentStatus};
use crate::models::purchase::{Purchase, PurchaseItem};
use crate::models::registration::{
    QuestionResponse, Registration, RegistrationParticipant, RegistrationStatus,
};
use crate::models::ticket::TicketType;
use crate::services::{access, guest_token, inventory};
use crate::utils::error::AppError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRegistrationRequest {
    pub event_id: Uuid,
    #[serde(default)]
    pub tickets: Vec<TicketLine>,
    pub participants: Vec<ParticipantInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLine {
    pub ticket_type_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInput {
    pub ticket_type_id: Option<Uuid>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    #[serde(default)]
    pub responses: Vec<ResponseInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInput {
    pub question_id: Uuid,
    pub answer_text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRegistration {
    pub registration_id: Uuid,
    /// Returned exactly once, only for unauthenticated paid registrations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_token: Option<String>,
}

/// Cheap structural checks that need no database access.
pub fn validate_shape(req: &CreateRegistrationRequest) -> Result<(), AppError> {
    if req.participants.is_empty() {
        return Err(AppError::ValidationError(
            "participants: at least one attendee is required".to_string(),
        ));
    }

    for (i, participant) in req.participants.iter().enumerate() {
        if !participant.email.contains('@') {
            return Err(AppError::ValidationError(format!(
                "participants[{i}].email: a valid email address is required"
            )));
        }
        if participant.first_name.trim().is_empty() || participant.last_name.trim().is_empty() {
            return Err(AppError::ValidationError(format!(
                "participants[{i}]: firstName and lastName are required"
            )));
        }
    }

    let mut seen = HashSet::new();
    for (i, line) in req.tickets.iter().enumerate() {
        if line.quantity < 1 {
            return Err(AppError::ValidationError(format!(
                "tickets[{i}].quantity: must be at least 1"
            )));
        }
        if !seen.insert(line.ticket_type_id) {
            return Err(AppError::ValidationError(format!(
                "tickets[{i}].ticketTypeId: duplicate ticket line"
            )));
        }
    }

    Ok(())
}

/// Event-dependent preconditions, checked before the transaction opens.
pub fn validate_for_event(
    event: &Event,
    questions: &[Question],
    req: &CreateRegistrationRequest,
) -> Result<(), AppError> {
    if !event.status.is_bookable() {
        return Err(AppError::Conflict(
            "event is not open for registration".to_string(),
        ));
    }

    if event.is_free {
        if !req.tickets.is_empty() {
            return Err(AppError::ValidationError(
                "tickets: free events do not take ticket lines".to_string(),
            ));
        }
        if let Some(i) = req
            .participants
            .iter()
            .position(|p| p.ticket_type_id.is_some())
        {
            return Err(AppError::ValidationError(format!(
                "participants[{i}].ticketTypeId: not applicable for a free event"
            )));
        }
    } else {
        if req.tickets.is_empty() {
            return Err(AppError::ValidationError(
                "tickets: at least one ticket line is required for a paid event".to_string(),
            ));
        }

        let total_units: i32 = req.tickets.iter().map(|l| l.quantity).sum();
        if total_units as usize != req.participants.len() {
            return Err(AppError::ValidationError(format!(
                "participants: {} attendees named but {} ticket units requested",
                req.participants.len(),
                total_units
            )));
        }

        // Every ticket unit gets exactly one named attendee.
        let mut assigned: HashMap<Uuid, i32> = HashMap::new();
        for (i, participant) in req.participants.iter().enumerate() {
            let Some(ticket_type_id) = participant.ticket_type_id else {
                return Err(AppError::ValidationError(format!(
                    "participants[{i}].ticketTypeId: required for paid events"
                )));
            };
            *assigned.entry(ticket_type_id).or_insert(0) += 1;
        }
        for line in &req.tickets {
            if assigned.get(&line.ticket_type_id).copied().unwrap_or(0) != line.quantity {
                return Err(AppError::ValidationError(format!(
                    "participants: attendee count for ticket type {} does not match its quantity",
                    line.ticket_type_id
                )));
            }
        }
        if assigned.len() != req.tickets.len() {
            return Err(AppError::ValidationError(
                "participants: an attendee references a ticket type outside the requested lines"
                    .to_string(),
            ));
        }
    }

    let known: HashSet<Uuid> = questions.iter().map(|q| q.id).collect();
    let required: Vec<Uuid> = questions
        .iter()
        .filter(|q| q.is_required)
        .map(|q| q.id)
        .collect();

    for (i, participant) in req.participants.iter().enumerate() {
        let mut answered = HashSet::new();
        for response in &participant.responses {
            if !known.contains(&response.question_id) {
                return Err(AppError::ValidationError(format!(
                    "participants[{i}].responses: question {} does not belong to this event",
                    response.question_id
                )));
            }
            if !answered.insert(response.question_id) {
                return Err(AppError::ValidationError(format!(
                    "participants[{i}].responses: duplicate answer for question {}",
                    response.question_id
                )));
            }
        }
        for question_id in &required {
            if !answered.contains(question_id) {
                return Err(AppError::ValidationError(format!(
                    "participants[{i}].responses: required question {question_id} is unanswered"
                )));
            }
        }
    }

    Ok(())
}

pub async fn create_registration(
    pool: &PgPool,
    caller: Option<&AuthUser>,
    req: &CreateRegistrationRequest,
) -> Result<CreatedRegistration, AppError> {
    validate_shape(req)?;

    let event = fetch_event(pool, req.event_id).await?;
    let questions = sqlx::query_as::<_, Question>(
        "SELECT * FROM questions WHERE event_id = $1 ORDER BY position",
    )
    .bind(event.id)
    .fetch_all(pool)
    .await?;

    validate_for_event(&event, &questions, req)?;

    // One retry on a serialization failure, then surface it as a conflict.
    let mut retried = false;
    loop {
        match try_create(pool, caller, &event, req).await {
            Err(e) if is_serialization_conflict(&e) => {
                if retried {
                    return Err(AppError::Conflict(
                        "registration conflicted with a concurrent request, please retry"
                            .to_string(),
                    ));
                }
                tracing::warn!(event_id = %event.id, "Retrying registration after serialization failure");
                retried = true;
            }
            result => return result,
        }
    }
}

async fn try_create(
    pool: &PgPool,
    caller: Option<&AuthUser>,
    event: &Event,
    req: &CreateRegistrationRequest,
) -> Result<CreatedRegistration, AppError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    // Lock ticket rows in a stable order so concurrent requests with
    // overlapping lines cannot deadlock.
    let mut lines = req.tickets.clone();
    lines.sort_by_key(|l| l.ticket_type_id);

    let mut reserved: Vec<(TicketType, i32)> = Vec::with_capacity(lines.len());
    for line in &lines {
        let ticket = inventory::reserve(&mut tx, line.ticket_type_id, line.quantity, now).await?;
        if ticket.event_id != event.id {
            return Err(AppError::ValidationError(format!(
                "tickets: ticket type {} does not belong to this event",
                ticket.id
            )));
        }
        reserved.push((ticket, line.quantity));
    }

    if reserved
        .windows(2)
        .any(|pair| pair[0].0.currency != pair[1].0.currency)
    {
        return Err(AppError::ValidationError(
            "tickets: all ticket lines must share one currency".to_string(),
        ));
    }

    let primary_id = upsert_participant(&mut tx, &req.participants[0]).await?;

    let status = if event.is_free {
        RegistrationStatus::Confirmed
    } else {
        RegistrationStatus::Pending
    };
    let registration_id: Uuid = sqlx::query_scalar(
        "INSERT INTO registrations (event_id, primary_participant_id, owner_user_id, status)
         VALUES ($1, $2, $3, $4)
         RETURNING id",
    )
    .bind(event.id)
    .bind(primary_id)
    .bind(caller.map(|u| u.user_id))
    .bind(status)
    .fetch_one(&mut *tx)
    .await?;

    let mut plaintext_token = None;
    if !event.is_free {
        let total: i64 = reserved
            .iter()
            .map(|(ticket, qty)| ticket.price_minor * i64::from(*qty))
            .sum();
        let currency = reserved[0].0.currency.clone();

        let credential = caller.is_none().then(|| guest_token::issue(now));
        let (token_hash, token_expiry) = match &credential {
            Some(c) => (Some(c.token_hash.as_str()), Some(c.expires_at)),
            None => (None, None),
        };

        let purchase_id: Uuid = sqlx::query_scalar(
            "INSERT INTO purchases
                 (registration_id, total_price_minor, currency,
                  payment_token_hash, payment_token_expires_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(registration_id)
        .bind(total)
        .bind(&currency)
        .bind(token_hash)
        .bind(token_expiry)
        .fetch_one(&mut *tx)
        .await?;

        for (ticket, quantity) in &reserved {
            sqlx::query(
                "INSERT INTO purchase_items (purchase_id, ticket_type_id, quantity, unit_price_minor)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(purchase_id)
            .bind(ticket.id)
            .bind(quantity)
            .bind(ticket.price_minor)
            .execute(&mut *tx)
            .await?;
        }

        plaintext_token = credential.map(|c| c.plaintext);
    }

    for participant in &req.participants {
        let participant_id = upsert_participant(&mut tx, participant).await?;

        let attendee_id: Uuid = sqlx::query_scalar(
            "INSERT INTO registration_participants (registration_id, participant_id, ticket_type_id)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(registration_id)
        .bind(participant_id)
        .bind(participant.ticket_type_id)
        .fetch_one(&mut *tx)
        .await?;

        for response in &participant.responses {
            sqlx::query(
                "INSERT INTO responses (registration_participant_id, question_id, answer_text)
                 VALUES ($1, $2, $3)",
            )
            .bind(attendee_id)
            .bind(response.question_id)
            .bind(&response.answer_text)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    tracing::info!(
        registration_id = %registration_id,
        event_id = %event.id,
        attendees = req.participants.len(),
        guest = caller.is_none(),
        "Registration created"
    );

    Ok(CreatedRegistration {
        registration_id,
        guest_token: plaintext_token,
    })
}

/// Cancellation is the only path that releases reserved stock. The status
/// transition guards the release: once a registration is `cancelled`,
/// repeating the call is a no-op.
pub async fn cancel_registration(
    pool: &PgPool,
    registration_id: Uuid,
    caller: Option<&AuthUser>,
    guest_token: Option<&str>,
) -> Result<(), AppError> {
    let registration = fetch_registration(pool, registration_id).await?;
    let purchase = fetch_purchase(pool, registration_id).await?;

    access::ensure_can_transact(
        &registration,
        purchase.as_ref(),
        caller,
        guest_token,
        Utc::now(),
    )?;

    if let Some(purchase) = &purchase {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE purchase_id = $1")
            .bind(purchase.id)
            .fetch_optional(pool)
            .await?;
        if payment.is_some_and(|p| p.status == PaymentStatus::Completed) {
            return Err(AppError::Conflict(
                "registration has already been paid and cannot be cancelled here".to_string(),
            ));
        }
    }

    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE registrations SET status = 'cancelled', updated_at = now()
         WHERE id = $1 AND status <> 'cancelled'",
    )
    .bind(registration_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    // Already cancelled means the stock was already returned.
    if updated == 0 {
        tx.commit().await?;
        return Ok(());
    }

    if let Some(purchase) = &purchase {
        let items = sqlx::query_as::<_, PurchaseItem>(
            "SELECT * FROM purchase_items WHERE purchase_id = $1",
        )
        .bind(purchase.id)
        .fetch_all(&mut *tx)
        .await?;

        for item in items {
            inventory::release(&mut tx, item.ticket_type_id, item.quantity).await?;
        }
    }

    tx.commit().await?;

    tracing::info!(registration_id = %registration_id, "Registration cancelled");
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationDetail {
    pub registration: Registration,
    pub attendees: Vec<AttendeeDetail>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendeeDetail {
    pub participant: Participant,
    pub ticket_type_id: Option<Uuid>,
    pub responses: Vec<QuestionResponse>,
}

/// Read the full aggregate back for the payment-retry flow, so a failed
/// settlement never forces attendee data to be re-collected. Same
/// authorization rules as the other registration-scoped operations.
pub async fn fetch_registration_detail(
    pool: &PgPool,
    registration_id: Uuid,
    caller: Option<&AuthUser>,
    guest_token: Option<&str>,
) -> Result<RegistrationDetail, AppError> {
    let registration = fetch_registration(pool, registration_id).await?;
    let purchase = fetch_purchase(pool, registration_id).await?;

    access::ensure_can_transact(
        &registration,
        purchase.as_ref(),
        caller,
        guest_token,
        Utc::now(),
    )?;

    let links = sqlx::query_as::<_, RegistrationParticipant>(
        "SELECT * FROM registration_participants WHERE registration_id = $1 ORDER BY created_at",
    )
    .bind(registration_id)
    .fetch_all(pool)
    .await?;

    let mut attendees = Vec::with_capacity(links.len());
    for link in links {
        let participant =
            sqlx::query_as::<_, Participant>("SELECT * FROM participants WHERE id = $1")
                .bind(link.participant_id)
                .fetch_one(pool)
                .await?;
        let responses = sqlx::query_as::<_, QuestionResponse>(
            "SELECT * FROM responses WHERE registration_participant_id = $1",
        )
        .bind(link.id)
        .fetch_all(pool)
        .await?;

        attendees.push(AttendeeDetail {
            participant,
            ticket_type_id: link.ticket_type_id,
            responses,
        });
    }

    Ok(RegistrationDetail {
        registration,
        attendees,
    })
}

pub async fn fetch_registration(
    pool: &PgPool,
    registration_id: Uuid,
) -> Result<Registration, AppError> {
    sqlx::query_as::<_, Registration>("SELECT * FROM registrations WHERE id = $1")
        .bind(registration_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Registration not found".to_string()))
}

pub async fn fetch_purchase(
    pool: &PgPool,
    registration_id: Uuid,
) -> Result<Option<Purchase>, AppError> {
    let purchase =
        sqlx::query_as::<_, Purchase>("SELECT * FROM purchases WHERE registration_id = $1")
            .bind(registration_id)
            .fetch_optional(pool)
            .await?;
    Ok(purchase)
}

async fn fetch_event(pool: &PgPool, event_id: Uuid) -> Result<Event, AppError> {
    sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
        .bind(event_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Event not found".to_string()))
}

async fn upsert_participant(
    conn: &mut PgConnection,
    input: &ParticipantInput,
) -> Result<Uuid, AppError> {
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO participants (email, first_name, last_name, phone)
         VALUES (lower($1), $2, $3, $4)
         ON CONFLICT (email) DO UPDATE
             SET first_name = EXCLUDED.first_name,
                 last_name = EXCLUDED.last_name,
                 phone = COALESCE(EXCLUDED.phone, participants.phone),
                 updated_at = now()
         RETURNING id",
    )
    .bind(&input.email)
    .bind(&input.first_name)
    .bind(&input.last_name)
    .bind(&input.phone)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

fn is_serialization_conflict(err: &AppError) -> bool {
    let AppError::DatabaseError(sqlx::Error::Database(db)) = err else {
        return false;
    };
    // 40001 serialization_failure, 40P01 deadlock_detected
    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::EventStatus;

    fn event(is_free: bool, status: EventStatus) -> Event {
        let now = Utc::now();
        Event {
            id: Uuid::new_v4(),
            organizer_id: Uuid::new_v4(),
            title: "RustConf".into(),
            description: None,
            location: "Berlin".into(),
            capacity: 100,
            is_free,
            status,
            start_time: now,
            end_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn question(event_id: Uuid, required: bool) -> Question {
        Question {
            id: Uuid::new_v4(),
            event_id,
            prompt: "Dietary requirements?".into(),
            is_required: required,
            position: 0,
            created_at: Utc::now(),
        }
    }

    fn attendee(ticket: Option<Uuid>, email: &str) -> ParticipantInput {
        ParticipantInput {
            ticket_type_id: ticket,
            email: email.into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            phone: None,
            responses: vec![],
        }
    }

    fn paid_request(ticket_id: Uuid, quantity: i32, attendees: usize) -> CreateRegistrationRequest {
        CreateRegistrationRequest {
            event_id: Uuid::new_v4(),
            tickets: vec![TicketLine {
                ticket_type_id: ticket_id,
                quantity,
            }],
            participants: (0..attendees)
                .map(|i| attendee(Some(ticket_id), &format!("a{i}@example.com")))
                .collect(),
        }
    }

    #[test]
    fn test_shape_rejects_empty_participants() {
        let req = CreateRegistrationRequest {
            event_id: Uuid::new_v4(),
            tickets: vec![],
            participants: vec![],
        };
        assert!(validate_shape(&req).is_err());
    }

    #[test]
    fn test_shape_rejects_bad_email_and_zero_quantity() {
        let ticket_id = Uuid::new_v4();
        let mut req = paid_request(ticket_id, 1, 1);
        req.participants[0].email = "not-an-email".into();
        assert!(validate_shape(&req).is_err());

        let mut req = paid_request(ticket_id, 1, 1);
        req.tickets[0].quantity = 0;
        assert!(validate_shape(&req).is_err());
    }

    #[test]
    fn test_shape_rejects_duplicate_ticket_lines() {
        let ticket_id = Uuid::new_v4();
        let mut req = paid_request(ticket_id, 1, 2);
        req.tickets.push(TicketLine {
            ticket_type_id: ticket_id,
            quantity: 1,
        });
        assert!(validate_shape(&req).is_err());
    }

    #[test]
    fn test_unpublished_event_is_a_conflict() {
        let event = event(false, EventStatus::Draft);
        let req = paid_request(Uuid::new_v4(), 1, 1);
        let err = validate_for_event(&event, &[], &req).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_free_event_rejects_ticket_lines() {
        let event = event(true, EventStatus::Published);
        let req = paid_request(Uuid::new_v4(), 1, 1);
        assert!(validate_for_event(&event, &[], &req).is_err());
    }

    #[test]
    fn test_free_event_accepts_participants_without_tickets() {
        let event = event(true, EventStatus::Published);
        let req = CreateRegistrationRequest {
            event_id: event.id,
            tickets: vec![],
            participants: vec![
                attendee(None, "a@example.com"),
                attendee(None, "b@example.com"),
            ],
        };
        assert!(validate_for_event(&event, &[], &req).is_ok());
    }

    #[test]
    fn test_paid_event_requires_one_attendee_per_ticket_unit() {
        let event = event(false, EventStatus::Published);
        // Two units requested, one attendee named.
        let req = paid_request(Uuid::new_v4(), 2, 1);
        assert!(validate_for_event(&event, &[], &req).is_err());

        let req = paid_request(Uuid::new_v4(), 2, 2);
        assert!(validate_for_event(&event, &[], &req).is_ok());
    }

    #[test]
    fn test_attendee_must_reference_a_requested_line() {
        let event = event(false, EventStatus::Published);
        let mut req = paid_request(Uuid::new_v4(), 2, 2);
        // Second attendee points at a ticket type that was never requested.
        req.participants[1].ticket_type_id = Some(Uuid::new_v4());
        assert!(validate_for_event(&event, &[], &req).is_err());
    }

    #[test]
    fn test_required_question_must_be_answered_by_every_attendee() {
        let event = event(false, EventStatus::Published);
        let q = question(event.id, true);
        let mut req = paid_request(Uuid::new_v4(), 2, 2);

        req.participants[0].responses = vec![ResponseInput {
            question_id: q.id,
            answer_text: "vegetarian".into(),
        }];
        // Second attendee left it unanswered.
        assert!(validate_for_event(&event, &[q.clone()], &req).is_err());

        req.participants[1].responses = vec![ResponseInput {
            question_id: q.id,
            answer_text: "none".into(),
        }];
        assert!(validate_for_event(&event, &[q], &req).is_ok());
    }

    #[test]
    fn test_unknown_and_duplicate_question_ids_are_rejected() {
        let event = event(false, EventStatus::Published);
        let q = question(event.id, false);

        let mut req = paid_request(Uuid::new_v4(), 1, 1);
        req.participants[0].responses = vec![ResponseInput {
            question_id: Uuid::new_v4(),
            answer_text: "?".into(),
        }];
        assert!(validate_for_event(&event, &[q.clone()], &req).is_err());

        let mut req = paid_request(Uuid::new_v4(), 1, 1);
        req.participants[0].responses = vec![
            ResponseInput {
                question_id: q.id,
                answer_text: "a".into(),
            },
            ResponseInput {
                question_id: q.id,
                answer_text: "b".into(),
            },
        ];
        assert!(validate_for_event(&event, &[q], &req).is_err());
    }

    #[test]
    fn test_optional_question_may_be_skipped() {
        let event = event(false, EventStatus::Published);
        let q = question(event.id, false);
        let req = paid_request(Uuid::new_v4(), 1, 1);
        assert!(validate_for_event(&event, &[q], &req).is_ok());
    }
}
