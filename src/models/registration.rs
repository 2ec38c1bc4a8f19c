use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Root aggregate for one checkout transaction. Never deleted once payment
/// has started; settlement only moves its status forward.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Registration {
    pub id: Uuid,
    pub event_id: Uuid,
    pub primary_participant_id: Uuid,
    pub owner_user_id: Option<Uuid>,
    pub status: RegistrationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// One named attendee bound to exactly one purchased ticket unit.
/// `ticket_type_id` is NULL only for free events.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RegistrationParticipant {
    pub id: Uuid,
    pub registration_id: Uuid,
    pub participant_id: Uuid,
    pub ticket_type_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuestionResponse {
    pub id: Uuid,
    pub registration_participant_id: Uuid,
    pub question_id: Uuid,
    pub answer_text: String,
    pub created_at: DateTime<Utc>,
}
