use chrono::{DateTime, Utc};
use palaver_schema::{ChatMessageType, SessionStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub team: String,
    /// Platform identity: phone number, chat id, email.
    pub identifier: String,
    /// Linked platform user, if the participant ever authenticated.
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub external_id: String,
    pub team: String,
    pub experiment_id: String,
    pub channel_id: Option<String>,
    pub participant_id: i64,
    pub participant_identifier: String,
    pub participant_user: Option<String>,
    pub chat_id: i64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub no_activity_ping_count: i64,
    /// Platform conversation handle where the platform needs one to reply
    /// without an inbound message in hand (Slack `channel:thread_ts`).
    pub external_session_id: Option<String>,
}

impl SessionRecord {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub id: i64,
    pub chat_id: i64,
    pub message_type: ChatMessageType,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessageRecord {
    pub id: i64,
    pub session_id: i64,
    pub message: String,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
