//! SQLite-backed session store: participants, experiment sessions and their
//! chat logs. This is the only durable state the conversational engine
//! touches; everything else is read-only configuration.

mod migrations;
mod models;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use palaver_schema::{ChatMessageType, SessionStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use uuid::Uuid;

use migrations::run_migrations;
pub use models::{ChatMessageRecord, Participant, ScheduledMessageRecord, SessionRecord};

/// Chat metadata key holding the cooperative cancellation flag.
pub const METADATA_CANCELLED: &str = "cancelled";
/// Chat metadata key holding the provider-side assistant thread id.
pub const METADATA_THREAD_ID: &str = "thread_id";

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    // ============================================================
    // Participants
    // ============================================================

    /// Find or create the participant for `(team, identifier)`.
    ///
    /// Runs inside a transaction so concurrent first-contact messages from
    /// the same identifier cannot create duplicates. Returns the
    /// participant and whether it was freshly created.
    pub async fn find_or_create_participant(
        &self,
        team: &str,
        identifier: &str,
        user_id: Option<&str>,
    ) -> Result<(Participant, bool)> {
        let db = Arc::clone(&self.db);
        let team = team.to_owned();
        let identifier = identifier.to_owned();
        let user_id = user_id.map(str::to_owned);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let tx = conn.unchecked_transaction()?;
            let existing = tx
                .query_row(
                    "SELECT id, team, identifier, user_id, created_at
                     FROM participants WHERE team = ?1 AND identifier = ?2",
                    params![team, identifier],
                    map_participant,
                )
                .optional()?;

            let result = match existing {
                Some(mut participant) => {
                    // A participant that becomes a platform user keeps the
                    // same row; reconcile the link on first sight.
                    if participant.user_id.is_none() {
                        if let Some(user) = &user_id {
                            tx.execute(
                                "UPDATE participants SET user_id = ?1 WHERE id = ?2",
                                params![user, participant.id],
                            )?;
                            participant.user_id = Some(user.clone());
                        }
                    }
                    (participant, false)
                }
                None => {
                    let now = Utc::now();
                    tx.execute(
                        "INSERT INTO participants (team, identifier, user_id, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![team, identifier, user_id, now.to_rfc3339()],
                    )?;
                    let id = tx.last_insert_rowid();
                    (
                        Participant {
                            id,
                            team,
                            identifier,
                            user_id,
                            created_at: now,
                        },
                        true,
                    )
                }
            };
            tx.commit()?;
            Ok::<_, anyhow::Error>(result)
        })
        .await?
    }

    /// Read the merged key-value data for a participant within an
    /// experiment (timezone, custom fields).
    pub async fn participant_data(
        &self,
        participant_id: i64,
        experiment_id: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let db = Arc::clone(&self.db);
        let experiment_id = experiment_id.to_owned();
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT data FROM participant_data
                     WHERE participant_id = ?1 AND experiment_id = ?2",
                    params![participant_id, experiment_id],
                    |row| row.get(0),
                )
                .optional()?;
            let value = match raw {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Map::new(),
            };
            Ok::<_, anyhow::Error>(value)
        })
        .await?
    }

    /// Merge `data` keys into the participant's experiment-scoped record.
    pub async fn update_participant_data(
        &self,
        participant_id: i64,
        experiment_id: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let current = self.participant_data(participant_id, experiment_id).await?;
        let db = Arc::clone(&self.db);
        let experiment_id = experiment_id.to_owned();
        task::spawn_blocking(move || {
            let mut merged = current;
            for (key, value) in data {
                merged.insert(key, value);
            }
            let conn = lock(&db)?;
            conn.execute(
                "INSERT INTO participant_data (participant_id, experiment_id, data)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (participant_id, experiment_id) DO UPDATE SET data = excluded.data",
                params![
                    participant_id,
                    experiment_id,
                    serde_json::to_string(&merged)?
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    // ============================================================
    // Sessions
    // ============================================================

    /// Create a session (and its chat row) for a participant.
    pub async fn create_session(
        &self,
        team: &str,
        experiment_id: &str,
        channel_id: Option<&str>,
        participant_id: i64,
        status: SessionStatus,
        external_session_id: Option<&str>,
    ) -> Result<SessionRecord> {
        let db = Arc::clone(&self.db);
        let team = team.to_owned();
        let experiment_id = experiment_id.to_owned();
        let channel_id = channel_id.map(str::to_owned);
        let external_session_id = external_session_id.map(str::to_owned);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO chats (team, metadata) VALUES (?1, '{}')",
                params![team],
            )?;
            let chat_id = tx.last_insert_rowid();
            let external_id = Uuid::new_v4().to_string();
            let now = Utc::now();
            tx.execute(
                "INSERT INTO experiment_sessions
                    (external_id, team, experiment_id, channel_id, participant_id,
                     chat_id, status, created_at, external_session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    external_id,
                    team,
                    experiment_id,
                    channel_id,
                    participant_id,
                    chat_id,
                    status.as_str(),
                    now.to_rfc3339(),
                    external_session_id,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            let session = conn.query_row(
                &format!("{SESSION_SELECT} WHERE s.id = ?1"),
                params![id],
                map_session,
            )?;
            Ok::<_, anyhow::Error>(session)
        })
        .await?
    }

    /// The most recent session for `(experiment, identifier)`, ended or
    /// not. The orchestrator decides whether an ended one warrants a new
    /// session.
    pub async fn latest_session(
        &self,
        experiment_id: &str,
        identifier: &str,
    ) -> Result<Option<SessionRecord>> {
        let db = Arc::clone(&self.db);
        let experiment_id = experiment_id.to_owned();
        let identifier = identifier.to_owned();
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let session = conn
                .query_row(
                    &format!(
                        "{SESSION_SELECT}
                         WHERE s.experiment_id = ?1 AND p.identifier = ?2
                         ORDER BY s.created_at DESC, s.id DESC LIMIT 1"
                    ),
                    params![experiment_id, identifier],
                    map_session,
                )
                .optional()?;
            Ok::<_, anyhow::Error>(session)
        })
        .await?
    }

    pub async fn session_by_external_id(&self, external_id: &str) -> Result<Option<SessionRecord>> {
        let db = Arc::clone(&self.db);
        let external_id = external_id.to_owned();
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let session = conn
                .query_row(
                    &format!("{SESSION_SELECT} WHERE s.external_id = ?1"),
                    params![external_id],
                    map_session,
                )
                .optional()?;
            Ok::<_, anyhow::Error>(session)
        })
        .await?
    }

    pub async fn session_count(&self, experiment_id: &str, identifier: &str) -> Result<i64> {
        let db = Arc::clone(&self.db);
        let experiment_id = experiment_id.to_owned();
        let identifier = identifier.to_owned();
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let count = conn.query_row(
                "SELECT COUNT(*) FROM experiment_sessions s
                 JOIN participants p ON p.id = s.participant_id
                 WHERE s.experiment_id = ?1 AND p.identifier = ?2",
                params![experiment_id, identifier],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(count)
        })
        .await?
    }

    pub async fn update_status(&self, session_id: i64, status: SessionStatus) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            conn.execute(
                "UPDATE experiment_sessions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), session_id],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    /// End the session: terminal status plus an ended-at timestamp.
    pub async fn end_session(&self, session_id: i64) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            conn.execute(
                "UPDATE experiment_sessions SET status = ?1, ended_at = ?2 WHERE id = ?3",
                params![
                    SessionStatus::PendingReview.as_str(),
                    Utc::now().to_rfc3339(),
                    session_id
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn reset_ping_count(&self, session_id: i64) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            conn.execute(
                "UPDATE experiment_sessions SET no_activity_ping_count = 0 WHERE id = ?1",
                params![session_id],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    // ============================================================
    // Chat log
    // ============================================================

    pub async fn append_message(
        &self,
        chat_id: i64,
        message_type: ChatMessageType,
        content: &str,
        tags: &[String],
    ) -> Result<ChatMessageRecord> {
        let db = Arc::clone(&self.db);
        let content = content.to_owned();
        let tags = tags.to_vec();
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let now = Utc::now();
            conn.execute(
                "INSERT INTO chat_messages (chat_id, message_type, content, tags, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chat_id,
                    message_type.as_str(),
                    content,
                    serde_json::to_string(&tags)?,
                    now.to_rfc3339()
                ],
            )?;
            Ok::<_, anyhow::Error>(ChatMessageRecord {
                id: conn.last_insert_rowid(),
                chat_id,
                message_type,
                content,
                tags,
                created_at: now,
            })
        })
        .await?
    }

    /// Full ordered message log for a chat.
    pub async fn messages(&self, chat_id: i64) -> Result<Vec<ChatMessageRecord>> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, message_type, content, tags, created_at
                 FROM chat_messages WHERE chat_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![chat_id], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok::<_, anyhow::Error>(rows)
        })
        .await?
    }

    /// Whether the participant ever said anything in this chat. Gating
    /// prompts append HUMAN entries too, so consent-stage replies count.
    pub async fn has_human_message(&self, chat_id: i64) -> Result<bool> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_messages
                 WHERE chat_id = ?1 AND message_type = ?2",
                params![chat_id, ChatMessageType::Human.as_str()],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(count > 0)
        })
        .await?
    }

    // ============================================================
    // Chat metadata
    // ============================================================

    pub async fn chat_metadata(&self, chat_id: i64) -> Result<serde_json::Value> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let raw: String = conn.query_row(
                "SELECT metadata FROM chats WHERE id = ?1",
                params![chat_id],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(serde_json::from_str(&raw)?)
        })
        .await?
    }

    pub async fn set_chat_metadata(
        &self,
        chat_id: i64,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let raw: String = conn.query_row(
                "SELECT metadata FROM chats WHERE id = ?1",
                params![chat_id],
                |row| row.get(0),
            )?;
            let mut metadata: serde_json::Value = serde_json::from_str(&raw)?;
            metadata[key] = value;
            conn.execute(
                "UPDATE chats SET metadata = ?1 WHERE id = ?2",
                params![serde_json::to_string(&metadata)?, chat_id],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    /// The cooperative cancellation flag polled mid-generation.
    pub async fn chat_cancelled(&self, chat_id: i64) -> Result<bool> {
        let metadata = self.chat_metadata(chat_id).await?;
        Ok(metadata
            .get(METADATA_CANCELLED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    // ============================================================
    // Routes and scheduled messages
    // ============================================================

    pub async fn upsert_route(
        &self,
        team: &str,
        parent_id: &str,
        child_id: &str,
        keyword: &str,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        let (team, parent_id, child_id, keyword) = (
            team.to_owned(),
            parent_id.to_owned(),
            child_id.to_owned(),
            keyword.to_owned(),
        );
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            conn.execute(
                "INSERT INTO experiment_routes (team, parent_id, child_id, keyword)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (team, parent_id, child_id) DO UPDATE SET keyword = excluded.keyword",
                params![team, parent_id, child_id, keyword],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn route_keyword(
        &self,
        team: &str,
        parent_id: &str,
        child_id: &str,
    ) -> Result<Option<String>> {
        let db = Arc::clone(&self.db);
        let (team, parent_id, child_id) =
            (team.to_owned(), parent_id.to_owned(), child_id.to_owned());
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let keyword = conn
                .query_row(
                    "SELECT keyword FROM experiment_routes
                     WHERE team = ?1 AND parent_id = ?2 AND child_id = ?3",
                    params![team, parent_id, child_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok::<_, anyhow::Error>(keyword)
        })
        .await?
    }

    pub async fn insert_scheduled_message(
        &self,
        session_id: i64,
        message: &str,
        due_at: DateTime<Utc>,
    ) -> Result<i64> {
        let db = Arc::clone(&self.db);
        let message = message.to_owned();
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            conn.execute(
                "INSERT INTO scheduled_messages (session_id, message, due_at, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session_id,
                    message,
                    due_at.to_rfc3339(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok::<_, anyhow::Error>(conn.last_insert_rowid())
        })
        .await?
    }

    pub async fn scheduled_messages(&self, session_id: i64) -> Result<Vec<ScheduledMessageRecord>> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = lock(&db)?;
            let mut stmt = conn.prepare(
                "SELECT id, session_id, message, due_at, created_at
                 FROM scheduled_messages WHERE session_id = ?1 ORDER BY due_at",
            )?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    Ok(ScheduledMessageRecord {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        message: row.get(2)?,
                        due_at: parse_datetime(row, 3)?,
                        created_at: parse_datetime(row, 4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok::<_, anyhow::Error>(rows)
        })
        .await?
    }
}

const SESSION_SELECT: &str = "\
    SELECT s.id, s.external_id, s.team, s.experiment_id, s.channel_id,
           s.participant_id, p.identifier, p.user_id, s.chat_id, s.status,
           s.created_at, s.ended_at, s.no_activity_ping_count, s.external_session_id
    FROM experiment_sessions s
    JOIN participants p ON p.id = s.participant_id";

fn lock(db: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|_| anyhow!("failed to lock sqlite connection"))
}

fn parse_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_datetime_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    })
    .transpose()
}

fn map_participant(row: &Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: row.get(0)?,
        team: row.get(1)?,
        identifier: row.get(2)?,
        user_id: row.get(3)?,
        created_at: parse_datetime(row, 4)?,
    })
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(9)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        team: row.get(2)?,
        experiment_id: row.get(3)?,
        channel_id: row.get(4)?,
        participant_id: row.get(5)?,
        participant_identifier: row.get(6)?,
        participant_user: row.get(7)?,
        chat_id: row.get(8)?,
        status: SessionStatus::parse(&status),
        created_at: parse_datetime(row, 10)?,
        ended_at: parse_datetime_opt(row, 11)?,
        no_activity_ping_count: row.get(12)?,
        external_session_id: row.get(13)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<ChatMessageRecord> {
    let message_type: String = row.get(2)?;
    let tags: String = row.get(4)?;
    Ok(ChatMessageRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        message_type: ChatMessageType::parse(&message_type).unwrap_or(ChatMessageType::System),
        content: row.get(3)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at: parse_datetime(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_session() -> (SessionStore, SessionRecord) {
        let store = SessionStore::open_in_memory().unwrap();
        let (participant, created) = store
            .find_or_create_participant("acme", "12345", None)
            .await
            .unwrap();
        assert!(created);
        let session = store
            .create_session(
                "acme",
                "exp-1",
                Some("ch-1"),
                participant.id,
                SessionStatus::Setup,
                None,
            )
            .await
            .unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn find_or_create_participant_is_idempotent() {
        let store = SessionStore::open_in_memory().unwrap();
        let (p1, created1) = store
            .find_or_create_participant("acme", "12345", None)
            .await
            .unwrap();
        let (p2, created2) = store
            .find_or_create_participant("acme", "12345", None)
            .await
            .unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(p1.id, p2.id);
    }

    #[tokio::test]
    async fn participant_user_link_is_reconciled() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .find_or_create_participant("acme", "user@example.com", None)
            .await
            .unwrap();
        let (p, created) = store
            .find_or_create_participant("acme", "user@example.com", Some("u-9"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(p.user_id.as_deref(), Some("u-9"));
    }

    #[tokio::test]
    async fn same_identifier_distinct_teams_get_distinct_participants() {
        let store = SessionStore::open_in_memory().unwrap();
        let (p1, _) = store
            .find_or_create_participant("acme", "123", None)
            .await
            .unwrap();
        let (p2, _) = store
            .find_or_create_participant("globex", "123", None)
            .await
            .unwrap();
        assert_ne!(p1.id, p2.id);
    }

    #[tokio::test]
    async fn create_and_fetch_latest_session() {
        let (store, session) = store_with_session().await;
        assert_eq!(session.status, SessionStatus::Setup);
        assert!(session.ended_at.is_none());
        assert_eq!(session.participant_identifier, "12345");

        let latest = store
            .latest_session("exp-1", "12345")
            .await
            .unwrap()
            .expect("session should exist");
        assert_eq!(latest.id, session.id);

        assert!(store
            .latest_session("exp-1", "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn end_session_sets_terminal_status_and_timestamp() {
        let (store, session) = store_with_session().await;
        store.end_session(session.id).await.unwrap();
        let ended = store
            .latest_session("exp-1", "12345")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ended.status, SessionStatus::PendingReview);
        assert!(ended.is_ended());
    }

    #[tokio::test]
    async fn latest_session_prefers_newest_row() {
        let (store, first) = store_with_session().await;
        store.end_session(first.id).await.unwrap();
        let second = store
            .create_session(
                "acme",
                "exp-1",
                Some("ch-1"),
                first.participant_id,
                SessionStatus::Setup,
                None,
            )
            .await
            .unwrap();
        let latest = store
            .latest_session("exp-1", "12345")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(store.session_count("exp-1", "12345").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn message_log_round_trip() {
        let (store, session) = store_with_session().await;
        assert!(!store.has_human_message(session.chat_id).await.unwrap());

        store
            .append_message(session.chat_id, ChatMessageType::Human, "hello", &[])
            .await
            .unwrap();
        store
            .append_message(
                session.chat_id,
                ChatMessageType::Ai,
                "hi there",
                &["routed".to_string()],
            )
            .await
            .unwrap();

        let messages = store.messages(session.chat_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, ChatMessageType::Human);
        assert_eq!(messages[1].tags, vec!["routed".to_string()]);
        assert!(store.has_human_message(session.chat_id).await.unwrap());
    }

    #[tokio::test]
    async fn chat_metadata_holds_cancellation_flag() {
        let (store, session) = store_with_session().await;
        assert!(!store.chat_cancelled(session.chat_id).await.unwrap());

        store
            .set_chat_metadata(session.chat_id, METADATA_CANCELLED, serde_json::json!(true))
            .await
            .unwrap();
        assert!(store.chat_cancelled(session.chat_id).await.unwrap());

        store
            .set_chat_metadata(
                session.chat_id,
                METADATA_THREAD_ID,
                serde_json::json!("thread_abc"),
            )
            .await
            .unwrap();
        let metadata = store.chat_metadata(session.chat_id).await.unwrap();
        assert_eq!(metadata[METADATA_THREAD_ID], "thread_abc");
        // Setting one key leaves the other untouched.
        assert_eq!(metadata[METADATA_CANCELLED], true);
    }

    #[tokio::test]
    async fn participant_data_merges_keys() {
        let (store, session) = store_with_session().await;
        let mut data = serde_json::Map::new();
        data.insert("timezone".into(), serde_json::json!("Africa/Johannesburg"));
        store
            .update_participant_data(session.participant_id, "exp-1", data)
            .await
            .unwrap();

        let mut more = serde_json::Map::new();
        more.insert("name".into(), serde_json::json!("Tester"));
        store
            .update_participant_data(session.participant_id, "exp-1", more)
            .await
            .unwrap();

        let data = store
            .participant_data(session.participant_id, "exp-1")
            .await
            .unwrap();
        assert_eq!(data["timezone"], "Africa/Johannesburg");
        assert_eq!(data["name"], "Tester");
    }

    #[tokio::test]
    async fn route_keyword_lookup() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .upsert_route("acme", "parent", "child", "billing")
            .await
            .unwrap();
        assert_eq!(
            store
                .route_keyword("acme", "parent", "child")
                .await
                .unwrap()
                .as_deref(),
            Some("billing")
        );
        assert!(store
            .route_keyword("acme", "parent", "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn scheduled_messages_round_trip() {
        let (store, session) = store_with_session().await;
        let due = Utc::now() + chrono::TimeDelta::try_hours(2).unwrap();
        store
            .insert_scheduled_message(session.id, "take your medication", due)
            .await
            .unwrap();
        let rows = store.scheduled_messages(session.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "take your medication");
    }

    #[tokio::test]
    async fn open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palaver.db");
        let path = path.to_str().unwrap();
        {
            let store = SessionStore::open(path).unwrap();
            store
                .find_or_create_participant("acme", "123", None)
                .await
                .unwrap();
        }
        let store = SessionStore::open(path).unwrap();
        let (_, created) = store
            .find_or_create_participant("acme", "123", None)
            .await
            .unwrap();
        assert!(!created);
    }
}
