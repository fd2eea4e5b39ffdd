use anyhow::Result;
use rusqlite::Connection;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS participants (
            id INTEGER PRIMARY KEY,
            team TEXT NOT NULL,
            identifier TEXT NOT NULL,
            user_id TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (team, identifier)
        );

        CREATE TABLE IF NOT EXISTS participant_data (
            participant_id INTEGER NOT NULL REFERENCES participants(id),
            experiment_id TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (participant_id, experiment_id)
        );

        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY,
            team TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id INTEGER PRIMARY KEY,
            chat_id INTEGER NOT NULL REFERENCES chats(id),
            message_type TEXT NOT NULL,
            content TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
            ON chat_messages(chat_id);

        CREATE TABLE IF NOT EXISTS experiment_sessions (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            team TEXT NOT NULL,
            experiment_id TEXT NOT NULL,
            channel_id TEXT,
            participant_id INTEGER NOT NULL REFERENCES participants(id),
            chat_id INTEGER NOT NULL REFERENCES chats(id),
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            ended_at TEXT,
            no_activity_ping_count INTEGER NOT NULL DEFAULT 0,
            external_session_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_experiment_participant
            ON experiment_sessions(experiment_id, participant_id, created_at);

        CREATE TABLE IF NOT EXISTS experiment_routes (
            team TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            child_id TEXT NOT NULL,
            keyword TEXT NOT NULL,
            PRIMARY KEY (team, parent_id, child_id)
        );

        CREATE TABLE IF NOT EXISTS scheduled_messages (
            id INTEGER PRIMARY KEY,
            session_id INTEGER NOT NULL REFERENCES experiment_sessions(id),
            message TEXT NOT NULL,
            due_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
