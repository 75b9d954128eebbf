use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// All timestamps are stored as INTEGER milliseconds since the epoch.
#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("[DB] Connecting to {}", database_url);

        let file_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        if file_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                    info!("[DB] Created directory {:?}", parent);
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("[DB] Connection pool ready");
        Ok(Self { pool })
    }

    /// Single shared connection so every query sees the same in-memory database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("[DB] Schema up to date ({} statements)", SCHEMA.len());
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT UNIQUE NOT NULL,
        email TEXT UNIQUE,
        display_name TEXT NOT NULL,
        avatar TEXT,
        bio TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'offline',
        role TEXT NOT NULL DEFAULT 'user',
        is_online INTEGER NOT NULL DEFAULT 0,
        socket_id TEXT,
        last_seen INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    "#,
    // Written by the authentication service; read here to authenticate sockets.
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        user_id TEXT NOT NULL,
        session_token TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS groups (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        avatar TEXT,
        created_by TEXT NOT NULL,
        is_private INTEGER NOT NULL DEFAULT 0,
        invite_code TEXT UNIQUE,
        allow_member_invites INTEGER NOT NULL DEFAULT 1,
        allow_file_sharing INTEGER NOT NULL DEFAULT 1,
        allow_message_editing INTEGER NOT NULL DEFAULT 1,
        last_activity INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_members (
        group_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'member',
        joined_at INTEGER NOT NULL,
        PRIMARY KEY (group_id, user_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        sender_id TEXT NOT NULL,
        content TEXT,
        kind TEXT NOT NULL DEFAULT 'text',
        chat_type TEXT NOT NULL,
        private_chat_with TEXT,
        group_id TEXT,
        status TEXT NOT NULL DEFAULT 'sending',
        attachment_url TEXT,
        attachment_filename TEXT,
        attachment_size INTEGER,
        attachment_mime_type TEXT,
        reply_to_message TEXT,
        reply_to_content TEXT,
        reply_to_sender TEXT,
        edited INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        forwarded INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages (chat_type, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_messages_private ON messages (private_chat_with, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_messages_group ON messages (group_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages (sender_id, created_at);",
    r#"
    CREATE TABLE IF NOT EXISTS message_recipients (
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (message_id, user_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_delivery (
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'sent',
        delivered_at INTEGER,
        seen_at INTEGER,
        PRIMARY KEY (message_id, user_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_reads (
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        read_at INTEGER NOT NULL,
        PRIMARY KEY (message_id, user_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_reactions (
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        emoji TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (message_id, user_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS calls (
        id TEXT NOT NULL,
        caller_id TEXT NOT NULL,
        callee_id TEXT NOT NULL,
        call_type TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        answered_at INTEGER,
        ended_at INTEGER,
        duration_secs INTEGER NOT NULL DEFAULT 0,
        ended_by TEXT,
        PRIMARY KEY (id, started_at)
    );
    "#,
    "CREATE INDEX IF NOT EXISTS idx_calls_participants ON calls (caller_id, callee_id, started_at);",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();

        let tables: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(tables, 10);
    }
}
