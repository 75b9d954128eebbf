use crate::common::models::{now_millis, UserId};
use crate::server::database::Database;
use log::{debug, info, warn};
use sqlx::Row;
use std::time::Duration;

/// Resolves a session token to its user. Expired and unknown tokens yield `None`.
pub async fn validate_session(db: &Database, session_token: &str) -> Option<UserId> {
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
        .bind(session_token)
        .bind(now_millis())
        .fetch_optional(&db.pool)
        .await;

    match row {
        Ok(Some(row)) => {
            let user_id: String = row.get("user_id");
            debug!("[AUTH] Session valid for user {}", user_id);
            Some(user_id)
        }
        Ok(None) => {
            debug!("[AUTH] Session token {} is unknown or expired", mask(session_token));
            None
        }
        Err(e) => {
            warn!("[AUTH] Database error validating session: {}", e);
            None
        }
    }
}

/// Stores a session the way the authentication service does. Used by tooling and tests.
pub async fn create_session(db: &Database, user_id: &str, ttl: Duration) -> Result<String, sqlx::Error> {
    let token = format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple());
    let now = now_millis();
    sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(user_id)
        .bind(&token)
        .bind(now)
        .bind(now + ttl.as_millis() as i64)
        .execute(&db.pool)
        .await?;
    Ok(token)
}

/// Removes expired sessions. Safe to run periodically.
pub async fn cleanup_expired_sessions(db: &Database) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now_millis())
        .execute(&db.pool)
        .await?;
    if res.rows_affected() > 0 {
        info!("[AUTH] Cleaned up {} expired sessions", res.rows_affected());
    }
    Ok(res.rows_affected())
}

fn mask(token: &str) -> String {
    let visible: String = token.chars().take(8).collect();
    format!("{}…", visible)
}
