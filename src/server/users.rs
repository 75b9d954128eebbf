use crate::common::models::{from_millis, now_millis, PublicProfile, UserId, UserStatus, UserSummary};
use crate::server::database::Database;
use crate::server::error::{ChatError, ChatResult};
use log::info;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const PROFILE_COLUMNS: &str = "id, username, display_name, avatar, bio, status, is_online, last_seen";

fn profile_from_row(row: &SqliteRow) -> PublicProfile {
    let status: String = row.get("status");
    PublicProfile {
        id: row.get("id"),
        username: row.get("username"),
        display_name: row.get("display_name"),
        avatar: row.get("avatar"),
        bio: row.get("bio"),
        status: UserStatus::parse(&status).unwrap_or(UserStatus::Offline),
        is_online: row.get::<i64, _>("is_online") != 0,
        last_seen: from_millis(row.get("last_seen")),
    }
}

/// Inserts a user row. Account creation belongs to the HTTP side; this exists for
/// tooling and tests.
pub async fn create_user(
    db: &Database,
    username: &str,
    display_name: &str,
    email: Option<&str>,
) -> ChatResult<UserId> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();
    sqlx::query(
        "INSERT INTO users (id, username, email, display_name, last_seen, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(username)
    .bind(email)
    .bind(display_name)
    .bind(now)
    .bind(now)
    .execute(&db.pool)
    .await?;
    info!("[USERS] Created user {} ({})", username, id);
    Ok(id)
}

pub async fn find_profile(db: &Database, user_id: &str) -> ChatResult<Option<PublicProfile>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", PROFILE_COLUMNS))
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.as_ref().map(profile_from_row))
}

pub async fn require_profile(db: &Database, user_id: &str) -> ChatResult<PublicProfile> {
    find_profile(db, user_id)
        .await?
        .ok_or_else(|| ChatError::not_found("User not found"))
}

pub async fn find_summary(db: &Database, user_id: &str) -> ChatResult<Option<UserSummary>> {
    Ok(find_profile(db, user_id).await?.map(|p| p.summary()))
}

pub async fn exists(db: &Database, user_id: &str) -> ChatResult<bool> {
    let found = sqlx::query("SELECT 1 FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(found.is_some())
}

pub async fn mark_connected(db: &Database, user_id: &str, socket_id: &str) -> ChatResult<()> {
    sqlx::query("UPDATE users SET is_online = 1, socket_id = ?, last_seen = ? WHERE id = ?")
        .bind(socket_id)
        .bind(now_millis())
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

pub async fn mark_disconnected(db: &Database, user_id: &str) -> ChatResult<()> {
    sqlx::query("UPDATE users SET is_online = 0, socket_id = NULL, last_seen = ? WHERE id = ?")
        .bind(now_millis())
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

/// Clears stale presence left behind by a previous run.
pub async fn mark_all_offline(db: &Database) -> ChatResult<u64> {
    let res = sqlx::query("UPDATE users SET is_online = 0, socket_id = NULL WHERE is_online = 1")
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn set_status(db: &Database, user_id: &str, status: UserStatus) -> ChatResult<()> {
    let res = sqlx::query("UPDATE users SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::not_found("User not found"));
    }
    Ok(())
}

pub async fn count_online(db: &Database) -> ChatResult<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE is_online = 1")
        .fetch_one(&db.pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn connect_and_disconnect_toggle_presence() {
        let db = setup().await;
        let uid = create_user(&db, "carol", "Carol", Some("carol@example.com")).await.unwrap();

        mark_connected(&db, &uid, "conn-1").await.unwrap();
        let profile = require_profile(&db, &uid).await.unwrap();
        assert!(profile.is_online);
        assert_eq!(count_online(&db).await.unwrap(), 1);

        mark_disconnected(&db, &uid).await.unwrap();
        let profile = require_profile(&db, &uid).await.unwrap();
        assert!(!profile.is_online);
        assert_eq!(count_online(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_updates_persist() {
        let db = setup().await;
        let uid = create_user(&db, "dave", "Dave", None).await.unwrap();

        set_status(&db, &uid, UserStatus::Busy).await.unwrap();
        assert_eq!(require_profile(&db, &uid).await.unwrap().status, UserStatus::Busy);
        assert!(matches!(
            set_status(&db, "missing", UserStatus::Away).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stale_presence_is_cleared() {
        let db = setup().await;
        let a = create_user(&db, "erin", "Erin", None).await.unwrap();
        let b = create_user(&db, "frank", "Frank", None).await.unwrap();
        mark_connected(&db, &a, "c1").await.unwrap();
        mark_connected(&db, &b, "c2").await.unwrap();

        assert_eq!(mark_all_offline(&db).await.unwrap(), 2);
        assert!(!exists(&db, "ghost").await.unwrap());
        assert_eq!(find_summary(&db, &a).await.unwrap().unwrap().username, "erin");
    }
}
