use crate::common::models::{from_millis, now_millis, GroupRole, UserId};
use crate::server::database::Database;
use crate::server::error::{ChatError, ChatResult};
use chrono::{DateTime, Utc};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const INVITE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const INVITE_CODE_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    pub allow_member_invites: bool,
    pub allow_file_sharing: bool,
    pub allow_message_editing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub avatar: Option<String>,
    pub created_by: UserId,
    pub is_private: bool,
    pub invite_code: Option<String>,
    pub settings: GroupSettings,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

fn group_from_row(row: &SqliteRow) -> GroupInfo {
    GroupInfo {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        avatar: row.get("avatar"),
        created_by: row.get("created_by"),
        is_private: row.get::<i64, _>("is_private") != 0,
        invite_code: row.get("invite_code"),
        settings: GroupSettings {
            allow_member_invites: row.get::<i64, _>("allow_member_invites") != 0,
            allow_file_sharing: row.get::<i64, _>("allow_file_sharing") != 0,
            allow_message_editing: row.get::<i64, _>("allow_message_editing") != 0,
        },
        last_activity: from_millis(row.get("last_activity")),
        created_at: from_millis(row.get("created_at")),
    }
}

/// Creates a group with its creator as the first admin.
pub async fn create_group(db: &Database, creator: &str, name: &str, description: &str) -> ChatResult<GroupInfo> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(ChatError::invalid("Group name must be 1-100 characters"));
    }
    let group_id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();

    let mut tx = db.pool.begin().await?;
    sqlx::query(
        "INSERT INTO groups (id, name, description, created_by, last_activity, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&group_id)
    .bind(name)
    .bind(description)
    .bind(creator)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query("INSERT INTO group_members (group_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
        .bind(&group_id)
        .bind(creator)
        .bind(GroupRole::Admin.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!("[GROUPS] Group '{}' created with id {} by {}", name, group_id, creator);
    find(db, &group_id)
        .await?
        .ok_or_else(|| ChatError::not_found("Group not found"))
}

pub async fn find(db: &Database, group_id: &str) -> ChatResult<Option<GroupInfo>> {
    let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.as_ref().map(group_from_row))
}

/// Adds a member; returns `false` when they were already in the group.
pub async fn add_member(db: &Database, group_id: &str, user_id: &str, role: GroupRole) -> ChatResult<bool> {
    let now = now_millis();
    let res = sqlx::query("INSERT OR IGNORE INTO group_members (group_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
        .bind(group_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(now)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() > 0 {
        touch_activity(db, group_id).await?;
    }
    Ok(res.rows_affected() > 0)
}

pub async fn remove_member(db: &Database, group_id: &str, user_id: &str) -> ChatResult<bool> {
    let res = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() > 0 {
        touch_activity(db, group_id).await?;
    }
    Ok(res.rows_affected() > 0)
}

/// Promotes an existing member; non-members are left alone.
pub async fn promote_to_admin(db: &Database, group_id: &str, user_id: &str) -> ChatResult<bool> {
    let res = sqlx::query("UPDATE group_members SET role = ? WHERE group_id = ? AND user_id = ?")
        .bind(GroupRole::Admin.as_str())
        .bind(group_id)
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() > 0 {
        touch_activity(db, group_id).await?;
    }
    Ok(res.rows_affected() > 0)
}

async fn member_role(db: &Database, group_id: &str, user_id: &str) -> ChatResult<Option<GroupRole>> {
    let row = sqlx::query("SELECT role FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.and_then(|r| GroupRole::parse(&r.get::<String, _>("role"))))
}

pub async fn is_member(db: &Database, group_id: &str, user_id: &str) -> ChatResult<bool> {
    Ok(member_role(db, group_id, user_id).await?.is_some())
}

pub async fn is_admin(db: &Database, group_id: &str, user_id: &str) -> ChatResult<bool> {
    Ok(member_role(db, group_id, user_id).await? == Some(GroupRole::Admin))
}

pub async fn member_ids(db: &Database, group_id: &str) -> ChatResult<Vec<UserId>> {
    let rows = sqlx::query("SELECT user_id FROM group_members WHERE group_id = ? ORDER BY joined_at, user_id")
        .bind(group_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("user_id")).collect())
}

pub async fn touch_activity(db: &Database, group_id: &str) -> ChatResult<()> {
    sqlx::query("UPDATE groups SET last_activity = ? WHERE id = ?")
        .bind(now_millis())
        .bind(group_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

fn random_invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}

/// Assigns a fresh invite code, retrying on the rare unique-index collision.
pub async fn generate_invite_code(db: &Database, group_id: &str) -> ChatResult<String> {
    for _ in 0..5 {
        let code = random_invite_code();
        let res = sqlx::query("UPDATE groups SET invite_code = ? WHERE id = ?")
            .bind(&code)
            .bind(group_id)
            .execute(&db.pool)
            .await;
        match res {
            Ok(r) if r.rows_affected() == 0 => return Err(ChatError::not_found("Group not found")),
            Ok(_) => return Ok(code),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(ChatError::conflict("Could not allocate an invite code"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::users;

    async fn setup() -> (Database, UserId, UserId) {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let owner = users::create_user(&db, "owner", "Owner", None).await.unwrap();
        let other = users::create_user(&db, "member", "Member", None).await.unwrap();
        (db, owner, other)
    }

    #[tokio::test]
    async fn creator_becomes_admin() {
        let (db, owner, other) = setup().await;
        let group = create_group(&db, &owner, "  Rustaceans ", "").await.unwrap();

        assert_eq!(group.name, "Rustaceans");
        assert!(group.settings.allow_member_invites);
        assert!(is_admin(&db, &group.id, &owner).await.unwrap());
        assert!(!is_member(&db, &group.id, &other).await.unwrap());
    }

    #[tokio::test]
    async fn membership_changes() {
        let (db, owner, other) = setup().await;
        let group = create_group(&db, &owner, "crew", "weekend plans").await.unwrap();

        assert!(add_member(&db, &group.id, &other, GroupRole::Member).await.unwrap());
        assert!(!add_member(&db, &group.id, &other, GroupRole::Member).await.unwrap());
        assert_eq!(member_ids(&db, &group.id).await.unwrap().len(), 2);
        assert!(!is_admin(&db, &group.id, &other).await.unwrap());

        assert!(promote_to_admin(&db, &group.id, &other).await.unwrap());
        assert!(is_admin(&db, &group.id, &other).await.unwrap());

        assert!(remove_member(&db, &group.id, &other).await.unwrap());
        assert!(!is_member(&db, &group.id, &other).await.unwrap());
        assert!(!promote_to_admin(&db, &group.id, &other).await.unwrap());
    }

    #[tokio::test]
    async fn invite_codes_use_the_expected_alphabet() {
        let (db, owner, _) = setup().await;
        let group = create_group(&db, &owner, "crew", "").await.unwrap();

        let code = generate_invite_code(&db, &group.id).await.unwrap();
        assert_eq!(code.len(), INVITE_CODE_LEN);
        assert!(code.bytes().all(|b| INVITE_ALPHABET.contains(&b)));
        assert_eq!(find(&db, &group.id).await.unwrap().unwrap().invite_code, Some(code));
        assert!(matches!(
            generate_invite_code(&db, "missing").await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_names_are_rejected() {
        let (db, owner, _) = setup().await;
        assert!(matches!(
            create_group(&db, &owner, "   ", "").await,
            Err(ChatError::Invalid(_))
        ));
    }
}
