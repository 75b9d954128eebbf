use crate::common::models::{
    aggregate_status, from_millis, now_millis, Attachment, ChatMessage, ChatType, DeliveryEntry,
    DeliveryState, MessageKind, MessageStatus, Reaction, ReadReceipt, ReplySnapshot, UserId, UserSummary,
};
use crate::server::database::Database;
use crate::server::error::{ChatError, ChatResult};
use chrono::{DateTime, Utc};
use log::debug;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const MESSAGE_SELECT: &str = r#"
    SELECT m.*,
           s.username AS s_username, s.display_name AS s_display_name, s.avatar AS s_avatar,
           r.username AS r_username, r.display_name AS r_display_name, r.avatar AS r_avatar
    FROM messages m
    LEFT JOIN users s ON s.id = m.sender_id
    LEFT JOIN users r ON r.id = m.reply_to_sender
"#;

/// Reply target captured at send time.
#[derive(Debug, Clone)]
pub struct ReplyRef {
    pub message_id: String,
    pub content: Option<String>,
    pub sender_id: UserId,
}

/// A validated message ready to be stored.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub chat_type: ChatType,
    pub recipients: Vec<UserId>,
    pub private_chat_with: Option<UserId>,
    pub group_id: Option<String>,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<ReplyRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    Added,
    Updated,
}

pub async fn save(db: &Database, message: NewMessage) -> ChatResult<ChatMessage> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();
    let attachment = message.attachment.as_ref();
    let reply = message.reply_to.as_ref();

    let mut tx = db.pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO messages (
            id, sender_id, content, kind, chat_type, private_chat_with, group_id, status,
            attachment_url, attachment_filename, attachment_size, attachment_mime_type,
            reply_to_message, reply_to_content, reply_to_sender, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&message.sender_id)
    .bind(&message.content)
    .bind(message.kind.as_str())
    .bind(message.chat_type.as_str())
    .bind(&message.private_chat_with)
    .bind(&message.group_id)
    .bind(MessageStatus::Sent.as_str())
    .bind(attachment.map(|a| a.url.clone()))
    .bind(attachment.and_then(|a| a.filename.clone()))
    .bind(attachment.and_then(|a| a.size))
    .bind(attachment.and_then(|a| a.mime_type.clone()))
    .bind(reply.map(|r| r.message_id.clone()))
    .bind(reply.and_then(|r| r.content.clone()))
    .bind(reply.map(|r| r.sender_id.clone()))
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for recipient in &message.recipients {
        sqlx::query("INSERT OR IGNORE INTO message_recipients (message_id, user_id) VALUES (?, ?)")
            .bind(&id)
            .bind(recipient)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO message_delivery (message_id, user_id, status) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(recipient)
            .bind(DeliveryState::Sent.as_str())
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    debug!(
        "[MSG] Stored {} message {} from {} for {} recipients",
        message.chat_type,
        id,
        message.sender_id,
        message.recipients.len()
    );
    find(db, &id)
        .await?
        .ok_or_else(|| ChatError::not_found("Message not found"))
}

/// Loads a message with sender, reply snapshot and receipts populated.
pub async fn find(db: &Database, message_id: &str) -> ChatResult<Option<ChatMessage>> {
    let row = sqlx::query(&format!("{} WHERE m.id = ?", MESSAGE_SELECT))
        .bind(message_id)
        .fetch_optional(&db.pool)
        .await?;
    match row {
        Some(row) => Ok(Some(hydrate(db, &row).await?)),
        None => Ok(None),
    }
}

pub async fn recent_global(db: &Database, limit: i64) -> ChatResult<Vec<ChatMessage>> {
    let rows = sqlx::query(&format!(
        "{} WHERE m.chat_type = 'global' AND m.deleted = 0 ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?",
        MESSAGE_SELECT
    ))
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    hydrate_oldest_first(db, rows).await
}

/// Conversation between two users, in either direction.
pub async fn recent_private(db: &Database, a: &str, b: &str, limit: i64) -> ChatResult<Vec<ChatMessage>> {
    let rows = sqlx::query(&format!(
        r#"{} WHERE m.chat_type = 'private' AND m.deleted = 0
              AND ((m.sender_id = ? AND m.private_chat_with = ?) OR (m.sender_id = ? AND m.private_chat_with = ?))
           ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?"#,
        MESSAGE_SELECT
    ))
    .bind(a)
    .bind(b)
    .bind(b)
    .bind(a)
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    hydrate_oldest_first(db, rows).await
}

pub async fn recent_group(db: &Database, group_id: &str, limit: i64) -> ChatResult<Vec<ChatMessage>> {
    let rows = sqlx::query(&format!(
        "{} WHERE m.chat_type = 'group' AND m.group_id = ? AND m.deleted = 0 ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?",
        MESSAGE_SELECT
    ))
    .bind(group_id)
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    hydrate_oldest_first(db, rows).await
}

pub async fn total_count(db: &Database) -> ChatResult<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE deleted = 0")
        .fetch_one(&db.pool)
        .await?;
    Ok(count)
}

async fn is_recipient(db: &Database, message_id: &str, user_id: &str) -> ChatResult<bool> {
    let found = sqlx::query("SELECT 1 FROM message_recipients WHERE message_id = ? AND user_id = ?")
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(found.is_some())
}

/// Moves a recipient's entry from `sent` to `delivered`. Returns `false` when the
/// entry was already delivered or seen.
pub async fn mark_delivered(db: &Database, message_id: &str, user_id: &str) -> ChatResult<bool> {
    let res = sqlx::query(
        r#"
        INSERT INTO message_delivery (message_id, user_id, status, delivered_at) VALUES (?, ?, 'delivered', ?)
        ON CONFLICT (message_id, user_id) DO UPDATE
            SET status = 'delivered', delivered_at = excluded.delivered_at
            WHERE message_delivery.status = 'sent'
        "#,
    )
    .bind(message_id)
    .bind(user_id)
    .bind(now_millis())
    .execute(&db.pool)
    .await?;
    if res.rows_affected() == 0 {
        return Ok(false);
    }
    refresh_status(db, message_id).await?;
    Ok(true)
}

/// Records a read receipt. Returns the read time when this is the user's first
/// read of the message, `None` when it was already read.
pub async fn mark_read(db: &Database, message_id: &str, user_id: &str) -> ChatResult<Option<DateTime<Utc>>> {
    let now = now_millis();
    let res = sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)")
        .bind(message_id)
        .bind(user_id)
        .bind(now)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Ok(None);
    }

    if is_recipient(db, message_id, user_id).await? {
        sqlx::query(
            r#"
            INSERT INTO message_delivery (message_id, user_id, status, delivered_at, seen_at) VALUES (?, ?, 'seen', ?, ?)
            ON CONFLICT (message_id, user_id) DO UPDATE
                SET status = 'seen',
                    seen_at = excluded.seen_at,
                    delivered_at = COALESCE(message_delivery.delivered_at, excluded.delivered_at)
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&db.pool)
        .await?;
        refresh_status(db, message_id).await?;
    }
    Ok(Some(from_millis(now)))
}

async fn refresh_status(db: &Database, message_id: &str) -> ChatResult<MessageStatus> {
    let recipient_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_recipients WHERE message_id = ?")
        .bind(message_id)
        .fetch_one(&db.pool)
        .await?;
    let rows = sqlx::query(
        r#"
        SELECT d.status FROM message_delivery d
        JOIN message_recipients r ON r.message_id = d.message_id AND r.user_id = d.user_id
        WHERE d.message_id = ?
        "#,
    )
    .bind(message_id)
    .fetch_all(&db.pool)
    .await?;
    let states: Vec<DeliveryState> = rows
        .iter()
        .filter_map(|r| DeliveryState::parse(&r.get::<String, _>("status")))
        .collect();

    let status = aggregate_status(recipient_count as usize, &states);
    sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(message_id)
        .execute(&db.pool)
        .await?;
    Ok(status)
}

/// Sets the user's reaction, replacing any previous one.
pub async fn add_reaction(db: &Database, message_id: &str, user_id: &str, emoji: &str) -> ChatResult<ReactionChange> {
    let existing = sqlx::query("SELECT emoji FROM message_reactions WHERE message_id = ? AND user_id = ?")
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)
        ON CONFLICT (message_id, user_id) DO UPDATE SET emoji = excluded.emoji, created_at = excluded.created_at
        "#,
    )
    .bind(message_id)
    .bind(user_id)
    .bind(emoji)
    .bind(now_millis())
    .execute(&db.pool)
    .await?;
    Ok(if existing.is_some() { ReactionChange::Updated } else { ReactionChange::Added })
}

/// Removes the user's reaction. With `Some(emoji)` only that emoji is removed.
pub async fn remove_reaction(db: &Database, message_id: &str, user_id: &str, emoji: Option<&str>) -> ChatResult<bool> {
    let res = sqlx::query(
        "DELETE FROM message_reactions WHERE message_id = ? AND user_id = ? AND (? IS NULL OR emoji = ?)",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(emoji)
    .bind(emoji)
    .execute(&db.pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn reactions(db: &Database, message_id: &str) -> ChatResult<Vec<Reaction>> {
    let rows = sqlx::query(
        "SELECT user_id, emoji, created_at FROM message_reactions WHERE message_id = ? ORDER BY created_at, user_id",
    )
    .bind(message_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| Reaction {
            user: r.get("user_id"),
            emoji: r.get("emoji"),
            created_at: from_millis(r.get("created_at")),
        })
        .collect())
}

async fn hydrate_oldest_first(db: &Database, rows: Vec<SqliteRow>) -> ChatResult<Vec<ChatMessage>> {
    let mut messages = Vec::with_capacity(rows.len());
    for row in rows.iter().rev() {
        messages.push(hydrate(db, row).await?);
    }
    Ok(messages)
}

fn summary_from(row: &SqliteRow, id: UserId, prefix: &str) -> Option<UserSummary> {
    let username: Option<String> = row.get(format!("{}_username", prefix).as_str());
    let display_name: Option<String> = row.get(format!("{}_display_name", prefix).as_str());
    Some(UserSummary {
        id,
        username: username?,
        display_name: display_name?,
        avatar: row.get(format!("{}_avatar", prefix).as_str()),
    })
}

async fn hydrate(db: &Database, row: &SqliteRow) -> ChatResult<ChatMessage> {
    let id: String = row.get("id");
    let sender_id: String = row.get("sender_id");
    let sender = summary_from(row, sender_id.clone(), "s").unwrap_or(UserSummary {
        id: sender_id,
        username: "deleted".to_string(),
        display_name: "Deleted user".to_string(),
        avatar: None,
    });

    let attachment = row.get::<Option<String>, _>("attachment_url").map(|url| Attachment {
        url,
        filename: row.get("attachment_filename"),
        size: row.get("attachment_size"),
        mime_type: row.get("attachment_mime_type"),
    });
    let reply_to = row.get::<Option<String>, _>("reply_to_message").map(|message| ReplySnapshot {
        message,
        content: row.get("reply_to_content"),
        sender: row
            .get::<Option<String>, _>("reply_to_sender")
            .and_then(|sid| summary_from(row, sid, "r")),
    });

    let recipients = sqlx::query("SELECT user_id FROM message_recipients WHERE message_id = ? ORDER BY rowid")
        .bind(&id)
        .fetch_all(&db.pool)
        .await?
        .iter()
        .map(|r| r.get::<String, _>("user_id"))
        .collect();

    let delivery_status = sqlx::query(
        "SELECT user_id, status, delivered_at, seen_at FROM message_delivery WHERE message_id = ? ORDER BY rowid",
    )
    .bind(&id)
    .fetch_all(&db.pool)
    .await?
    .iter()
    .map(|r| DeliveryEntry {
        user: r.get("user_id"),
        status: DeliveryState::parse(&r.get::<String, _>("status")).unwrap_or(DeliveryState::Sent),
        delivered_at: r.get::<Option<i64>, _>("delivered_at").map(from_millis),
        seen_at: r.get::<Option<i64>, _>("seen_at").map(from_millis),
    })
    .collect();

    let read_by = sqlx::query("SELECT user_id, read_at FROM message_reads WHERE message_id = ? ORDER BY read_at, rowid")
        .bind(&id)
        .fetch_all(&db.pool)
        .await?
        .iter()
        .map(|r| ReadReceipt {
            user: r.get("user_id"),
            read_at: from_millis(r.get("read_at")),
        })
        .collect();

    let reactions = reactions(db, &id).await?;

    Ok(ChatMessage {
        sender,
        content: row.get("content"),
        kind: MessageKind::parse(&row.get::<String, _>("kind")).unwrap_or_default(),
        chat_type: ChatType::parse(&row.get::<String, _>("chat_type")).unwrap_or(ChatType::Global),
        recipients,
        private_chat_with: row.get("private_chat_with"),
        group_id: row.get("group_id"),
        attachment,
        reply_to,
        status: MessageStatus::parse(&row.get::<String, _>("status")).unwrap_or(MessageStatus::Sent),
        delivery_status,
        read_by,
        reactions,
        edited: row.get::<i64, _>("edited") != 0,
        deleted: row.get::<i64, _>("deleted") != 0,
        forwarded: row.get::<i64, _>("forwarded") != 0,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::users;

    async fn setup() -> (Database, UserId, UserId, UserId) {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let alice = users::create_user(&db, "alice", "Alice", None).await.unwrap();
        let bob = users::create_user(&db, "bob", "Bob", None).await.unwrap();
        let carol = users::create_user(&db, "carol", "Carol", None).await.unwrap();
        (db, alice, bob, carol)
    }

    fn text(sender: &str, chat_type: ChatType, recipients: Vec<UserId>, content: &str) -> NewMessage {
        NewMessage {
            sender_id: sender.to_string(),
            content: Some(content.to_string()),
            kind: MessageKind::Text,
            chat_type,
            private_chat_with: if chat_type == ChatType::Private { recipients.first().cloned() } else { None },
            recipients,
            group_id: None,
            attachment: None,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn save_populates_sender_and_initial_delivery() {
        let (db, alice, bob, _) = setup().await;
        let msg = save(&db, text(&alice, ChatType::Private, vec![bob.clone()], "hi bob")).await.unwrap();

        assert_eq!(msg.sender.username, "alice");
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.recipients, vec![bob.clone()]);
        assert_eq!(msg.delivery_state_for(&bob), DeliveryState::Sent);
        assert_eq!(msg.private_chat_with.as_deref(), Some(bob.as_str()));
    }

    #[tokio::test]
    async fn delivery_never_moves_backwards() {
        let (db, alice, bob, _) = setup().await;
        let msg = save(&db, text(&alice, ChatType::Private, vec![bob.clone()], "ping")).await.unwrap();

        assert!(mark_delivered(&db, &msg.id, &bob).await.unwrap());
        assert!(!mark_delivered(&db, &msg.id, &bob).await.unwrap());
        assert_eq!(find(&db, &msg.id).await.unwrap().unwrap().status, MessageStatus::Delivered);

        assert!(mark_read(&db, &msg.id, &bob).await.unwrap().is_some());
        assert!(!mark_delivered(&db, &msg.id, &bob).await.unwrap());
        let stored = find(&db, &msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Seen);
        assert_eq!(stored.delivery_state_for(&bob), DeliveryState::Seen);
        assert!(stored.delivery_status[0].delivered_at.is_some());
    }

    #[tokio::test]
    async fn reads_are_recorded_once() {
        let (db, alice, bob, carol) = setup().await;
        let msg = save(&db, text(&alice, ChatType::Group, vec![bob.clone(), carol.clone()], "team")).await.unwrap();

        assert!(mark_read(&db, &msg.id, &bob).await.unwrap().is_some());
        assert!(mark_read(&db, &msg.id, &bob).await.unwrap().is_none());

        let stored = find(&db, &msg.id).await.unwrap().unwrap();
        assert_eq!(stored.read_by.len(), 1);
        assert_eq!(stored.status, MessageStatus::Delivered);

        mark_read(&db, &msg.id, &carol).await.unwrap();
        assert_eq!(find(&db, &msg.id).await.unwrap().unwrap().status, MessageStatus::Seen);
    }

    #[tokio::test]
    async fn history_is_newest_window_oldest_first() {
        let (db, alice, bob, carol) = setup().await;
        for i in 0..5 {
            save(&db, text(&alice, ChatType::Global, vec![], &format!("g{}", i))).await.unwrap();
        }
        save(&db, text(&alice, ChatType::Private, vec![bob.clone()], "to bob")).await.unwrap();
        save(&db, text(&bob, ChatType::Private, vec![alice.clone()], "to alice")).await.unwrap();
        save(&db, text(&alice, ChatType::Private, vec![carol.clone()], "to carol")).await.unwrap();

        let global = recent_global(&db, 3).await.unwrap();
        let contents: Vec<_> = global.iter().map(|m| m.content.clone().unwrap()).collect();
        assert_eq!(contents, vec!["g2", "g3", "g4"]);

        let private = recent_private(&db, &bob, &alice, 50).await.unwrap();
        let contents: Vec<_> = private.iter().map(|m| m.content.clone().unwrap()).collect();
        assert_eq!(contents, vec!["to bob", "to alice"]);
        assert_eq!(total_count(&db).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn replies_snapshot_the_target() {
        let (db, alice, bob, _) = setup().await;
        let original = save(&db, text(&alice, ChatType::Global, vec![], "question?")).await.unwrap();
        let mut reply = text(&bob, ChatType::Global, vec![], "answer");
        reply.reply_to = Some(ReplyRef {
            message_id: original.id.clone(),
            content: original.content.clone(),
            sender_id: alice.clone(),
        });
        reply.attachment = Some(Attachment {
            url: "https://files.example/a.png".into(),
            filename: Some("a.png".into()),
            size: Some(42),
            mime_type: Some("image/png".into()),
        });

        let saved = save(&db, reply).await.unwrap();
        let snapshot = saved.reply_to.unwrap();
        assert_eq!(snapshot.message, original.id);
        assert_eq!(snapshot.content.as_deref(), Some("question?"));
        assert_eq!(snapshot.sender.unwrap().username, "alice");
        assert_eq!(saved.attachment.unwrap().size, Some(42));
    }

    #[tokio::test]
    async fn one_reaction_per_user() {
        let (db, alice, bob, _) = setup().await;
        let msg = save(&db, text(&alice, ChatType::Global, vec![], "react")).await.unwrap();

        assert_eq!(add_reaction(&db, &msg.id, &bob, "👍").await.unwrap(), ReactionChange::Added);
        assert_eq!(add_reaction(&db, &msg.id, &bob, "🎉").await.unwrap(), ReactionChange::Updated);
        let list = reactions(&db, &msg.id).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].emoji, "🎉");

        assert!(!remove_reaction(&db, &msg.id, &bob, Some("👍")).await.unwrap());
        assert!(remove_reaction(&db, &msg.id, &bob, None).await.unwrap());
        assert!(reactions(&db, &msg.id).await.unwrap().is_empty());
    }
}
