// Dumps the chat database, or seeds a user with a session token for chat_probe.
//
// usage: db_inspect                 summary of users, groups, messages and calls
//        db_inspect seed <username> create the user if needed and print a token
use securechat::server::config::ServerConfig;
use securechat::server::database::Database;
use securechat::server::{auth, users};
use sqlx::Row;
use std::time::Duration;

async fn seed(db: &Database, username: &str) -> anyhow::Result<()> {
    let existing = sqlx::query("SELECT id FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(&db.pool)
        .await?;
    let user_id = match existing {
        Some(row) => row.try_get::<String, _>("id")?,
        None => users::create_user(db, username, username, None).await?,
    };
    let token = auth::create_session(db, &user_id, Duration::from_secs(24 * 3600)).await?;
    println!("user_id={}", user_id);
    println!("token={}", token);
    Ok(())
}

async fn summary(db: &Database) -> anyhow::Result<()> {
    println!("\n-- users --");
    let rows = sqlx::query("SELECT id, username, status, is_online, last_seen FROM users ORDER BY username")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let username: String = r.try_get("username").unwrap_or_default();
        let status: String = r.try_get("status").unwrap_or_default();
        let is_online: bool = r.try_get("is_online").unwrap_or(false);
        let last_seen: i64 = r.try_get("last_seen").unwrap_or(0);
        println!("id={} username={} status={} online={} last_seen={}", id, username, status, is_online, last_seen);
    }

    println!("\n-- groups --");
    let rows = sqlx::query(
        "SELECT g.id, g.name, g.created_by, COUNT(m.user_id) AS members FROM groups g \
         LEFT JOIN group_members m ON m.group_id = g.id GROUP BY g.id ORDER BY g.created_at",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let name: String = r.try_get("name").unwrap_or_default();
        let created_by: String = r.try_get("created_by").unwrap_or_default();
        let members: i64 = r.try_get("members").unwrap_or(0);
        println!("id={} name={} created_by={} members={}", id, name, created_by, members);
    }

    println!("\n-- messages (last 10) --");
    let rows = sqlx::query(
        "SELECT id, sender_id, chat_type, status, content, created_at FROM messages ORDER BY created_at DESC LIMIT 10",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let sender_id: String = r.try_get("sender_id").unwrap_or_default();
        let chat_type: String = r.try_get("chat_type").unwrap_or_default();
        let status: String = r.try_get("status").unwrap_or_default();
        let content: Option<String> = r.try_get("content").unwrap_or(None);
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        println!(
            "id={} sender={} chat={} status={} content_len={} created_at={}",
            id,
            sender_id,
            chat_type,
            status,
            content.map(|c| c.chars().count()).unwrap_or(0),
            created_at
        );
    }

    println!("\n-- calls (last 10) --");
    let rows = sqlx::query(
        "SELECT id, caller_id, callee_id, call_type, status, duration_secs FROM calls ORDER BY started_at DESC LIMIT 10",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let caller: String = r.try_get("caller_id").unwrap_or_default();
        let callee: String = r.try_get("callee_id").unwrap_or_default();
        let call_type: String = r.try_get("call_type").unwrap_or_default();
        let status: String = r.try_get("status").unwrap_or_default();
        let duration: i64 = r.try_get("duration_secs").unwrap_or(0);
        println!("id={} {} -> {} type={} status={} duration={}s", id, caller, callee, call_type, status, duration);
    }

    println!("\nonline users: {}", users::count_online(db).await?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    println!("Connecting to {}", config.database_url);
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] => summary(&db).await,
        ["seed", username] => seed(&db, username).await,
        _ => {
            eprintln!("usage: db_inspect [seed <username>]");
            std::process::exit(2);
        }
    }
}
