use crate::common::models::{now_millis, CallStatus, CallType, UserId};
use crate::server::database::Database;
use crate::server::error::{ChatError, ChatResult};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Active,
}

#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub id: String,
    pub caller: UserId,
    pub callee: UserId,
    pub call_type: CallType,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    /// Distinguishes calls that reuse a client-supplied id.
    pub generation: u64,
}

impl ActiveCall {
    pub fn involves(&self, user_id: &str) -> bool {
        self.caller == user_id || self.callee == user_id
    }

    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.caller == user_id {
            Some(&self.callee)
        } else if self.callee == user_id {
            Some(&self.caller)
        } else {
            None
        }
    }

    /// Seconds since the call was answered; zero if it never was.
    pub fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        self.answered_at
            .map(|at| (now - at).num_seconds().max(0))
            .unwrap_or(0)
    }
}

pub fn generate_call_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(9)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("call_{}_{}", now_millis(), suffix)
}

/// Calls that are ringing or in progress. A user takes part in at most one.
#[derive(Clone, Default)]
pub struct CallRegistry {
    inner: Arc<Mutex<HashMap<String, ActiveCall>>>,
    generations: Arc<AtomicU64>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self, call_id: String, caller: &str, callee: &str, call_type: CallType) -> ChatResult<ActiveCall> {
        let mut calls = self.inner.lock().await;
        if calls.contains_key(&call_id) {
            return Err(ChatError::conflict("Call already exists"));
        }
        if calls.values().any(|c| c.involves(caller) || c.involves(callee)) {
            return Err(ChatError::conflict("User is busy"));
        }
        let call = ActiveCall {
            id: call_id.clone(),
            caller: caller.to_string(),
            callee: callee.to_string(),
            call_type,
            state: CallState::Ringing,
            started_at: Utc::now(),
            answered_at: None,
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
        };
        calls.insert(call_id, call.clone());
        info!("[CALLS] {} call {} ringing: {} -> {}", call_type, call.id, caller, callee);
        Ok(call)
    }

    /// Only the callee can accept, and only while the call rings.
    pub async fn accept(&self, call_id: &str, user_id: &str) -> ChatResult<ActiveCall> {
        let mut calls = self.inner.lock().await;
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| ChatError::not_found("Call not found"))?;
        if call.callee != user_id {
            return Err(ChatError::forbidden("Only the callee can answer this call"));
        }
        if call.state != CallState::Ringing {
            return Err(ChatError::invalid("Call is not ringing"));
        }
        call.state = CallState::Active;
        call.answered_at = Some(Utc::now());
        info!("[CALLS] Call {} accepted by {}", call_id, user_id);
        Ok(call.clone())
    }

    pub async fn reject(&self, call_id: &str, user_id: &str) -> ChatResult<ActiveCall> {
        let mut calls = self.inner.lock().await;
        let call = calls
            .get(call_id)
            .ok_or_else(|| ChatError::not_found("Call not found"))?;
        if call.callee != user_id {
            return Err(ChatError::forbidden("Only the callee can reject this call"));
        }
        if call.state != CallState::Ringing {
            return Err(ChatError::invalid("Call is not ringing"));
        }
        info!("[CALLS] Call {} rejected by {}", call_id, user_id);
        calls
            .remove(call_id)
            .ok_or_else(|| ChatError::not_found("Call not found"))
    }

    /// Either participant may hang up.
    pub async fn end(&self, call_id: &str, user_id: &str) -> ChatResult<ActiveCall> {
        let mut calls = self.inner.lock().await;
        let call = calls
            .get(call_id)
            .ok_or_else(|| ChatError::not_found("Call not found"))?;
        if !call.involves(user_id) {
            return Err(ChatError::forbidden("Not a participant in this call"));
        }
        info!("[CALLS] Call {} ended by {}", call_id, user_id);
        calls
            .remove(call_id)
            .ok_or_else(|| ChatError::not_found("Call not found"))
    }

    /// Removes the call if nobody answered it yet. A later call that reused the
    /// id carries another generation and is left alone.
    pub async fn expire_if_ringing(&self, call_id: &str, generation: u64) -> Option<ActiveCall> {
        let mut calls = self.inner.lock().await;
        match calls.get(call_id) {
            Some(c) if c.generation == generation && c.state == CallState::Ringing => {}
            _ => return None,
        }
        info!("[CALLS] Call {} was not answered", call_id);
        calls.remove(call_id)
    }

    /// Checks that `from` is in the call and `to` is the other side.
    pub async fn signal_peer(&self, call_id: &str, from: &str, to: &str) -> ChatResult<()> {
        let calls = self.inner.lock().await;
        let call = calls
            .get(call_id)
            .ok_or_else(|| ChatError::not_found("Call not found"))?;
        match call.peer_of(from) {
            Some(peer) if peer == to => Ok(()),
            _ => Err(ChatError::forbidden("Not a participant in this call")),
        }
    }

    /// Removes and returns every call the user is part of.
    pub async fn take_calls_of(&self, user_id: &str) -> Vec<ActiveCall> {
        let mut calls = self.inner.lock().await;
        let ids: Vec<String> = calls
            .values()
            .filter(|c| c.involves(user_id))
            .map(|c| c.id.clone())
            .collect();
        ids.iter().filter_map(|id| calls.remove(id)).collect()
    }

    pub async fn call_of(&self, user_id: &str) -> Option<ActiveCall> {
        let calls = self.inner.lock().await;
        calls.values().find(|c| c.involves(user_id)).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

// Call log persistence. A failed write must not break signaling, so errors are
// logged and dropped.

pub async fn record_started(db: &Database, call: &ActiveCall) {
    let res = sqlx::query(
        "INSERT INTO calls (id, caller_id, callee_id, call_type, status, started_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&call.id)
    .bind(&call.caller)
    .bind(&call.callee)
    .bind(call.call_type.as_str())
    .bind(CallStatus::Ringing.as_str())
    .bind(call.started_at.timestamp_millis())
    .execute(&db.pool)
    .await;
    if let Err(e) = res {
        warn!("[CALLS] Failed to record call {}: {}", call.id, e);
    }
}

pub async fn record_answered(db: &Database, call: &ActiveCall) {
    let answered_at = call.answered_at.map(|t| t.timestamp_millis()).unwrap_or_else(now_millis);
    let res = sqlx::query("UPDATE calls SET status = ?, answered_at = ? WHERE id = ? AND started_at = ?")
        .bind(CallStatus::Active.as_str())
        .bind(answered_at)
        .bind(&call.id)
        .bind(call.started_at.timestamp_millis())
        .execute(&db.pool)
        .await;
    if let Err(e) = res {
        warn!("[CALLS] Failed to update call {}: {}", call.id, e);
    }
}

pub async fn record_finished(
    db: &Database,
    call: &ActiveCall,
    status: CallStatus,
    ended_by: Option<&str>,
    ended_at: DateTime<Utc>,
) {
    let res = sqlx::query(
        "UPDATE calls SET status = ?, ended_at = ?, duration_secs = ?, ended_by = ? WHERE id = ? AND started_at = ?",
    )
        .bind(status.as_str())
        .bind(ended_at.timestamp_millis())
        .bind(call.duration_secs(ended_at))
        .bind(ended_by)
        .bind(&call.id)
        .bind(call.started_at.timestamp_millis())
        .execute(&db.pool)
        .await;
    if let Err(e) = res {
        warn!("[CALLS] Failed to close call {}: {}", call.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn a_user_can_only_be_in_one_call() {
        let calls = CallRegistry::new();
        calls.begin("c1".into(), "alice", "bob", CallType::Voice).await.unwrap();

        let busy = calls.begin("c2".into(), "carol", "bob", CallType::Video).await;
        assert!(matches!(busy, Err(ChatError::Conflict(ref m)) if m == "User is busy"));
        let dup = calls.begin("c1".into(), "dave", "erin", CallType::Video).await;
        assert!(matches!(dup, Err(ChatError::Conflict(ref m)) if m == "Call already exists"));
        assert_eq!(calls.active_count().await, 1);
    }

    #[tokio::test]
    async fn only_the_callee_answers_a_ringing_call() {
        let calls = CallRegistry::new();
        calls.begin("c1".into(), "alice", "bob", CallType::Video).await.unwrap();

        assert!(matches!(calls.accept("c1", "alice").await, Err(ChatError::Forbidden(_))));
        let call = calls.accept("c1", "bob").await.unwrap();
        assert_eq!(call.state, CallState::Active);
        assert!(matches!(calls.accept("c1", "bob").await, Err(ChatError::Invalid(_))));
        assert!(matches!(calls.reject("c1", "bob").await, Err(ChatError::Invalid(_))));
        assert!(calls.expire_if_ringing("c1", call.generation).await.is_none());
        assert!(matches!(calls.accept("nope", "bob").await, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn signals_only_flow_between_participants() {
        let calls = CallRegistry::new();
        calls.begin("c1".into(), "alice", "bob", CallType::Voice).await.unwrap();

        assert!(calls.signal_peer("c1", "alice", "bob").await.is_ok());
        assert!(calls.signal_peer("c1", "bob", "alice").await.is_ok());
        assert!(calls.signal_peer("c1", "alice", "carol").await.is_err());
        assert!(calls.signal_peer("c1", "carol", "bob").await.is_err());
        assert!(matches!(calls.signal_peer("c9", "alice", "bob").await, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn ending_and_disconnect_cleanup() {
        let calls = CallRegistry::new();
        calls.begin("c1".into(), "alice", "bob", CallType::Voice).await.unwrap();
        assert!(matches!(calls.end("c1", "carol").await, Err(ChatError::Forbidden(_))));
        assert_eq!(calls.end("c1", "bob").await.unwrap().caller, "alice");

        calls.begin("c2".into(), "alice", "bob", CallType::Voice).await.unwrap();
        assert_eq!(calls.call_of("bob").await.map(|c| c.id), Some("c2".to_string()));
        assert_eq!(calls.take_calls_of("bob").await.len(), 1);
        assert_eq!(calls.active_count().await, 0);
    }

    #[tokio::test]
    async fn expiry_ignores_a_call_that_reused_the_id() {
        let calls = CallRegistry::new();
        let first = calls.begin("x".into(), "alice", "bob", CallType::Voice).await.unwrap();
        calls.end("x", "alice").await.unwrap();
        let second = calls.begin("x".into(), "alice", "bob", CallType::Voice).await.unwrap();
        assert_ne!(first.generation, second.generation);

        assert!(calls.expire_if_ringing("x", first.generation).await.is_none());
        assert_eq!(calls.active_count().await, 1);
        assert_eq!(calls.expire_if_ringing("x", second.generation).await.map(|c| c.generation), Some(second.generation));
        assert_eq!(calls.active_count().await, 0);
    }

    #[test]
    fn generated_ids_have_the_call_prefix() {
        let id = generate_call_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "call");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[tokio::test]
    async fn call_log_tracks_the_lifecycle() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let calls = CallRegistry::new();
        let call = calls.begin("c1".into(), "alice", "bob", CallType::Video).await.unwrap();
        record_started(&db, &call).await;
        let call = calls.accept("c1", "bob").await.unwrap();
        record_answered(&db, &call).await;
        let call = calls.end("c1", "alice").await.unwrap();
        record_finished(&db, &call, CallStatus::Ended, Some("alice"), Utc::now()).await;

        let row = sqlx::query("SELECT status, ended_by, answered_at FROM calls WHERE id = 'c1'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("status"), "ended");
        assert_eq!(row.get::<Option<String>, _>("ended_by").as_deref(), Some("alice"));
        assert!(row.get::<Option<i64>, _>("answered_at").is_some());
    }

    #[tokio::test]
    async fn reused_ids_get_their_own_log_rows() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let calls = CallRegistry::new();

        let first = calls.begin("x".into(), "alice", "bob", CallType::Voice).await.unwrap();
        record_started(&db, &first).await;
        let first = calls.end("x", "alice").await.unwrap();
        record_finished(&db, &first, CallStatus::Missed, Some("alice"), Utc::now()).await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = calls.begin("x".into(), "bob", "alice", CallType::Video).await.unwrap();
        record_started(&db, &second).await;

        let rows = sqlx::query("SELECT caller_id, status FROM calls WHERE id = 'x' ORDER BY started_at")
            .fetch_all(&db.pool)
            .await
            .unwrap();
        let logged: Vec<(String, String)> = rows
            .iter()
            .map(|r| (r.get("caller_id"), r.get("status")))
            .collect();
        assert_eq!(
            logged,
            vec![
                ("alice".to_string(), "missed".to_string()),
                ("bob".to_string(), "ringing".to_string())
            ]
        );
    }
}
