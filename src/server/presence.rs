use crate::common::models::{ConnectionId, UserId};
use crate::common::protocol::ServerEvent;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Outbound queue drained by a connection's writer task.
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub sender: Outbound,
    /// Fired to force the connection closed.
    pub kick: Option<oneshot::Sender<()>>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct PresenceState {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

// Tracks live connections per user; a user is online while at least one remains
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<PresenceState>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns how many the user now has.
    pub async fn register(&self, handle: ConnectionHandle) -> usize {
        let mut state = self.inner.lock().await;
        let user_id = handle.user_id.clone();
        let conn_id = handle.id.clone();
        state.connections.insert(conn_id.clone(), handle);
        let conns = state.by_user.entry(user_id.clone()).or_default();
        conns.insert(conn_id.clone());
        let total = conns.len();
        info!("[PRESENCE] Registered connection {} for user {} (total={})", conn_id, user_id, total);
        total
    }

    /// Removes a connection. Returns its user and how many connections that user
    /// still has, or `None` if the connection was unknown.
    pub async fn unregister(&self, conn_id: &str) -> Option<(UserId, usize)> {
        let mut state = self.inner.lock().await;
        let handle = state.connections.remove(conn_id)?;
        let remaining = match state.by_user.get_mut(&handle.user_id) {
            Some(conns) => {
                conns.remove(conn_id);
                conns.len()
            }
            None => 0,
        };
        if remaining == 0 {
            state.by_user.remove(&handle.user_id);
            info!("[PRESENCE] No remaining connections for user {}", handle.user_id);
        } else {
            debug!("[PRESENCE] Unregistered {} for user {} (remaining={})", conn_id, handle.user_id, remaining);
        }
        Some((handle.user_id, remaining))
    }

    pub async fn send_to_connection(&self, conn_id: &str, event: ServerEvent) -> bool {
        let state = self.inner.lock().await;
        match state.connections.get(conn_id) {
            Some(handle) => handle.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Sends to each listed connection; returns how many accepted the event.
    pub async fn send_to_connections(&self, conn_ids: &[ConnectionId], event: &ServerEvent) -> usize {
        let state = self.inner.lock().await;
        conn_ids
            .iter()
            .filter_map(|id| state.connections.get(id))
            .filter(|handle| handle.sender.send(event.clone()).is_ok())
            .count()
    }

    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        let conns = self.connections_of(user_id).await;
        self.send_to_connections(&conns, event).await
    }

    /// Sends to every connection except `except`.
    pub async fn broadcast(&self, event: &ServerEvent, except: Option<&str>) -> usize {
        let state = self.inner.lock().await;
        state
            .connections
            .values()
            .filter(|handle| Some(handle.id.as_str()) != except)
            .filter(|handle| handle.sender.send(event.clone()).is_ok())
            .count()
    }

    pub async fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        let state = self.inner.lock().await;
        state
            .by_user
            .get(user_id)
            .map(|conns| conns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let state = self.inner.lock().await;
        state.by_user.get(user_id).map_or(false, |conns| !conns.is_empty())
    }

    pub async fn user_of(&self, conn_id: &str) -> Option<UserId> {
        let state = self.inner.lock().await;
        state.connections.get(conn_id).map(|h| h.user_id.clone())
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn online_user_count(&self) -> usize {
        self.inner.lock().await.by_user.len()
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.inner.lock().await.by_user.keys().cloned().collect()
    }

    /// Signals every connection of the user to close. The connections unregister
    /// themselves as they shut down.
    pub async fn kick_all(&self, user_id: &str) -> usize {
        let mut state = self.inner.lock().await;
        let conn_ids: Vec<ConnectionId> = state
            .by_user
            .get(user_id)
            .map(|conns| conns.iter().cloned().collect())
            .unwrap_or_default();
        let mut kicked = 0;
        for id in &conn_ids {
            if let Some(kick) = state.connections.get_mut(id).and_then(|h| h.kick.take()) {
                let _ = kick.send(());
                kicked += 1;
            }
        }
        if kicked > 0 {
            info!("[PRESENCE] Kicking {} connections for user {}", kicked, user_id);
        }
        kicked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str, user: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (kick_tx, kick_rx) = oneshot::channel();
        let handle = ConnectionHandle {
            id: id.to_string(),
            user_id: user.to_string(),
            sender: tx,
            kick: Some(kick_tx),
            connected_at: Utc::now(),
        };
        (handle, rx, kick_rx)
    }

    #[tokio::test]
    async fn user_stays_online_until_last_connection_leaves() {
        let presence = PresenceRegistry::new();
        let (h1, _rx1, _k1) = handle("c1", "alice");
        let (h2, _rx2, _k2) = handle("c2", "alice");
        assert_eq!(presence.register(h1).await, 1);
        assert_eq!(presence.register(h2).await, 2);
        assert_eq!(presence.online_user_count().await, 1);

        assert_eq!(presence.unregister("c1").await, Some(("alice".to_string(), 1)));
        assert!(presence.is_online("alice").await);
        assert_eq!(presence.unregister("c2").await, Some(("alice".to_string(), 0)));
        assert!(!presence.is_online("alice").await);
        assert_eq!(presence.unregister("c2").await, None);
    }

    #[tokio::test]
    async fn broadcast_skips_the_excluded_connection() {
        let presence = PresenceRegistry::new();
        let (h1, mut rx1, _k1) = handle("c1", "alice");
        let (h2, mut rx2, _k2) = handle("c2", "bob");
        presence.register(h1).await;
        presence.register(h2).await;

        assert_eq!(presence.broadcast(&ServerEvent::Pong, Some("c1")).await, 1);
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(ServerEvent::Pong)));

        assert_eq!(presence.send_to_user("alice", &ServerEvent::Pong).await, 1);
        assert!(matches!(rx1.try_recv(), Ok(ServerEvent::Pong)));
    }

    #[tokio::test]
    async fn kick_all_fires_each_signal_once() {
        let presence = PresenceRegistry::new();
        let (h1, _rx1, k1) = handle("c1", "alice");
        let (h2, _rx2, k2) = handle("c2", "alice");
        presence.register(h1).await;
        presence.register(h2).await;

        assert_eq!(presence.kick_all("alice").await, 2);
        assert!(k1.await.is_ok());
        assert!(k2.await.is_ok());
        assert_eq!(presence.kick_all("alice").await, 0);
        assert_eq!(presence.user_of("c1").await.as_deref(), Some("alice"));
    }
}
