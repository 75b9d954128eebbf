use crate::common::models::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const GLOBAL_ROOM: &str = "global_chat";

/// Every connection of a user joins this room on connect.
pub fn user_room(user_id: &str) -> String {
    format!("user_{}", user_id)
}

/// Same name regardless of which side asks.
pub fn private_room(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("private_{}_{}", lo, hi)
}

pub fn group_room(group_id: &str) -> String {
    format!("group_{}", group_id)
}

#[derive(Default)]
struct RoomState {
    members: HashMap<String, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

impl RoomState {
    fn drop_if_empty(&mut self, room: &str) {
        if self.members.get(room).map_or(false, |set| set.is_empty()) {
            self.members.remove(room);
        }
    }
}

/// Room membership per connection. Empty rooms are dropped.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<RoomState>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the connection was already in the room.
    pub async fn join(&self, conn: &str, room: &str) -> bool {
        let mut state = self.inner.write().await;
        let added = state
            .members
            .entry(room.to_string())
            .or_default()
            .insert(conn.to_string());
        state
            .by_connection
            .entry(conn.to_string())
            .or_default()
            .insert(room.to_string());
        added
    }

    pub async fn leave(&self, conn: &str, room: &str) -> bool {
        let mut state = self.inner.write().await;
        let removed = state.members.get_mut(room).map_or(false, |set| set.remove(conn));
        state.drop_if_empty(room);
        let now_idle = state.by_connection.get_mut(conn).map_or(false, |rooms| {
            rooms.remove(room);
            rooms.is_empty()
        });
        if now_idle {
            state.by_connection.remove(conn);
        }
        removed
    }

    /// Drops the connection from every room it is in and returns those rooms.
    pub async fn leave_all(&self, conn: &str) -> Vec<String> {
        let mut state = self.inner.write().await;
        let rooms: Vec<String> = state
            .by_connection
            .remove(conn)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for room in &rooms {
            if let Some(set) = state.members.get_mut(room) {
                set.remove(conn);
            }
            state.drop_if_empty(room);
        }
        rooms
    }

    pub async fn members(&self, room: &str) -> Vec<ConnectionId> {
        let state = self.inner.read().await;
        state
            .members
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_in(&self, conn: &str, room: &str) -> bool {
        let state = self.inner.read().await;
        state.members.get(room).map_or(false, |set| set.contains(conn))
    }

    pub async fn rooms_of(&self, conn: &str) -> Vec<String> {
        let state = self.inner.read().await;
        state
            .by_connection
            .get(conn)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_room_is_symmetric() {
        assert_eq!(private_room("b", "a"), "private_a_b");
        assert_eq!(private_room("a", "b"), private_room("b", "a"));
        assert_eq!(user_room("u1"), "user_u1");
        assert_eq!(group_room("g1"), "group_g1");
    }

    #[tokio::test]
    async fn join_and_leave() {
        let rooms = RoomRegistry::new();
        assert!(rooms.join("c1", GLOBAL_ROOM).await);
        assert!(!rooms.join("c1", GLOBAL_ROOM).await);
        rooms.join("c2", GLOBAL_ROOM).await;

        let mut members = rooms.members(GLOBAL_ROOM).await;
        members.sort();
        assert_eq!(members, vec!["c1", "c2"]);
        assert!(rooms.is_in("c1", GLOBAL_ROOM).await);

        assert!(rooms.leave("c1", GLOBAL_ROOM).await);
        assert!(!rooms.leave("c1", GLOBAL_ROOM).await);
        assert!(!rooms.is_in("c1", GLOBAL_ROOM).await);
        assert_eq!(rooms.room_count().await, 1);
    }

    #[tokio::test]
    async fn leave_all_cleans_up_empty_rooms() {
        let rooms = RoomRegistry::new();
        rooms.join("c1", GLOBAL_ROOM).await;
        rooms.join("c1", &user_room("u1")).await;
        rooms.join("c2", GLOBAL_ROOM).await;

        let mut left = rooms.leave_all("c1").await;
        left.sort();
        assert_eq!(left, vec![GLOBAL_ROOM.to_string(), "user_u1".to_string()]);
        assert!(rooms.rooms_of("c1").await.is_empty());
        assert!(rooms.members("user_u1").await.is_empty());
        assert_eq!(rooms.room_count().await, 1);
    }
}
