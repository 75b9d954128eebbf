use crate::common::protocol::ServerEvent;
use crate::server::hub::ChatHub;
use futures_util::StreamExt;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

pub const EVENTS_CHANNEL: &str = "securechat:events";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum EnvelopeTarget {
    Room(String),
    Everyone,
}

/// An emit made on one instance, replayed to local connections on the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: String,
    pub target: EnvelopeTarget,
    pub event: ServerEvent,
}

/// Parses a payload from the channel, dropping envelopes this instance sent.
pub fn decode_envelope(own_instance: &str, payload: &str) -> Option<Envelope> {
    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) if envelope.origin == own_instance => None,
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("[REDIS] Dropping malformed envelope: {}", e);
            None
        }
    }
}

/// Pub/sub link between server instances sharing one Redis.
pub struct RedisBridge {
    instance_id: String,
    redis_url: String,
    publisher: Arc<Mutex<ConnectionManager>>,
}

impl RedisBridge {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client).await?;
        let instance_id = uuid::Uuid::new_v4().to_string();
        info!("[REDIS] Bridge {} connected to {}", instance_id, redis_url);
        Ok(Self {
            instance_id,
            redis_url: redis_url.to_string(),
            publisher: Arc::new(Mutex::new(publisher)),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn publish(&self, target: EnvelopeTarget, event: &ServerEvent) -> anyhow::Result<()> {
        let envelope = Envelope {
            origin: self.instance_id.clone(),
            target,
            event: event.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.publisher.lock().await;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(EVENTS_CHANNEL)
            .arg(payload)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// Listens on the events channel until the hub is dropped, reconnecting after
    /// failures.
    pub fn spawn_subscriber(self: &Arc<Self>, hub: Weak<ChatHub>) {
        let bridge = self.clone();
        tokio::spawn(async move {
            info!("[REDIS] Starting subscriber on '{}'", EVENTS_CHANNEL);
            loop {
                if hub.strong_count() == 0 {
                    break;
                }
                match bridge.listen(&hub).await {
                    Ok(()) => info!("[REDIS] Subscriber stream ended"),
                    Err(e) => warn!("[REDIS] Subscriber error: {}", e),
                }
                info!("[REDIS] Subscriber disconnected, retrying in {}s", RECONNECT_DELAY.as_secs());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
    }

    async fn listen(&self, hub: &Weak<ChatHub>) -> anyhow::Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(EVENTS_CHANNEL).await?;
        info!("[REDIS] Subscribed to {}", EVENTS_CHANNEL);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!("[REDIS] Unreadable payload: {}", e);
                    continue;
                }
            };
            let Some(envelope) = decode_envelope(&self.instance_id, &payload) else { continue };
            let Some(hub) = hub.upgrade() else { return Ok(()) };
            debug!("[REDIS] Delivering envelope from {} to {:?}", envelope.origin, envelope.target);
            hub.deliver_remote(envelope).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelopes_carry_target_and_event() {
        let envelope = Envelope {
            origin: "node-a".into(),
            target: EnvelopeTarget::Room("group_g1".into()),
            event: ServerEvent::Pong,
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["target"], json!({"kind": "room", "name": "group_g1"}));
        assert_eq!(wire["event"]["event"], "pong");

        let everyone: EnvelopeTarget = serde_json::from_value(json!({"kind": "everyone"})).unwrap();
        assert_eq!(everyone, EnvelopeTarget::Everyone);
    }

    #[test]
    fn own_and_malformed_envelopes_are_dropped() {
        let payload = json!({
            "origin": "node-a",
            "target": {"kind": "everyone"},
            "event": {"event": "user_offline", "data": {"userId": "u1"}}
        })
        .to_string();

        assert!(decode_envelope("node-a", &payload).is_none());
        let remote = decode_envelope("node-b", &payload).unwrap();
        assert!(matches!(remote.event, ServerEvent::UserOffline(ref u) if u.user_id == "u1"));
        assert!(decode_envelope("node-b", "not json").is_none());
    }
}
