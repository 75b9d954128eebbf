//! Socket events exchanged with clients.
//!
//! Every frame is a JSON text message shaped `{"event": "<name>", "data": {...}}`.
//! Event names are snake_case, payload fields camelCase.

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::common::models::{
    Attachment, CallType, ChatMessage, ChatType, DeliveryState, MessageKind, PublicProfile,
    Reaction, UserId, UserStatus, UserSummary,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Must be the first frame on a new connection.
    Auth(AuthRequest),
    JoinGlobal(NoPayload),
    LeaveGlobal(NoPayload),
    JoinPrivate(PrivateTarget),
    LeavePrivate(PrivateTarget),
    JoinGroup(GroupTarget),
    LeaveGroup(GroupTarget),
    SendMessage(SendMessage),
    TypingStart(TypingTarget),
    TypingStop(TypingTarget),
    #[serde(alias = "message_read")]
    MarkMessageRead(MessageRef),
    MessageDelivered(MessageRef),
    AddReaction(ReactionRequest),
    RemoveReaction(ReactionRemoval),
    UpdateStatus(StatusUpdate),
    CallInvite(CallInvite),
    CallAccept(CallRef),
    CallReject(CallRef),
    CallEnd(CallRef),
    Offer(OfferSignal),
    Answer(AnswerSignal),
    IceCandidate(IceSignal),
    Ping(NoPayload),
}

impl ClientEvent {
    /// Message sent back when handling fails for a reason the client didn't cause.
    pub fn failure_context(&self) -> &'static str {
        match self {
            ClientEvent::Auth(_) | ClientEvent::Ping(_) => "Request failed",
            ClientEvent::JoinGlobal(_)
            | ClientEvent::LeaveGlobal(_)
            | ClientEvent::JoinPrivate(_)
            | ClientEvent::LeavePrivate(_)
            | ClientEvent::JoinGroup(_)
            | ClientEvent::LeaveGroup(_) => "Failed to join chat",
            ClientEvent::SendMessage(_) => "Failed to send message",
            ClientEvent::TypingStart(_) | ClientEvent::TypingStop(_) => "Failed to send typing indicator",
            ClientEvent::MarkMessageRead(_) | ClientEvent::MessageDelivered(_) => "Failed to update message status",
            ClientEvent::AddReaction(_) | ClientEvent::RemoveReaction(_) => "Failed to update reaction",
            ClientEvent::UpdateStatus(_) => "Failed to update status",
            ClientEvent::CallInvite(_)
            | ClientEvent::CallAccept(_)
            | ClientEvent::CallReject(_)
            | ClientEvent::CallEnd(_)
            | ClientEvent::Offer(_)
            | ClientEvent::Answer(_)
            | ClientEvent::IceCandidate(_) => "Call signaling failed",
        }
    }
}

/// Payload of events that carry no data. Accepts a missing `data` key, `null`
/// or any object, and ignores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NoPayload;

impl<'de> Deserialize<'de> for NoPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<IgnoredAny>::deserialize(deserializer).map(|_| NoPayload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateTarget {
    #[serde(default)]
    pub other_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTarget {
    #[serde(default)]
    pub group_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub content: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub chat_type: Option<String>,
    pub recipients: Option<Vec<UserId>>,
    pub group_id: Option<String>,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<ReplyRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRequest {
    pub message_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingTarget {
    pub chat_type: Option<String>,
    pub recipients: Option<Vec<UserId>>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRequest {
    pub message_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRemoval {
    pub message_id: String,
    /// `None` removes whatever the user reacted with.
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvite {
    pub call_id: Option<String>,
    pub call_type: Option<String>,
    pub to: UserId,
    pub offer: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub call_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferSignal {
    pub call_id: String,
    pub to: UserId,
    pub offer: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSignal {
    pub call_id: String,
    pub to: UserId,
    pub answer: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceSignal {
    pub call_id: String,
    pub to: UserId,
    pub candidate: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthResponse(AuthResponse),
    UserOnline(UserOnline),
    UserOffline(UserRef),
    UserStatusUpdated(UserStatusUpdated),
    GlobalMessages(Vec<ChatMessage>),
    PrivateMessages(PrivateHistory),
    GroupMessages(GroupHistory),
    MessageReceived(ChatMessage),
    MessageSent(ChatMessage),
    NewPrivateMessage(PrivateNotice),
    NewGroupMessage(GroupNotice),
    MessageDeliveryUpdate(DeliveryUpdate),
    MessageRead(ReadNotice),
    UserTyping(TypingNotice),
    UserStoppedTyping(TypingStopped),
    ReactionAdded(ReactionNotice),
    ReactionUpdated(ReactionNotice),
    ReactionRemoved(ReactionNotice),
    CallRinging(CallRinging),
    CallIncoming(CallIncoming),
    CallAccepted(CallAccepted),
    CallRejected(CallRejected),
    CallEnded(CallEnded),
    Offer(OfferRelay),
    Answer(AnswerRelay),
    IceCandidate(IceRelay),
    Pong,
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
            error: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    pub user_id: Option<UserId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOnline {
    pub user_id: UserId,
    pub user: PublicProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusUpdated {
    pub user_id: UserId,
    pub status: UserStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateHistory {
    pub other_user_id: UserId,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHistory {
    pub group_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateNotice {
    pub message: ChatMessage,
    pub sender: UserSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupNotice {
    pub message: ChatMessage,
    pub group_id: String,
    pub sender: UserSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUpdate {
    pub message_id: String,
    pub user_id: UserId,
    pub status: DeliveryState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadNotice {
    pub message_id: String,
    pub read_by: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub chat_type: ChatType,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStopped {
    pub user_id: UserId,
    pub chat_type: ChatType,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionNotice {
    pub message_id: String,
    pub user_id: UserId,
    pub emoji: Option<String>,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRinging {
    pub call_id: String,
    pub to: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIncoming {
    pub call_id: String,
    pub call_type: CallType,
    pub from: UserSummary,
    pub offer: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAccepted {
    pub call_id: String,
    pub accepted_by: UserId,
    pub call_type: CallType,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRejected {
    pub call_id: String,
    pub rejected_by: UserId,
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub call_id: String,
    pub ended_by: Option<UserId>,
    pub ended_at: DateTime<Utc>,
    pub duration: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRelay {
    pub call_id: String,
    pub from: UserId,
    pub offer: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRelay {
    pub call_id: String,
    pub from: UserId,
    pub answer: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceRelay {
    pub call_id: String,
    pub from: UserId,
    pub candidate: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_unit_and_payload_events() {
        let join: ClientEvent = serde_json::from_str(r#"{"event":"join_global"}"#).unwrap();
        assert!(matches!(join, ClientEvent::JoinGlobal(_)));

        let private: ClientEvent =
            serde_json::from_value(json!({"event": "join_private", "data": {"otherUserId": "u2"}})).unwrap();
        match private {
            ClientEvent::JoinPrivate(target) => assert_eq!(target.other_user_id, "u2"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn payloadless_events_tolerate_empty_data() {
        for frame in [
            json!({"event": "join_global", "data": {}}),
            json!({"event": "leave_global", "data": null}),
            json!({"event": "ping", "data": {"ts": 1}}),
            json!({"event": "ping"}),
        ] {
            let event: ClientEvent = serde_json::from_value(frame.clone()).unwrap_or_else(|e| panic!("{}: {}", frame, e));
            assert!(matches!(
                event,
                ClientEvent::JoinGlobal(_) | ClientEvent::LeaveGlobal(_) | ClientEvent::Ping(_)
            ));
        }
        let wire = serde_json::to_value(ClientEvent::Ping(NoPayload)).unwrap();
        assert_eq!(wire["event"], "ping");
    }

    #[test]
    fn send_message_defaults_to_text() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "send_message",
            "data": {"content": "hello", "chatType": "global"}
        }))
        .unwrap();
        match event {
            ClientEvent::SendMessage(msg) => {
                assert_eq!(msg.kind, MessageKind::Text);
                assert_eq!(msg.chat_type.as_deref(), Some("global"));
                assert!(msg.recipients.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn message_read_is_an_alias_for_mark_message_read() {
        let event: ClientEvent =
            serde_json::from_value(json!({"event": "message_read", "data": {"messageId": "m1"}})).unwrap();
        assert!(matches!(event, ClientEvent::MarkMessageRead(ref r) if r.message_id == "m1"));
    }

    #[test]
    fn signaling_payloads_pass_through_untouched() {
        let sdp = json!({"type": "offer", "sdp": "v=0\r\n"});
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "offer",
            "data": {"callId": "c1", "to": "u2", "offer": sdp.clone()}
        }))
        .unwrap();
        let ClientEvent::Offer(signal) = event else { panic!("expected offer") };
        assert_eq!(signal.offer, sdp);

        let relay = ServerEvent::Offer(OfferRelay {
            call_id: signal.call_id,
            from: "u1".into(),
            offer: signal.offer,
        });
        let wire = serde_json::to_value(&relay).unwrap();
        assert_eq!(wire["event"], "offer");
        assert_eq!(wire["data"]["from"], "u1");
        assert_eq!(wire["data"]["offer"]["sdp"], "v=0\r\n");
    }

    #[test]
    fn server_errors_use_error_event() {
        let wire = serde_json::to_value(ServerEvent::error("Chat type required")).unwrap();
        assert_eq!(wire, json!({"event": "error", "data": {"message": "Chat type required", "error": null}}));
    }

    #[test]
    fn unknown_events_are_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"drop_tables"}"#).is_err());
    }
}
