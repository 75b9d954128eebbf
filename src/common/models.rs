use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = String;
pub type ConnectionId = String;

/// Enums stored as lowercase text in SQLite and sent as the same text on the wire.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(ChatType {
    Global => "global",
    Private => "private",
    Group => "group",
});

wire_enum!(
    /// Content kind of a message; `text` unless the client says otherwise.
    MessageKind {
        Text => "text",
        Image => "image",
        File => "file",
        Emoji => "emoji",
    }
);

wire_enum!(MessageStatus {
    Sending => "sending",
    Sent => "sent",
    Delivered => "delivered",
    Seen => "seen",
});

wire_enum!(
    /// Per-recipient delivery state. Only ever moves forward.
    DeliveryState {
        Sent => "sent",
        Delivered => "delivered",
        Seen => "seen",
    }
);

wire_enum!(UserStatus {
    Online => "online",
    Offline => "offline",
    Away => "away",
    Busy => "busy",
});

wire_enum!(GroupRole {
    Member => "member",
    Admin => "admin",
});

wire_enum!(CallType {
    Voice => "voice",
    Video => "video",
});

wire_enum!(CallStatus {
    Ringing => "ringing",
    Active => "active",
    Rejected => "rejected",
    Ended => "ended",
    Missed => "missed",
});

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

impl DeliveryState {
    fn rank(&self) -> u8 {
        match self {
            DeliveryState::Sent => 0,
            DeliveryState::Delivered => 1,
            DeliveryState::Seen => 2,
        }
    }

    pub fn is_behind(&self, other: DeliveryState) -> bool {
        self.rank() < other.rank()
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Who sent something, as attached to messages and notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub bio: String,
    pub status: UserStatus,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

impl PublicProfile {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

/// Reference to an already uploaded file; the bytes live elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub filename: Option<String>,
    pub size: Option<i64>,
    pub mime_type: Option<String>,
}

/// Snapshot of the message being replied to, taken when the reply is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySnapshot {
    pub message: String,
    pub content: Option<String>,
    pub sender: Option<UserSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEntry {
    pub user: UserId,
    pub status: DeliveryState,
    pub delivered_at: Option<DateTime<Utc>>,
    pub seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// A stored message with its sender and receipts populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender: UserSummary,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub chat_type: ChatType,
    pub recipients: Vec<UserId>,
    pub private_chat_with: Option<UserId>,
    pub group_id: Option<String>,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<ReplySnapshot>,
    pub status: MessageStatus,
    pub delivery_status: Vec<DeliveryEntry>,
    pub read_by: Vec<ReadReceipt>,
    pub reactions: Vec<Reaction>,
    pub edited: bool,
    pub deleted: bool,
    pub forwarded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_recipient(&self, user_id: &str) -> bool {
        self.recipients.iter().any(|r| r == user_id)
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.iter().any(|r| r.user == user_id)
    }

    /// Delivery state for one recipient; recipients without an entry count as `sent`.
    pub fn delivery_state_for(&self, user_id: &str) -> DeliveryState {
        self.delivery_status
            .iter()
            .find(|d| d.user == user_id)
            .map(|d| d.status)
            .unwrap_or(DeliveryState::Sent)
    }
}

/// Overall status from the per-recipient entries: `seen` once every recipient has
/// seen it, `delivered` once any recipient has it, `sent` otherwise.
pub fn aggregate_status(recipient_count: usize, states: &[DeliveryState]) -> MessageStatus {
    if recipient_count == 0 {
        return MessageStatus::Sent;
    }
    let seen = states.iter().filter(|s| **s == DeliveryState::Seen).count();
    if seen >= recipient_count {
        MessageStatus::Seen
    } else if states.iter().any(|s| *s != DeliveryState::Sent) {
        MessageStatus::Delivered
    } else {
        MessageStatus::Sent
    }
}
