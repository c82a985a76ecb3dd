use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{CommunityId, ConversationId, MessageId, Participant, RoomRef},
    error::IngestError,
};

const CONVERSATION_ID_KEYS: &[&str] = &["conversationId", "conversation_id", "chatId", "chat_id"];
const COMMUNITY_ID_KEYS: &[&str] = &["communityId", "community_id"];
const SENDER_USERNAME_KEYS: &[&str] = &["senderId", "sender_username", "senderUsername", "sender_id"];
const SENDER_KEYS: &[&str] = &["sender", "senderProfile", "sender_profile"];
const CONTENT_KEYS: &[&str] = &["content", "text", "body"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "created_at", "createdAt", "sentAt", "sent_at"];
const EVENT_ID_KEYS: &[&str] = &["id", "messageId", "message_id", "_id"];
const USERNAME_KEYS: &[&str] = &["username", "userName", "user_name"];
const DISPLAY_NAME_KEYS: &[&str] = &["displayName", "display_name", "name", "fullName", "full_name"];
const AVATAR_KEYS: &[&str] = &[
    "avatarUrl",
    "avatar_url",
    "avatar",
    "profilePicture",
    "profile_picture",
];
const BIO_KEYS: &[&str] = &["bio", "about"];

/// Frames the client writes to the persistent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinConversation {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    LeaveConversation {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    JoinCommunityChat {
        #[serde(rename = "communityId")]
        community_id: CommunityId,
    },
    LeaveCommunityChat {
        #[serde(rename = "communityId")]
        community_id: CommunityId,
    },
    HeartbeatAck,
}

impl ClientFrame {
    pub fn join(room: &RoomRef) -> Self {
        match room {
            RoomRef::Conversation(id) => ClientFrame::JoinConversation {
                conversation_id: id.clone(),
            },
            RoomRef::Community(id) => ClientFrame::JoinCommunityChat {
                community_id: id.clone(),
            },
        }
    }

    pub fn leave(room: &RoomRef) -> Self {
        match room {
            RoomRef::Conversation(id) => ClientFrame::LeaveConversation {
                conversation_id: id.clone(),
            },
            RoomRef::Community(id) => ClientFrame::LeaveCommunityChat {
                community_id: id.clone(),
            },
        }
    }
}

/// Envelope of every frame the server pushes. The payload shape depends on
/// `event` and is only interpreted by [`ingest_frame`].
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    Conversation(ConversationId),
    Community {
        community_id: CommunityId,
        conversation_id: Option<ConversationId>,
    },
}

/// Canonical inbound message. Every legacy field alias has already been
/// resolved by the time one of these exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub event_id: Option<MessageId>,
    pub target: MessageTarget,
    pub sender_username: String,
    pub sender: Option<Participant>,
    pub content: String,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(InboundMessage),
    CommunityConversationReady {
        community_id: CommunityId,
        conversation_id: ConversationId,
    },
    Heartbeat,
}

/// Parses one text frame into the canonical event shape.
///
/// Returns `Ok(None)` for event names this client does not consume.
pub fn ingest_frame(text: &str) -> Result<Option<InboundEvent>, IngestError> {
    let frame: RawFrame = serde_json::from_str(text)?;
    ingest(frame)
}

pub fn ingest(frame: RawFrame) -> Result<Option<InboundEvent>, IngestError> {
    let empty = Map::new();
    let data = frame.data.as_object().unwrap_or(&empty);

    match frame.event.as_str() {
        "new_message" => {
            let conversation_id = text_field(data, CONVERSATION_ID_KEYS)
                .ok_or(IngestError::MissingField("conversationId"))?;
            let target = MessageTarget::Conversation(ConversationId(conversation_id));
            Ok(Some(InboundEvent::Message(ingest_message(data, target)?)))
        }
        "new_community_message" => {
            let community_id = text_field(data, COMMUNITY_ID_KEYS)
                .ok_or(IngestError::MissingField("communityId"))?;
            let target = MessageTarget::Community {
                community_id: CommunityId(community_id),
                conversation_id: text_field(data, CONVERSATION_ID_KEYS).map(ConversationId),
            };
            Ok(Some(InboundEvent::Message(ingest_message(data, target)?)))
        }
        "community_conversation_ready" => {
            let community_id = text_field(data, COMMUNITY_ID_KEYS)
                .ok_or(IngestError::MissingField("communityId"))?;
            let conversation_id = text_field(data, CONVERSATION_ID_KEYS)
                .ok_or(IngestError::MissingField("conversationId"))?;
            Ok(Some(InboundEvent::CommunityConversationReady {
                community_id: CommunityId(community_id),
                conversation_id: ConversationId(conversation_id),
            }))
        }
        "heartbeat" | "ping" => Ok(Some(InboundEvent::Heartbeat)),
        _ => Ok(None),
    }
}

fn ingest_message(
    data: &Map<String, Value>,
    target: MessageTarget,
) -> Result<InboundMessage, IngestError> {
    let sender = field(data, SENDER_KEYS).and_then(participant_from_value);
    let sender_username = text_field(data, SENDER_USERNAME_KEYS)
        .or_else(|| sender.as_ref().map(|s| s.username.clone()))
        .ok_or(IngestError::MissingField("senderUsername"))?;

    // An inline record describing somebody else is not this sender's profile.
    let sender = sender.filter(|s| s.username == sender_username);

    Ok(InboundMessage {
        event_id: text_field(data, EVENT_ID_KEYS).map(MessageId),
        target,
        sender_username,
        sender,
        content: text_field(data, CONTENT_KEYS).unwrap_or_default(),
        sent_at: timestamp_field(data, TIMESTAMP_KEYS),
    })
}

/// A user record given either as a bare username or as an object using any
/// of the known field spellings.
pub fn participant_from_value(value: &Value) -> Option<Participant> {
    match value {
        Value::String(username) if !username.trim().is_empty() => {
            Some(Participant::new(username.trim()))
        }
        Value::Object(map) => {
            let username = text_field(map, USERNAME_KEYS)?;
            Some(Participant {
                username,
                display_name: text_field(map, DISPLAY_NAME_KEYS),
                avatar_url: text_field(map, AVATAR_KEYS),
                bio: text_field(map, BIO_KEYS),
            })
        }
        _ => None,
    }
}

/// First non-null value among `keys`, in order.
pub fn field<'a>(data: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| data.get(*key).filter(|value| !value.is_null()))
}

pub fn text_field(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match data.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// First alias among `keys` that holds a parseable timestamp. Blank or
/// malformed values fall through to the next spelling.
pub fn timestamp_field(data: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .find_map(|key| data.get(*key).and_then(parse_timestamp))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (as UTC), epoch seconds and
/// epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            raw.parse::<i64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    // Anything past 1e11 cannot be seconds for a plausible date.
    if value.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
