use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(CommunityId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
    Community,
}

/// Transport room a client subscribes to in order to receive pushes for a
/// conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RoomRef {
    Conversation(ConversationId),
    Community(CommunityId),
}

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomRef::Conversation(id) => write!(f, "conversation:{id}"),
            RoomRef::Community(id) => write!(f, "community:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl Participant {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: None,
            avatar_url: None,
            bio: None,
        }
    }

    /// Last-resort record for a sender nobody has described yet: the name is
    /// the raw username and the avatar stays blank.
    pub fn placeholder(username: &str) -> Self {
        Self {
            username: username.to_string(),
            display_name: Some(username.to_string()),
            avatar_url: None,
            bio: None,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        is_blank(self.display_name.as_deref()) || is_blank(self.avatar_url.as_deref())
    }

    /// Overlays the populated fields of `incoming`; absent fields never erase
    /// known data.
    pub fn merge_from(&mut self, incoming: &Participant) {
        if !is_blank(incoming.display_name.as_deref()) {
            self.display_name = incoming.display_name.clone();
        }
        if !is_blank(incoming.avatar_url.as_deref()) {
            self.avatar_url = incoming.avatar_url.clone();
        }
        if !is_blank(incoming.bio.as_deref()) {
            self.bio = incoming.bio.clone();
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender_username: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Server-provided name for group and community chats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    pub room: RoomRef,
    /// Materialized from an inbound event rather than a snapshot.
    #[serde(default)]
    pub provisional: bool,
}

impl Conversation {
    pub fn direct(id: ConversationId) -> Self {
        Self {
            room: RoomRef::Conversation(id.clone()),
            id,
            kind: ConversationKind::Direct,
            title: None,
            participants: Vec::new(),
            last_message: None,
            unread_count: 0,
            provisional: false,
        }
    }

    pub fn community(id: ConversationId, community_id: CommunityId) -> Self {
        Self {
            id,
            kind: ConversationKind::Community,
            title: None,
            participants: Vec::new(),
            last_message: None,
            unread_count: 0,
            room: RoomRef::Community(community_id),
            provisional: false,
        }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.sent_at)
    }

    pub fn participant(&self, username: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.username == username)
    }

    /// The other party of a direct conversation.
    pub fn counterpart(&self, local_username: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.username != local_username)
    }

    /// Name to show for this conversation, or `None` when nothing is known
    /// and the view has to pick its own placeholder.
    pub fn display_name(&self, local_username: &str) -> Option<String> {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return Some(title.to_string());
        }
        let counterpart = self.counterpart(local_username)?;
        counterpart
            .display_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| Some(counterpart.username.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_known_fields_when_incoming_is_sparse() {
        let mut existing = Participant {
            username: "bob".into(),
            display_name: Some("Bob".into()),
            avatar_url: Some("https://cdn/bob.png".into()),
            bio: None,
        };
        existing.merge_from(&Participant::new("bob"));
        assert_eq!(existing.display_name.as_deref(), Some("Bob"));
        assert_eq!(existing.avatar_url.as_deref(), Some("https://cdn/bob.png"));
    }

    #[test]
    fn display_name_falls_back_to_counterpart_username() {
        let mut conversation = Conversation::direct(ConversationId::from("c1"));
        conversation.participants.push(Participant::new("alice"));
        conversation.participants.push(Participant::new("bob"));
        assert_eq!(conversation.display_name("alice").as_deref(), Some("bob"));
    }

    #[test]
    fn display_name_is_none_without_counterpart() {
        let conversation = Conversation::direct(ConversationId::from("c1"));
        assert_eq!(conversation.display_name("alice"), None);
    }

    #[test]
    fn placeholder_participant_uses_raw_username() {
        let placeholder = Participant::placeholder("carol");
        assert_eq!(placeholder.display_name.as_deref(), Some("carol"));
        assert!(placeholder.avatar_url.is_none());
        assert!(placeholder.is_incomplete());
    }
}
