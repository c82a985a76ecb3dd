use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde_json::{Map, Value};
use shared::{
    domain::{
        CommunityId, Conversation, ConversationId, ConversationKind, LastMessage, MessageId,
        Participant, RoomRef,
    },
    error::ApiError,
    protocol::{field, participant_from_value, text_field, timestamp_field},
};
use tracing::warn;

use crate::error::SyncError;

/// REST collaborator the synchronizer consumes.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn conversations(&self, username: &str) -> Result<Vec<Conversation>>;
    async fn conversation(&self, id: &ConversationId) -> Result<Conversation>;
    async fn user_by_username(&self, username: &str) -> Result<Participant>;
    async fn mark_all_read(&self, id: &ConversationId, username: &str) -> Result<()>;
}

/// Stand-in for a session without a REST backend. Every call fails.
pub struct MissingConversationApi;

#[async_trait]
impl ConversationApi for MissingConversationApi {
    async fn conversations(&self, _username: &str) -> Result<Vec<Conversation>> {
        Err(anyhow!("conversation api is unavailable"))
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Conversation> {
        Err(anyhow!("conversation api is unavailable for conversation {id}"))
    }

    async fn user_by_username(&self, username: &str) -> Result<Participant> {
        Err(anyhow!("conversation api is unavailable for user {username}"))
    }

    async fn mark_all_read(&self, id: &ConversationId, _username: &str) -> Result<()> {
        Err(anyhow!("conversation api is unavailable for conversation {id}"))
    }
}

#[derive(Debug, Serialize)]
struct MarkReadRequest<'a> {
    username: &'a str,
}

pub struct HttpConversationApi {
    http: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpConversationApi {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            request_timeout,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Sends the request, repeating it once if no response arrived at all.
    /// Error statuses come back as [`SyncError::Rest`] and are never retried.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, SyncError> {
        let mut retried = false;
        loop {
            let err = match self.authorized(build()).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let detail = response.json::<ApiError>().await.ok();
                    return Err(SyncError::Rest { status, detail });
                }
                Err(err) if err.is_timeout() => SyncError::Timeout(self.request_timeout),
                Err(err) if err.is_connect() || err.is_request() => SyncError::Unreachable(err),
                Err(err) => return Err(SyncError::Transport(err.to_string())),
            };

            if retried || !err.is_retryable() {
                return Err(err);
            }
            warn!("rest: request failed before a response arrived, retrying once: {err}");
            retried = true;
        }
    }

    async fn get_json(&self, url: String, query: &[(&str, &str)]) -> Result<Value> {
        let response = self.send(|| self.http.get(&url).query(query)).await?;
        response
            .json::<Value>()
            .await
            .map_err(|err| SyncError::Decode(err.to_string()).into())
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn conversations(&self, username: &str) -> Result<Vec<Conversation>> {
        let body = self
            .get_json(
                format!("{}/conversations", self.base_url),
                &[("username", username)],
            )
            .await?;
        decode_snapshot(&body)
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Conversation> {
        let body = self
            .get_json(format!("{}/conversations/{id}", self.base_url), &[])
            .await?;
        let record = unwrap_envelope(&body, &["conversation", "data"]);
        decode_conversation(record)
            .ok_or_else(|| SyncError::Decode(format!("conversation {id} has no usable id")).into())
    }

    async fn user_by_username(&self, username: &str) -> Result<Participant> {
        let body = self
            .get_json(format!("{}/users/{username}", self.base_url), &[])
            .await?;
        let record = unwrap_envelope(&body, &["user", "data"]);
        participant_from_value(record)
            .ok_or_else(|| SyncError::Decode(format!("user {username} has no username")).into())
    }

    async fn mark_all_read(&self, id: &ConversationId, username: &str) -> Result<()> {
        let url = format!("{}/conversations/{id}/read", self.base_url);
        self.send(|| self.http.post(&url).json(&MarkReadRequest { username }))
            .await?;
        Ok(())
    }
}

fn unwrap_envelope<'a>(body: &'a Value, keys: &[&str]) -> &'a Value {
    body.as_object()
        .and_then(|map| field(map, keys))
        .filter(|inner| inner.is_object())
        .unwrap_or(body)
}

/// Accepts a bare array or an object wrapping it. Records that cannot be
/// identified are skipped.
pub fn decode_snapshot(body: &Value) -> Result<Vec<Conversation>> {
    let records = match body {
        Value::Array(records) => records,
        Value::Object(map) => match field(map, &["conversations", "data"]) {
            Some(Value::Array(records)) => records,
            _ => return Err(SyncError::Decode("snapshot has no conversation list".into()).into()),
        },
        _ => return Err(SyncError::Decode("snapshot is not a list".into()).into()),
    };

    Ok(records
        .iter()
        .filter_map(|record| {
            let decoded = decode_conversation(record);
            if decoded.is_none() {
                warn!("rest: skipping conversation record without id");
            }
            decoded
        })
        .collect())
}

pub fn decode_conversation(record: &Value) -> Option<Conversation> {
    let map = record.as_object()?;
    let id = ConversationId(text_field(map, &["id", "_id", "conversationId", "conversation_id"])?);
    let community_id =
        text_field(map, &["communityId", "community_id"]).map(CommunityId);

    let participants: Vec<Participant> = match field(map, &["participants", "members"]) {
        Some(Value::Array(items)) => items.iter().filter_map(participant_from_value).collect(),
        _ => Vec::new(),
    };

    let kind = match text_field(map, &["kind", "type", "conversationType"]).as_deref() {
        Some("community") => ConversationKind::Community,
        Some("group") => ConversationKind::Group,
        Some(_) => ConversationKind::Direct,
        None if community_id.is_some() => ConversationKind::Community,
        None if participants.len() > 2 => ConversationKind::Group,
        None => ConversationKind::Direct,
    };

    let room = match (&kind, community_id) {
        (ConversationKind::Community, Some(community_id)) => RoomRef::Community(community_id),
        _ => RoomRef::Conversation(id.clone()),
    };

    let unread_count = map
        .get("unreadCount")
        .or_else(|| map.get("unread_count"))
        .and_then(Value::as_i64)
        .map(|n| n.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(0);

    Some(Conversation {
        id,
        kind,
        title: text_field(map, &["title", "name", "groupName", "group_name"]),
        participants,
        last_message: field(map, &["lastMessage", "last_message"])
            .and_then(Value::as_object)
            .and_then(decode_last_message),
        unread_count,
        room,
        provisional: false,
    })
}

fn decode_last_message(map: &Map<String, Value>) -> Option<LastMessage> {
    let sender_username = text_field(map, &["senderUsername", "sender_username", "senderId"])
        .or_else(|| {
            field(map, &["sender"])
                .and_then(participant_from_value)
                .map(|p| p.username)
        })?;
    Some(LastMessage {
        id: text_field(map, &["id", "_id", "messageId"]).map(MessageId),
        sender_username,
        content: text_field(map, &["content", "text"]).unwrap_or_default(),
        sent_at: timestamp_field(
            map,
            &["sentAt", "sent_at", "createdAt", "created_at", "timestamp"],
        )?,
        read: map
            .get("read")
            .or_else(|| map.get("isRead"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
