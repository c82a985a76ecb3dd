use std::sync::Arc;

use shared::domain::Participant;
use tracing::{debug, warn};

use crate::{reconciler::EnrichmentRequest, rest::ConversationApi};

/// Resolves the counterpart profile of a direct conversation that only has
/// placeholder data. Best effort: failures are logged and yield `None`, the
/// caller never retries within the same generation.
pub struct EnrichmentFetcher {
    api: Arc<dyn ConversationApi>,
    local_username: String,
}

impl EnrichmentFetcher {
    pub fn new(api: Arc<dyn ConversationApi>, local_username: impl Into<String>) -> Self {
        Self {
            api,
            local_username: local_username.into(),
        }
    }

    /// Conversation detail first; the user directory fills whatever the
    /// detail still leaves blank.
    pub async fn fetch(&self, request: &EnrichmentRequest) -> Option<Participant> {
        let from_detail = match self.api.conversation(&request.conversation_id).await {
            Ok(detail) => detail.counterpart(&self.local_username).cloned(),
            Err(err) => {
                warn!(
                    conversation_id = %request.conversation_id,
                    "enrich: conversation detail failed: {err:#}"
                );
                None
            }
        };

        if let Some(participant) = &from_detail {
            if !participant.is_incomplete() {
                return from_detail;
            }
        }

        let username = from_detail
            .as_ref()
            .map(|p| p.username.clone())
            .or_else(|| request.counterpart.clone())?;

        match self.api.user_by_username(&username).await {
            Ok(profile) if profile.username == username => {
                let mut participant =
                    from_detail.unwrap_or_else(|| Participant::new(username.as_str()));
                participant.merge_from(&profile);
                Some(participant)
            }
            Ok(profile) => {
                debug!(
                    requested = %username,
                    returned = %profile.username,
                    "enrich: user lookup returned a different user"
                );
                from_detail
            }
            Err(err) => {
                warn!(username = %username, "enrich: user lookup failed: {err:#}");
                from_detail
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use shared::domain::{Conversation, ConversationId};

    use super::*;

    #[derive(Default)]
    struct FakeApi {
        detail: Option<Conversation>,
        users: Vec<Participant>,
        lookups: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConversationApi for FakeApi {
        async fn conversations(&self, _username: &str) -> Result<Vec<Conversation>> {
            Ok(Vec::new())
        }

        async fn conversation(&self, id: &ConversationId) -> Result<Conversation> {
            self.detail
                .clone()
                .ok_or_else(|| anyhow!("no detail for {id}"))
        }

        async fn user_by_username(&self, username: &str) -> Result<Participant> {
            self.lookups.lock().expect("lookups").push(username.into());
            self.users
                .iter()
                .find(|u| u.username == username)
                .cloned()
                .ok_or_else(|| anyhow!("no user {username}"))
        }

        async fn mark_all_read(&self, _id: &ConversationId, _username: &str) -> Result<()> {
            Ok(())
        }
    }

    fn request(counterpart: Option<&str>) -> EnrichmentRequest {
        EnrichmentRequest {
            generation: 3,
            conversation_id: ConversationId::from("c1"),
            counterpart: counterpart.map(str::to_string),
        }
    }

    fn complete(username: &str) -> Participant {
        Participant {
            username: username.into(),
            display_name: Some(format!("{username} display")),
            avatar_url: Some(format!("https://cdn/{username}.png")),
            bio: None,
        }
    }

    fn detail_with(participants: Vec<Participant>) -> Conversation {
        let mut conversation = Conversation::direct(ConversationId::from("c1"));
        conversation.participants = participants;
        conversation
    }

    #[tokio::test]
    async fn complete_detail_skips_user_lookup() {
        let api = Arc::new(FakeApi {
            detail: Some(detail_with(vec![Participant::new("alice"), complete("bob")])),
            ..FakeApi::default()
        });
        let fetcher = EnrichmentFetcher::new(api.clone(), "alice");

        let participant = fetcher.fetch(&request(Some("bob"))).await;

        assert_eq!(participant, Some(complete("bob")));
        assert!(api.lookups.lock().expect("lookups").is_empty());
    }

    #[tokio::test]
    async fn incomplete_detail_is_filled_from_user_lookup() {
        let api = Arc::new(FakeApi {
            detail: Some(detail_with(vec![Participant::new("bob")])),
            users: vec![complete("bob")],
            ..FakeApi::default()
        });
        let fetcher = EnrichmentFetcher::new(api.clone(), "alice");

        let participant = fetcher.fetch(&request(None)).await.expect("participant");

        assert_eq!(participant.display_name.as_deref(), Some("bob display"));
        assert_eq!(*api.lookups.lock().expect("lookups"), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn failed_detail_falls_back_to_known_counterpart() {
        let api = Arc::new(FakeApi {
            users: vec![complete("carol")],
            ..FakeApi::default()
        });
        let fetcher = EnrichmentFetcher::new(api, "alice");

        let participant = fetcher.fetch(&request(Some("carol"))).await;

        assert_eq!(participant, Some(complete("carol")));
    }

    #[tokio::test]
    async fn nothing_known_yields_none() {
        let fetcher = EnrichmentFetcher::new(Arc::new(FakeApi::default()), "alice");
        assert_eq!(fetcher.fetch(&request(None)).await, None);
        assert_eq!(fetcher.fetch(&request(Some("dave"))).await, None);
    }
}
