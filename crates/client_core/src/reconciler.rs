use std::collections::{HashMap, HashSet};

use shared::{
    domain::{
        CommunityId, Conversation, ConversationId, ConversationKind, LastMessage, Participant,
        RoomRef,
    },
    protocol::{InboundMessage, MessageTarget},
};
use tokio::time::Instant;

use crate::dedup::EventDeduplicator;

/// What an inbound event did to the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Already processed inside the dedup window.
    Duplicate,
    /// No authoritative timestamp; nothing was touched.
    MissingTimestamp,
    /// Processed, but the list value is the same as before.
    Unchanged,
    Updated { conversation_id: ConversationId },
    /// First sighting of a conversation. Its room has to be joined and a
    /// snapshot fetched to fill in the rest.
    Created {
        conversation_id: ConversationId,
        room: RoomRef,
    },
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            MergeOutcome::Updated { .. } | MergeOutcome::Created { .. }
        )
    }
}

/// A direct conversation whose counterpart still lacks profile data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentRequest {
    pub generation: u64,
    pub conversation_id: ConversationId,
    pub counterpart: Option<String>,
}

/// Owner of the authoritative conversation list.
///
/// Pure state machine: callers feed it snapshots, inbound events, optimistic
/// updates and enrichment results and act on what it returns. The list is
/// kept most-recent-first by `last_message.sent_at`; conversations with no
/// message sort last.
#[derive(Debug)]
pub struct Reconciler {
    local_username: String,
    conversations: Vec<Conversation>,
    dedup: EventDeduplicator,
    generation: u64,
    enrichment_attempted: HashSet<ConversationId>,
}

impl Reconciler {
    pub fn new(local_username: impl Into<String>, dedup: EventDeduplicator) -> Self {
        Self {
            local_username: local_username.into(),
            conversations: Vec::new(),
            dedup,
            generation: 0,
            enrichment_attempted: HashSet::new(),
        }
    }

    pub fn local_username(&self) -> &str {
        &self.local_username
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    /// Bumped whenever the list is replaced wholesale. Fetches compare the
    /// value they started with before applying their result.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replaces the list with server truth.
    ///
    /// Two local facts survive: a conversation whose local `last_message` is
    /// strictly newer than the snapshot's keeps that message and its unread
    /// count, and provisional conversations the snapshot does not list yet
    /// are carried over. A provisional conversation is matched by id, or by
    /// room when the snapshot lists the same community under its real id.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Conversation>) {
        let mut previous: HashMap<ConversationId, Conversation> = self
            .conversations
            .drain(..)
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut seen = HashSet::new();
        let mut next = Vec::with_capacity(snapshot.len());
        for mut incoming in snapshot {
            if !seen.insert(incoming.id.clone()) {
                continue;
            }
            incoming.provisional = false;
            if let Some(local) = previous.remove(&incoming.id) {
                absorb_local(&mut incoming, local);
            }
            // A provisional entry synthesized under a derived id is superseded
            // by the listed conversation bound to the same room.
            while let Some(local) = take_provisional_in_room(&mut previous, &incoming.room) {
                absorb_local(&mut incoming, local);
            }
            next.push(incoming);
        }
        next.extend(previous.into_values().filter(|c| c.provisional));

        // Stable: equal timestamps keep the snapshot's order.
        next.sort_by(|a, b| b.sent_at().cmp(&a.sent_at()));

        self.conversations = next;
        self.generation += 1;
        self.enrichment_attempted.clear();
    }

    /// Applies a snapshot only if nothing replaced the list since the fetch
    /// started at `expected_generation`.
    pub fn apply_snapshot_if_current(
        &mut self,
        expected_generation: u64,
        snapshot: Vec<Conversation>,
    ) -> bool {
        if expected_generation != self.generation {
            return false;
        }
        self.apply_snapshot(snapshot);
        true
    }

    pub fn apply_inbound(&mut self, message: &InboundMessage, now: Instant) -> MergeOutcome {
        let conversation_id = self.resolve_conversation_id(&message.target);

        let Some(sent_at) = message.sent_at else {
            return MergeOutcome::MissingTimestamp;
        };

        if !self
            .dedup
            .should_process(&conversation_id, message.event_id.as_ref(), now)
        {
            return MergeOutcome::Duplicate;
        }

        let from_self = message.sender_username == self.local_username;
        let incoming = LastMessage {
            id: message.event_id.clone(),
            sender_username: message.sender_username.clone(),
            content: message.content.clone(),
            sent_at,
            read: from_self,
        };

        let Some(index) = self.index_of(&conversation_id) else {
            return self.synthesize(conversation_id, message, incoming, from_self);
        };

        let local_username = self.local_username.clone();
        let conversation = &mut self.conversations[index];
        let sender = reconciled_sender(Some(&*conversation), message);
        let participants_changed = upsert_participant(conversation, sender, &local_username);

        let is_stale = conversation.sent_at().is_some_and(|current| sent_at < current);
        let is_repeat = conversation
            .last_message
            .as_ref()
            .is_some_and(|current| same_message(current, &incoming));
        // Out-of-order delivery of a distinct message still counts as
        // unread but never displaces the newer `last_message`. Without an id
        // a stale event cannot be told apart from a redelivery.
        let counts_as_unread_only =
            is_stale && !is_repeat && !from_self && message.event_id.is_some();
        if counts_as_unread_only {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
            return MergeOutcome::Updated { conversation_id };
        }
        if is_stale || is_repeat {
            return if participants_changed {
                MergeOutcome::Updated { conversation_id }
            } else {
                MergeOutcome::Unchanged
            };
        }

        conversation.last_message = Some(incoming);
        if !from_self {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        self.reposition(index);
        MergeOutcome::Updated { conversation_id }
    }

    /// Moves a provisional community conversation from its derived id to the
    /// id the server assigned. When the real conversation is already listed
    /// the provisional entry is folded into it.
    pub fn rebind_community_conversation(
        &mut self,
        community_id: &CommunityId,
        conversation_id: ConversationId,
    ) -> bool {
        let derived = community_conversation_id(community_id);
        if derived == conversation_id {
            return false;
        }
        let Some(index) = self
            .index_of(&derived)
            .filter(|&i| self.conversations[i].provisional)
        else {
            return false;
        };

        let provisional = self.conversations.remove(index);
        match self.index_of(&conversation_id) {
            Some(existing) => {
                absorb_local(&mut self.conversations[existing], provisional);
                self.reposition(existing);
            }
            None => {
                let mut rebound = provisional;
                rebound.id = conversation_id;
                self.conversations.insert(index, rebound);
            }
        }
        true
    }

    /// Local "mark read"; the next snapshot or event may override it.
    pub fn apply_optimistic_mark_read(&mut self, id: &ConversationId) -> bool {
        let Some(conversation) = self.conversations.iter_mut().find(|c| &c.id == id) else {
            return false;
        };
        let message_unread = conversation
            .last_message
            .as_ref()
            .is_some_and(|m| !m.read);
        if conversation.unread_count == 0 && !message_unread {
            return false;
        }
        conversation.unread_count = 0;
        if let Some(message) = conversation.last_message.as_mut() {
            message.read = true;
        }
        true
    }

    /// Direct conversations that still need a profile fetch. Each one is
    /// handed out at most once per generation.
    pub fn take_enrichment_candidates(&mut self) -> Vec<EnrichmentRequest> {
        let mut requests = Vec::new();
        for conversation in &self.conversations {
            if conversation.kind != ConversationKind::Direct
                || self.enrichment_attempted.contains(&conversation.id)
            {
                continue;
            }
            let counterpart = conversation.counterpart(&self.local_username);
            if counterpart.is_some_and(|p| !p.is_incomplete()) {
                continue;
            }
            self.enrichment_attempted.insert(conversation.id.clone());
            requests.push(EnrichmentRequest {
                generation: self.generation,
                conversation_id: conversation.id.clone(),
                counterpart: counterpart.map(|p| p.username.clone()),
            });
        }
        requests
    }

    /// Merges a fetched participant through the same upsert used for
    /// inbound senders. Results from an older generation are discarded.
    pub fn apply_enrichment(
        &mut self,
        generation: u64,
        id: &ConversationId,
        participant: Participant,
    ) -> bool {
        if generation != self.generation {
            return false;
        }
        let local_username = self.local_username.clone();
        match self.conversations.iter_mut().find(|c| &c.id == id) {
            Some(conversation) => upsert_participant(conversation, participant, &local_username),
            None => false,
        }
    }

    /// Drops all state. Used on logout.
    pub fn reset(&mut self) {
        self.conversations.clear();
        self.dedup.clear();
        self.enrichment_attempted.clear();
        self.generation += 1;
    }

    fn index_of(&self, id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| &c.id == id)
    }

    fn resolve_conversation_id(&self, target: &MessageTarget) -> ConversationId {
        match target {
            MessageTarget::Conversation(id) => id.clone(),
            MessageTarget::Community {
                conversation_id: Some(id),
                ..
            } => id.clone(),
            MessageTarget::Community {
                community_id,
                conversation_id: None,
            } => {
                let room = RoomRef::Community(community_id.clone());
                self.conversations
                    .iter()
                    .find(|c| c.room == room)
                    .map(|c| c.id.clone())
                    .unwrap_or_else(|| community_conversation_id(community_id))
            }
        }
    }

    fn synthesize(
        &mut self,
        conversation_id: ConversationId,
        message: &InboundMessage,
        incoming: LastMessage,
        from_self: bool,
    ) -> MergeOutcome {
        let mut conversation = match &message.target {
            MessageTarget::Community { community_id, .. } => {
                Conversation::community(conversation_id.clone(), community_id.clone())
            }
            MessageTarget::Conversation(_) => Conversation::direct(conversation_id.clone()),
        };
        conversation.provisional = true;
        if !from_self {
            conversation
                .participants
                .push(reconciled_sender(None, message));
            conversation.unread_count = 1;
        }
        conversation.last_message = Some(incoming);

        let room = conversation.room.clone();
        self.conversations.push(conversation);
        let last = self.conversations.len() - 1;
        self.reposition(last);
        MergeOutcome::Created {
            conversation_id,
            room,
        }
    }

    /// Moves the conversation at `index` ahead of every conversation whose
    /// timestamp is not newer, so a freshly mutated entry wins ties.
    fn reposition(&mut self, index: usize) {
        let conversation = self.conversations.remove(index);
        let sent_at = conversation.sent_at();
        let target = self
            .conversations
            .iter()
            .position(|c| c.sent_at() <= sent_at)
            .unwrap_or(self.conversations.len());
        self.conversations.insert(target, conversation);
    }
}

pub fn community_conversation_id(community_id: &CommunityId) -> ConversationId {
    ConversationId(format!("community:{community_id}"))
}

/// Inline payload first, then the participant already on file, then a
/// placeholder built from the raw username.
fn reconciled_sender(existing: Option<&Conversation>, message: &InboundMessage) -> Participant {
    if let Some(sender) = &message.sender {
        return sender.clone();
    }
    existing
        .and_then(|c| c.participant(&message.sender_username))
        .cloned()
        .unwrap_or_else(|| Participant::placeholder(&message.sender_username))
}

/// Upsert by username. Direct conversations never grow past the local user
/// plus one counterpart.
fn upsert_participant(
    conversation: &mut Conversation,
    participant: Participant,
    local_username: &str,
) -> bool {
    if let Some(existing) = conversation
        .participants
        .iter_mut()
        .find(|p| p.username == participant.username)
    {
        let before = existing.clone();
        existing.merge_from(&participant);
        return *existing != before;
    }

    if conversation.kind == ConversationKind::Direct {
        let is_local = participant.username == local_username;
        let has_counterpart = conversation
            .participants
            .iter()
            .any(|p| p.username != local_username);
        if conversation.participants.len() >= 2 || (!is_local && has_counterpart) {
            return false;
        }
    }

    conversation.participants.push(participant);
    true
}

/// Carries local state into `target`: a strictly newer `last_message` with
/// its unread count, and profile fields `target` lacks.
fn absorb_local(target: &mut Conversation, local: Conversation) {
    if local.sent_at() > target.sent_at() {
        target.last_message = local.last_message;
        target.unread_count = local.unread_count;
    }
    fill_missing_profiles(&mut target.participants, &local.participants);
}

fn take_provisional_in_room(
    previous: &mut HashMap<ConversationId, Conversation>,
    room: &RoomRef,
) -> Option<Conversation> {
    let id = previous
        .values()
        .find(|c| c.provisional && &c.room == room)?
        .id
        .clone();
    previous.remove(&id)
}

fn fill_missing_profiles(target: &mut [Participant], known: &[Participant]) {
    for participant in target {
        let Some(local) = known.iter().find(|p| p.username == participant.username) else {
            continue;
        };
        if participant.display_name.is_none() {
            participant.display_name = local.display_name.clone();
        }
        if participant.avatar_url.is_none() {
            participant.avatar_url = local.avatar_url.clone();
        }
        if participant.bio.is_none() {
            participant.bio = local.bio.clone();
        }
    }
}

fn same_message(current: &LastMessage, incoming: &LastMessage) -> bool {
    if let (Some(a), Some(b)) = (&current.id, &incoming.id) {
        return a == b;
    }
    current.sent_at == incoming.sent_at
        && current.sender_username == incoming.sender_username
        && current.content == incoming.content
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
