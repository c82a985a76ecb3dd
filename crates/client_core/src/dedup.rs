use std::{collections::HashMap, time::Duration};

use shared::domain::{ConversationId, MessageId};
use tokio::time::Instant;

/// Remembers recently processed `(conversation, event id)` pairs so
/// redelivered events can be dropped.
#[derive(Debug)]
pub struct EventDeduplicator {
    seen: HashMap<(ConversationId, MessageId), Instant>,
    retention: Duration,
    sweep_interval: Duration,
    last_sweep: Option<Instant>,
}

impl EventDeduplicator {
    pub fn new(retention: Duration, sweep_interval: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            retention,
            sweep_interval,
            last_sweep: None,
        }
    }

    /// `false` means the event was already handled inside the retention
    /// window. Events without an id always pass; the merge step has to be
    /// idempotent for those on its own.
    pub fn should_process(
        &mut self,
        conversation_id: &ConversationId,
        event_id: Option<&MessageId>,
        now: Instant,
    ) -> bool {
        self.maybe_sweep(now);

        let Some(event_id) = event_id else {
            return true;
        };

        let key = (conversation_id.clone(), event_id.clone());
        match self.seen.get(&key) {
            Some(seen_at) if now.saturating_duration_since(*seen_at) < self.retention => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    fn maybe_sweep(&mut self, now: Instant) {
        let due = self
            .last_sweep
            .map_or(true, |last| now.saturating_duration_since(last) >= self.sweep_interval);
        if due {
            self.sweep(now);
        }
    }

    /// Evicts entries older than the retention window.
    pub fn sweep(&mut self, now: Instant) {
        let retention = self.retention;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < retention);
        self.last_sweep = Some(now);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.last_sweep = None;
    }
}
