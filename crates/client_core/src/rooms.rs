use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use shared::domain::RoomRef;

/// Rooms this session intends to be subscribed to.
///
/// Intent survives disconnects; the connection task replays the whole set
/// after every successful connect. Writers only ever add or remove single
/// rooms so a concurrent insert is never lost to a bulk replacement.
#[derive(Debug, Default)]
pub struct RoomMembership {
    rooms: Mutex<BTreeSet<RoomRef>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, BTreeSet<RoomRef>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` when the room was not already tracked.
    pub fn add(&self, room: RoomRef) -> bool {
        self.guard().insert(room)
    }

    /// Returns `true` when the room was tracked.
    pub fn remove(&self, room: &RoomRef) -> bool {
        self.guard().remove(room)
    }

    pub fn contains(&self, room: &RoomRef) -> bool {
        self.guard().contains(room)
    }

    pub fn snapshot(&self) -> Vec<RoomRef> {
        self.guard().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Drops every room. Only used when the session itself ends.
    pub(crate) fn clear(&self) {
        self.guard().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_report_membership_changes() {
        let rooms = RoomMembership::new();
        let room = RoomRef::Conversation("c1".into());

        assert!(rooms.add(room.clone()));
        assert!(!rooms.add(room.clone()));
        assert!(rooms.contains(&room));
        assert!(rooms.remove(&room));
        assert!(!rooms.remove(&room));
        assert!(rooms.is_empty());
    }

    #[test]
    fn snapshot_contains_each_room_once() {
        let rooms = RoomMembership::new();
        rooms.add(RoomRef::Conversation("c2".into()));
        rooms.add(RoomRef::Community("k1".into()));
        rooms.add(RoomRef::Conversation("c2".into()));

        let snapshot = rooms.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&RoomRef::Community("k1".into())));
    }
}
