use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use anyhow::Result;
use futures::future::join_all;
use shared::{
    domain::{Conversation, ConversationId, RoomRef},
    protocol::{ingest_frame, ClientFrame, InboundEvent, InboundMessage},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    connection::{ConnectionManager, ConnectionSettings, Connector, TransportEvent},
    dedup::EventDeduplicator,
    enrichment::EnrichmentFetcher,
    reconciler::{EnrichmentRequest, MergeOutcome, Reconciler},
    rest::{ConversationApi, HttpConversationApi},
    rooms::RoomMembership,
    transport::WsConnector,
};

#[derive(Debug, Clone)]
pub enum SyncEvent {
    ListChanged(Arc<[Conversation]>),
    ConnectionChanged(bool),
    Error(String),
}

type ListListener = Arc<dyn Fn(&[Conversation]) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    listeners: Vec<(u64, ListListener)>,
}

fn lock_registry(registry: &StdMutex<ListenerRegistry>) -> MutexGuard<'_, ListenerRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by [`ConversationSyncService::on_list_changed`].
///
/// The listener is removed exactly once, by [`Subscription::dispose`] or on
/// drop, whichever comes first.
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<StdMutex<ListenerRegistry>>,
    active: bool,
}

impl Subscription {
    pub fn dispose(mut self) {
        self.remove();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(registry) = self.registry.upgrade() {
            lock_registry(&registry)
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Session-scoped owner of the conversation list.
///
/// Every mutation goes through the single [`Reconciler`] behind one lock and
/// is published while that lock is held, so observers see list values in
/// mutation order. Must be created inside a tokio runtime.
pub struct ConversationSyncService {
    settings: SyncSettings,
    local_username: String,
    credential: String,
    api: Arc<dyn ConversationApi>,
    enrichment: EnrichmentFetcher,
    connection: ConnectionManager,
    reconciler: Mutex<Reconciler>,
    list: watch::Sender<Arc<[Conversation]>>,
    events: broadcast::Sender<SyncEvent>,
    listeners: Arc<StdMutex<ListenerRegistry>>,
    refresh_task: StdMutex<Option<JoinHandle<()>>>,
    pump_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConversationSyncService {
    /// Wires the REST client and websocket connector from `settings`.
    pub fn from_settings(
        settings: SyncSettings,
        local_username: impl Into<String>,
        token: Option<String>,
    ) -> Result<Arc<Self>> {
        let api = HttpConversationApi::new(
            settings.rest_base_url.clone(),
            token.clone(),
            settings.request_timeout,
        )?;
        Ok(Self::new(
            settings,
            local_username,
            token.unwrap_or_default(),
            Arc::new(api),
            Arc::new(WsConnector),
        ))
    }

    pub fn new(
        settings: SyncSettings,
        local_username: impl Into<String>,
        credential: impl Into<String>,
        api: Arc<dyn ConversationApi>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let local_username = local_username.into();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            connector,
            ConnectionSettings::from(&settings),
            Arc::new(RoomMembership::new()),
            transport_tx,
        );
        let dedup = EventDeduplicator::new(settings.dedup_retention, settings.dedup_sweep_interval);
        let (list, _) = watch::channel(Arc::<[Conversation]>::from(Vec::new()));
        let (events, _) = broadcast::channel(1024);

        let service = Arc::new(Self {
            enrichment: EnrichmentFetcher::new(Arc::clone(&api), local_username.clone()),
            reconciler: Mutex::new(Reconciler::new(local_username.clone(), dedup)),
            settings,
            local_username,
            credential: credential.into(),
            api,
            connection,
            list,
            events,
            listeners: Arc::new(StdMutex::new(ListenerRegistry::default())),
            refresh_task: StdMutex::new(None),
            pump_task: StdMutex::new(None),
        });
        let pump = service.spawn_event_pump(transport_rx);
        *lock_task(&service.pump_task) = Some(pump);
        service
    }

    pub fn local_username(&self) -> &str {
        &self.local_username
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<bool> {
        self.connection.subscribe_status()
    }

    pub fn watch_list(&self) -> watch::Receiver<Arc<[Conversation]>> {
        self.list.subscribe()
    }

    pub fn conversations(&self) -> Arc<[Conversation]> {
        self.list.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn rooms(&self) -> Vec<RoomRef> {
        self.connection.rooms().snapshot()
    }

    /// Registers a callback invoked with every new list value.
    pub fn on_list_changed(
        &self,
        callback: impl Fn(&[Conversation]) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = lock_registry(&self.listeners);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
            active: true,
        }
    }

    /// Starts the persistent connection unless it is already up or retrying,
    /// and schedules the initial snapshot load.
    pub fn connect_if_needed(self: &Arc<Self>) -> Result<()> {
        let endpoint = self.settings.socket_endpoint()?;
        if self.connection.connect(endpoint, self.credential.clone()) {
            info!(username = %self.local_username, "sync: session connecting");
            self.schedule_refresh();
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn join_room(&self, room: RoomRef) {
        self.connection.join_room(room);
    }

    pub fn leave_room(&self, room: RoomRef) {
        self.connection.leave_room(room);
    }

    /// Fetches a snapshot and applies it unless the list was replaced while
    /// the request was in flight. On failure the current list stays as is.
    pub async fn refresh(self: &Arc<Self>) -> Result<()> {
        let generation = self.reconciler.lock().await.generation();
        let snapshot = match self.api.conversations(&self.local_username).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("sync: snapshot refresh failed: {err:#}");
                let _ = self
                    .events
                    .send(SyncEvent::Error(format!("snapshot refresh failed: {err:#}")));
                return Err(err);
            }
        };

        let (rooms, candidates) = {
            let mut reconciler = self.reconciler.lock().await;
            if !reconciler.apply_snapshot_if_current(generation, snapshot) {
                debug!(generation, "sync: discarding superseded snapshot");
                return Ok(());
            }
            self.publish(&reconciler);
            let rooms: Vec<RoomRef> = reconciler
                .conversations()
                .iter()
                .map(|c| c.room.clone())
                .collect();
            (rooms, reconciler.take_enrichment_candidates())
        };
        info!(
            conversations = rooms.len(),
            "sync: snapshot applied"
        );

        for room in rooms {
            self.connection.join_room(room);
        }
        self.spawn_enrichment(candidates);
        Ok(())
    }

    /// Coalesces refresh requests: each call restarts the debounce window.
    pub fn schedule_refresh(self: &Arc<Self>) {
        let debounce = self.settings.refresh_debounce;
        let mut slot = lock_task(&self.refresh_task);
        if let Some(pending) = slot.take() {
            pending.abort();
        }
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            if debounce > Duration::ZERO {
                tokio::time::sleep(debounce).await;
            }
            if let Some(service) = weak.upgrade() {
                let _ = service.refresh().await;
            }
        }));
    }

    /// Clears the unread badge locally and tells the server in the
    /// background. A failed request keeps the local state.
    pub async fn open_conversation(self: &Arc<Self>, id: &ConversationId) -> bool {
        let changed = {
            let mut reconciler = self.reconciler.lock().await;
            let changed = reconciler.apply_optimistic_mark_read(id);
            if changed {
                self.publish(&reconciler);
            }
            changed
        };

        let service = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(err) = service
                .api
                .mark_all_read(&id, &service.local_username)
                .await
            {
                warn!(conversation_id = %id, "sync: mark read failed: {err:#}");
                let _ = service.events.send(SyncEvent::Error(format!(
                    "mark read failed for conversation {id}: {err:#}"
                )));
            }
        });
        changed
    }

    /// Ends the session: closes the connection, forgets every room and
    /// conversation, and invalidates all in-flight fetches.
    pub async fn logout(&self) {
        if let Some(pending) = lock_task(&self.refresh_task).take() {
            pending.abort();
        }
        self.connection.disconnect().await;
        self.connection.rooms().clear();
        let mut reconciler = self.reconciler.lock().await;
        reconciler.reset();
        self.publish(&reconciler);
        info!(username = %self.local_username, "sync: session reset");
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.handle_transport_event(event).await;
            }
        })
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let _ = self.events.send(SyncEvent::ConnectionChanged(true));
                self.schedule_refresh();
            }
            TransportEvent::Disconnected { reason } => {
                debug!("sync: connection down: {reason}");
                let _ = self.events.send(SyncEvent::ConnectionChanged(false));
            }
            TransportEvent::ConnectFailed { error } => {
                debug!("sync: connect attempt failed: {error}");
            }
            TransportEvent::Frame(text) => match ingest_frame(&text) {
                Ok(Some(InboundEvent::Message(message))) => self.apply_inbound(message).await,
                Ok(Some(InboundEvent::CommunityConversationReady {
                    community_id,
                    conversation_id,
                })) => {
                    info!(
                        community_id = %community_id,
                        conversation_id = %conversation_id,
                        "sync: community conversation ready"
                    );
                    {
                        let mut reconciler = self.reconciler.lock().await;
                        let rebound = reconciler
                            .rebind_community_conversation(&community_id, conversation_id);
                        if rebound {
                            self.publish(&reconciler);
                        }
                    }
                    self.connection.join_room(RoomRef::Community(community_id));
                    self.schedule_refresh();
                }
                Ok(Some(InboundEvent::Heartbeat)) => {
                    if let Err(err) = self.connection.send(ClientFrame::HeartbeatAck) {
                        debug!("sync: heartbeat not acknowledged: {err}");
                    }
                }
                Ok(None) => debug!("sync: ignoring unhandled frame"),
                Err(err) => warn!("sync: dropping malformed frame: {err}"),
            },
        }
    }

    async fn apply_inbound(self: &Arc<Self>, message: InboundMessage) {
        let (outcome, candidates) = {
            let mut reconciler = self.reconciler.lock().await;
            let outcome = reconciler.apply_inbound(&message, Instant::now());
            let candidates = if outcome.changed() {
                self.publish(&reconciler);
                reconciler.take_enrichment_candidates()
            } else {
                Vec::new()
            };
            (outcome, candidates)
        };

        match outcome {
            MergeOutcome::Created {
                conversation_id,
                room,
            } => {
                info!(
                    conversation_id = %conversation_id,
                    room = %room,
                    "sync: new conversation from inbound message"
                );
                self.connection.join_room(room);
                self.schedule_refresh();
            }
            MergeOutcome::Duplicate => debug!("sync: duplicate event dropped"),
            MergeOutcome::MissingTimestamp => {
                debug!(sender = %message.sender_username, "sync: event without timestamp dropped")
            }
            MergeOutcome::Updated { .. } | MergeOutcome::Unchanged => {}
        }
        self.spawn_enrichment(candidates);
    }

    fn spawn_enrichment(self: &Arc<Self>, requests: Vec<EnrichmentRequest>) {
        if requests.is_empty() {
            return;
        }
        let service = Arc::clone(self);
        tokio::spawn(async move {
            // Let the current publish settle before hitting the network.
            tokio::task::yield_now().await;
            let fetches = requests.iter().map(|request| service.enrichment.fetch(request));
            let results = join_all(fetches).await;

            for (request, participant) in requests.iter().zip(results) {
                let Some(participant) = participant else {
                    continue;
                };
                let mut reconciler = service.reconciler.lock().await;
                if reconciler.apply_enrichment(
                    request.generation,
                    &request.conversation_id,
                    participant,
                ) {
                    service.publish(&reconciler);
                } else {
                    debug!(
                        conversation_id = %request.conversation_id,
                        "enrich: result discarded"
                    );
                }
            }
        });
    }

    fn publish(&self, reconciler: &Reconciler) {
        let list: Arc<[Conversation]> = Arc::from(reconciler.conversations());
        self.list.send_replace(Arc::clone(&list));
        let _ = self.events.send(SyncEvent::ListChanged(Arc::clone(&list)));

        let listeners: Vec<ListListener> = lock_registry(&self.listeners)
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&list);
        }
    }
}

impl Drop for ConversationSyncService {
    fn drop(&mut self) {
        for slot in [&self.refresh_task, &self.pump_task] {
            if let Some(task) = lock_task(slot).take() {
                task.abort();
            }
        }
    }
}

fn lock_task(slot: &StdMutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/service_tests.rs"]
mod tests;
