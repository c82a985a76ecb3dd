use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{domain::RoomRef, protocol::ClientFrame};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{config::SyncSettings, error::SyncError, rooms::RoomMembership};

/// One established connection. Dropping `outbound` closes the socket; the
/// connector closes `inbound` when the peer goes away.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str, credential: &str) -> Result<TransportLink>;
}

/// Lifecycle and payload notifications from the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    ConnectFailed { error: String },
    Frame(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub reconnect_delay_floor: Duration,
    pub reconnect_delay_ceiling: Duration,
    pub connect_timeout: Duration,
}

impl From<&SyncSettings> for ConnectionSettings {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval,
            reconnect_delay_floor: settings.reconnect_delay_floor,
            reconnect_delay_ceiling: settings.reconnect_delay_ceiling,
            connect_timeout: settings.connect_timeout,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

/// Delay before reconnect attempt number `attempt` (zero based): doubles
/// from the floor and never exceeds the ceiling.
pub fn backoff_delay(attempt: u32, floor: Duration, ceiling: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    floor.saturating_mul(factor).min(ceiling)
}

enum ConnectionCommand {
    Join(RoomRef),
    Leave(RoomRef),
    Send(ClientFrame),
    Shutdown,
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

struct ActiveConnection {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    task: JoinHandle<()>,
}

/// Owns the single persistent connection of a session.
///
/// The background task reconnects forever with bounded exponential backoff,
/// keeps the heartbeat going while connected, and replays every tracked
/// room after each successful connect.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    rooms: Arc<RoomMembership>,
    status: watch::Sender<bool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    active: Mutex<Option<ActiveConnection>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
        rooms: Arc<RoomMembership>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (status, _) = watch::channel(false);
        Self {
            connector,
            settings,
            rooms,
            status,
            events,
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the connection task. A no-op while one is already running,
    /// whether it is connected or still retrying. Returns `true` when a new
    /// task was started.
    pub fn connect(&self, endpoint: impl Into<String>, credential: impl Into<String>) -> bool {
        let mut active = self.active();
        if active.as_ref().is_some_and(|a| !a.task.is_finished()) {
            debug!("ws: connect ignored, connection task already running");
            return false;
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            Arc::clone(&self.connector),
            endpoint.into(),
            credential.into(),
            self.settings.clone(),
            Arc::clone(&self.rooms),
            self.status.clone(),
            self.events.clone(),
            commands_rx,
        ));
        *active = Some(ActiveConnection { commands, task });
        true
    }

    /// Stops the connection task and waits for it to close the socket.
    /// Room membership is left untouched.
    pub async fn disconnect(&self) {
        let active = self.active().take();
        if let Some(active) = active {
            let _ = active.commands.send(ConnectionCommand::Shutdown);
            if let Err(err) = active.task.await {
                if !err.is_cancelled() {
                    warn!("ws: connection task ended abnormally: {err}");
                }
            }
        }
        self.status.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    pub fn rooms(&self) -> &Arc<RoomMembership> {
        &self.rooms
    }

    /// Tracks the room and joins it right away when connected; otherwise the
    /// next successful connect replays it.
    pub fn join_room(&self, room: RoomRef) {
        if self.rooms.add(room.clone()) {
            self.command(ConnectionCommand::Join(room));
        }
    }

    pub fn leave_room(&self, room: RoomRef) {
        if self.rooms.remove(&room) {
            self.command(ConnectionCommand::Leave(room));
        }
    }

    /// Queues a frame for the live session.
    pub fn send(&self, frame: ClientFrame) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.command(ConnectionCommand::Send(frame));
        Ok(())
    }

    fn command(&self, command: ConnectionCommand) {
        if let Some(active) = self.active().as_ref() {
            let _ = active.commands.send(command);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active().take() {
            active.task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    connector: Arc<dyn Connector>,
    endpoint: String,
    credential: String,
    settings: ConnectionSettings,
    rooms: Arc<RoomMembership>,
    status: watch::Sender<bool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
) {
    let mut attempt: u32 = 0;
    loop {
        let connect = tokio::time::timeout(
            settings.connect_timeout,
            connector.connect(&endpoint, &credential),
        );
        tokio::pin!(connect);

        // Membership changes made while connecting are picked up by the
        // replay, so only shutdown matters here.
        let result = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = commands.recv() => match command {
                    None | Some(ConnectionCommand::Shutdown) => return,
                    Some(_) => {}
                },
            }
        };

        match result {
            Ok(Ok(link)) => {
                attempt = 0;
                info!(endpoint = %endpoint, "ws: connected");
                status.send_replace(true);
                let _ = events.send(TransportEvent::Connected);

                let end = run_session(link, &settings, &rooms, &events, &mut commands).await;
                status.send_replace(false);
                match end {
                    SessionEnd::Shutdown => {
                        info!(endpoint = %endpoint, "ws: disconnected by client");
                        let _ = events.send(TransportEvent::Disconnected {
                            reason: "client disconnect".into(),
                        });
                        return;
                    }
                    SessionEnd::Lost(reason) => {
                        warn!(endpoint = %endpoint, "ws: connection lost: {reason}");
                        let _ = events.send(TransportEvent::Disconnected { reason });
                    }
                }
            }
            Ok(Err(err)) => {
                warn!(endpoint = %endpoint, attempt, "ws: connect failed: {err:#}");
                let _ = events.send(TransportEvent::ConnectFailed {
                    error: format!("{err:#}"),
                });
            }
            Err(_) => {
                warn!(endpoint = %endpoint, attempt, "ws: connect timed out after {:?}", settings.connect_timeout);
                let _ = events.send(TransportEvent::ConnectFailed {
                    error: format!("connect timed out after {:?}", settings.connect_timeout),
                });
            }
        }

        let delay = backoff_delay(
            attempt,
            settings.reconnect_delay_floor,
            settings.reconnect_delay_ceiling,
        );
        attempt = attempt.saturating_add(1);
        debug!("ws: reconnecting in {delay:?}");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    None | Some(ConnectionCommand::Shutdown) => return,
                    Some(_) => {}
                },
            }
        }
    }
}

async fn run_session(
    link: TransportLink,
    settings: &ConnectionSettings,
    rooms: &RoomMembership,
    events: &mpsc::UnboundedSender<TransportEvent>,
    commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
) -> SessionEnd {
    let TransportLink {
        outbound,
        mut inbound,
    } = link;

    // Commands queued before the snapshot is taken are already reflected in
    // it; `joined` filters them so every room is joined once per session.
    let replay = rooms.snapshot();
    info!(rooms = replay.len(), "ws: replaying room membership");
    for room in &replay {
        if outbound.send(ClientFrame::join(room)).is_err() {
            return SessionEnd::Lost("outbound channel closed during replay".into());
        }
    }
    let mut joined: HashSet<RoomRef> = replay.into_iter().collect();

    let interval = settings.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            inbound_frame = inbound.recv() => match inbound_frame {
                Some(text) => {
                    let _ = events.send(TransportEvent::Frame(text));
                    continue;
                }
                None => return SessionEnd::Lost("connection closed by peer".into()),
            },
            _ = heartbeat.tick() => ClientFrame::HeartbeatAck,
            command = commands.recv() => match command {
                Some(ConnectionCommand::Shutdown) | None => return SessionEnd::Shutdown,
                Some(command) => match session_frame(&mut joined, command) {
                    Some(frame) => frame,
                    None => continue,
                },
            },
        };

        if outbound.send(frame).is_err() {
            return SessionEnd::Lost("outbound channel closed".into());
        }
    }
}

/// Frame to write for `command`, given the rooms this session has joined.
/// Joins of a joined room and leaves of a room never joined write nothing.
fn session_frame(
    joined: &mut HashSet<RoomRef>,
    command: ConnectionCommand,
) -> Option<ClientFrame> {
    match command {
        ConnectionCommand::Join(room) => joined
            .insert(room.clone())
            .then(|| ClientFrame::join(&room)),
        ConnectionCommand::Leave(room) => joined
            .remove(&room)
            .then(|| ClientFrame::leave(&room)),
        ConnectionCommand::Send(frame) => Some(frame),
        ConnectionCommand::Shutdown => None,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
