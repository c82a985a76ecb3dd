pub mod config;
pub mod connection;
pub mod dedup;
pub mod enrichment;
pub mod error;
pub mod reconciler;
pub mod rest;
pub mod rooms;
pub mod service;
pub mod transport;

pub use config::{load_settings, SyncSettings};
pub use connection::{ConnectionManager, Connector, TransportEvent, TransportLink};
pub use error::SyncError;
pub use reconciler::{MergeOutcome, Reconciler};
pub use rest::{ConversationApi, HttpConversationApi, MissingConversationApi};
pub use service::{ConversationSyncService, Subscription, SyncEvent};
pub use transport::WsConnector;
