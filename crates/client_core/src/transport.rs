use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::ClientFrame;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::connection::{Connector, TransportLink};

/// Websocket [`Connector`]. The credential travels as a `token` query
/// parameter on the upgrade request.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

pub fn socket_url(endpoint: &str, credential: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint).with_context(|| format!("invalid socket url: {endpoint}"))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        anyhow::bail!("socket url must use ws:// or wss://, got {endpoint}");
    }
    if !credential.is_empty() {
        url.query_pairs_mut().append_pair("token", credential);
    }
    Ok(url)
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str, credential: &str) -> Result<TransportLink> {
        let url = socket_url(endpoint, credential)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {endpoint}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("ws: failed to encode outbound frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("ws: send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("ws: server closed connection: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("ws: receive failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(TransportLink { outbound, inbound })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
