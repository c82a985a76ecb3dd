use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use shared::domain::ConversationId;
use tokio::net::TcpListener;

use super::*;

#[derive(Clone)]
struct WsState {
    tokens: mpsc::UnboundedSender<Option<String>>,
    received: mpsc::UnboundedSender<String>,
    close_after_greeting: bool,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let token = query.get("token").cloned();
    ws.on_upgrade(move |socket| ws_connection(state, socket, token))
}

async fn ws_connection(state: WsState, socket: WebSocket, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let _ = state.tokens.send(token);
    let _ = sender
        .send(WsMessage::Text(r#"{"event":"heartbeat"}"#.to_string()))
        .await;
    if state.close_after_greeting {
        let _ = sender.close().await;
        return;
    }
    while let Some(Ok(msg)) = receiver.next().await {
        if let WsMessage::Text(text) = msg {
            let _ = state.received.send(text);
        }
    }
}

struct SocketServer {
    url: String,
    tokens: mpsc::UnboundedReceiver<Option<String>>,
    received: mpsc::UnboundedReceiver<String>,
}

async fn spawn_socket_server(close_after_greeting: bool) -> SocketServer {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tokens_tx, tokens) = mpsc::unbounded_channel();
    let (received_tx, received) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(WsState {
            tokens: tokens_tx,
            received: received_tx,
            close_after_greeting,
        });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    SocketServer {
        url: format!("ws://{addr}/ws"),
        tokens,
        received,
    }
}

#[test]
fn socket_url_appends_credential() {
    let url = socket_url("ws://chat.test/ws", "abc def").expect("url");
    assert_eq!(url.as_str(), "ws://chat.test/ws?token=abc+def");

    let bare = socket_url("wss://chat.test/ws", "").expect("url");
    assert_eq!(bare.query(), None);
}

#[test]
fn socket_url_rejects_http_and_garbage() {
    assert!(socket_url("http://chat.test/ws", "t").is_err());
    assert!(socket_url("not a url", "t").is_err());
}

#[tokio::test]
async fn frames_flow_both_ways() {
    let mut server = spawn_socket_server(false).await;

    let mut link = WsConnector
        .connect(&server.url, "abc")
        .await
        .expect("connect");

    assert_eq!(
        server.tokens.recv().await.expect("token"),
        Some("abc".to_string())
    );
    assert_eq!(
        link.inbound.recv().await.as_deref(),
        Some(r#"{"event":"heartbeat"}"#)
    );

    link.outbound
        .send(ClientFrame::JoinConversation {
            conversation_id: ConversationId::from("c1"),
        })
        .expect("send");
    let text = server.received.recv().await.expect("frame");
    let value: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(
        value,
        json!({ "event": "join_conversation", "data": { "conversationId": "c1" } })
    );
}

#[tokio::test]
async fn server_close_ends_inbound_stream() {
    let server = spawn_socket_server(true).await;

    let mut link = WsConnector
        .connect(&server.url, "abc")
        .await
        .expect("connect");

    assert!(link.inbound.recv().await.is_some());
    assert!(link.inbound.recv().await.is_none());
}

#[tokio::test]
async fn refused_connection_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let result = WsConnector.connect(&format!("ws://{addr}/ws"), "abc").await;
    assert!(result.is_err());
}
