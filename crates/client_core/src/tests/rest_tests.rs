use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::Mutex};

use super::*;

#[derive(Clone, Default)]
struct ServerState {
    hits: Arc<AtomicUsize>,
    read_requests: Arc<Mutex<Vec<(String, Value, Option<String>)>>>,
}

async fn handle_conversations(
    State(state): State<ServerState>,
    Query(query): Query<std::collections::HashMap<String, String>>,
) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    assert_eq!(query.get("username").map(String::as_str), Some("alice"));
    Json(json!({
        "conversations": [
            {
                "_id": "c1",
                "participants": [
                    { "username": "alice" },
                    { "username": "bob", "name": "Bob", "profilePicture": "https://cdn/bob.png" }
                ],
                "last_message": {
                    "sender_username": "bob",
                    "content": "hey",
                    "created_at": "2024-05-01T10:00:00Z"
                },
                "unreadCount": 2
            },
            {
                "id": 77,
                "type": "community",
                "communityId": "k1",
                "name": "Town square",
                "unread_count": -4
            },
            { "participants": [] }
        ]
    }))
}

async fn handle_failing(State(state): State<ServerState>) -> (StatusCode, Json<Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "code": "internal", "message": "database down" })),
    )
}

async fn handle_user(Path(username): Path<String>) -> Json<Value> {
    Json(json!({ "user": { "username": username, "displayName": "Carol C", "avatarUrl": "https://cdn/c.png" } }))
}

async fn handle_mark_read(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.read_requests.lock().await.push((id, body, auth));
    StatusCode::NO_CONTENT
}

async fn spawn_api_server(router: Router<ServerState>) -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ServerState::default();
    let app = router.with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn api(base_url: &str) -> HttpConversationApi {
    HttpConversationApi::new(base_url, Some("secret-token".into()), Duration::from_secs(2))
        .expect("client")
}

#[tokio::test]
async fn snapshot_decodes_aliased_records_and_skips_unidentified_ones() {
    let (url, state) =
        spawn_api_server(Router::new().route("/conversations", get(handle_conversations))).await;

    let conversations = api(&url).conversations("alice").await.expect("snapshot");

    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    assert_eq!(conversations.len(), 2);

    let c1 = &conversations[0];
    assert_eq!(c1.id, ConversationId::from("c1"));
    assert_eq!(c1.kind, ConversationKind::Direct);
    assert_eq!(c1.unread_count, 2);
    let bob = c1.participant("bob").expect("bob");
    assert_eq!(bob.avatar_url.as_deref(), Some("https://cdn/bob.png"));
    let last = c1.last_message.as_ref().expect("last message");
    assert_eq!(last.sender_username, "bob");

    let community = &conversations[1];
    assert_eq!(community.id, ConversationId::from("77"));
    assert_eq!(community.room, RoomRef::Community("k1".into()));
    assert_eq!(community.title.as_deref(), Some("Town square"));
    assert_eq!(community.unread_count, 0);
}

#[tokio::test]
async fn server_errors_are_not_retried() {
    let (url, state) =
        spawn_api_server(Router::new().route("/conversations", get(handle_failing))).await;

    let err = api(&url).conversations("alice").await.expect_err("must fail");

    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::Rest { status, detail }) => {
            assert_eq!(*status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(
                detail.as_ref().map(|d| d.message.as_str()),
                Some("database down")
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn dropped_connections_are_retried_exactly_once() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    let result = api(&format!("http://{addr}")).conversations("alice").await;

    assert!(result.is_err());
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn user_lookup_unwraps_envelope() {
    let (url, _) = spawn_api_server(Router::new().route("/users/:username", get(handle_user))).await;

    let user = api(&url).user_by_username("carol").await.expect("user");

    assert_eq!(user.username, "carol");
    assert_eq!(user.display_name.as_deref(), Some("Carol C"));
}

#[tokio::test]
async fn mark_all_read_posts_username_with_bearer_token() {
    let (url, state) = spawn_api_server(
        Router::new().route("/conversations/:id/read", post(handle_mark_read)),
    )
    .await;

    api(&url)
        .mark_all_read(&ConversationId::from("c1"), "alice")
        .await
        .expect("mark read");

    let requests = state.read_requests.lock().await;
    assert_eq!(requests.len(), 1);
    let (id, body, auth) = &requests[0];
    assert_eq!(id, "c1");
    assert_eq!(body, &json!({ "username": "alice" }));
    assert_eq!(auth.as_deref(), Some("Bearer secret-token"));
}

#[test]
fn snapshot_must_be_a_list() {
    assert!(decode_snapshot(&json!({ "error": "nope" })).is_err());
    assert!(decode_snapshot(&json!([])).expect("empty").is_empty());
}

#[test]
fn last_message_without_timestamp_is_dropped() {
    let record = json!({
        "id": "c3",
        "lastMessage": { "senderUsername": "bob", "content": "?" }
    });
    let conversation = decode_conversation(&record).expect("conversation");
    assert!(conversation.last_message.is_none());
}

#[test]
fn unparseable_last_message_timestamp_uses_a_later_alias() {
    let record = json!({
        "id": "c4",
        "lastMessage": {
            "senderUsername": "bob",
            "content": "later",
            "sentAt": "yesterday-ish",
            "createdAt": 1_714_557_600_000_i64
        }
    });
    let conversation = decode_conversation(&record).expect("conversation");
    let message = conversation.last_message.expect("last message");
    assert_eq!(message.sent_at.timestamp(), 1_714_557_600);
}
