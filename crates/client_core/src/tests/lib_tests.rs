use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::{
    domain::{MessageId, MessageKey},
    protocol::{ApiEnvelope, AuthPayload, ChatsListResponse, MessagesResponse, TokenResponse},
};
use tokio::net::TcpListener;

use super::*;
use crate::test_support::{
    chat_response, message_response, token_expiring_in, user_response, COMPANION, ME,
};

#[derive(Clone)]
struct Backend {
    access_token: String,
}

async fn login(State(backend): State<Backend>) -> Json<ApiEnvelope<AuthPayload>> {
    Json(ApiEnvelope::success(AuthPayload {
        user: user_response(ME, "Alice"),
        token: TokenResponse {
            access_token: backend.access_token,
            refresh_token: "refresh-1".into(),
        },
    }))
}

async fn logout() -> Json<Value> {
    Json(json!({ "is_success": true }))
}

async fn chats() -> Json<ApiEnvelope<ChatsListResponse>> {
    Json(ApiEnvelope::success(ChatsListResponse {
        chats: vec![chat_response(1, "Bob", Some("hi"), "2024-05-01T09:00:00Z")],
        total: 1,
        limit: 20,
        offset: 0,
    }))
}

async fn messages(Path(chat_id): Path<i64>) -> Json<ApiEnvelope<MessagesResponse>> {
    Json(ApiEnvelope::success(MessagesResponse {
        messages: vec![message_response(
            1,
            chat_id,
            COMPANION,
            "hi",
            "2024-05-01T09:00:00Z",
        )],
        total: 1,
        limit: 50,
        offset: 0,
    }))
}

async fn send_message(
    Path(chat_id): Path<i64>,
    Json(body): Json<Value>,
) -> Json<ApiEnvelope<shared::protocol::MessageResponse>> {
    let text = body["text"].as_str().unwrap_or_default().to_string();
    Json(ApiEnvelope::success(message_response(
        500,
        chat_id,
        ME,
        &text,
        "2024-05-01T10:00:00Z",
    )))
}

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(push_one_message)
}

async fn push_one_message(mut socket: WebSocket) {
    let frame = json!({
        "type": "new_message",
        "data": message_response(600, 1, COMPANION, "pushed", "2024-05-01T10:05:00Z"),
    });
    if socket
        .send(AxumWsMessage::Text(frame.to_string()))
        .await
        .is_err()
    {
        return;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_backend(access_token: String) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let app = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/chats", get(chats))
        .route("/chats/:id/messages", get(messages).post(send_message))
        .route("/ws", get(ws_handler))
        .with_state(Backend { access_token });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn full_session_against_mock_backend() {
    let server_url = spawn_backend(token_expiring_in(3600)).await;
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let settings = ClientSettings {
        server_url,
        database_url: "sqlite::memory:".into(),
        ..ClientSettings::default()
    };
    let client = ChatClient::with_storage(settings, Some(storage.clone()))
        .await
        .expect("client");

    assert!(!client.is_logged_in().await);
    assert!(matches!(
        client.connect_push().await,
        Err(ClientError::NotLoggedIn)
    ));

    let me = client.login("alice", "password1").await.expect("login");
    assert_eq!(me.display_name, "Alice");
    assert!(storage.load_session().await.expect("load").is_some());

    client.chat_list().refresh().await.expect("chats");
    let chat = client
        .chat_list()
        .find(ChatId(1))
        .await
        .expect("chat 1 listed");
    assert_eq!(chat.companion_name, "Bob");
    assert_eq!(storage.list_chats(50).await.expect("cached").len(), 1);

    let thread = client.open_chat(&chat).await;
    thread.refresh().await.expect("messages");
    let sent = thread.send("hello").await.expect("send");
    assert_eq!(sent.key, MessageKey::Confirmed(MessageId(500)));

    client.connect_push().await.expect("push");
    let pushed = MessageKey::Confirmed(MessageId(600));
    wait_for(|| {
        let thread = Arc::clone(&thread);
        async move { thread.snapshot().items.iter().any(|m| m.key == pushed) }
    })
    .await;

    let keys: Vec<MessageKey> = thread.snapshot().items.iter().map(|m| m.key).collect();
    assert_eq!(
        keys,
        vec![
            MessageKey::Confirmed(MessageId(1)),
            MessageKey::Confirmed(MessageId(500)),
            pushed
        ]
    );
    let bumped = client.chat_list().find(ChatId(1)).await.expect("chat 1");
    assert_eq!(bumped.last_message_text.as_deref(), Some("pushed"));

    client.logout().await;

    let list = client.chat_list().snapshot();
    assert!(list.items.is_empty(), "previous user's chats are gone");
    assert_eq!(list.phase, collection::SyncPhase::Empty);
    assert!(!client.is_logged_in().await);
    assert!(!client.push().is_open().await);
    assert!(client.router().open_threads().await.is_empty());
    assert!(storage.load_session().await.expect("load").is_none());
    assert!(storage.list_chats(50).await.expect("cached").is_empty());
}

#[tokio::test]
async fn opening_a_chat_with_unknown_user_reports_server_error() {
    let server_url = spawn_backend(token_expiring_in(3600)).await;
    let settings = ClientSettings {
        server_url,
        ..ClientSettings::default()
    };
    let client = ChatClient::with_storage(settings, None)
        .await
        .expect("client");
    client.login("alice", "password1").await.expect("login");

    let err = client
        .open_chat_with(UserId(404))
        .await
        .err()
        .expect("no such route");

    assert!(matches!(err, ClientError::Http { status: 405, .. }));
    assert!(client.router().open_threads().await.is_empty());
}

async fn chats_once(State(served): State<Arc<AtomicUsize>>) -> Response {
    if served.fetch_add(1, Ordering::SeqCst) == 0 {
        chats().await.into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(ApiEnvelope::<Value>::failure("token revoked")),
        )
            .into_response()
    }
}

#[tokio::test]
async fn session_expiry_drops_the_chat_list() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let access_token = token_expiring_in(3600);
    let app = Router::new()
        .route(
            "/auth/login",
            post(move || {
                let backend = Backend {
                    access_token: access_token.clone(),
                };
                async move { login(State(backend)).await }
            }),
        )
        .route("/chats", get(chats_once))
        .with_state(Arc::new(AtomicUsize::new(0)));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    let settings = ClientSettings {
        server_url: format!("http://{addr}"),
        ..ClientSettings::default()
    };
    let client = ChatClient::with_storage(settings, None)
        .await
        .expect("client");
    let mut expired = client.subscribe_session_expired();
    client.login("alice", "password1").await.expect("login");
    client.chat_list().refresh().await.expect("first page");
    assert_eq!(client.chat_list().snapshot().items.len(), 1);

    let err = client
        .chat_list()
        .refresh()
        .await
        .expect_err("revoked token");
    assert!(err.is_auth_failure());
    expired.recv().await.expect("expiry signalled");

    wait_for(|| {
        let chat_list = client.chat_list().clone();
        async move {
            let snapshot = chat_list.snapshot();
            snapshot.items.is_empty() && snapshot.phase == collection::SyncPhase::Empty
        }
    })
    .await;
    assert!(!client.is_logged_in().await);
}
