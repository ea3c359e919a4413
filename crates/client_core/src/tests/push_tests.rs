use std::{collections::HashMap, time::Duration};

use axum::{
    extract::{
        ws::{CloseFrame, Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::domain::{MessageId, UserId};
use tokio::{net::TcpListener, sync::mpsc};

use super::*;

const NEW_MESSAGE: &str = r#"{"type":"new_message","data":{"id":5,"chat_id":2,"sender_id":8,"text":"hi","created_at":"2024-05-01T10:00:00Z"}}"#;

fn insert(position: usize, text: &str) -> EditOp {
    EditOp::Insert {
        position,
        text: text.into(),
    }
}

#[test]
fn parses_new_message() {
    let event = parse_frame(NEW_MESSAGE).expect("valid").expect("event");
    match event {
        PushEvent::NewMessage(message) => {
            assert_eq!(message.id, MessageId(5));
            assert_eq!(message.chat_id, ChatId(2));
            assert_eq!(message.sender_id, UserId(8));
            assert_eq!(message.text, "hi");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn parses_chat_update() {
    let raw = r#"{"type":"chat_update","data":{"id":3,"other_user":{"id":9,"login":"bob","display_name":"Bob"},"created_at":"2024-01-01T00:00:00Z"}}"#;
    match parse_frame(raw).expect("valid").expect("event") {
        PushEvent::ChatUpdate(chat) => {
            assert_eq!(chat.id, ChatId(3));
            assert_eq!(chat.other_user.display_name, "Bob");
            assert!(chat.last_message.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn typing_fields_may_be_nested_or_top_level() {
    let nested = r#"{"type":"typing","data":{"chat_id":4,"operations":[{"type":"insert","position":0,"text":"he"}]}}"#;
    let flat = r#"{"type":"typing","chat_id":4,"operations":[{"type":"insert","position":0,"text":"he"}]}"#;
    let expected = PushEvent::Typing {
        chat_id: ChatId(4),
        operations: vec![insert(0, "he")],
    };

    assert_eq!(parse_frame(nested).expect("nested"), Some(expected.clone()));
    assert_eq!(parse_frame(flat).expect("flat"), Some(expected));
}

#[test]
fn typing_operations_tolerate_missing_fields() {
    let raw = r#"{"type":"typing","chat_id":4,"operations":[{"type":"delete","position":2},{"type":"clear"}]}"#;

    assert_eq!(
        parse_frame(raw).expect("valid"),
        Some(PushEvent::Typing {
            chat_id: ChatId(4),
            operations: vec![
                EditOp::Delete {
                    position: 2,
                    length: 0
                },
                EditOp::Clear
            ],
        })
    );
}

#[test]
fn greetings_and_unknown_kinds_carry_nothing() {
    assert_eq!(parse_frame("connected").expect("greeting"), None);
    assert_eq!(
        parse_frame(r#"{"type":"presence","data":{"user_id":1}}"#).expect("unknown"),
        None
    );
}

#[test]
fn undecodable_frames_are_errors() {
    assert!(matches!(parse_frame("{not json"), Err(FrameError::Json(_))));
    assert!(matches!(
        parse_frame(r#"{"type":"new_message"}"#),
        Err(FrameError::MissingData { .. })
    ));
    assert!(matches!(
        parse_frame(r#"{"type":"new_message","data":{"id":"five"}}"#),
        Err(FrameError::MalformedData { .. })
    ));
    assert!(matches!(
        parse_frame(r#"{"type":"typing","operations":[]}"#),
        Err(FrameError::MissingData { .. })
    ));
}

#[derive(Clone)]
struct WsState {
    seen: mpsc::UnboundedSender<String>,
    hold_open: bool,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    let _ = state
        .seen
        .send(format!("token={}", params.get("token").cloned().unwrap_or_default()));
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: WsState) {
    for frame in ["connected", "{not json", NEW_MESSAGE] {
        if socket
            .send(AxumWsMessage::Text(frame.to_string()))
            .await
            .is_err()
        {
            return;
        }
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let AxumWsMessage::Text(text) = message {
            let _ = state.seen.send(text);
            if !state.hold_open {
                break;
            }
        }
    }
    if !state.hold_open {
        let _ = socket
            .send(AxumWsMessage::Close(Some(CloseFrame {
                code: 1000,
                reason: "bye".into(),
            })))
            .await;
    }
}

async fn spawn_ws_server(hold_open: bool) -> (String, mpsc::UnboundedReceiver<String>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let (seen, seen_rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(WsState { seen, hold_open });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("ws://{addr}/ws"), seen_rx)
}

async fn next_event(events: &mut broadcast::Receiver<PushEvent>) -> PushEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

#[tokio::test]
async fn delivers_frames_sends_typing_and_reports_close() {
    let (ws_url, mut seen) = spawn_ws_server(false).await;
    let push = PushConnection::new(ws_url);
    let mut events = push.subscribe();

    push.open("tok-1").await.expect("open");

    assert_eq!(seen.recv().await.as_deref(), Some("token=tok-1"));
    assert_eq!(next_event(&mut events).await, PushEvent::ConnectionOpened);
    match next_event(&mut events).await {
        PushEvent::NewMessage(message) => assert_eq!(message.id, MessageId(5)),
        other => panic!("garbage should have been dropped, got {other:?}"),
    }

    push.send_typing(ChatId(4), &[insert(0, "he")])
        .await
        .expect("typing sent");
    let typed = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("typing in time")
        .expect("frame");
    let typed: serde_json::Value = serde_json::from_str(&typed).expect("json");
    assert_eq!(typed["type"], "typing");
    assert_eq!(typed["chat_id"], 4);
    assert_eq!(typed["operations"][0]["type"], "insert");
    assert_eq!(typed["operations"][0]["text"], "he");

    assert_eq!(
        next_event(&mut events).await,
        PushEvent::ConnectionClosed {
            reason: Some("bye".into())
        }
    );
}

#[tokio::test]
async fn local_close_reports_connection_closed() {
    let (ws_url, _seen) = spawn_ws_server(true).await;
    let push = PushConnection::new(ws_url);
    let mut events = push.subscribe();
    push.open("tok-2").await.expect("open");
    assert_eq!(next_event(&mut events).await, PushEvent::ConnectionOpened);
    assert!(push.is_open().await);

    push.close().await;

    loop {
        match next_event(&mut events).await {
            PushEvent::ConnectionClosed { .. } => break,
            PushEvent::NewMessage(_) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(!push.is_open().await);
}

#[tokio::test]
async fn typing_requires_an_open_connection() {
    let push = PushConnection::new("ws://127.0.0.1:9/ws");

    let err = push
        .send_typing(ChatId(1), &[insert(0, "x")])
        .await
        .expect_err("not open");

    assert!(matches!(err, ClientError::Network(_)));
}
