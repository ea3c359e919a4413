use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use shared::{
    domain::{ChatId, MessageId, Session, UserId, UserProfile},
    protocol::{ChatResponse, EditOp, LastMessageInfo, MessageResponse, UserResponse},
};

use crate::{
    api::ChatBackend,
    error::{ClientError, ClientResult},
    token_store::TokenStore,
    typing::TypingSink,
};

pub(crate) const ME: UserId = UserId(7);
pub(crate) const COMPANION: UserId = UserId(8);

pub(crate) fn token_expiring_at(exp: i64) -> String {
    encode(
        &Header::default(),
        &serde_json::json!({ "sub": "7", "exp": exp }),
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("token")
}

pub(crate) fn token_expiring_in(secs: i64) -> String {
    token_expiring_at(Utc::now().timestamp() + secs)
}

pub(crate) fn me() -> UserProfile {
    UserProfile {
        user_id: ME,
        username: "alice".into(),
        display_name: "Alice".into(),
    }
}

pub(crate) fn session(access_token: &str, refresh_token: &str) -> Session {
    Session {
        access_token: access_token.into(),
        refresh_token: refresh_token.into(),
        user: me(),
    }
}

pub(crate) async fn logged_in_store() -> Arc<TokenStore> {
    let tokens = Arc::new(TokenStore::in_memory());
    tokens
        .save_session(session(&token_expiring_in(3600), "refresh-1"))
        .await;
    tokens
}

pub(crate) fn user_response(id: UserId, name: &str) -> UserResponse {
    UserResponse {
        id,
        login: name.to_lowercase(),
        display_name: name.into(),
    }
}

pub(crate) fn chat_response(id: i64, companion: &str, last_text: Option<&str>, at: &str) -> ChatResponse {
    let other_user = user_response(UserId(100 + id), companion);
    ChatResponse {
        id: ChatId(id),
        last_message: last_text.map(|text| LastMessageInfo {
            text: text.into(),
            created_at: at.into(),
            sender: other_user.clone(),
        }),
        other_user,
        created_at: "2024-01-01T00:00:00Z".into(),
    }
}

pub(crate) fn message_response(id: i64, chat_id: i64, sender: UserId, text: &str, at: &str) -> MessageResponse {
    MessageResponse {
        id: MessageId(id),
        chat_id: ChatId(chat_id),
        sender_id: sender,
        text: text.into(),
        created_at: at.into(),
    }
}

/// In-process stand-in for the REST backend.
#[derive(Default)]
pub(crate) struct FakeBackend {
    pub chats: Mutex<Vec<ChatResponse>>,
    pub messages: Mutex<HashMap<ChatId, Vec<MessageResponse>>>,
    pub send_results: Mutex<VecDeque<ClientResult<MessageResponse>>>,
    pub typing: Mutex<Vec<(ChatId, Vec<EditOp>)>>,
    pub chat_fetches: AtomicUsize,
    pub message_fetches: AtomicUsize,
    pub sends: AtomicUsize,
    next_message_id: AtomicUsize,
}

impl FakeBackend {
    pub fn with_chats(chats: Vec<ChatResponse>) -> Arc<Self> {
        let backend = Self::default();
        *backend.chats.lock().expect("chats") = chats;
        Arc::new(backend)
    }

    pub fn queue_send(&self, result: ClientResult<MessageResponse>) {
        self.send_results.lock().expect("sends").push_back(result);
    }

    pub fn set_messages(&self, chat_id: ChatId, messages: Vec<MessageResponse>) {
        self.messages
            .lock()
            .expect("messages")
            .insert(chat_id, messages);
    }
}

fn page<T: Clone>(items: &[T], offset: u32, limit: u32) -> Vec<T> {
    items
        .iter()
        .skip(offset as usize)
        .take(limit as usize)
        .cloned()
        .collect()
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_chats(&self, offset: u32, limit: u32) -> ClientResult<Vec<ChatResponse>> {
        self.chat_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(page(&self.chats.lock().expect("chats"), offset, limit))
    }

    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        offset: u32,
        limit: u32,
    ) -> ClientResult<Vec<MessageResponse>> {
        self.message_fetches.fetch_add(1, Ordering::SeqCst);
        let messages = self.messages.lock().expect("messages");
        Ok(messages
            .get(&chat_id)
            .map(|items| page(items, offset, limit))
            .unwrap_or_default())
    }

    async fn send_message(&self, chat_id: ChatId, text: &str) -> ClientResult<MessageResponse> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.send_results.lock().expect("sends").pop_front() {
            return result;
        }
        let id = 1_000 + self.next_message_id.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(message_response(id, chat_id.0, ME, text, "2024-05-01T10:00:00Z"))
    }

    async fn create_chat(&self, companion_id: UserId) -> ClientResult<ChatResponse> {
        let existing = self
            .chats
            .lock()
            .expect("chats")
            .iter()
            .find(|chat| chat.other_user.id == companion_id)
            .cloned();
        existing.ok_or_else(|| ClientError::Api("user not found".into()))
    }

    async fn send_typing(&self, chat_id: ChatId, operations: &[EditOp]) -> ClientResult<()> {
        self.typing
            .lock()
            .expect("typing")
            .push((chat_id, operations.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub sent: Mutex<Vec<(ChatId, Vec<EditOp>)>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(ChatId, Vec<EditOp>)> {
        self.sent.lock().expect("sent").clone()
    }
}

#[async_trait]
impl TypingSink for RecordingSink {
    async fn send_typing(&self, chat_id: ChatId, operations: &[EditOp]) -> ClientResult<()> {
        self.sent
            .lock()
            .expect("sent")
            .push((chat_id, operations.to_vec()));
        Ok(())
    }
}
