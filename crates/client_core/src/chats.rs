use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{Chat, ChatId, UserId},
    protocol::{ChatResponse, MessageResponse},
};
use storage::Storage;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::{
    api::{chat_from_response, timestamp_millis, ChatBackend},
    collection::{CacheTier, CollectionSnapshot, LivePlacement, PageSource, SyncEntity, SyncedCollection},
    error::ClientResult,
    token_store::TokenStore,
};

pub const DEFAULT_CHAT_PAGE_SIZE: u32 = 20;

impl SyncEntity for Chat {
    type Key = ChatId;

    fn key(&self) -> ChatId {
        self.chat_id
    }

    fn live_placement() -> LivePlacement {
        LivePlacement::Front
    }
}

pub struct ChatPages {
    backend: Arc<dyn ChatBackend>,
}

impl ChatPages {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PageSource<Chat> for ChatPages {
    async fn fetch_page(&self, offset: u32, limit: u32) -> ClientResult<Vec<Chat>> {
        let page = self.backend.fetch_chats(offset, limit).await?;
        Ok(page.iter().map(chat_from_response).collect())
    }
}

pub struct ChatCache {
    storage: Storage,
    limit: u32,
}

impl ChatCache {
    pub fn new(storage: Storage, limit: u32) -> Self {
        Self { storage, limit }
    }
}

#[async_trait]
impl CacheTier<Chat> for ChatCache {
    async fn load(&self) -> Result<Vec<Chat>> {
        self.storage.list_chats(self.limit).await
    }

    async fn replace(&self, items: &[Chat]) -> Result<()> {
        self.storage.replace_chats(items, self.limit).await
    }

    async fn upsert(&self, item: &Chat) -> Result<()> {
        self.storage.upsert_chat(item, self.limit).await
    }
}

/// The global chat list. Lives as long as the session.
#[derive(Clone)]
pub struct ChatList {
    collection: Arc<SyncedCollection<Chat>>,
    backend: Arc<dyn ChatBackend>,
    tokens: Arc<TokenStore>,
}

impl ChatList {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        cache: Arc<dyn CacheTier<Chat>>,
        tokens: Arc<TokenStore>,
        page_size: u32,
    ) -> Self {
        let source: Arc<dyn PageSource<Chat>> = Arc::new(ChatPages::new(Arc::clone(&backend)));
        Self {
            collection: SyncedCollection::new("chats", page_size, source, cache),
            backend,
            tokens,
        }
    }

    pub fn collection(&self) -> &Arc<SyncedCollection<Chat>> {
        &self.collection
    }

    pub fn subscribe(&self) -> WatchStream<CollectionSnapshot<Chat>> {
        self.collection.subscribe()
    }

    pub fn snapshot(&self) -> CollectionSnapshot<Chat> {
        self.collection.snapshot()
    }

    pub async fn refresh(&self) -> ClientResult<()> {
        self.collection.refresh().await
    }

    pub async fn load_next_page(&self) -> ClientResult<()> {
        self.collection.load_next_page().await
    }

    /// Drops the in-memory list when the session that loaded it ends.
    pub async fn reset(&self) {
        self.collection.reset().await;
    }

    pub async fn find(&self, chat_id: ChatId) -> Option<Chat> {
        self.collection.find(&chat_id).await
    }

    /// Moves the chat to the front with the message as its last activity.
    /// Returns false when the chat is not in the list.
    pub async fn record_message(&self, message: &MessageResponse) -> bool {
        let Some(chat) = self.collection.find(&message.chat_id).await else {
            return false;
        };
        let sender_name = match self.tokens.current_user().await {
            Some(me) if me.user_id == message.sender_id => me.display_name,
            _ => chat.companion_name.clone(),
        };
        let timestamp = timestamp_millis(Some(&message.created_at));
        let bumped = chat.with_last_message(message.text.clone(), sender_name, timestamp);
        self.collection.apply_live(bumped).await;
        true
    }

    pub async fn apply_chat_update(&self, update: &ChatResponse) {
        debug!(chat_id = %update.id, "sync: chat update");
        self.collection.apply_live(chat_from_response(update)).await;
    }

    /// Creates the chat with `companion_id`, or fetches the existing one, and
    /// makes sure it is in the list.
    pub async fn open_chat_with(&self, companion_id: UserId) -> ClientResult<Chat> {
        let response = self.backend.create_chat(companion_id).await?;
        let chat = chat_from_response(&response);
        let existing = self
            .collection
            .update_entry(&chat.chat_id, |entry| *entry = chat.clone())
            .await;
        if existing.is_none() {
            self.collection.apply_live(chat.clone()).await;
        }
        Ok(chat)
    }
}

#[cfg(test)]
#[path = "tests/chats_tests.rs"]
mod tests;
