use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ChatId, LocalMessageId, Message, MessageKey, MessageStatus, TypingState},
    protocol::{EditOp, MessageResponse},
};
use storage::Storage;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

use crate::{
    api::{message_from_response, ChatBackend},
    collection::{CacheTier, CollectionSnapshot, LivePlacement, PageSource, SyncEntity, SyncedCollection},
    error::{ClientError, ClientResult},
    token_store::TokenStore,
    typing::{TypingReconciler, TypingSink},
};

pub const DEFAULT_MESSAGE_PAGE_SIZE: u32 = 50;

impl SyncEntity for Message {
    type Key = MessageKey;

    fn key(&self) -> MessageKey {
        self.key
    }

    fn live_placement() -> LivePlacement {
        LivePlacement::Sorted
    }

    fn normalize(items: &mut Vec<Self>) {
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
    }

    fn is_local_only(&self) -> bool {
        self.key.is_pending()
    }
}

pub struct MessagePages {
    backend: Arc<dyn ChatBackend>,
    tokens: Arc<TokenStore>,
    chat_id: ChatId,
    companion_name: String,
}

#[async_trait]
impl PageSource<Message> for MessagePages {
    async fn fetch_page(&self, offset: u32, limit: u32) -> ClientResult<Vec<Message>> {
        let page = self
            .backend
            .fetch_messages(self.chat_id, offset, limit)
            .await?;
        let me = self.tokens.current_user().await;
        Ok(page
            .iter()
            .map(|m| message_from_response(m, me.as_ref(), &self.companion_name))
            .collect())
    }
}

pub struct MessageCache {
    storage: Storage,
    chat_id: ChatId,
    limit: u32,
}

impl MessageCache {
    pub fn new(storage: Storage, chat_id: ChatId, limit: u32) -> Self {
        Self {
            storage,
            chat_id,
            limit,
        }
    }
}

#[async_trait]
impl CacheTier<Message> for MessageCache {
    async fn load(&self) -> Result<Vec<Message>> {
        self.storage.list_messages(self.chat_id, self.limit).await
    }

    async fn replace(&self, items: &[Message]) -> Result<()> {
        self.storage
            .replace_messages(self.chat_id, items, self.limit)
            .await
    }

    async fn upsert(&self, item: &Message) -> Result<()> {
        self.storage.upsert_message(item, self.limit).await?;
        Ok(())
    }
}

pub struct ThreadOptions {
    pub page_size: u32,
    pub typing_debounce: Duration,
}

/// An open chat: its message collection plus the typing indicator. Closing it
/// cancels the debounce and drops late results.
pub struct MessageThread {
    chat_id: ChatId,
    companion_name: String,
    collection: Arc<SyncedCollection<Message>>,
    typing: TypingReconciler,
    backend: Arc<dyn ChatBackend>,
    tokens: Arc<TokenStore>,
}

impl MessageThread {
    pub fn new(
        chat_id: ChatId,
        companion_name: impl Into<String>,
        backend: Arc<dyn ChatBackend>,
        cache: Arc<dyn CacheTier<Message>>,
        typing_sink: Arc<dyn TypingSink>,
        tokens: Arc<TokenStore>,
        options: ThreadOptions,
    ) -> Self {
        let companion_name = companion_name.into();
        let source: Arc<dyn PageSource<Message>> = Arc::new(MessagePages {
            backend: Arc::clone(&backend),
            tokens: Arc::clone(&tokens),
            chat_id,
            companion_name: companion_name.clone(),
        });
        Self {
            chat_id,
            collection: SyncedCollection::new(
                format!("chat:{chat_id}"),
                options.page_size,
                source,
                cache,
            ),
            typing: TypingReconciler::new(chat_id, typing_sink, options.typing_debounce),
            companion_name,
            backend,
            tokens,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn companion_name(&self) -> &str {
        &self.companion_name
    }

    pub fn collection(&self) -> &Arc<SyncedCollection<Message>> {
        &self.collection
    }

    pub fn typing(&self) -> &TypingReconciler {
        &self.typing
    }

    pub fn subscribe(&self) -> WatchStream<CollectionSnapshot<Message>> {
        self.collection.subscribe()
    }

    pub fn subscribe_typing(&self) -> WatchStream<TypingState> {
        self.typing.subscribe()
    }

    pub fn snapshot(&self) -> CollectionSnapshot<Message> {
        self.collection.snapshot()
    }

    pub async fn refresh(&self) -> ClientResult<()> {
        self.collection.refresh().await
    }

    pub async fn load_next_page(&self) -> ClientResult<()> {
        self.collection.load_next_page().await
    }

    pub fn local_text_changed(&self, text: impl Into<String>) {
        self.typing.local_text_changed(text);
    }

    pub fn apply_remote_typing(&self, operations: &[EditOp]) {
        self.typing.apply_remote(operations);
    }

    pub fn clear_remote_typing(&self) {
        self.typing.clear_remote();
    }

    /// Shows the message immediately as `Sending`, then reconciles it with the
    /// server's copy or marks it `Failed` in place.
    pub async fn send(&self, text: &str) -> ClientResult<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Validation("message must not be blank".into()));
        }
        let me = self
            .tokens
            .current_user()
            .await
            .ok_or(ClientError::NotLoggedIn)?;

        self.typing.cancel_pending();
        let local_id = LocalMessageId::new();
        let optimistic = Message {
            key: MessageKey::Pending(local_id),
            chat_id: self.chat_id,
            sender_id: me.user_id,
            sender_name: me.display_name.clone(),
            text: text.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            is_mine: true,
            status: MessageStatus::Sending,
        };
        self.collection.push_local(optimistic).await?;
        self.deliver(local_id, text).await
    }

    /// Re-sends a `Failed` message under the same local id.
    pub async fn retry_send(&self, local_id: LocalMessageId) -> ClientResult<Message> {
        let key = MessageKey::Pending(local_id);
        let mut was_failed = false;
        let entry = self
            .collection
            .update_entry(&key, |message| {
                was_failed = message.status == MessageStatus::Failed;
                if was_failed {
                    message.status = MessageStatus::Sending;
                }
            })
            .await
            .ok_or_else(|| ClientError::Validation("no such pending message".into()))?;
        if !was_failed {
            return Err(ClientError::Validation("message is not in a failed state".into()));
        }
        self.deliver(local_id, &entry.text).await
    }

    async fn deliver(&self, local_id: LocalMessageId, text: &str) -> ClientResult<Message> {
        let key = MessageKey::Pending(local_id);
        match self.backend.send_message(self.chat_id, text).await {
            Ok(response) => {
                let me = self.tokens.current_user().await;
                let confirmed = message_from_response(&response, me.as_ref(), &self.companion_name);
                self.collection.replace_entry(&key, confirmed.clone()).await;
                debug!(chat_id = %self.chat_id, message_id = %response.id, "sync: send confirmed");
                Ok(confirmed)
            }
            Err(err) => {
                info!(chat_id = %self.chat_id, "sync: send failed: {err}");
                self.collection
                    .update_entry(&key, |message| message.status = MessageStatus::Failed)
                    .await;
                Err(err)
            }
        }
    }

    /// Merges a pushed message. A message from the companion ends their
    /// typing indicator.
    pub async fn apply_live_message(&self, response: &MessageResponse) {
        let me = self.tokens.current_user().await;
        let message = message_from_response(response, me.as_ref(), &self.companion_name);
        let from_companion = !message.is_mine;
        self.collection.apply_live(message).await;
        if from_companion {
            self.typing.clear_remote();
        }
    }

    pub async fn close(&self) {
        self.typing.close();
        self.collection.close().await;
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
