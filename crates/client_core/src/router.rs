use std::{collections::HashMap, sync::Arc};

use shared::{domain::ChatId, protocol::PushEvent};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{chats::ChatList, messages::MessageThread};

/// Dispatches push events to the chat list and to whichever chat threads are
/// currently open. Events are handled one at a time in arrival order.
pub struct EventRouter {
    chat_list: ChatList,
    threads: RwLock<HashMap<ChatId, Arc<MessageThread>>>,
}

impl EventRouter {
    pub fn new(chat_list: ChatList) -> Self {
        Self {
            chat_list,
            threads: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, thread: Arc<MessageThread>) {
        let chat_id = thread.chat_id();
        if let Some(previous) = self.threads.write().await.insert(chat_id, thread) {
            previous.close().await;
        }
        debug!(chat_id = %chat_id, "router: thread registered");
    }

    pub async fn unregister(&self, chat_id: ChatId) -> Option<Arc<MessageThread>> {
        let removed = self.threads.write().await.remove(&chat_id);
        if removed.is_some() {
            debug!(chat_id = %chat_id, "router: thread unregistered");
        }
        removed
    }

    pub async fn thread(&self, chat_id: ChatId) -> Option<Arc<MessageThread>> {
        self.threads.read().await.get(&chat_id).cloned()
    }

    pub async fn open_threads(&self) -> Vec<ChatId> {
        self.threads.read().await.keys().copied().collect()
    }

    pub async fn route(&self, event: PushEvent) {
        match event {
            PushEvent::ConnectionOpened => {}
            PushEvent::NewMessage(message) => {
                if !self.chat_list.record_message(&message).await {
                    debug!(chat_id = %message.chat_id, "router: message for unknown chat, refreshing list");
                    let chat_list = self.chat_list.clone();
                    tokio::spawn(async move {
                        if let Err(err) = chat_list.refresh().await {
                            warn!("router: chat list refresh failed: {err}");
                        }
                    });
                }
                if let Some(thread) = self.thread(message.chat_id).await {
                    thread.apply_live_message(&message).await;
                }
            }
            PushEvent::ChatUpdate(chat) => self.chat_list.apply_chat_update(&chat).await,
            PushEvent::Typing {
                chat_id,
                operations,
            } => match self.thread(chat_id).await {
                Some(thread) => thread.apply_remote_typing(&operations),
                None => debug!(chat_id = %chat_id, "router: typing for unobserved chat"),
            },
            PushEvent::ConnectionClosed { .. } => {
                for thread in self.threads.read().await.values() {
                    thread.clear_remote_typing();
                }
            }
        }
    }

    /// Recovery after events were skipped. Remote typing buffers can no longer
    /// be trusted, and every open view refetches its first page.
    pub async fn resync(&self) {
        let threads: Vec<Arc<MessageThread>> = self.threads.read().await.values().cloned().collect();
        for thread in &threads {
            thread.clear_remote_typing();
        }
        if let Err(err) = self.chat_list.refresh().await {
            warn!("router: chat list resync failed: {err}");
        }
        for thread in threads {
            if let Err(err) = thread.refresh().await {
                warn!(chat_id = %thread.chat_id(), "router: thread resync failed: {err}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
