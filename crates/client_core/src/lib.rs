use std::sync::Arc;

use reqwest::Client;
use shared::domain::{Chat, ChatId, Message, UserId, UserProfile};
use storage::Storage;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod api;
pub mod authenticator;
pub mod chats;
pub mod collection;
pub mod config;
pub mod error;
pub mod messages;
pub mod push;
pub mod router;
pub mod token_expiry;
pub mod token_store;
pub mod typing;
pub mod validation;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

use api::{ApiClient, ChatBackend, HttpRefreshTransport, USER_SEARCH_PAGE_SIZE};
use authenticator::{SessionAuthenticator, SessionExpired};
use chats::{ChatCache, ChatList};
use collection::{CacheTier, MissingCache};
use config::ClientSettings;
use error::{ClientError, ClientResult};
use messages::{MessageCache, MessageThread, ThreadOptions};
use push::PushConnection;
use router::EventRouter;
use token_store::{MemorySessionPersistence, SessionPersistence, TokenStore};
use typing::{RestTypingSink, TypingSink};

/// Entry point for a front end: one instance per signed-in device.
pub struct ChatClient {
    settings: ClientSettings,
    storage: Option<Storage>,
    api: Arc<ApiClient>,
    backend: Arc<dyn ChatBackend>,
    chat_list: ChatList,
    router: Arc<EventRouter>,
    push: Arc<PushConnection>,
    typing_sink: Arc<dyn TypingSink>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Opens the local database named in `settings` and restores any saved
    /// session.
    pub async fn connect(settings: ClientSettings) -> ClientResult<Arc<Self>> {
        settings.validate()?;
        let storage = Storage::new(&settings.database_url)
            .await
            .map_err(|err| ClientError::Cache(format!("{err:#}")))?;
        Self::with_storage(settings, Some(storage)).await
    }

    /// Without storage the session and caches live only in memory.
    pub async fn with_storage(
        settings: ClientSettings,
        storage: Option<Storage>,
    ) -> ClientResult<Arc<Self>> {
        let http = Client::builder().build()?;
        let persistence: Arc<dyn SessionPersistence> = match &storage {
            Some(storage) => Arc::new(storage.clone()),
            None => Arc::new(MemorySessionPersistence::default()),
        };
        let tokens = Arc::new(TokenStore::new(persistence));
        if let Some(session) = tokens.restore().await {
            info!(user_id = %session.user.user_id, "auth: restored session");
        }

        let refresher = Arc::new(HttpRefreshTransport::new(http.clone(), &settings.server_url));
        let auth = Arc::new(SessionAuthenticator::with_threshold(
            Arc::clone(&tokens),
            refresher,
            settings.refresh_threshold_secs,
        ));
        let api = Arc::new(ApiClient::new(http, &settings.server_url, auth));
        let backend: Arc<dyn ChatBackend> = api.clone();

        let chat_cache: Arc<dyn CacheTier<Chat>> = match &storage {
            Some(storage) => Arc::new(ChatCache::new(storage.clone(), settings.chat_cache_limit)),
            None => Arc::new(MissingCache),
        };
        let chat_list = ChatList::new(
            Arc::clone(&backend),
            chat_cache,
            tokens,
            settings.chat_page_size,
        );
        let router = Arc::new(EventRouter::new(chat_list.clone()));
        let push = Arc::new(PushConnection::new(settings.resolved_ws_url()?));
        let typing_sink: Arc<dyn TypingSink> = Arc::new(RestTypingSink::new(Arc::clone(&backend)));

        let client = Arc::new(Self {
            settings,
            storage,
            api,
            backend,
            chat_list,
            router,
            push,
            typing_sink,
            pump: Mutex::new(None),
        });
        client.spawn_event_pump().await;
        Ok(client)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn push(&self) -> &Arc<PushConnection> {
        &self.push
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub async fn is_logged_in(&self) -> bool {
        self.api.authenticator().is_logged_in().await
    }

    pub async fn current_user(&self) -> Option<UserProfile> {
        self.api.tokens().current_user().await
    }

    pub fn subscribe_session_expired(&self) -> broadcast::Receiver<SessionExpired> {
        self.api.authenticator().subscribe_session_expired()
    }

    pub async fn login(&self, login: &str, password: &str) -> ClientResult<UserProfile> {
        let session = self.api.login(login, password).await?;
        info!(user_id = %session.user.user_id, "auth: logged in");
        Ok(session.user)
    }

    pub async fn register(
        &self,
        login: &str,
        password: &str,
        display_name: &str,
    ) -> ClientResult<UserProfile> {
        let session = self.api.register(login, password, display_name).await?;
        info!(user_id = %session.user.user_id, "auth: registered");
        Ok(session.user)
    }

    /// Ends the session on the server and wipes every piece of local state.
    pub async fn logout(&self) {
        self.detach_session().await;
        self.api.logout().await;
        self.wipe_local_state().await;
        info!("auth: logged out");
    }

    /// Signs every device of this account out.
    pub async fn logout_all(&self) -> ClientResult<()> {
        self.api.logout_all().await?;
        self.detach_session().await;
        self.wipe_local_state().await;
        info!("auth: logged out everywhere");
        Ok(())
    }

    pub async fn delete_account(&self, password: &str) -> ClientResult<()> {
        self.api.delete_account(password).await?;
        self.detach_session().await;
        self.wipe_local_state().await;
        info!("auth: account deleted");
        Ok(())
    }

    /// Returns true when the server ended the session as part of the change.
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> ClientResult<bool> {
        let revoked = self.api.change_password(old_password, new_password).await?;
        if revoked {
            self.detach_session().await;
            self.wipe_local_state().await;
        }
        Ok(revoked)
    }

    pub async fn update_display_name(&self, display_name: &str) -> ClientResult<UserProfile> {
        self.api.update_display_name(display_name).await
    }

    /// Users to start a chat with; `offset` pages through longer results.
    pub async fn search_users(&self, query: &str, offset: u32) -> ClientResult<Vec<UserProfile>> {
        self.api
            .search_users(query, offset, USER_SEARCH_PAGE_SIZE)
            .await
    }

    async fn detach_session(&self) {
        self.push.close().await;
        for chat_id in self.router.open_threads().await {
            self.close_chat(chat_id).await;
        }
    }

    async fn wipe_local_state(&self) {
        self.chat_list.reset().await;
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.clear_all().await {
                warn!("auth: failed to clear local caches: {err:#}");
            }
        }
    }

    /// Opens, or reopens with the current access token, the push connection.
    pub async fn connect_push(&self) -> ClientResult<()> {
        let token = self
            .api
            .tokens()
            .access_token()
            .await
            .ok_or(ClientError::NotLoggedIn)?;
        self.push.open(&token).await
    }

    pub async fn disconnect_push(&self) {
        self.push.close().await;
    }

    pub fn chat_list(&self) -> &ChatList {
        &self.chat_list
    }

    /// Opens a thread for `chat` and routes its live events until
    /// [`close_chat`](Self::close_chat).
    pub async fn open_chat(&self, chat: &Chat) -> Arc<MessageThread> {
        let cache: Arc<dyn CacheTier<Message>> = match &self.storage {
            Some(storage) => Arc::new(MessageCache::new(
                storage.clone(),
                chat.chat_id,
                self.settings.message_cache_limit,
            )),
            None => Arc::new(MissingCache),
        };
        let thread = Arc::new(MessageThread::new(
            chat.chat_id,
            chat.companion_name.clone(),
            Arc::clone(&self.backend),
            cache,
            Arc::clone(&self.typing_sink),
            Arc::clone(self.api.tokens()),
            ThreadOptions {
                page_size: self.settings.message_page_size,
                typing_debounce: self.settings.typing_debounce(),
            },
        ));
        self.router.register(Arc::clone(&thread)).await;
        thread
    }

    pub async fn open_chat_with(&self, companion_id: UserId) -> ClientResult<Arc<MessageThread>> {
        let chat = self.chat_list.open_chat_with(companion_id).await?;
        Ok(self.open_chat(&chat).await)
    }

    pub async fn close_chat(&self, chat_id: ChatId) {
        if let Some(thread) = self.router.unregister(chat_id).await {
            thread.close().await;
        }
    }

    async fn spawn_event_pump(&self) {
        let mut events = self.push.subscribe();
        let mut expired = self.subscribe_session_expired();
        let router = Arc::clone(&self.router);
        let push = Arc::clone(&self.push);
        let chat_list = self.chat_list.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => router.route(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "push: event consumer lagged, resyncing");
                            router.resync().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    signal = expired.recv() => match signal {
                        Ok(SessionExpired) => {
                            info!("push: closing connection after session expiry");
                            push.close().await;
                            chat_list.reset().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        *self.pump.lock().await = Some(handle);
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.try_lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
