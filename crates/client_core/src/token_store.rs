use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{Session, UserProfile};
use storage::Storage;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// Durable home of the session between process runs.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn update_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl SessionPersistence for Storage {
    async fn load(&self) -> Result<Option<Session>> {
        self.load_session().await
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.save_session(session).await
    }

    async fn update_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        Storage::update_tokens(self, access_token, refresh_token).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.clear_session().await
    }
}

/// Process-local persistence, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemorySessionPersistence {
    session: Mutex<Option<Session>>,
}

#[async_trait]
impl SessionPersistence for MemorySessionPersistence {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.session.lock().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.session.lock().await = Some(session.clone());
        Ok(())
    }

    async fn update_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.access_token = access_token.to_string();
            session.refresh_token = refresh_token.to_string();
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.session.lock().await = None;
        Ok(())
    }
}

/// Holds the current session. The in-memory copy is authoritative; persistence
/// failures are logged and do not fail the caller.
pub struct TokenStore {
    current: RwLock<Option<Session>>,
    persistence: Arc<dyn SessionPersistence>,
}

impl TokenStore {
    pub fn new(persistence: Arc<dyn SessionPersistence>) -> Self {
        Self {
            current: RwLock::new(None),
            persistence,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionPersistence::default()))
    }

    /// Loads the persisted session, discarding one whose tokens are blank.
    pub async fn restore(&self) -> Option<Session> {
        let loaded = match self.persistence.load().await {
            Ok(loaded) => loaded.filter(Session::is_usable),
            Err(err) => {
                warn!("auth: failed to load persisted session: {err:#}");
                None
            }
        };
        *self.current.write().await = loaded.clone();
        loaded
    }

    pub async fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|s| s.refresh_token.clone())
    }

    pub async fn current_user(&self) -> Option<UserProfile> {
        self.current.read().await.as_ref().map(|s| s.user.clone())
    }

    pub async fn is_logged_in(&self) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .is_some_and(Session::is_usable)
    }

    pub async fn save_session(&self, session: Session) {
        if let Err(err) = self.persistence.save(&session).await {
            warn!("auth: failed to persist session: {err:#}");
        }
        *self.current.write().await = Some(session);
    }

    /// Rotates both tokens. Returns false when there is no session to update.
    pub async fn update_tokens(&self, access_token: &str, refresh_token: &str) -> bool {
        {
            let mut guard = self.current.write().await;
            let Some(session) = guard.as_mut() else {
                return false;
            };
            session.access_token = access_token.to_string();
            session.refresh_token = refresh_token.to_string();
        }
        if let Err(err) = self
            .persistence
            .update_tokens(access_token, refresh_token)
            .await
        {
            warn!("auth: failed to persist rotated tokens: {err:#}");
        }
        true
    }

    /// Replaces the profile of the signed-in user, keeping the tokens.
    pub async fn update_user(&self, user: UserProfile) -> bool {
        let updated = {
            let mut guard = self.current.write().await;
            let Some(session) = guard.as_mut() else {
                return false;
            };
            session.user = user;
            session.clone()
        };
        if let Err(err) = self.persistence.save(&updated).await {
            warn!("auth: failed to persist updated profile: {err:#}");
        }
        true
    }

    /// Drops the session. Returns true only if a session was present.
    pub async fn clear(&self) -> bool {
        let had_session = self.current.write().await.take().is_some();
        if let Err(err) = self.persistence.clear().await {
            warn!("auth: failed to clear persisted session: {err:#}");
        }
        had_session
    }
}

#[cfg(test)]
#[path = "tests/token_store_tests.rs"]
mod tests;
