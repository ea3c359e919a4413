use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use shared::protocol::TokenResponse;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, ClientResult},
    token_expiry::{is_expiring_soon, DEFAULT_REFRESH_THRESHOLD_SECS},
    token_store::TokenStore,
};

pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Which credential a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Access,
    Refresh,
    None,
}

/// Transport-neutral description of a REST call, decorated with a bearer
/// before it is sent.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(&'static str, String)>,
    pub body: Option<Value>,
    pub auth: AuthKind,
    pub bearer: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>, auth: AuthKind) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            auth,
            bearer: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, AuthKind::Access)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path, AuthKind::Access)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path, AuthKind::Access)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path, AuthKind::Access)
    }

    pub fn with_query(mut self, key: &'static str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_auth(mut self, auth: AuthKind) -> Self {
        self.auth = auth;
        self
    }

    fn is_session_endpoint(&self) -> bool {
        self.path.ends_with(REFRESH_PATH) || self.path.ends_with(LOGOUT_PATH)
    }

    fn with_bearer(mut self, bearer: Option<String>) -> Self {
        self.bearer = bearer;
        self
    }
}

/// Outcome of the proactive step of [`SessionAuthenticator::decorate`]. None
/// of these abort the request.
#[derive(Debug)]
pub enum ProactiveRefresh {
    NotNeeded,
    Refreshed,
    RefreshedByPeer,
    NoRefreshToken,
    Ignored(ClientError),
}

#[derive(Debug)]
pub enum UnauthorizedOutcome {
    Retry(OutboundRequest),
    SessionExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExpired;

/// The refresh call itself. Implementations must not route through the
/// authenticator.
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> ClientResult<TokenResponse>;
}

pub struct MissingRefreshTransport;

#[async_trait]
impl RefreshTransport for MissingRefreshTransport {
    async fn refresh(&self, _refresh_token: &str) -> ClientResult<TokenResponse> {
        Err(ClientError::Network("refresh transport unavailable".into()))
    }
}

/// Keeps the access token fresh. Every refresh and every session mutation
/// around it runs under `refresh_lock`, so at most one refresh call is ever in
/// flight.
pub struct SessionAuthenticator {
    tokens: Arc<TokenStore>,
    refresher: Arc<dyn RefreshTransport>,
    refresh_lock: Mutex<()>,
    threshold_secs: i64,
    expired_tx: broadcast::Sender<SessionExpired>,
}

impl SessionAuthenticator {
    pub fn new(tokens: Arc<TokenStore>, refresher: Arc<dyn RefreshTransport>) -> Self {
        Self::with_threshold(tokens, refresher, DEFAULT_REFRESH_THRESHOLD_SECS)
    }

    pub fn with_threshold(
        tokens: Arc<TokenStore>,
        refresher: Arc<dyn RefreshTransport>,
        threshold_secs: i64,
    ) -> Self {
        let (expired_tx, _) = broadcast::channel(8);
        Self {
            tokens,
            refresher,
            refresh_lock: Mutex::new(()),
            threshold_secs,
            expired_tx,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub async fn is_logged_in(&self) -> bool {
        self.tokens.is_logged_in().await
    }

    pub fn subscribe_session_expired(&self) -> broadcast::Receiver<SessionExpired> {
        self.expired_tx.subscribe()
    }

    pub async fn decorate(&self, request: OutboundRequest) -> (OutboundRequest, ProactiveRefresh) {
        match request.auth {
            AuthKind::None => (request.with_bearer(None), ProactiveRefresh::NotNeeded),
            AuthKind::Refresh => {
                let bearer = self.tokens.refresh_token().await;
                (request.with_bearer(bearer), ProactiveRefresh::NotNeeded)
            }
            AuthKind::Access if request.is_session_endpoint() => {
                (request.with_bearer(None), ProactiveRefresh::NotNeeded)
            }
            AuthKind::Access => {
                let outcome = self.refresh_if_expiring().await;
                if let ProactiveRefresh::Ignored(err) = &outcome {
                    warn!(path = %request.path, "auth: proactive refresh failed, sending stale token: {err}");
                }
                let bearer = self.tokens.access_token().await;
                (request.with_bearer(bearer), outcome)
            }
        }
    }

    async fn refresh_if_expiring(&self) -> ProactiveRefresh {
        let observed = self.tokens.access_token().await;
        if !is_expiring_soon(observed.as_deref(), self.threshold_secs) {
            return ProactiveRefresh::NotNeeded;
        }

        let _guard = self.refresh_lock.lock().await;
        let current = self.tokens.access_token().await;
        if !is_expiring_soon(current.as_deref(), self.threshold_secs) {
            return if current != observed {
                ProactiveRefresh::RefreshedByPeer
            } else {
                ProactiveRefresh::NotNeeded
            };
        }

        let Some(refresh_token) = self.tokens.refresh_token().await else {
            return ProactiveRefresh::NoRefreshToken;
        };
        match self.refresher.refresh(&refresh_token).await {
            Ok(rotated) if !has_both_tokens(&rotated) => {
                warn!("auth: proactive refresh returned blank tokens, keeping the old pair");
                ProactiveRefresh::Ignored(ClientError::EmptyPayload)
            }
            Ok(rotated) => {
                if self
                    .tokens
                    .update_tokens(&rotated.access_token, &rotated.refresh_token)
                    .await
                {
                    debug!("auth: proactive refresh rotated tokens");
                    ProactiveRefresh::Refreshed
                } else {
                    ProactiveRefresh::NoRefreshToken
                }
            }
            Err(err) => ProactiveRefresh::Ignored(err),
        }
    }

    /// Called after `failed` came back 401. `response_count` counts the 401
    /// responses seen for this call so far, including this one.
    pub async fn on_unauthorized(
        &self,
        failed: &OutboundRequest,
        response_count: usize,
    ) -> UnauthorizedOutcome {
        if response_count >= 2 {
            info!(path = %failed.path, "auth: retried request still unauthorized");
            return self.expire_session().await;
        }
        if failed.is_session_endpoint() {
            info!(path = %failed.path, "auth: session endpoint rejected credentials");
            return self.expire_session().await;
        }
        let Some(observed_refresh) = self.tokens.refresh_token().await else {
            return self.expire_session().await;
        };

        let _guard = self.refresh_lock.lock().await;
        let Some(current_refresh) = self.tokens.refresh_token().await else {
            // A peer already ended the session and emitted the signal.
            return UnauthorizedOutcome::SessionExpired;
        };
        let current_access = self.tokens.access_token().await;
        if current_refresh != observed_refresh || current_access != failed.bearer {
            debug!(path = %failed.path, "auth: reusing tokens refreshed by a peer");
            return UnauthorizedOutcome::Retry(failed.clone().with_bearer(current_access));
        }

        match self.refresher.refresh(&current_refresh).await {
            Ok(rotated) if has_both_tokens(&rotated) => {
                if !self
                    .tokens
                    .update_tokens(&rotated.access_token, &rotated.refresh_token)
                    .await
                {
                    return UnauthorizedOutcome::SessionExpired;
                }
                debug!(path = %failed.path, "auth: reactive refresh rotated tokens");
                UnauthorizedOutcome::Retry(
                    failed.clone().with_bearer(Some(rotated.access_token)),
                )
            }
            Ok(_) => {
                warn!("auth: refresh returned blank tokens");
                self.expire_session_locked().await
            }
            Err(err) => {
                warn!("auth: reactive refresh failed: {err}");
                self.expire_session_locked().await
            }
        }
    }

    async fn expire_session(&self) -> UnauthorizedOutcome {
        let _guard = self.refresh_lock.lock().await;
        self.expire_session_locked().await
    }

    /// Caller holds `refresh_lock`. Only the caller that actually drops a
    /// present session emits the signal.
    async fn expire_session_locked(&self) -> UnauthorizedOutcome {
        if self.tokens.clear().await {
            info!("auth: session expired");
            let _ = self.expired_tx.send(SessionExpired);
        }
        UnauthorizedOutcome::SessionExpired
    }
}

fn has_both_tokens(rotated: &TokenResponse) -> bool {
    !rotated.access_token.trim().is_empty() && !rotated.refresh_token.trim().is_empty()
}

#[cfg(test)]
#[path = "tests/authenticator_tests.rs"]
mod tests;
