use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{Chat, ChatId, Message, MessageKey, MessageStatus, Session, UserId, UserProfile},
    protocol::{
        ApiEnvelope, AuthPayload, ChatResponse, ChatsListResponse, CreateChatRequest,
        DeleteUserRequest, EditOp, LoginRequest, MessageResponse, MessagesResponse,
        RegisterRequest, SendMessageRequest, TokenResponse, TypingUpdateRequest,
        UpdateDisplayNameRequest, UpdatePasswordRequest, UpdateUserResponse, UserResponse,
        UsersSearchResponse,
    },
};
use tracing::{debug, info, warn};

use crate::{
    authenticator::{
        AuthKind, OutboundRequest, RefreshTransport, SessionAuthenticator, UnauthorizedOutcome,
        LOGOUT_PATH, REFRESH_PATH,
    },
    error::{ClientError, ClientResult, GENERIC_FAILURE},
    token_store::TokenStore,
    validation::{validate_display_name, validate_login, validate_new_password, validate_password},
};

pub const USER_SEARCH_PAGE_SIZE: u32 = 20;

/// REST operations the synchronized collections are fed from.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_chats(&self, offset: u32, limit: u32) -> ClientResult<Vec<ChatResponse>>;
    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        offset: u32,
        limit: u32,
    ) -> ClientResult<Vec<MessageResponse>>;
    async fn send_message(&self, chat_id: ChatId, text: &str) -> ClientResult<MessageResponse>;
    async fn create_chat(&self, companion_id: UserId) -> ClientResult<ChatResponse>;
    async fn send_typing(&self, chat_id: ChatId, operations: &[EditOp]) -> ClientResult<()>;
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

pub struct ApiClient {
    http: Client,
    base_url: String,
    auth: Arc<SessionAuthenticator>,
}

impl ApiClient {
    pub fn new(http: Client, base_url: &str, auth: Arc<SessionAuthenticator>) -> Self {
        Self {
            http,
            base_url: normalize_base_url(base_url),
            auth,
        }
    }

    pub fn authenticator(&self) -> &Arc<SessionAuthenticator> {
        &self.auth
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        self.auth.tokens()
    }

    pub async fn login(&self, login: &str, password: &str) -> ClientResult<Session> {
        validate_login(login)?;
        validate_password(password)?;
        let body = serde_json::to_value(LoginRequest {
            login: login.to_string(),
            password: password.to_string(),
        })?;
        let payload: AuthPayload = self
            .execute(
                OutboundRequest::post("/auth/login")
                    .with_auth(AuthKind::None)
                    .with_body(body),
            )
            .await?;
        self.start_session(payload).await
    }

    pub async fn register(
        &self,
        login: &str,
        password: &str,
        display_name: &str,
    ) -> ClientResult<Session> {
        validate_login(login)?;
        validate_new_password(password)?;
        validate_display_name(display_name)?;
        let body = serde_json::to_value(RegisterRequest {
            login: login.to_string(),
            password: password.to_string(),
            display_name: display_name.trim().to_string(),
        })?;
        let payload: AuthPayload = self
            .execute(
                OutboundRequest::post("/auth/register")
                    .with_auth(AuthKind::None)
                    .with_body(body),
            )
            .await?;
        self.start_session(payload).await
    }

    /// Tells the server to drop the refresh token, then clears the local
    /// session whatever the answer was.
    pub async fn logout(&self) {
        if self.tokens().refresh_token().await.is_some() {
            let request = OutboundRequest::post(LOGOUT_PATH).with_auth(AuthKind::Refresh);
            if let Err(err) = self.execute_unit(request).await {
                debug!("auth: server logout failed: {err}");
            }
        }
        self.tokens().clear().await;
    }

    /// Ends every session of this account, on all devices.
    pub async fn logout_all(&self) -> ClientResult<()> {
        self.execute_unit(OutboundRequest::post("/auth/logout-all")).await?;
        self.tokens().clear().await;
        Ok(())
    }

    /// Fetches the signed-in user's profile and refreshes the stored copy.
    pub async fn fetch_profile(&self) -> ClientResult<UserProfile> {
        let user: UserResponse = self.execute(OutboundRequest::get("/users/me")).await?;
        let profile = profile_from_response(user);
        self.tokens().update_user(profile.clone()).await;
        Ok(profile)
    }

    pub async fn update_display_name(&self, display_name: &str) -> ClientResult<UserProfile> {
        validate_display_name(display_name)?;
        let body = serde_json::to_value(UpdateDisplayNameRequest {
            display_name: display_name.trim().to_string(),
        })?;
        let updated: UpdateUserResponse = self
            .execute(OutboundRequest::patch("/users/me").with_body(body))
            .await?;
        let profile = profile_from_response(updated.user);
        self.tokens().update_user(profile.clone()).await;
        Ok(profile)
    }

    /// Returns true when the server revoked this account's tokens as part of
    /// the change; the local session is dropped in that case.
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> ClientResult<bool> {
        if old_password.is_empty() {
            return Err(ClientError::Validation("current password must not be empty".into()));
        }
        validate_new_password(new_password)?;
        let body = serde_json::to_value(UpdatePasswordRequest {
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
        })?;
        let updated: UpdateUserResponse = self
            .execute(OutboundRequest::patch("/users/me").with_body(body))
            .await?;
        if updated.tokens_revoked {
            info!(
                reason = updated.tokens_revoked_reason.as_deref().unwrap_or(""),
                "auth: password change revoked tokens"
            );
            self.tokens().clear().await;
        }
        Ok(updated.tokens_revoked)
    }

    /// Deletes the account; the local session ends on success.
    pub async fn delete_account(&self, password: &str) -> ClientResult<()> {
        if password.is_empty() {
            return Err(ClientError::Validation("password must not be empty".into()));
        }
        let body = serde_json::to_value(DeleteUserRequest {
            password: password.to_string(),
        })?;
        self.execute_unit(OutboundRequest::delete("/users/me").with_body(body))
            .await?;
        self.tokens().clear().await;
        Ok(())
    }

    /// One page of users whose login or display name matches `query`.
    pub async fn search_users(
        &self,
        query: &str,
        offset: u32,
        limit: u32,
    ) -> ClientResult<Vec<UserProfile>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ClientError::Validation("search query must not be blank".into()));
        }
        let page: UsersSearchResponse = self
            .execute(
                OutboundRequest::get("/users/search")
                    .with_query("q", query)
                    .with_query("limit", limit)
                    .with_query("offset", offset),
            )
            .await?;
        Ok(page.users.into_iter().map(profile_from_response).collect())
    }

    async fn start_session(&self, payload: AuthPayload) -> ClientResult<Session> {
        let session = Session {
            access_token: payload.token.access_token,
            refresh_token: payload.token.refresh_token,
            user: profile_from_response(payload.user),
        };
        if !session.is_usable() {
            return Err(ClientError::Api("server issued blank tokens".into()));
        }
        self.tokens().save_session(session.clone()).await;
        Ok(session)
    }

    pub async fn execute<T: DeserializeOwned>(&self, request: OutboundRequest) -> ClientResult<T> {
        let envelope = self.execute_envelope::<T>(request).await?;
        envelope_into_result(envelope)
    }

    /// For endpoints whose success carries no payload.
    pub async fn execute_unit(&self, request: OutboundRequest) -> ClientResult<()> {
        let envelope = self.execute_envelope::<Value>(request).await?;
        if envelope.is_success {
            Ok(())
        } else {
            Err(failure_message(envelope.error))
        }
    }

    async fn execute_envelope<T: DeserializeOwned>(
        &self,
        request: OutboundRequest,
    ) -> ClientResult<ApiEnvelope<T>> {
        let (mut request, _) = self.auth.decorate(request).await;
        let mut unauthorized_responses = 0;
        loop {
            let response = self.send(&request).await?;
            if response.status() == StatusCode::UNAUTHORIZED && request.auth != AuthKind::None {
                unauthorized_responses += 1;
                match self
                    .auth
                    .on_unauthorized(&request, unauthorized_responses)
                    .await
                {
                    UnauthorizedOutcome::Retry(next) => {
                        request = next;
                        continue;
                    }
                    UnauthorizedOutcome::SessionExpired => return Err(ClientError::SessionExpired),
                }
            }
            return read_envelope(response).await;
        }
    }

    async fn send(&self, request: &OutboundRequest) -> ClientResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(bearer) = &request.bearer {
            builder = builder.bearer_auth(bearer);
        }
        Ok(builder.send().await?)
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn fetch_chats(&self, offset: u32, limit: u32) -> ClientResult<Vec<ChatResponse>> {
        let page: ChatsListResponse = self
            .execute(
                OutboundRequest::get("/chats")
                    .with_query("limit", limit)
                    .with_query("offset", offset),
            )
            .await?;
        Ok(page.chats)
    }

    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        offset: u32,
        limit: u32,
    ) -> ClientResult<Vec<MessageResponse>> {
        let page: MessagesResponse = self
            .execute(
                OutboundRequest::get(format!("/chats/{chat_id}/messages"))
                    .with_query("limit", limit)
                    .with_query("offset", offset),
            )
            .await?;
        Ok(page.messages)
    }

    async fn send_message(&self, chat_id: ChatId, text: &str) -> ClientResult<MessageResponse> {
        let body = serde_json::to_value(SendMessageRequest {
            text: text.to_string(),
        })?;
        self.execute(OutboundRequest::post(format!("/chats/{chat_id}/messages")).with_body(body))
            .await
    }

    async fn create_chat(&self, companion_id: UserId) -> ClientResult<ChatResponse> {
        let body = serde_json::to_value(CreateChatRequest {
            companion_user_id: companion_id,
        })?;
        self.execute(OutboundRequest::post("/chats").with_body(body))
            .await
    }

    async fn send_typing(&self, chat_id: ChatId, operations: &[EditOp]) -> ClientResult<()> {
        let body = serde_json::to_value(TypingUpdateRequest {
            operations: operations.to_vec(),
        })?;
        self.execute_unit(OutboundRequest::post(format!("/chats/{chat_id}/typing")).with_body(body))
            .await
    }
}

/// Performs `/auth/refresh` directly, outside the authenticator.
pub struct HttpRefreshTransport {
    http: Client,
    base_url: String,
}

impl HttpRefreshTransport {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: normalize_base_url(base_url),
        }
    }
}

#[async_trait]
impl RefreshTransport for HttpRefreshTransport {
    async fn refresh(&self, refresh_token: &str) -> ClientResult<TokenResponse> {
        let response = self
            .http
            .request(Method::POST, format!("{}{REFRESH_PATH}", self.base_url))
            .bearer_auth(refresh_token)
            .send()
            .await?;
        envelope_into_result(read_envelope(response).await?)
    }
}

async fn read_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> ClientResult<ApiEnvelope<T>> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if status.is_success() {
        return Ok(serde_json::from_slice(&bytes)?);
    }
    match serde_json::from_slice::<ApiEnvelope<Value>>(&bytes) {
        Ok(envelope) if envelope.error.as_deref().is_some_and(|e| !e.trim().is_empty()) => {
            Err(failure_message(envelope.error))
        }
        _ => Err(ClientError::Http {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or(GENERIC_FAILURE)
                .to_string(),
        }),
    }
}

pub fn envelope_into_result<T>(envelope: ApiEnvelope<T>) -> ClientResult<T> {
    if !envelope.is_success {
        return Err(failure_message(envelope.error));
    }
    envelope.data.ok_or(ClientError::EmptyPayload)
}

fn failure_message(error: Option<String>) -> ClientError {
    let message = error
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| GENERIC_FAILURE.to_string());
    ClientError::Api(message)
}

/// ISO-8601 to epoch millis; missing or unparseable input maps to now.
pub fn timestamp_millis(iso: Option<&str>) -> i64 {
    iso.filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(parsed) => Some(parsed.timestamp_millis()),
            Err(err) => {
                warn!("sync: unparseable timestamp '{raw}': {err}");
                None
            }
        })
        .unwrap_or_else(|| Utc::now().timestamp_millis())
}

pub fn chat_from_response(response: &ChatResponse) -> Chat {
    let created_at = timestamp_millis(Some(&response.created_at));
    let last_message_timestamp = match &response.last_message {
        Some(last) => timestamp_millis(Some(&last.created_at)),
        None => created_at,
    };
    Chat {
        chat_id: response.id,
        companion_id: response.other_user.id,
        companion_name: response.other_user.display_name.clone(),
        last_message_text: response.last_message.as_ref().map(|m| m.text.clone()),
        last_message_sender_name: response
            .last_message
            .as_ref()
            .map(|m| m.sender.display_name.clone()),
        last_message_timestamp,
        created_at,
    }
}

pub fn profile_from_response(user: UserResponse) -> UserProfile {
    UserProfile {
        user_id: user.id,
        username: user.login,
        display_name: user.display_name,
    }
}

/// Messages from the current user carry their display name; anything else is
/// attributed to the chat companion.
pub fn message_from_response(
    response: &MessageResponse,
    me: Option<&UserProfile>,
    companion_name: &str,
) -> Message {
    let is_mine = me.is_some_and(|me| me.user_id == response.sender_id);
    let sender_name = match me {
        Some(me) if is_mine => me.display_name.clone(),
        _ => companion_name.to_string(),
    };
    Message {
        key: MessageKey::Confirmed(response.id),
        chat_id: response.chat_id,
        sender_id: response.sender_id,
        sender_name,
        text: response.text.clone(),
        timestamp: timestamp_millis(Some(&response.created_at)),
        is_mine,
        status: MessageStatus::Sent,
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
