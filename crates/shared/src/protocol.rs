use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, MessageId, UserId};

/// Envelope every REST endpoint wraps its payload in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub is_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            is_success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            is_success: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub login: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: UserId,
    pub login: String,
    pub display_name: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenResponse { .. }")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub user: UserResponse,
    pub token: TokenResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessageInfo {
    pub text: String,
    pub created_at: String,
    pub sender: UserResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: ChatId,
    pub other_user: UserResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessageInfo>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatsListResponse {
    pub chats: Vec<ChatResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersSearchResponse {
    pub users: Vec<UserResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDisplayNameRequest {
    pub display_name: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UpdatePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

impl std::fmt::Debug for UpdatePasswordRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UpdatePasswordRequest { .. }")
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DeleteUserRequest {
    pub password: String,
}

impl std::fmt::Debug for DeleteUserRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeleteUserRequest { .. }")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUserResponse {
    pub user: UserResponse,
    #[serde(default)]
    pub tokens_revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_revoked_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub companion_user_id: UserId,
}

/// Positional edit against the companion's in-progress text.
///
/// Offsets and lengths count chars. Missing numeric fields decode as 0 and a
/// missing text as empty, matching what peers have been observed to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditOp {
    Insert {
        #[serde(default)]
        position: usize,
        #[serde(default)]
        text: String,
    },
    Delete {
        #[serde(default)]
        position: usize,
        #[serde(default)]
        length: usize,
    },
    Replace {
        #[serde(default)]
        position: usize,
        #[serde(default)]
        length: usize,
        #[serde(default)]
        text: String,
    },
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingUpdateRequest {
    pub operations: Vec<EditOp>,
}

/// Raw inbound push frame before it is interpreted by kind.
#[derive(Debug, Clone, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub operations: Option<Vec<EditOp>>,
}

/// Typing fields carried inside `data`; peers also put them at the top level
/// of the frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TypingPayload {
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub operations: Option<Vec<EditOp>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundTypingFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub chat_id: ChatId,
    pub operations: &'a [EditOp],
}

impl<'a> OutboundTypingFrame<'a> {
    pub fn new(chat_id: ChatId, operations: &'a [EditOp]) -> Self {
        Self {
            kind: "typing",
            chat_id,
            operations,
        }
    }
}

/// Interpreted event from the push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    ConnectionOpened,
    NewMessage(MessageResponse),
    ChatUpdate(ChatResponse),
    Typing {
        chat_id: ChatId,
        operations: Vec<EditOp>,
    },
    ConnectionClosed {
        reason: Option<String>,
    },
}
