use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);

/// Client-side identifier of a message that has not been confirmed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalMessageId(pub Uuid);

impl LocalMessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalMessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a message in a thread.
///
/// Optimistic sends live under `Pending` until the server assigns an id, so the
/// two id spaces can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageKey {
    Confirmed(MessageId),
    Pending(LocalMessageId),
}

impl MessageKey {
    pub fn server_id(&self) -> Option<MessageId> {
        match self {
            MessageKey::Confirmed(id) => Some(*id),
            MessageKey::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageKey::Pending(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
}

/// Authenticated session. Both tokens are always present together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserProfile,
}

impl Session {
    pub fn is_usable(&self) -> bool {
        !self.access_token.trim().is_empty() && !self.refresh_token.trim().is_empty()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: ChatId,
    pub companion_id: UserId,
    pub companion_name: String,
    pub last_message_text: Option<String>,
    pub last_message_sender_name: Option<String>,
    /// Epoch millis.
    pub last_message_timestamp: i64,
    /// Epoch millis.
    pub created_at: i64,
}

impl Chat {
    pub fn with_last_message(
        mut self,
        text: impl Into<String>,
        sender_name: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        self.last_message_text = Some(text.into());
        self.last_message_sender_name = Some(sender_name.into());
        self.last_message_timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub key: MessageKey,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub text: String,
    /// Epoch millis.
    pub timestamp: i64,
    pub is_mine: bool,
    pub status: MessageStatus,
}

/// Companion's live-typed text for one chat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingState {
    pub remote_text: String,
    pub is_active: bool,
}

impl TypingState {
    pub fn from_text(remote_text: String) -> Self {
        let is_active = !remote_text.is_empty();
        Self {
            remote_text,
            is_active,
        }
    }
}
