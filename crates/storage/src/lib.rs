use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    Chat, ChatId, Message, MessageId, MessageKey, MessageStatus, Session, UserId, UserProfile,
};

pub const DEFAULT_CHAT_CACHE_LIMIT: u32 = 50;
pub const DEFAULT_MESSAGE_CACHE_LIMIT: u32 = 100;

/// Local persisted state of a signed-in client: the session row plus bounded
/// recent-chats and per-chat recent-messages caches.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO session (id, access_token, refresh_token, user_id, username, display_name)
             VALUES (1, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                access_token=excluded.access_token,
                refresh_token=excluded.refresh_token,
                user_id=excluded.user_id,
                username=excluded.username,
                display_name=excluded.display_name,
                updated_at=CURRENT_TIMESTAMP",
        )
        .bind(&session.access_token)
        .bind(&session.refresh_token)
        .bind(session.user.user_id.0)
        .bind(&session.user.username)
        .bind(&session.user.display_name)
        .execute(&self.pool)
        .await
        .context("failed to persist session")?;
        Ok(())
    }

    pub async fn load_session(&self) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, user_id, username, display_name
             FROM session WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load session")?;

        Ok(row.map(|r| Session {
            access_token: r.get::<String, _>(0),
            refresh_token: r.get::<String, _>(1),
            user: UserProfile {
                user_id: UserId(r.get::<i64, _>(2)),
                username: r.get::<String, _>(3),
                display_name: r.get::<String, _>(4),
            },
        }))
    }

    /// Rotates both tokens of the stored session. Returns false when no
    /// session row exists.
    pub async fn update_tokens(&self, access_token: &str, refresh_token: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session SET access_token = ?, refresh_token = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = 1",
        )
        .bind(access_token)
        .bind(refresh_token)
        .execute(&self.pool)
        .await
        .context("failed to rotate session tokens")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_session(&self) -> Result<()> {
        sqlx::query("DELETE FROM session")
            .execute(&self.pool)
            .await
            .context("failed to clear session")?;
        Ok(())
    }

    /// Drops the session and every cached chat and message.
    pub async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM session").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM chats").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM messages").execute(&mut *tx).await?;
        tx.commit().await.context("failed to clear local state")?;
        Ok(())
    }

    pub async fn list_chats(&self, limit: u32) -> Result<Vec<Chat>> {
        let rows = sqlx::query(
            "SELECT id, companion_id, companion_name, last_message_text, last_message_sender_name,
                    last_message_timestamp, created_at
             FROM chats
             ORDER BY last_message_timestamp DESC, id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list cached chats")?;
        Ok(rows.iter().map(chat_from_row).collect())
    }

    /// Supersedes the cached chat list with `chats`, keeping at most `limit`
    /// most recently active entries.
    pub async fn replace_chats(&self, chats: &[Chat], limit: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chats").execute(&mut *tx).await?;
        for chat in chats {
            upsert_chat_query(chat).execute(&mut *tx).await?;
        }
        trim_chats_query(limit).execute(&mut *tx).await?;
        tx.commit().await.context("failed to replace cached chats")?;
        Ok(())
    }

    pub async fn upsert_chat(&self, chat: &Chat, limit: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_chat_query(chat).execute(&mut *tx).await?;
        trim_chats_query(limit).execute(&mut *tx).await?;
        tx.commit().await.context("failed to upsert cached chat")?;
        Ok(())
    }

    /// Cached messages of a chat in ascending timestamp order.
    pub async fn list_messages(&self, chat_id: ChatId, limit: u32) -> Result<Vec<Message>> {
        let mut rows = sqlx::query(
            "SELECT id, chat_id, sender_id, sender_name, text, timestamp, is_mine
             FROM messages
             WHERE chat_id = ?
             ORDER BY timestamp DESC, id DESC
             LIMIT ?",
        )
        .bind(chat_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list cached messages")?;

        rows.reverse();
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Supersedes the cached messages of one chat. Messages without a server
    /// id are skipped.
    pub async fn replace_messages(
        &self,
        chat_id: ChatId,
        messages: &[Message],
        limit: u32,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE chat_id = ?")
            .bind(chat_id.0)
            .execute(&mut *tx)
            .await?;
        for message in messages.iter().filter(|m| m.chat_id == chat_id) {
            if let Some(message_id) = message.key.server_id() {
                upsert_message_query(message_id, message)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        trim_messages_query(chat_id, limit)
            .execute(&mut *tx)
            .await?;
        tx.commit()
            .await
            .with_context(|| format!("failed to replace cached messages for chat {chat_id}"))?;
        Ok(())
    }

    /// Returns false when the message has no server id and was not stored.
    pub async fn upsert_message(&self, message: &Message, limit: u32) -> Result<bool> {
        let Some(message_id) = message.key.server_id() else {
            return Ok(false);
        };
        let mut tx = self.pool.begin().await?;
        upsert_message_query(message_id, message)
            .execute(&mut *tx)
            .await?;
        trim_messages_query(message.chat_id, limit)
            .execute(&mut *tx)
            .await?;
        tx.commit().await.context("failed to upsert cached message")?;
        Ok(true)
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn upsert_chat_query(chat: &Chat) -> SqliteQuery<'_> {
    sqlx::query(
        "INSERT INTO chats (id, companion_id, companion_name, last_message_text,
                            last_message_sender_name, last_message_timestamp, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            companion_id=excluded.companion_id,
            companion_name=excluded.companion_name,
            last_message_text=excluded.last_message_text,
            last_message_sender_name=excluded.last_message_sender_name,
            last_message_timestamp=excluded.last_message_timestamp,
            created_at=excluded.created_at",
    )
    .bind(chat.chat_id.0)
    .bind(chat.companion_id.0)
    .bind(chat.companion_name.as_str())
    .bind(chat.last_message_text.as_deref())
    .bind(chat.last_message_sender_name.as_deref())
    .bind(chat.last_message_timestamp)
    .bind(chat.created_at)
}

fn trim_chats_query<'q>(limit: u32) -> SqliteQuery<'q> {
    sqlx::query(
        "DELETE FROM chats WHERE id NOT IN (
            SELECT id FROM chats ORDER BY last_message_timestamp DESC, id DESC LIMIT ?
         )",
    )
    .bind(limit)
}

fn upsert_message_query(message_id: MessageId, message: &Message) -> SqliteQuery<'_> {
    sqlx::query(
        "INSERT INTO messages (id, chat_id, sender_id, sender_name, text, timestamp, is_mine)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            chat_id=excluded.chat_id,
            sender_id=excluded.sender_id,
            sender_name=excluded.sender_name,
            text=excluded.text,
            timestamp=excluded.timestamp,
            is_mine=excluded.is_mine",
    )
    .bind(message_id.0)
    .bind(message.chat_id.0)
    .bind(message.sender_id.0)
    .bind(message.sender_name.as_str())
    .bind(message.text.as_str())
    .bind(message.timestamp)
    .bind(message.is_mine)
}

fn trim_messages_query<'q>(chat_id: ChatId, limit: u32) -> SqliteQuery<'q> {
    sqlx::query(
        "DELETE FROM messages WHERE chat_id = ?1 AND id NOT IN (
            SELECT id FROM messages WHERE chat_id = ?1
            ORDER BY timestamp DESC, id DESC LIMIT ?2
         )",
    )
    .bind(chat_id.0)
    .bind(limit)
}

fn chat_from_row(r: &SqliteRow) -> Chat {
    Chat {
        chat_id: ChatId(r.get::<i64, _>(0)),
        companion_id: UserId(r.get::<i64, _>(1)),
        companion_name: r.get::<String, _>(2),
        last_message_text: r.get::<Option<String>, _>(3),
        last_message_sender_name: r.get::<Option<String>, _>(4),
        last_message_timestamp: r.get::<i64, _>(5),
        created_at: r.get::<i64, _>(6),
    }
}

fn message_from_row(r: &SqliteRow) -> Message {
    Message {
        key: MessageKey::Confirmed(MessageId(r.get::<i64, _>(0))),
        chat_id: ChatId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        sender_name: r.get::<String, _>(3),
        text: r.get::<String, _>(4),
        timestamp: r.get::<i64, _>(5),
        is_mine: r.get::<bool, _>(6),
        status: MessageStatus::Sent,
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
