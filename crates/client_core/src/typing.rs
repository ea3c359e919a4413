use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{ChatId, TypingState},
    protocol::EditOp,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::{api::ChatBackend, error::ClientResult};

pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(300);

/// Single operation turning `old` into `new`, or `None` when they are equal.
///
/// Only pure appends and truncations get a precise operation; any other edit
/// is sent as a full `Replace` of the old text.
pub fn diff(old: &str, new: &str) -> Option<EditOp> {
    if old == new {
        return None;
    }
    if new.is_empty() {
        return Some(EditOp::Clear);
    }
    if old.is_empty() {
        return Some(EditOp::Insert {
            position: 0,
            text: new.to_string(),
        });
    }
    if let Some(appended) = new.strip_prefix(old) {
        return Some(EditOp::Insert {
            position: old.chars().count(),
            text: appended.to_string(),
        });
    }
    if let Some(removed) = old.strip_prefix(new) {
        return Some(EditOp::Delete {
            position: new.chars().count(),
            length: removed.chars().count(),
        });
    }
    Some(EditOp::Replace {
        position: 0,
        length: old.chars().count(),
        text: new.to_string(),
    })
}

/// Applies one operation. Offsets count chars; a position past the end is
/// clamped to the end and a length is clamped to the chars that remain.
pub fn apply(text: &str, op: &EditOp) -> String {
    match op {
        EditOp::Insert {
            position,
            text: inserted,
        } => splice(text, *position, 0, inserted),
        EditOp::Delete { position, length } => splice(text, *position, *length, ""),
        EditOp::Replace {
            position,
            length,
            text: inserted,
        } => splice(text, *position, *length, inserted),
        EditOp::Clear => String::new(),
    }
}

pub fn apply_all(text: &str, operations: &[EditOp]) -> String {
    operations
        .iter()
        .fold(text.to_string(), |current, op| apply(&current, op))
}

fn splice(text: &str, position: usize, length: usize, inserted: &str) -> String {
    let start = byte_offset(text, position);
    let end = byte_offset(text, position.saturating_add(length));
    let mut out = String::with_capacity(text.len() - (end - start) + inserted.len());
    out.push_str(&text[..start]);
    out.push_str(inserted);
    out.push_str(&text[end..]);
    out
}

fn byte_offset(text: &str, char_position: usize) -> usize {
    text.char_indices()
        .nth(char_position)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len())
}

/// Where outgoing typing operations go.
#[async_trait]
pub trait TypingSink: Send + Sync {
    async fn send_typing(&self, chat_id: ChatId, operations: &[EditOp]) -> ClientResult<()>;
}

/// Sends typing operations through `POST /chats/{id}/typing`.
pub struct RestTypingSink {
    backend: Arc<dyn ChatBackend>,
}

impl RestTypingSink {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TypingSink for RestTypingSink {
    async fn send_typing(&self, chat_id: ChatId, operations: &[EditOp]) -> ClientResult<()> {
        self.backend.send_typing(chat_id, operations).await
    }
}

enum TypingCommand {
    LocalText(String),
    Cancel,
}

/// Per-chat typing indicator: reconstructs the companion's text from remote
/// operations and debounces the user's own edits into outgoing operations.
///
/// Remote batches must be applied in the order the transport delivered them.
pub struct TypingReconciler {
    chat_id: ChatId,
    state_tx: watch::Sender<TypingState>,
    commands: mpsc::UnboundedSender<TypingCommand>,
    worker: JoinHandle<()>,
}

impl TypingReconciler {
    pub fn new(chat_id: ChatId, sink: Arc<dyn TypingSink>, debounce: Duration) -> Self {
        let (state_tx, _) = watch::channel(TypingState::default());
        let (commands, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_outbound(chat_id, sink, debounce, rx));
        Self {
            chat_id,
            state_tx,
            commands,
            worker,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn subscribe(&self) -> WatchStream<TypingState> {
        WatchStream::new(self.state_tx.subscribe())
    }

    pub fn state(&self) -> TypingState {
        self.state_tx.borrow().clone()
    }

    pub fn apply_remote(&self, operations: &[EditOp]) {
        if operations.is_empty() {
            return;
        }
        self.state_tx.send_modify(|state| {
            let text = apply_all(&state.remote_text, operations);
            *state = TypingState::from_text(text);
        });
        debug!(chat_id = %self.chat_id, ops = operations.len(), "typing: applied remote operations");
    }

    pub fn clear_remote(&self) {
        self.state_tx.send_if_modified(|state| {
            if state.remote_text.is_empty() && !state.is_active {
                return false;
            }
            *state = TypingState::default();
            true
        });
    }

    /// Restarts the quiet window with `text` as the latest local state.
    pub fn local_text_changed(&self, text: impl Into<String>) {
        let _ = self.commands.send(TypingCommand::LocalText(text.into()));
    }

    /// Drops pending operations unsent and resets the baseline to empty.
    pub fn cancel_pending(&self) {
        let _ = self.commands.send(TypingCommand::Cancel);
    }

    pub fn close(&self) {
        self.worker.abort();
    }
}

impl Drop for TypingReconciler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_outbound(
    chat_id: ChatId,
    sink: Arc<dyn TypingSink>,
    debounce: Duration,
    mut commands: mpsc::UnboundedReceiver<TypingCommand>,
) {
    let mut baseline = String::new();
    let mut pending: Option<String> = None;
    loop {
        let command = if pending.is_some() {
            match timeout(debounce, commands.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(_) => {
                    if let Some(text) = pending.take() {
                        flush(chat_id, sink.as_ref(), &baseline, &text).await;
                        baseline = text;
                    }
                    continue;
                }
            }
        } else {
            match commands.recv().await {
                Some(command) => command,
                None => break,
            }
        };

        match command {
            TypingCommand::LocalText(text) => pending = Some(text),
            TypingCommand::Cancel => {
                pending = None;
                baseline.clear();
            }
        }
    }
}

async fn flush(chat_id: ChatId, sink: &dyn TypingSink, baseline: &str, text: &str) {
    let Some(op) = diff(baseline, text) else {
        return;
    };
    match sink.send_typing(chat_id, std::slice::from_ref(&op)).await {
        Ok(()) => debug!(chat_id = %chat_id, "typing: sent {op:?}"),
        Err(err) => warn!(chat_id = %chat_id, "typing: failed to send operations: {err}"),
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
