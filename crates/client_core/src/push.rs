use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::ChatId,
    protocol::{ChatResponse, EditOp, MessageResponse, OutboundTypingFrame, PushEvent, PushFrame, TypingPayload},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult, FrameError},
    typing::TypingSink,
};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

struct ActiveConnection {
    writer: Arc<Mutex<WsWriter>>,
    reader: JoinHandle<()>,
}

/// One push connection per session. `open` may be called again with a fresh
/// token; the previous connection is closed first.
pub struct PushConnection {
    ws_url: String,
    events: broadcast::Sender<PushEvent>,
    active: Mutex<Option<ActiveConnection>>,
}

impl PushConnection {
    pub fn new(ws_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            ws_url: ws_url.into(),
            events,
            active: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    pub async fn is_open(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|active| !active.reader.is_finished())
    }

    pub async fn open(&self, access_token: &str) -> ClientResult<()> {
        self.close().await;

        let url = Url::parse_with_params(&self.ws_url, &[("token", access_token)])
            .map_err(|err| ClientError::Config(format!("invalid push url: {err}")))?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::Network(format!("push connect failed: {err}")))?;
        let (writer, mut reader) = stream.split();
        info!("push: connected");
        let _ = self.events.send(PushEvent::ConnectionOpened);

        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match parse_frame(&text) {
                        Ok(Some(event)) => {
                            let _ = events.send(event);
                        }
                        Ok(None) => {}
                        Err(err) => warn!("push: dropping undecodable frame: {err}"),
                    },
                    Ok(WsMessage::Close(close)) => {
                        reason = close.map(|c| c.reason.to_string());
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        reason = Some(err.to_string());
                        break;
                    }
                }
            }
            info!(reason = reason.as_deref().unwrap_or(""), "push: connection closed");
            let _ = events.send(PushEvent::ConnectionClosed { reason });
        });

        *self.active.lock().await = Some(ActiveConnection {
            writer: Arc::new(Mutex::new(writer)),
            reader,
        });
        Ok(())
    }

    pub async fn close(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        let still_running = !active.reader.is_finished();
        let _ = active.writer.lock().await.close().await;
        active.reader.abort();
        if still_running {
            let _ = self
                .events
                .send(PushEvent::ConnectionClosed { reason: None });
        }
    }

    async fn writer(&self) -> Option<Arc<Mutex<WsWriter>>> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|active| !active.reader.is_finished())
            .map(|active| Arc::clone(&active.writer))
    }
}

#[async_trait]
impl TypingSink for PushConnection {
    async fn send_typing(&self, chat_id: ChatId, operations: &[EditOp]) -> ClientResult<()> {
        let writer = self
            .writer()
            .await
            .ok_or_else(|| ClientError::Network("push connection is not open".into()))?;
        let frame = serde_json::to_string(&OutboundTypingFrame::new(chat_id, operations))?;
        let mut writer = writer.lock().await;
        writer
            .send(WsMessage::Text(frame))
            .await
            .map_err(|err| ClientError::Network(format!("push send failed: {err}")))?;
        Ok(())
    }
}

/// Interprets one text frame. `Ok(None)` means the frame is valid but carries
/// nothing for the core (greetings, unknown kinds).
pub fn parse_frame(raw: &str) -> Result<Option<PushEvent>, FrameError> {
    if raw.trim() == "connected" {
        return Ok(None);
    }
    let frame: PushFrame = serde_json::from_str(raw)?;
    match frame.kind.as_str() {
        "new_message" => {
            let message: MessageResponse = decode_data(&frame)?;
            Ok(Some(PushEvent::NewMessage(message)))
        }
        "chat_update" => {
            let chat: ChatResponse = decode_data(&frame)?;
            Ok(Some(PushEvent::ChatUpdate(chat)))
        }
        "typing" => {
            let nested = match &frame.data {
                Some(data) if data.is_object() => serde_json::from_value::<TypingPayload>(data.clone())
                    .map_err(|source| FrameError::MalformedData {
                        kind: frame.kind.clone(),
                        source,
                    })?,
                _ => TypingPayload::default(),
            };
            let chat_id = nested
                .chat_id
                .or(frame.chat_id)
                .ok_or_else(|| FrameError::MissingData {
                    kind: frame.kind.clone(),
                })?;
            let operations = nested
                .operations
                .or(frame.operations)
                .unwrap_or_default();
            Ok(Some(PushEvent::Typing {
                chat_id,
                operations,
            }))
        }
        other => {
            debug!(kind = other, "push: ignoring frame");
            Ok(None)
        }
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(frame: &PushFrame) -> Result<T, FrameError> {
    let data = frame.data.clone().ok_or_else(|| FrameError::MissingData {
        kind: frame.kind.clone(),
    })?;
    serde_json::from_value(data).map_err(|source| FrameError::MalformedData {
        kind: frame.kind.clone(),
        source,
    })
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
