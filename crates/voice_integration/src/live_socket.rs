use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::ToolResponse;
use tokio::{sync::mpsc, task::AbortHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    wire::{decode_server_message, ClientMessage, ServerSignal},
    LiveSession, SessionConfig, SessionEvent, VoiceConnector, VoiceSession, CAPTURE_SAMPLE_RATE,
};

pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Opens live sessions over a websocket speaking the JSON frames in
/// [`crate::wire`].
pub struct LiveSocketConnector {
    endpoint: Url,
    api_key: String,
}

impl LiveSocketConnector {
    pub fn new(endpoint: &str, api_key: impl Into<String>) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid live endpoint: {endpoint}"))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(anyhow!("live endpoint must use ws:// or wss://"));
        }
        Ok(Self {
            endpoint,
            api_key: api_key.into(),
        })
    }

    fn session_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if !self.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.api_key);
        }
        url
    }
}

#[async_trait]
impl VoiceConnector for LiveSocketConnector {
    async fn connect(&self, config: SessionConfig) -> Result<LiveSession> {
        let url = self.session_url();
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect live session: {}", self.endpoint))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let setup = serde_json::to_string(&ClientMessage::setup(&config))?;
        outbound_tx
            .send(Message::Text(setup))
            .map_err(|_| anyhow!("live session writer closed before setup"))?;

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_writer.send(message).await {
                    warn!("voice: live session send failed: {err}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(message) = ws_reader.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("voice: ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|frame| frame.reason.into_owned());
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = events_tx.send(SessionEvent::Error(err.to_string()));
                        break;
                    }
                };

                let event = match decode_server_message(&text) {
                    Ok(ServerSignal::SetupComplete) => SessionEvent::Opened,
                    Ok(ServerSignal::Frame(frame)) => SessionEvent::Message(frame),
                    Ok(ServerSignal::GoAway) => {
                        info!("voice: live session announced go-away");
                        continue;
                    }
                    Ok(ServerSignal::Ignored) => continue,
                    Err(err) => {
                        warn!("voice: invalid live session frame: {err}");
                        continue;
                    }
                };
                if events_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = events_tx.send(SessionEvent::Closed { reason });
        });

        let handle = LiveSocketSession {
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        };
        Ok(LiveSession {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

struct LiveSocketSession {
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl LiveSocketSession {
    fn enqueue(&self, message: &ClientMessage) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("live session is closed"));
        }
        let text = serde_json::to_string(message)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| anyhow!("live session writer is gone"))
    }
}

impl VoiceSession for LiveSocketSession {
    fn send_audio_chunk(&self, pcm: Vec<u8>) -> Result<()> {
        self.enqueue(&ClientMessage::audio(&pcm, CAPTURE_SAMPLE_RATE))
    }

    fn send_tool_responses(&self, responses: Vec<ToolResponse>) -> Result<()> {
        self.enqueue(&ClientMessage::tool_responses(responses))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        if self.outbound.send(Message::Close(None)).is_err() {
            self.writer.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LiveSocketSession {
    fn drop(&mut self) {
        self.close();
        self.writer.abort();
    }
}
