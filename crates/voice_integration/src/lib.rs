use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::protocol::{ToolCall, ToolResponse};
use tokio::sync::mpsc;

pub mod backends;
pub mod live_socket;
pub mod pcm;
pub mod wire;

/// Microphone capture rate sent upstream.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Rate of the model's spoken audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Samples per captured block (one mono channel).
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseModality {
    Audio,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterProperty {
    pub name: String,
    pub kind: ParameterKind,
    pub description: Option<String>,
    pub allowed_values: Vec<String>,
}

/// Object-typed parameter schema for a tool declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSchema {
    pub properties: Vec<ParameterProperty>,
    pub required: Vec<String>,
}

impl ParameterSchema {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn string(mut self, name: &str, description: Option<&str>) -> Self {
        self.properties.push(ParameterProperty {
            name: name.to_string(),
            kind: ParameterKind::String,
            description: description.map(str::to_string),
            allowed_values: Vec::new(),
        });
        self
    }

    pub fn one_of<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties.push(ParameterProperty {
            name: name.to_string(),
            kind: ParameterKind::String,
            description: None,
            allowed_values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = names.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub tools: Vec<ToolDeclaration>,
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// One inbound message. The payload kinds are independent; any combination
/// may be present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundFrame {
    pub tool_calls: Vec<ToolCall>,
    pub input_transcript: Option<String>,
    pub output_transcript: Option<String>,
    pub audio: Vec<AudioChunk>,
}

impl InboundFrame {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty()
            && self.input_transcript.is_none()
            && self.output_transcript.is_none()
            && self.audio.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    Message(InboundFrame),
    Error(String),
    Closed { reason: Option<String> },
}

/// Outbound half of a live session. Sends never block the caller.
pub trait VoiceSession: Send + Sync {
    fn send_audio_chunk(&self, pcm: Vec<u8>) -> anyhow::Result<()>;
    fn send_tool_responses(&self, responses: Vec<ToolResponse>) -> anyhow::Result<()>;
    /// Idempotent.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub struct LiveSession {
    pub handle: Arc<dyn VoiceSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, config: SessionConfig) -> anyhow::Result<LiveSession>;
}

pub struct MissingVoiceConnector;

#[async_trait]
impl VoiceConnector for MissingVoiceConnector {
    async fn connect(&self, _config: SessionConfig) -> anyhow::Result<LiveSession> {
        Err(anyhow::anyhow!("voice connector is unavailable"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    /// Seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

#[async_trait]
pub trait CaptureStream: Send + Sync {
    /// Next block of mono samples in [-1, 1]; `None` once closed or drained.
    async fn next_frame(&self) -> Option<Vec<f32>>;
    fn close(&self);
}

pub trait PlaybackContext: Send + Sync {
    fn sample_rate(&self) -> u32;
    /// Context clock in seconds.
    fn current_time(&self) -> f64;
    fn start(&self, clip: AudioClip, at: f64) -> anyhow::Result<SourceId>;
    fn stop(&self, source: SourceId);
    fn close(&self);
}

#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Acquires the microphone and opens a capture context at `sample_rate`.
    async fn open_capture(&self, sample_rate: u32) -> anyhow::Result<Arc<dyn CaptureStream>>;
    fn open_playback(&self, sample_rate: u32) -> anyhow::Result<Arc<dyn PlaybackContext>>;
}

pub struct MissingAudioBackend;

#[async_trait]
impl AudioBackend for MissingAudioBackend {
    async fn open_capture(&self, _sample_rate: u32) -> anyhow::Result<Arc<dyn CaptureStream>> {
        Err(anyhow::anyhow!("no microphone available"))
    }

    fn open_playback(&self, _sample_rate: u32) -> anyhow::Result<Arc<dyn PlaybackContext>> {
        Err(anyhow::anyhow!("no audio output available"))
    }
}
