//! JSON frames of the bidirectional live generate-content protocol.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shared::protocol::{ToolCall, ToolResponse};
use tracing::warn;

use crate::{pcm, AudioChunk, InboundFrame, ParameterSchema, SessionConfig, ToolDeclaration};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Value),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponsePayload),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponsePayload {
    pub function_responses: Vec<ToolResponse>,
}

impl ClientMessage {
    pub fn setup(config: &SessionConfig) -> Self {
        let mut setup = Map::new();
        setup.insert(
            "model".into(),
            Value::String(qualified_model_name(&config.model)),
        );
        setup.insert(
            "generationConfig".into(),
            json!({
                "responseModalities": [config.response_modality],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": config.voice_name } }
                },
            }),
        );
        setup.insert(
            "systemInstruction".into(),
            json!({ "parts": [{ "text": config.system_instruction }] }),
        );
        if !config.tools.is_empty() {
            let declarations: Vec<Value> = config.tools.iter().map(declaration_json).collect();
            setup.insert(
                "tools".into(),
                json!([{ "functionDeclarations": declarations }]),
            );
        }
        if config.input_transcription {
            setup.insert("inputAudioTranscription".into(), json!({}));
        }
        if config.output_transcription {
            setup.insert("outputAudioTranscription".into(), json!({}));
        }
        ClientMessage::Setup(Value::Object(setup))
    }

    pub fn audio(pcm_bytes: &[u8], sample_rate: u32) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: pcm::mime_type(sample_rate),
                data: STANDARD.encode(pcm_bytes),
            }],
        })
    }

    pub fn tool_responses(responses: Vec<ToolResponse>) -> Self {
        ClientMessage::ToolResponse(ToolResponsePayload {
            function_responses: responses,
        })
    }
}

fn qualified_model_name(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

fn declaration_json(declaration: &ToolDeclaration) -> Value {
    json!({
        "name": declaration.name,
        "description": declaration.description,
        "parameters": schema_json(&declaration.parameters),
    })
}

fn schema_json(schema: &ParameterSchema) -> Value {
    let mut properties = Map::new();
    for property in &schema.properties {
        let mut entry = Map::new();
        entry.insert("type".into(), json!(property.kind));
        if let Some(description) = &property.description {
            entry.insert("description".into(), json!(description));
        }
        if !property.allowed_values.is_empty() {
            entry.insert("enum".into(), json!(property.allowed_values));
        }
        properties.insert(property.name.clone(), Value::Object(entry));
    }
    let mut object = Map::new();
    object.insert("type".into(), json!("OBJECT"));
    object.insert("properties".into(), Value::Object(properties));
    if !schema.required.is_empty() {
        object.insert("required".into(), json!(schema.required));
    }
    Value::Object(object)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    tool_call: Option<ToolCallPayload>,
    #[serde(default)]
    go_away: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<MediaChunk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPayload {
    #[serde(default)]
    function_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerSignal {
    SetupComplete,
    Frame(InboundFrame),
    GoAway,
    Ignored,
}

pub fn decode_server_message(text: &str) -> serde_json::Result<ServerSignal> {
    let message: ServerMessage = serde_json::from_str(text)?;
    if message.setup_complete.is_some() {
        return Ok(ServerSignal::SetupComplete);
    }
    if message.go_away.is_some() {
        return Ok(ServerSignal::GoAway);
    }

    let mut frame = InboundFrame::default();
    if let Some(tool_call) = message.tool_call {
        frame.tool_calls = tool_call.function_calls;
    }
    if let Some(content) = message.server_content {
        frame.input_transcript = content
            .input_transcription
            .and_then(|transcription| transcription.text)
            .filter(|text| !text.is_empty());
        frame.output_transcript = content
            .output_transcription
            .and_then(|transcription| transcription.text)
            .filter(|text| !text.is_empty());
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|part| part.inline_data) {
            match STANDARD.decode(inline.data.as_bytes()) {
                Ok(data) => frame.audio.push(AudioChunk {
                    mime_type: inline.mime_type,
                    data,
                }),
                Err(err) => warn!(mime_type = %inline.mime_type, "voice: dropping undecodable inline audio: {err}"),
            }
        }
    }

    if frame.is_empty() {
        Ok(ServerSignal::Ignored)
    } else {
        Ok(ServerSignal::Frame(frame))
    }
}
