//! Voice assistant session: microphone capture upstream, tool calls against
//! the donor directory, transcripts and gap-free playback downstream.

use std::{
    collections::VecDeque,
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::protocol::{ToolCall, ToolResponse};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::AbortHandle,
};
use tracing::{debug, info, warn};
use voice_integration::{
    pcm, AudioBackend, AudioClip, CaptureStream, InboundFrame, LiveSession, PlaybackContext,
    ResponseModality, SessionConfig, SessionEvent, SourceId, VoiceConnector, VoiceSession,
    CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE,
};

use crate::tools::{self, DonorDirectory};

/// Transcript lines kept on screen.
pub const TRANSCRIPT_WINDOW: usize = 3;

pub const SYSTEM_INSTRUCTION: &str = "You are HemoFlow AI. Use tools to find donors, check inventory, or register donors. Be extremely brief in your verbal responses.";

pub fn session_config(model: &str, voice_name: &str) -> SessionConfig {
    SessionConfig {
        model: model.to_string(),
        response_modality: ResponseModality::Audio,
        system_instruction: SYSTEM_INSTRUCTION.to_string(),
        input_transcription: true,
        output_transcription: true,
        tools: tools::declarations(),
        voice_name: voice_name.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    #[default]
    Idle,
    Connecting,
    Active,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    StateChanged(VoiceState),
    Processing(bool),
    Transcripts(Vec<String>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceSessionError {
    #[error("voice session is already running")]
    AlreadyRunning,
    #[error("microphone unavailable: {0}")]
    Microphone(String),
    #[error("audio output unavailable: {0}")]
    Playback(String),
    #[error("failed to open live session: {0}")]
    Connect(String),
    #[error("voice session was stopped while connecting")]
    Cancelled,
}

pub struct VoiceCoordinator {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn VoiceConnector>,
    audio: Arc<dyn AudioBackend>,
    directory: Arc<dyn DonorDirectory>,
    config: SessionConfig,
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<VoiceEvent>,
}

#[derive(Default)]
struct CoordinatorState {
    phase: VoiceState,
    /// Bumped on every start and teardown; work tagged with an older value
    /// belongs to a session that is gone.
    generation: u64,
    /// Tool-call batches queued or running.
    processing: usize,
    transcripts: VecDeque<String>,
    resources: Resources,
}

#[derive(Default)]
struct Resources {
    session: Option<Arc<dyn VoiceSession>>,
    capture: Option<Arc<dyn CaptureStream>>,
    playback: Option<Arc<dyn PlaybackContext>>,
    next_start: f64,
    sources: Vec<ScheduledSource>,
    tasks: Vec<AbortHandle>,
    tool_queue: Option<mpsc::UnboundedSender<Vec<ToolCall>>>,
}

struct ScheduledSource {
    id: SourceId,
    ends_at: f64,
}

impl Resources {
    fn release(self) {
        for task in self.tasks {
            task.abort();
        }
        if let Some(session) = self.session {
            session.close();
        }
        if let Some(capture) = self.capture {
            capture.close();
        }
        if let Some(playback) = self.playback {
            let now = playback.current_time();
            for source in self.sources.iter().filter(|source| source.ends_at > now) {
                playback.stop(source.id);
            }
            playback.close();
        }
    }
}

impl VoiceCoordinator {
    pub fn new(
        connector: Arc<dyn VoiceConnector>,
        audio: Arc<dyn AudioBackend>,
        directory: Arc<dyn DonorDirectory>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                connector,
                audio,
                directory,
                config,
                state: Mutex::new(CoordinatorState::default()),
                events,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> VoiceState {
        self.shared.lock().phase
    }

    pub fn is_processing(&self) -> bool {
        self.shared.lock().processing > 0
    }

    pub fn transcripts(&self) -> Vec<String> {
        self.shared.lock().transcripts.iter().cloned().collect()
    }

    /// Starts a session when idle, stops the running one otherwise.
    pub async fn toggle(&self) -> Result<(), VoiceSessionError> {
        if self.state() == VoiceState::Idle {
            self.start().await
        } else {
            self.stop();
            Ok(())
        }
    }

    /// Acquires the microphone, opens both audio contexts and connects. Any
    /// failure releases whatever was already acquired and returns to idle.
    pub async fn start(&self) -> Result<(), VoiceSessionError> {
        let shared = &self.shared;
        let generation = {
            let mut state = shared.lock();
            if state.phase != VoiceState::Idle {
                return Err(VoiceSessionError::AlreadyRunning);
            }
            state.phase = VoiceState::Connecting;
            state.generation += 1;
            state.generation
        };
        shared.emit(VoiceEvent::StateChanged(VoiceState::Connecting));
        info!(generation, "voice: connecting");

        let capture = match shared.audio.open_capture(CAPTURE_SAMPLE_RATE).await {
            Ok(capture) => capture,
            Err(err) => {
                return Err(shared.fail_start(
                    generation,
                    VoiceSessionError::Microphone(err.to_string()),
                ))
            }
        };
        if !shared.adopt(generation, |resources| {
            resources.capture = Some(Arc::clone(&capture))
        }) {
            capture.close();
            return Err(VoiceSessionError::Cancelled);
        }

        let playback = match shared.audio.open_playback(PLAYBACK_SAMPLE_RATE) {
            Ok(playback) => playback,
            Err(err) => {
                return Err(
                    shared.fail_start(generation, VoiceSessionError::Playback(err.to_string()))
                )
            }
        };
        if !shared.adopt(generation, |resources| {
            resources.playback = Some(Arc::clone(&playback))
        }) {
            playback.close();
            return Err(VoiceSessionError::Cancelled);
        }

        let live = match shared.connector.connect(shared.config.clone()).await {
            Ok(live) => live,
            Err(err) => {
                return Err(
                    shared.fail_start(generation, VoiceSessionError::Connect(err.to_string()))
                )
            }
        };
        let LiveSession {
            handle: session,
            events,
        } = live;
        let (tool_queue, tool_calls) = mpsc::unbounded_channel();
        // The event task is spawned under the state lock, so the first event
        // it handles already sees the session and the tool queue.
        let adopted = shared.adopt(generation, |resources| {
            resources.session = Some(Arc::clone(&session));
            resources.tool_queue = Some(tool_queue);
            let event_task = tokio::spawn(Arc::clone(shared).run_session(generation, events));
            resources.tasks.push(event_task.abort_handle());
        });
        if !adopted {
            session.close();
            return Err(VoiceSessionError::Cancelled);
        }
        // Not tied to the session lifetime: a batch that is already running
        // finishes and its result is discarded.
        tokio::spawn(Arc::clone(shared).run_tools(generation, tool_calls));
        Ok(())
    }

    /// Closes the session and both audio contexts and stops pending
    /// playback. Safe to call at any time, any number of times.
    pub fn stop(&self) {
        self.shared.teardown(None);
    }
}

impl Drop for VoiceCoordinator {
    fn drop(&mut self) {
        self.shared.teardown(None);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }

    /// Runs `adopt` against the resources if `generation` is still current.
    fn adopt(&self, generation: u64, adopt: impl FnOnce(&mut Resources)) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        adopt(&mut state.resources);
        true
    }

    fn fail_start(&self, generation: u64, err: VoiceSessionError) -> VoiceSessionError {
        warn!(generation, "voice: {err}");
        self.emit(VoiceEvent::Error(err.to_string()));
        self.teardown(Some(generation));
        err
    }

    fn teardown(&self, generation: Option<u64>) {
        let (resources, was_processing) = {
            let mut state = self.lock();
            if generation.is_some_and(|generation| generation != state.generation) {
                return;
            }
            if state.phase == VoiceState::Idle {
                return;
            }
            state.phase = VoiceState::Idle;
            state.generation += 1;
            let was_processing = state.processing > 0;
            state.processing = 0;
            (mem::take(&mut state.resources), was_processing)
        };
        resources.release();
        if was_processing {
            self.emit(VoiceEvent::Processing(false));
        }
        self.emit(VoiceEvent::StateChanged(VoiceState::Idle));
        info!("voice: session closed");
    }

    async fn run_session(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Opened => self.on_open(generation),
                SessionEvent::Message(frame) => self.on_frame(generation, frame),
                SessionEvent::Error(message) => {
                    warn!(generation, "voice: live session error: {message}");
                    self.emit(VoiceEvent::Error(message));
                    self.teardown(Some(generation));
                    return;
                }
                SessionEvent::Closed { reason } => {
                    info!(generation, reason = ?reason, "voice: live session closed remotely");
                    self.teardown(Some(generation));
                    return;
                }
            }
        }
        self.teardown(Some(generation));
    }

    fn on_open(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation || state.phase != VoiceState::Connecting {
                return;
            }
            let (Some(capture), Some(session)) = (
                state.resources.capture.clone(),
                state.resources.session.clone(),
            ) else {
                return;
            };
            state.phase = VoiceState::Active;
            let pump = tokio::spawn(async move {
                while let Some(samples) = capture.next_frame().await {
                    if let Err(err) = session.send_audio_chunk(pcm::encode_pcm16(&samples)) {
                        debug!("voice: dropped capture frame: {err}");
                    }
                }
            });
            state.resources.tasks.push(pump.abort_handle());
        }
        info!(generation, "voice: session active");
        self.emit(VoiceEvent::StateChanged(VoiceState::Active));
    }

    fn on_frame(&self, generation: u64, frame: InboundFrame) {
        if !self.is_active(generation) {
            debug!(generation, "voice: dropping frame received before the session opened");
            return;
        }
        if !frame.tool_calls.is_empty() {
            self.enqueue_tool_calls(generation, frame.tool_calls);
        }

        let lines: Vec<String> = [
            frame.input_transcript.map(|text| format!("You: {text}")),
            frame.output_transcript.map(|text| format!("AI: {text}")),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !lines.is_empty() {
            let snapshot = {
                let mut state = self.lock();
                if state.generation != generation {
                    return;
                }
                for line in lines {
                    state.transcripts.push_back(line);
                }
                while state.transcripts.len() > TRANSCRIPT_WINDOW {
                    state.transcripts.pop_front();
                }
                state.transcripts.iter().cloned().collect()
            };
            self.emit(VoiceEvent::Transcripts(snapshot));
        }

        for chunk in frame.audio {
            let sample_rate =
                pcm::sample_rate_from_mime(&chunk.mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE);
            self.schedule(generation, pcm::decode_pcm16(&chunk.data, sample_rate));
        }
    }

    fn enqueue_tool_calls(&self, generation: u64, calls: Vec<ToolCall>) {
        let started = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            let Some(queue) = state.resources.tool_queue.clone() else {
                return;
            };
            if queue.send(calls).is_err() {
                return;
            }
            state.processing += 1;
            state.processing == 1
        };
        if started {
            self.emit(VoiceEvent::Processing(true));
        }
    }

    /// Queues `clip` right after the previous one, or now if playback has
    /// caught up.
    fn schedule(&self, generation: u64, clip: AudioClip) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let resources = &mut state.resources;
        let Some(playback) = resources.playback.clone() else {
            return;
        };
        let now = playback.current_time();
        resources.sources.retain(|source| source.ends_at > now);
        let start_at = resources.next_start.max(now);
        let duration = clip.duration();
        match playback.start(clip, start_at) {
            Ok(id) => {
                resources.next_start = start_at + duration;
                resources.sources.push(ScheduledSource {
                    id,
                    ends_at: resources.next_start,
                });
            }
            Err(err) => warn!(generation, "voice: failed to schedule playback: {err}"),
        }
    }

    async fn run_tools(
        self: Arc<Self>,
        generation: u64,
        mut batches: mpsc::UnboundedReceiver<Vec<ToolCall>>,
    ) {
        while let Some(calls) = batches.recv().await {
            if !self.is_current(generation) {
                debug!(generation, "voice: skipping tool calls queued before teardown");
                continue;
            }
            let responses = tools::execute_tool_calls(self.directory.as_ref(), &calls).await;
            self.deliver_tool_responses(generation, responses);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn is_active(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && state.phase == VoiceState::Active
    }

    fn deliver_tool_responses(&self, generation: u64, responses: Vec<ToolResponse>) {
        let (session, finished) = {
            let mut state = self.lock();
            let session = state.resources.session.clone();
            let (Some(session), true) = (session, state.generation == generation) else {
                debug!(
                    generation,
                    responses = responses.len(),
                    "voice: discarding tool responses for a closed session"
                );
                return;
            };
            state.processing = state.processing.saturating_sub(1);
            (session, state.processing == 0)
        };
        if let Err(err) = session.send_tool_responses(responses) {
            warn!(generation, "voice: failed to send tool responses: {err}");
        }
        if finished {
            self.emit(VoiceEvent::Processing(false));
        }
    }
}

#[cfg(test)]
#[path = "tests/voice_tests.rs"]
mod tests;
