//! Audio backends that do not need a sound card: a scripted one driven by
//! tests and one that reads and writes raw PCM files.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    runtime::Handle,
    sync::{mpsc, watch},
};
use tracing::{debug, warn};

use crate::{
    pcm, AudioBackend, AudioClip, CaptureStream, PlaybackContext, SourceId, CAPTURE_FRAME_SAMPLES,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

#[derive(Default)]
struct ScriptedState {
    captures: Vec<Arc<ScriptedCapture>>,
    playbacks: Vec<Arc<VirtualPlayback>>,
}

/// Backend whose microphone frames are pushed by the caller and whose
/// playback runs on a manual clock.
#[derive(Default)]
pub struct ScriptedAudioBackend {
    deny_microphone: bool,
    fail_playback: bool,
    state: Mutex<ScriptedState>,
}

impl ScriptedAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying_microphone() -> Self {
        Self {
            deny_microphone: true,
            ..Self::default()
        }
    }

    pub fn failing_playback() -> Self {
        Self {
            fail_playback: true,
            ..Self::default()
        }
    }

    /// Feeds a frame to the most recently opened capture stream.
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        match self.last_capture() {
            Some(capture) => capture.push(samples),
            None => false,
        }
    }

    pub fn last_capture(&self) -> Option<Arc<ScriptedCapture>> {
        lock(&self.state).captures.last().cloned()
    }

    pub fn last_playback(&self) -> Option<Arc<VirtualPlayback>> {
        lock(&self.state).playbacks.last().cloned()
    }

    pub fn capture_count(&self) -> usize {
        lock(&self.state).captures.len()
    }
}

#[async_trait]
impl AudioBackend for ScriptedAudioBackend {
    async fn open_capture(&self, sample_rate: u32) -> Result<Arc<dyn CaptureStream>> {
        if self.deny_microphone {
            return Err(anyhow!("microphone permission denied"));
        }
        let capture = Arc::new(ScriptedCapture::new(sample_rate));
        lock(&self.state).captures.push(capture.clone());
        Ok(capture)
    }

    fn open_playback(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackContext>> {
        if self.fail_playback {
            return Err(anyhow!("audio output unavailable"));
        }
        let playback = Arc::new(VirtualPlayback::new(sample_rate));
        lock(&self.state).playbacks.push(playback.clone());
        Ok(playback)
    }
}

pub struct ScriptedCapture {
    sample_rate: u32,
    sender: mpsc::UnboundedSender<Vec<f32>>,
    frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<f32>>>,
    closed: watch::Sender<bool>,
}

impl ScriptedCapture {
    fn new(sample_rate: u32) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            sample_rate,
            sender,
            frames: tokio::sync::Mutex::new(receiver),
            closed,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn push(&self, samples: Vec<f32>) -> bool {
        !self.is_closed() && self.sender.send(samples).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl CaptureStream for ScriptedCapture {
    async fn next_frame(&self) -> Option<Vec<f32>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut frames = self.frames.lock().await;
        tokio::select! {
            frame = frames.recv() => frame,
            _ = closed_signal(&mut closed) => None,
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledClip {
    pub id: SourceId,
    pub start_at: f64,
    pub duration: f64,
}

#[derive(Default)]
struct PlaybackState {
    now: f64,
    next_id: u64,
    scheduled: Vec<ScheduledClip>,
    stopped: Vec<SourceId>,
    closed: bool,
}

/// Playback context that records what was scheduled. Time only moves when
/// the caller advances it.
pub struct VirtualPlayback {
    sample_rate: u32,
    state: Mutex<PlaybackState>,
}

impl VirtualPlayback {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(PlaybackState::default()),
        }
    }

    pub fn advance(&self, seconds: f64) {
        lock(&self.state).now += seconds;
    }

    pub fn set_time(&self, seconds: f64) {
        lock(&self.state).now = seconds;
    }

    pub fn scheduled(&self) -> Vec<ScheduledClip> {
        lock(&self.state).scheduled.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        lock(&self.state).stopped.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl PlaybackContext for VirtualPlayback {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        lock(&self.state).now
    }

    fn start(&self, clip: AudioClip, at: f64) -> Result<SourceId> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(anyhow!("playback context is closed"));
        }
        state.next_id += 1;
        let id = SourceId(state.next_id);
        state.scheduled.push(ScheduledClip {
            id,
            start_at: at,
            duration: clip.duration(),
        });
        Ok(id)
    }

    fn stop(&self, source: SourceId) {
        let mut state = lock(&self.state);
        if !state.stopped.contains(&source) {
            state.stopped.push(source);
        }
    }

    fn close(&self) {
        lock(&self.state).closed = true;
    }
}

/// Streams microphone audio from a raw s16le file and appends the spoken
/// reply to another one.
pub struct PcmFileBackend {
    input: PathBuf,
    output: PathBuf,
}

impl PcmFileBackend {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

#[async_trait]
impl AudioBackend for PcmFileBackend {
    async fn open_capture(&self, sample_rate: u32) -> Result<Arc<dyn CaptureStream>> {
        let bytes = tokio::fs::read(&self.input)
            .await
            .with_context(|| format!("failed to read capture file {}", self.input.display()))?;
        let clip = pcm::decode_pcm16(&bytes, sample_rate);
        let frames: VecDeque<Vec<f32>> = clip
            .samples
            .chunks(CAPTURE_FRAME_SAMPLES)
            .map(<[f32]>::to_vec)
            .collect();
        debug!(
            path = %self.input.display(),
            frames = frames.len(),
            "voice: loaded capture file"
        );
        let pace = Duration::from_secs_f64(CAPTURE_FRAME_SAMPLES as f64 / f64::from(sample_rate));
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(FileCapture {
            frames: Mutex::new(frames),
            pace,
            closed,
        }))
    }

    /// Truncates `output` and appends every started clip to it from a writer
    /// task, so scheduling never waits on the disk.
    fn open_playback(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackContext>> {
        let runtime = Handle::try_current().context("file playback needs a tokio runtime")?;
        let (clips, pending) = mpsc::unbounded_channel();
        runtime.spawn(write_clips(self.output.clone(), pending));
        Ok(Arc::new(FilePlayback {
            sample_rate,
            opened_at: Instant::now(),
            next_id: Mutex::new(0),
            clips: Mutex::new(Some(clips)),
        }))
    }
}

async fn write_clips(path: PathBuf, mut clips: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), "voice: failed to open playback file: {err}");
            return;
        }
    };
    while let Some(bytes) = clips.recv().await {
        if let Err(err) = file.write_all(&bytes).await {
            warn!(path = %path.display(), "voice: failed to write playback clip: {err}");
            return;
        }
    }
    if let Err(err) = file.flush().await {
        warn!(path = %path.display(), "voice: failed to flush playback file: {err}");
    }
}

struct FileCapture {
    frames: Mutex<VecDeque<Vec<f32>>>,
    pace: Duration,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl CaptureStream for FileCapture {
    async fn next_frame(&self) -> Option<Vec<f32>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.pace) => lock(&self.frames).pop_front(),
            _ = closed_signal(&mut closed) => None,
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

struct FilePlayback {
    sample_rate: u32,
    opened_at: Instant,
    next_id: Mutex<u64>,
    clips: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl PlaybackContext for FilePlayback {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn start(&self, clip: AudioClip, at: f64) -> Result<SourceId> {
        let bytes = pcm::encode_pcm16(&clip.samples);
        {
            let clips = lock(&self.clips);
            let Some(clips) = clips.as_ref() else {
                return Err(anyhow!("playback context is closed"));
            };
            clips
                .send(bytes)
                .map_err(|_| anyhow!("playback file writer stopped"))?;
        }
        let mut next_id = lock(&self.next_id);
        *next_id += 1;
        debug!(source = *next_id, start_at = at, "voice: queued playback clip");
        Ok(SourceId(*next_id))
    }

    fn stop(&self, _source: SourceId) {}

    /// Clips already started are still written out.
    fn close(&self) {
        lock(&self.clips).take();
    }
}
