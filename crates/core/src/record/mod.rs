//! Capture and mux: one recording pass from the first frame to the finished
//! artifact.
//!
//! The recording loop is the only place that touches the surface, the audio
//! bus and the chunk buffer. Render ticks, capture ticks, chunk flushes, music
//! bars and encoder output are all serialized through a single `select!`.
//! Encoding runs on a dedicated thread so JPEG compression never stalls the
//! clock.

pub mod encoder;
pub mod matroska;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use encoder::{EncoderFactory, EncoderSettings, MatroskaFactory, MediaEncoder, VideoFrame};
pub use matroska::MatroskaEncoder;

use crate::audio::{AudioBus, MusicSynthesizer, VoiceInput};
use crate::render::{SlideRenderer, Surface};
use crate::timeline::{DriveMode, PlaybackClock, TimelineDriver};
use crate::{FrameStatus, MusicConfig, PipelineConfig, Result, SessionState, SlideDeck, SlidecastError};

/// Commands queued for the encoder thread.
const ENCODER_QUEUE: usize = 64;

/// The finished recording.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub video: Bytes,
    pub mime_type: String,
    pub thumbnail_png: Bytes,
}

/// Encoded chunks in arrival order.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: Vec<Bytes>,
    total_bytes: usize,
}

impl ChunkBuffer {
    /// Appends a chunk. Empty chunks are dropped and reported as `false`.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return false;
        }
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
        true
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    /// Concatenates every chunk in the order received.
    pub fn concat(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.total_bytes);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.total_bytes = 0;
        out.freeze()
    }
}

/// State of one recording pass. Transitions are checked and every change is
/// published on the shared state channel.
#[derive(Debug)]
pub struct CaptureSession {
    state: SessionState,
    started_at: Option<Instant>,
    target_duration_seconds: f64,
    chunks: ChunkBuffer,
    publish: Arc<watch::Sender<SessionState>>,
}

impl CaptureSession {
    pub fn new(target_duration_seconds: f64, publish: Arc<watch::Sender<SessionState>>) -> Self {
        Self {
            state: SessionState::Idle,
            started_at: None,
            target_duration_seconds,
            chunks: ChunkBuffer::default(),
            publish,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn target_duration_seconds(&self) -> f64 {
        self.target_duration_seconds
    }

    pub fn chunks(&self) -> &ChunkBuffer {
        &self.chunks
    }

    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(SlidecastError::InvalidState(self.state));
        }
        if next == SessionState::Recording {
            self.started_at = Some(Instant::now());
        }
        tracing::debug!(from = ?self.state, to = ?next, "capture state changed");
        self.state = next;
        self.publish.send_replace(next);
        Ok(())
    }

    pub fn append_chunk(&mut self, chunk: Bytes) {
        if !self.chunks.push(chunk) {
            tracing::trace!("skipped empty chunk");
        }
    }

    /// Joins the buffered chunks into the final container.
    pub fn take_video(&mut self) -> Bytes {
        self.chunks.concat()
    }

    /// Drops everything buffered and moves to `Failed`.
    pub fn fail(&mut self) {
        self.chunks.clear();
        self.state = SessionState::Failed;
        self.publish.send_replace(SessionState::Failed);
    }
}

enum EncoderCommand {
    Video(VideoFrame),
    Audio(Vec<f32>),
    Flush,
    Stop,
}

/// Output of the encoder thread.
#[derive(Debug)]
pub enum EncoderEvent {
    Chunk(Bytes),
    /// The encoder flushed everything after a stop request.
    Stopped,
    Failed(String),
}

struct EncoderWorker {
    commands: mpsc::Sender<EncoderCommand>,
    events: mpsc::UnboundedReceiver<EncoderEvent>,
}

impl EncoderWorker {
    fn spawn(encoder: Box<dyn MediaEncoder>) -> Result<Self> {
        let (commands, queue) = mpsc::channel(ENCODER_QUEUE);
        let (event_tx, events) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("slidecast-encoder".into())
            .spawn(move || run_encoder(encoder, queue, event_tx))?;
        Ok(Self { commands, events })
    }

    async fn next_event(&mut self) -> Option<EncoderEvent> {
        self.events.recv().await
    }

    /// Queues a command. If the thread has already exited, the error carries
    /// the failure it reported rather than a generic one.
    async fn send(&mut self, command: EncoderCommand) -> Result<()> {
        if self.commands.send(command).await.is_ok() {
            return Ok(());
        }
        while let Ok(event) = self.events.try_recv() {
            if let EncoderEvent::Failed(reason) = event {
                return Err(SlidecastError::Encoder(reason));
            }
        }
        Err(SlidecastError::encoder("encoder thread exited"))
    }
}

fn run_encoder(
    mut encoder: Box<dyn MediaEncoder>,
    mut queue: mpsc::Receiver<EncoderCommand>,
    events: mpsc::UnboundedSender<EncoderEvent>,
) {
    while let Some(command) = queue.blocking_recv() {
        let outcome = match command {
            EncoderCommand::Video(frame) => encoder.push_video(&frame).map(|_| None),
            EncoderCommand::Audio(samples) => encoder.push_audio(&samples).map(|_| None),
            EncoderCommand::Flush => encoder.drain().map(Some),
            EncoderCommand::Stop => {
                match encoder.finish() {
                    Ok(tail) => {
                        let _ = events.send(EncoderEvent::Chunk(Bytes::from(tail)));
                        let _ = events.send(EncoderEvent::Stopped);
                    }
                    Err(err) => {
                        let _ = events.send(EncoderEvent::Failed(err.to_string()));
                    }
                }
                return;
            }
        };

        match outcome {
            Ok(Some(chunk)) => {
                if events.send(EncoderEvent::Chunk(Bytes::from(chunk))).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                let _ = events.send(EncoderEvent::Failed(err.to_string()));
                return;
            }
        }
    }
}

/// Everything a recording pass needs. Built by the session controller.
pub struct RecordingJob {
    pub deck: SlideDeck,
    pub target_duration_seconds: f64,
    pub config: PipelineConfig,
    pub music: watch::Receiver<MusicConfig>,
    pub voice: Arc<dyn VoiceInput>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub state: Arc<watch::Sender<SessionState>>,
    pub frames: Arc<watch::Sender<Option<FrameStatus>>>,
    /// Cancelling ends the capture early; the pass still finalizes.
    pub stop: CancellationToken,
}

/// Runs one recording to completion. On success the session ends in `Done`;
/// on any error it ends in `Failed` and buffered chunks are discarded.
pub async fn record(job: RecordingJob) -> Result<Artifact> {
    let mut session = CaptureSession::new(job.target_duration_seconds, Arc::clone(&job.state));

    match capture(&mut session, job).await {
        Ok(artifact) => {
            session.advance(SessionState::Done)?;
            tracing::info!(
                bytes = artifact.video.len(),
                mime = %artifact.mime_type,
                "recording finished"
            );
            Ok(artifact)
        }
        Err(err) => {
            tracing::error!(error = %err, "recording failed");
            session.fail();
            Err(err)
        }
    }
}

async fn capture(session: &mut CaptureSession, job: RecordingJob) -> Result<Artifact> {
    let RecordingJob {
        deck,
        target_duration_seconds,
        config,
        music,
        voice,
        encoders,
        frames,
        stop,
        ..
    } = job;

    config.validate()?;
    let driver = TimelineDriver::new(deck.clone(), target_duration_seconds, DriveMode::Recording)?;
    let total = driver.timeline().total_duration_seconds;
    let renderer = SlideRenderer::new(config.render.fallback_label.clone());
    let mut surface = Surface::new(config.render.width, config.render.height)?;

    let settings = EncoderSettings::from_config(&config);
    let encoder = encoders.create(&settings)?;
    let mime_type = encoder.mime_type().to_string();
    let mut worker = EncoderWorker::spawn(encoder)?;

    let sample_rate = config.audio.sample_rate;
    let voice_stream = match voice.open(sample_rate).await {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(error = %err, "recording without voice input");
            None
        }
    };

    session.advance(SessionState::Recording)?;
    let clock = PlaybackClock::start();
    let (bar_tx, bar_rx) = mpsc::unbounded_channel();
    let music_enabled = music.borrow().enabled;
    // Runs even while muted so that enabling music mid-take is heard.
    let synth = MusicSynthesizer::new(music, clock).start(bar_tx);
    let mut bus = AudioBus::new(sample_rate, bar_rx, Some(synth));
    if let Some(stream) = voice_stream {
        bus = bus.with_voice(stream, config.audio.voice_gain);
    }

    tracing::info!(
        slides = deck.len(),
        duration = total,
        voice = bus.has_voice(),
        music = music_enabled,
        "recording started"
    );

    let mut render_tick = tokio::time::interval(Duration::from_secs_f64(1.0 / config.render.refresh_hz));
    render_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut capture_tick = tokio::time::interval(Duration::from_secs_f64(1.0 / config.capture.fps as f64));
    capture_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let flush_period = Duration::from_millis(config.capture.chunk_interval_ms);
    let mut flush_tick = tokio::time::interval_at(Instant::now() + flush_period, flush_period);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep_until(clock.instant_at(total));
    tokio::pin!(deadline);

    let mut frames_captured: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::info!(elapsed = clock.elapsed_seconds(), "recording stopped early");
                break;
            }
            _ = &mut deadline => break,
            Some(event) = worker.next_event() => match event {
                EncoderEvent::Chunk(chunk) => session.append_chunk(chunk),
                EncoderEvent::Failed(reason) => return Err(SlidecastError::Encoder(reason)),
                EncoderEvent::Stopped => return Err(SlidecastError::encoder("encoder stopped unexpectedly")),
            },
            Some(bar) = bus.next_bar(), if bus.music_active() => bus.schedule(bar),
            _ = render_tick.tick() => {
                let elapsed = clock.elapsed_seconds();
                match driver.frame_at(elapsed) {
                    Some(slide) => {
                        renderer.render(&mut surface, &slide.text, slide.index, elapsed);
                        frames.send_replace(Some(FrameStatus {
                            slide_index: slide.index,
                            elapsed_seconds: elapsed,
                        }));
                    }
                    None => break,
                }
            }
            _ = capture_tick.tick() => {
                let timestamp = clock.elapsed_seconds().min(total);
                worker.send(EncoderCommand::Video(VideoFrame::capture(&surface, timestamp))).await?;
                frames_captured += 1;
            }
            _ = flush_tick.tick() => {
                let block = bus.mix_until(clock.elapsed_seconds().min(total));
                worker.send(EncoderCommand::Audio(block)).await?;
                worker.send(EncoderCommand::Flush).await?;
            }
        }
    }

    session.advance(SessionState::Finalizing)?;
    let end = clock.elapsed_seconds().min(total);
    let tail = bus.mix_until(end);
    bus.stop_music();
    worker.send(EncoderCommand::Audio(tail)).await?;
    worker.send(EncoderCommand::Stop).await?;

    loop {
        match worker.next_event().await {
            Some(EncoderEvent::Chunk(chunk)) => session.append_chunk(chunk),
            Some(EncoderEvent::Stopped) => break,
            Some(EncoderEvent::Failed(reason)) => return Err(SlidecastError::Encoder(reason)),
            None => return Err(SlidecastError::encoder("encoder exited without acknowledging stop")),
        }
    }
    tracing::debug!(
        frames = frames_captured,
        chunks = session.chunks().len(),
        bytes = session.chunks().total_bytes(),
        audio_seconds = bus.engine().elapsed_seconds(),
        "encoder drained"
    );

    let video = session.take_video();
    let first_text = deck.first().map(|slide| slide.text.clone()).unwrap_or_default();
    let thumbnail = tokio::task::spawn_blocking(move || renderer.thumbnail_png(&first_text))
        .await
        .map_err(|err| SlidecastError::msg(format!("thumbnail task failed: {err}")))??;

    Ok(Artifact {
        video,
        mime_type,
        thumbnail_png: Bytes::from(thumbnail),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::audio::{MemoryVoiceInput, NoVoiceInput};

    #[derive(Default)]
    struct Captured {
        frames: Vec<f64>,
        audio: Vec<f32>,
    }

    /// Records what it is fed and emits a numbered chunk per drain.
    struct CollectingEncoder {
        captured: Arc<Mutex<Captured>>,
        drains: usize,
    }

    impl MediaEncoder for CollectingEncoder {
        fn mime_type(&self) -> &str {
            "application/x-test"
        }

        fn push_video(&mut self, frame: &VideoFrame) -> Result<()> {
            self.captured.lock().unwrap().frames.push(frame.timestamp_seconds);
            Ok(())
        }

        fn push_audio(&mut self, samples: &[f32]) -> Result<()> {
            self.captured.lock().unwrap().audio.extend_from_slice(samples);
            Ok(())
        }

        fn drain(&mut self) -> Result<Vec<u8>> {
            self.drains += 1;
            Ok(if self.drains % 2 == 0 { Vec::new() } else { vec![b'c'] })
        }

        fn finish(&mut self) -> Result<Vec<u8>> {
            Ok(b"end".to_vec())
        }
    }

    struct CollectingFactory(Arc<Mutex<Captured>>);

    impl EncoderFactory for CollectingFactory {
        fn create(&self, _settings: &EncoderSettings) -> Result<Box<dyn MediaEncoder>> {
            Ok(Box::new(CollectingEncoder {
                captured: Arc::clone(&self.0),
                drains: 0,
            }))
        }
    }

    /// Accepts video but fails the first audio block.
    struct FullDiskEncoder;

    impl MediaEncoder for FullDiskEncoder {
        fn mime_type(&self) -> &str {
            "application/x-test"
        }

        fn push_video(&mut self, _frame: &VideoFrame) -> Result<()> {
            Ok(())
        }

        fn push_audio(&mut self, _samples: &[f32]) -> Result<()> {
            Err(SlidecastError::encoder("disk full"))
        }

        fn drain(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn finish(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct BrokenFactory;

    impl EncoderFactory for BrokenFactory {
        fn create(&self, _settings: &EncoderSettings) -> Result<Box<dyn MediaEncoder>> {
            Err(SlidecastError::encoder("no codec available"))
        }
    }

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.render.width = 64;
        config.render.height = 36;
        config.render.refresh_hz = 30.0;
        config.audio.sample_rate = 8000;
        config.capture.fps = 10;
        config
    }

    fn job(
        encoders: Arc<dyn EncoderFactory>,
        voice: Arc<dyn VoiceInput>,
        music: MusicConfig,
    ) -> (RecordingJob, watch::Receiver<SessionState>) {
        let (state, state_rx) = watch::channel(SessionState::Idle);
        let (frames, _) = watch::channel(None);
        let (_music_tx, music_rx) = watch::channel(music);
        let job = RecordingJob {
            deck: SlideDeck::new(["First", "Second"]).unwrap(),
            target_duration_seconds: 5.0,
            config: small_config(),
            music: music_rx,
            voice,
            encoders,
            state: Arc::new(state),
            frames: Arc::new(frames),
            stop: CancellationToken::new(),
        };
        (job, state_rx)
    }

    #[test]
    fn chunks_concatenate_in_order() {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        let mut session = CaptureSession::new(5.0, Arc::new(tx));
        session.append_chunk(Bytes::from_static(b"c1"));
        session.append_chunk(Bytes::new());
        session.append_chunk(Bytes::from_static(b"c2"));
        session.append_chunk(Bytes::from_static(b"c3"));
        assert_eq!(session.chunks().len(), 3);
        assert_eq!(session.take_video(), Bytes::from_static(b"c1c2c3"));
    }

    #[test]
    fn transitions_are_checked() {
        let (tx, rx) = watch::channel(SessionState::Idle);
        let mut session = CaptureSession::new(5.0, Arc::new(tx));
        assert!(session.advance(SessionState::Finalizing).is_err());
        session.advance(SessionState::Recording).unwrap();
        assert!(session.started_at().is_some());
        session.advance(SessionState::Finalizing).unwrap();
        assert_eq!(*rx.borrow(), SessionState::Finalizing);

        session.append_chunk(Bytes::from_static(b"partial"));
        session.fail();
        assert!(session.chunks().is_empty());
        assert_eq!(*rx.borrow(), SessionState::Failed);
        assert!(session.advance(SessionState::Recording).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn recording_collects_chunks_and_thumbnail() {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let (job, state) = job(
            Arc::new(CollectingFactory(Arc::clone(&captured))),
            Arc::new(NoVoiceInput),
            MusicConfig::default(),
        );

        let artifact = record(job).await.unwrap();
        assert_eq!(*state.borrow(), SessionState::Done);
        assert_eq!(artifact.mime_type, "application/x-test");
        assert!(artifact.video.ends_with(b"end"));
        assert!(artifact.video.iter().all(|&b| b == b'c' || b"end".contains(&b)));
        assert_eq!(&artifact.thumbnail_png[..4], &[0x89, b'P', b'N', b'G']);

        let captured = captured.lock().unwrap();
        assert!(captured.frames.len() >= 40);
        assert!(captured.frames.iter().all(|&t| t <= 5.0));
        // Voice was denied, so the track is the music bed alone.
        assert_eq!(captured.audio.len(), 5 * 8000);
        assert!(captured.audio.iter().any(|s| s.abs() > 0.01));
    }

    #[tokio::test(start_paused = true)]
    async fn voice_only_when_music_is_off() {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let music = MusicConfig {
            enabled: false,
            ..Default::default()
        };
        let (job, state) = job(
            Arc::new(CollectingFactory(Arc::clone(&captured))),
            Arc::new(MemoryVoiceInput::new(vec![0.5; 8000], 8000)),
            music,
        );

        record(job).await.unwrap();
        assert_eq!(*state.borrow(), SessionState::Done);

        let captured = captured.lock().unwrap();
        assert!((captured.audio[100] - 0.45).abs() < 1e-6);
        assert_eq!(captured.audio[8000..].iter().copied().fold(0.0_f32, f32::max), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn notes_already_due_reach_the_final_block() {
        let captured = Arc::new(Mutex::new(Captured::default()));
        // One beat is 1.2 s, so the second bar opens with a kick at 4.8 s,
        // after the last regular flush and before the end of the take.
        let music = MusicConfig {
            bpm: 50.0,
            volume: 1.0,
            ..Default::default()
        };
        let (job, _state) = job(
            Arc::new(CollectingFactory(Arc::clone(&captured))),
            Arc::new(NoVoiceInput),
            music,
        );

        record(job).await.unwrap();
        let captured = captured.lock().unwrap();
        assert_eq!(captured.audio.len(), 5 * 8000);
        let last_kick = &captured.audio[(4.8 * 8000.0) as usize..(4.9 * 8000.0) as usize];
        let peak = last_kick.iter().fold(0.0_f32, |peak, s| peak.max(s.abs()));
        assert!(peak > 0.1, "peak {peak}");
    }

    #[tokio::test]
    async fn encoder_failure_reason_survives_a_closed_queue() {
        let mut worker = EncoderWorker::spawn(Box::new(FullDiskEncoder)).unwrap();
        worker.send(EncoderCommand::Audio(vec![0.0; 16])).await.unwrap();

        let err = loop {
            match worker.send(EncoderCommand::Flush).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(err) => break err,
            }
        };
        assert!(matches!(&err, SlidecastError::Encoder(reason) if reason.contains("disk full")), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn encoder_construction_failure_fails_the_session() {
        let (job, state) = job(Arc::new(BrokenFactory), Arc::new(NoVoiceInput), MusicConfig::default());
        let err = record(job).await.unwrap_err();
        assert!(matches!(err, SlidecastError::Encoder(_)));
        assert_eq!(*state.borrow(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_early_still_finalizes() {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let (job, state) = job(
            Arc::new(CollectingFactory(Arc::clone(&captured))),
            Arc::new(NoVoiceInput),
            MusicConfig::default(),
        );
        let stop = job.stop.clone();
        let task = tokio::spawn(record(job));

        tokio::time::sleep(Duration::from_secs(2)).await;
        stop.cancel();
        let artifact = task.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), SessionState::Done);
        assert!(!artifact.video.is_empty());

        let audio_len = captured.lock().unwrap().audio.len();
        assert!(audio_len < 3 * 8000, "captured {audio_len} samples");
    }

    #[tokio::test(start_paused = true)]
    async fn matroska_recording_is_a_valid_stream() {
        let (job, _state) = job(Arc::new(MatroskaFactory), Arc::new(NoVoiceInput), MusicConfig::default());
        let artifact = record(job).await.unwrap();
        assert_eq!(artifact.mime_type, matroska::MIME_TYPE);
        assert_eq!(&artifact.video[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
    }
}
