//! Session controller: the front door for previewing and recording a deck.
//!
//! The controller owns every running task. Start operations are idempotent
//! while something is active, and dropping the controller cancels whatever is
//! still running.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioBus, AudioMonitor, MusicSynthesizer, NoVoiceInput, VoiceInput};
use crate::record::{self, Artifact, EncoderFactory, MatroskaFactory, RecordingJob};
use crate::render::{SlideRenderer, Surface};
use crate::timeline::{DriveHandle, DriveMode, PlaybackClock, Timeline, TimelineDriver};
use crate::{MusicConfig, PipelineConfig, Result, SlideDeck, SlidecastError};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Previewing,
    Recording,
    Finalizing,
    Done,
    Failed,
}

impl SessionState {
    /// Done and Failed are final for a controller.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Previewing | Self::Recording | Self::Finalizing)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Previewing) | (Idle, Recording) | (Previewing, Idle) => true,
            (Recording, Finalizing) | (Finalizing, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Latest frame drawn by the preview or recording loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameStatus {
    pub slide_index: usize,
    pub elapsed_seconds: f64,
}

enum Activity {
    Preview {
        drive: DriveHandle,
        audio: JoinHandle<Option<Box<dyn AudioMonitor>>>,
        stop: CancellationToken,
    },
    Recording {
        task: JoinHandle<Result<Artifact>>,
        stop: CancellationToken,
    },
}

impl Activity {
    fn cancel(&self) {
        match self {
            Activity::Preview { drive, stop, .. } => {
                drive.cancel();
                stop.cancel();
            }
            Activity::Recording { stop, .. } => stop.cancel(),
        }
    }
}

/// Runs previews and recordings of one slide deck.
///
/// `start_preview` and `start_recording` spawn onto the current Tokio runtime
/// and must be called from within one.
pub struct SessionController {
    config: PipelineConfig,
    deck: SlideDeck,
    target_duration_seconds: f64,
    music: watch::Sender<MusicConfig>,
    voice: Arc<dyn VoiceInput>,
    encoders: Arc<dyn EncoderFactory>,
    monitor: Option<Box<dyn AudioMonitor>>,
    state: Arc<watch::Sender<SessionState>>,
    frames: Arc<watch::Sender<Option<FrameStatus>>>,
    active: Option<Activity>,
    artifact: Option<Artifact>,
    failure: Option<String>,
    launches: u32,
}

impl SessionController {
    /// Validates everything up front so a bad deck, duration or
    /// configuration never reaches a running task.
    pub fn new(
        config: PipelineConfig,
        deck: SlideDeck,
        target_duration_seconds: f64,
        music: MusicConfig,
    ) -> Result<Self> {
        config.validate()?;
        let target_duration_seconds = Timeline::new(target_duration_seconds, deck.len())?.total_duration_seconds;
        let (music, _) = watch::channel(music.validated()?);
        let (state, _) = watch::channel(SessionState::Idle);
        let (frames, _) = watch::channel(None);

        Ok(Self {
            config,
            deck,
            target_duration_seconds,
            music,
            voice: Arc::new(NoVoiceInput),
            encoders: Arc::new(MatroskaFactory),
            monitor: None,
            state: Arc::new(state),
            frames: Arc::new(frames),
            active: None,
            artifact: None,
            failure: None,
            launches: 0,
        })
    }

    pub fn with_voice_input(mut self, voice: Arc<dyn VoiceInput>) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_encoder_factory(mut self, encoders: Arc<dyn EncoderFactory>) -> Self {
        self.encoders = encoders;
        self
    }

    /// Routes the preview audio to `monitor`. It is finished when the
    /// preview stops.
    pub fn with_preview_monitor(mut self, monitor: Box<dyn AudioMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<FrameStatus>> {
        self.frames.subscribe()
    }

    pub fn target_duration_seconds(&self) -> f64 {
        self.target_duration_seconds
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn take_artifact(&mut self) -> Option<Artifact> {
        self.artifact.take()
    }

    /// Why the last recording failed, if it did.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn music(&self) -> MusicConfig {
        *self.music.borrow()
    }

    /// Updates the music bed. Running synthesizers pick it up on their next
    /// bar.
    pub fn set_music(&self, music: MusicConfig) -> Result<()> {
        self.music.send_replace(music.validated()?);
        Ok(())
    }

    fn admit_start(&self, operation: &str) -> Result<bool> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SlidecastError::InvalidState(state));
        }
        if state.is_active() || self.active.is_some() {
            tracing::debug!(?state, operation, "session already active; ignoring");
            return Ok(false);
        }
        Ok(true)
    }

    /// Starts the looping preview with the music bed.
    pub fn start_preview(&mut self) -> Result<()> {
        if !self.admit_start("start_preview")? {
            return Ok(());
        }

        let driver = TimelineDriver::new(self.deck.clone(), self.target_duration_seconds, DriveMode::Preview)?;
        let renderer = SlideRenderer::new(self.config.render.fallback_label.clone());
        let mut surface = Surface::new(self.config.render.width, self.config.render.height)?;
        let clock = PlaybackClock::start();

        let frames = Arc::clone(&self.frames);
        let drive = driver.drive(clock, self.config.render.refresh_hz, move |slide, elapsed| {
            renderer.render(&mut surface, &slide.text, slide.index, elapsed);
            frames.send_replace(Some(FrameStatus {
                slide_index: slide.index,
                elapsed_seconds: elapsed,
            }));
        });

        // Muted bars keep the schedule alive so `set_music` can unmute later.
        let (bar_tx, bar_rx) = mpsc::unbounded_channel();
        let synth = MusicSynthesizer::new(self.music.subscribe(), clock).start(bar_tx);
        let bus = AudioBus::new(self.config.audio.sample_rate, bar_rx, Some(synth));
        let stop = CancellationToken::new();
        let audio = tokio::spawn(pump_preview_audio(
            bus,
            clock,
            self.monitor.take(),
            Duration::from_millis(self.config.capture.chunk_interval_ms),
            stop.clone(),
        ));

        self.active = Some(Activity::Preview { drive, audio, stop });
        self.launches += 1;
        self.state.send_replace(SessionState::Previewing);
        tracing::info!(slides = self.deck.len(), "preview started");
        Ok(())
    }

    /// Starts a recording. Completion is observed with [`Self::wait`] or the
    /// state channel.
    pub fn start_recording(&mut self) -> Result<()> {
        if !self.admit_start("start_recording")? {
            return Ok(());
        }

        let stop = CancellationToken::new();
        let job = RecordingJob {
            deck: self.deck.clone(),
            target_duration_seconds: self.target_duration_seconds,
            config: self.config.clone(),
            music: self.music.subscribe(),
            voice: Arc::clone(&self.voice),
            encoders: Arc::clone(&self.encoders),
            state: Arc::clone(&self.state),
            frames: Arc::clone(&self.frames),
            stop: stop.clone(),
        };

        self.state.send_replace(SessionState::Recording);
        let task = tokio::spawn(record::record(job));
        self.active = Some(Activity::Recording { task, stop });
        self.launches += 1;
        Ok(())
    }

    /// Stops whatever is running. A preview returns to `Idle`; a recording is
    /// cut short and still finalized into an artifact.
    pub async fn stop(&mut self) -> Result<()> {
        match self.active.take() {
            None => Ok(()),
            Some(Activity::Preview { drive, audio, stop }) => {
                drive.cancel();
                stop.cancel();
                let frames = drive.finished().await;
                let monitor = audio
                    .await
                    .map_err(|err| SlidecastError::msg(format!("preview audio task failed: {err}")))?;
                self.state.send_replace(SessionState::Idle);
                tracing::info!(frames, "preview stopped");
                match monitor {
                    Some(monitor) => monitor.finish(),
                    None => Ok(()),
                }
            }
            Some(Activity::Recording { task, stop }) => {
                stop.cancel();
                self.settle(task).await
            }
        }
    }

    /// Waits for a running recording to finish. Returns immediately when no
    /// recording is active.
    pub async fn wait(&mut self) -> Result<()> {
        match self.active.take() {
            Some(Activity::Recording { task, .. }) => self.settle(task).await,
            other => {
                self.active = other;
                Ok(())
            }
        }
    }

    async fn settle(&mut self, task: JoinHandle<Result<Artifact>>) -> Result<()> {
        let outcome = task
            .await
            .map_err(|err| SlidecastError::msg(format!("recording task failed: {err}")))
            .and_then(|result| result);

        match outcome {
            Ok(artifact) => {
                self.artifact = Some(artifact);
                Ok(())
            }
            Err(err) => {
                self.failure = Some(err.to_string());
                if self.state() != SessionState::Failed {
                    self.state.send_replace(SessionState::Failed);
                }
                Err(err)
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(activity) = self.active.take() {
            activity.cancel();
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("slides", &self.deck.len())
            .field("target_duration_seconds", &self.target_duration_seconds)
            .field("artifact", &self.artifact.is_some())
            .finish()
    }
}

/// Keeps the preview bed moving: schedules bars as they arrive and pulls the
/// mix forward in blocks for the monitor.
async fn pump_preview_audio(
    mut bus: AudioBus,
    clock: PlaybackClock,
    mut monitor: Option<Box<dyn AudioMonitor>>,
    period: Duration,
    stop: CancellationToken,
) -> Option<Box<dyn AudioMonitor>> {
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(bar) = bus.next_bar(), if bus.music_active() => bus.schedule(bar),
            _ = tick.tick() => {
                let block = bus.mix_until(clock.elapsed_seconds());
                if let Some(sink) = monitor.as_mut() {
                    if let Err(err) = sink.write(&block) {
                        tracing::warn!(error = %err, "preview monitor failed; muting");
                        monitor = None;
                    }
                }
            }
        }
    }

    bus.stop_music();
    monitor
}
