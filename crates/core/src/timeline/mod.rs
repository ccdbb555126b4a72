use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{config, Result, Slide, SlideDeck, SlidecastError};

/// Monotonic session clock shared by rendering and audio scheduling.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    origin: Instant,
}

impl PlaybackClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// Instant at which the clock reads `seconds`.
    pub fn instant_at(&self, seconds: f64) -> Instant {
        self.origin + Duration::from_secs_f64(seconds.max(0.0))
    }
}

/// Total duration split evenly across the slides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub total_duration_seconds: f64,
    pub slide_count: usize,
}

impl Timeline {
    /// Validates the inputs. Zero slides or a non-positive duration never
    /// reach a driver.
    pub fn new(total_duration_seconds: f64, slide_count: usize) -> Result<Self> {
        if slide_count == 0 {
            return Err(SlidecastError::validation("at least one slide is required"));
        }
        Ok(Self {
            total_duration_seconds: config::normalize_duration(total_duration_seconds)?,
            slide_count,
        })
    }

    pub fn per_slide_seconds(&self) -> f64 {
        self.total_duration_seconds / self.slide_count.max(1) as f64
    }

    /// Slide shown at `elapsed_seconds`, clamped to the last slide.
    pub fn index_at(&self, elapsed_seconds: f64) -> usize {
        let raw = (elapsed_seconds.max(0.0) / self.per_slide_seconds()).floor() as usize;
        raw.min(self.slide_count - 1)
    }

    pub fn is_complete(&self, elapsed_seconds: f64) -> bool {
        elapsed_seconds >= self.total_duration_seconds
    }
}

/// Whether the driver stops at the end of the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveMode {
    /// Loops on the last slide until cancelled.
    Preview,
    /// Finishes once elapsed reaches the total duration.
    Recording,
}

/// Maps elapsed time onto the slide deck.
#[derive(Debug, Clone)]
pub struct TimelineDriver {
    deck: SlideDeck,
    timeline: Timeline,
    mode: DriveMode,
}

impl TimelineDriver {
    pub fn new(deck: SlideDeck, total_duration_seconds: f64, mode: DriveMode) -> Result<Self> {
        let timeline = Timeline::new(total_duration_seconds, deck.len())?;
        Ok(Self {
            deck,
            timeline,
            mode,
        })
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    /// Slide for `elapsed_seconds`, or `None` once a recording is complete.
    pub fn frame_at(&self, elapsed_seconds: f64) -> Option<&Slide> {
        if self.mode == DriveMode::Recording && self.timeline.is_complete(elapsed_seconds) {
            return None;
        }
        self.deck.get(self.timeline.index_at(elapsed_seconds))
    }

    /// Spawns a loop that calls `on_frame` with the current slide and elapsed
    /// seconds once per refresh tick. It stops when the returned handle is
    /// cancelled or, in recording mode, when the timeline completes.
    pub fn drive<F>(self, clock: PlaybackClock, refresh_hz: f64, mut on_frame: F) -> DriveHandle
    where
        F: FnMut(&Slide, f64) + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let period = Duration::from_secs_f64(1.0 / refresh_hz.max(1.0));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut frames: u64 = 0;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let elapsed = clock.elapsed_seconds();
                        match self.frame_at(elapsed) {
                            Some(slide) => {
                                on_frame(slide, elapsed);
                                frames += 1;
                            }
                            None => break,
                        }
                    }
                }
            }

            tracing::debug!(frames, mode = ?self.mode, "timeline driver stopped");
            frames
        });

        DriveHandle { token, task }
    }
}

/// Handle to a running [`TimelineDriver::drive`] loop.
#[derive(Debug)]
pub struct DriveHandle {
    token: CancellationToken,
    task: JoinHandle<u64>,
}

impl DriveHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to end and returns how many frames it drew.
    pub async fn finished(self) -> u64 {
        self.task.await.unwrap_or_default()
    }
}
