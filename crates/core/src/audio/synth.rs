//! Procedural drum and bass loop.
//!
//! A scheduling task queues one bar of notes at a time on the audio clock and
//! wakes again at 90% of the bar to queue the next one, so every bar is in the
//! engine before it starts sounding.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{Instrument, Ramp, ScheduledEvent};
use crate::{MusicConfig, PlaybackClock};

pub const BEATS_PER_BAR: usize = 4;
/// Fraction of a bar after which the next bar is queued.
pub const LOOKAHEAD_FRACTION: f64 = 0.9;

const KICK_PEAK: f32 = 0.9;
const KICK_FLOOR: f32 = 0.001;
const HAT_PEAK: f32 = 0.08;
const HAT_HZ: f32 = 8000.0;
const HAT_OFFSET_BEATS: f64 = 0.25;
const BASS_PEAK: f32 = 0.15;
const BASS_HZ: f32 = 55.0;
const SILENT: f32 = 0.0001;

/// Timing of one bar on the audio clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarPlan {
    pub start_seconds: f64,
    pub beat_seconds: f64,
}

impl BarPlan {
    pub fn new(start_seconds: f64, bpm: f64) -> Self {
        Self {
            start_seconds,
            beat_seconds: 60.0 / bpm,
        }
    }

    pub fn bar_seconds(&self) -> f64 {
        self.beat_seconds * BEATS_PER_BAR as f64
    }

    /// Nominal end of the bar, which is where the next bar starts.
    pub fn end_seconds(&self) -> f64 {
        self.start_seconds + self.bar_seconds()
    }

    /// When the scheduler should queue the following bar.
    pub fn reschedule_at(&self) -> f64 {
        self.start_seconds + self.bar_seconds() * LOOKAHEAD_FRACTION
    }

    /// Kick on every beat, a hat a quarter beat later, bass on even beats.
    /// Gains are scaled by `volume`.
    pub fn events(&self, volume: f32) -> Vec<ScheduledEvent> {
        let mut events = Vec::with_capacity(BEATS_PER_BAR * 3);

        for beat in 0..BEATS_PER_BAR {
            let t = self.start_seconds + beat as f64 * self.beat_seconds;

            events.push(ScheduledEvent {
                start_offset_seconds: t,
                instrument: Instrument::Kick,
                frequency: Ramp::exponential(120.0, 40.0, 0.08),
                gain: Ramp::exponential(KICK_PEAK * volume, KICK_FLOOR * volume, 0.1),
                duration_seconds: 0.11,
            });

            events.push(ScheduledEvent {
                start_offset_seconds: t + HAT_OFFSET_BEATS * self.beat_seconds,
                instrument: Instrument::Hat,
                frequency: Ramp::constant(HAT_HZ),
                gain: Ramp::exponential(HAT_PEAK * volume, SILENT * volume, 0.03),
                duration_seconds: 0.035,
            });

            if beat % 2 == 0 {
                events.push(ScheduledEvent {
                    start_offset_seconds: t,
                    instrument: Instrument::Bass,
                    frequency: Ramp::constant(BASS_HZ),
                    gain: Ramp::exponential(BASS_PEAK * volume, SILENT * volume, 0.3),
                    duration_seconds: 0.31,
                });
            }
        }

        events
    }
}

/// Produces bars for the music bed. Configuration is read through a `watch`
/// channel at the start of every bar, so tempo, volume and muting changes
/// land on the next bar boundary. A muted bar is delivered empty.
#[derive(Debug)]
pub struct MusicSynthesizer {
    config: watch::Receiver<MusicConfig>,
    clock: PlaybackClock,
}

impl MusicSynthesizer {
    pub fn new(config: watch::Receiver<MusicConfig>, clock: PlaybackClock) -> Self {
        Self { config, clock }
    }

    /// Spawns the scheduling task. Bars are delivered to `bars` in order; the
    /// task ends when the handle is stopped or dropped, or when `bars` closes.
    pub fn start(self, bars: mpsc::UnboundedSender<Vec<ScheduledEvent>>) -> MusicHandle {
        let token = CancellationToken::new();
        let cancel = token.clone();

        let task = tokio::spawn(async move {
            let Self { config, clock } = self;
            let mut bar_start = clock.elapsed_seconds();
            let mut bars_sent: u64 = 0;

            loop {
                let music = *config.borrow();
                let plan = BarPlan::new(bar_start, music.bpm);

                let events = if music.enabled {
                    plan.events(music.volume)
                } else {
                    Vec::new()
                };
                if bars.send(events).is_err() {
                    break;
                }
                bars_sent += 1;
                tracing::debug!(bar = bars_sent, start = plan.start_seconds, bpm = music.bpm, "queued bar");

                bar_start = plan.end_seconds();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(clock.instant_at(plan.reschedule_at())) => {}
                }
            }

            tracing::debug!(bars = bars_sent, "music scheduler finished");
        });

        MusicHandle {
            _guard: token.clone().drop_guard(),
            token,
            task,
        }
    }
}

/// Owned handle to a running synthesizer. Dropping it cancels the scheduler.
#[derive(Debug)]
pub struct MusicHandle {
    token: CancellationToken,
    _guard: DropGuard,
    task: JoinHandle<()>,
}

impl MusicHandle {
    /// Cancels the next reschedule. Bars already handed out are unaffected.
    pub fn stop(self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn bar_timing_at_92_bpm() {
        let plan = BarPlan::new(0.0, 92.0);
        assert!((plan.beat_seconds - 0.652).abs() < 0.001);
        assert!((plan.bar_seconds() - 2.609).abs() < 0.001);
        assert!((plan.reschedule_at() - 2.348).abs() < 0.001);
    }

    #[test]
    fn bar_contains_the_full_pattern() {
        let plan = BarPlan::new(1.0, 120.0);
        let events = plan.events(1.0);

        let kicks: Vec<f64> = events
            .iter()
            .filter(|e| e.instrument == Instrument::Kick)
            .map(|e| e.start_offset_seconds)
            .collect();
        assert_eq!(kicks, vec![1.0, 1.5, 2.0, 2.5]);

        let hats: Vec<f64> = events
            .iter()
            .filter(|e| e.instrument == Instrument::Hat)
            .map(|e| e.start_offset_seconds)
            .collect();
        assert_eq!(hats, vec![1.125, 1.625, 2.125, 2.625]);

        let bass: Vec<f64> = events
            .iter()
            .filter(|e| e.instrument == Instrument::Bass)
            .map(|e| e.start_offset_seconds)
            .collect();
        assert_eq!(bass, vec![1.0, 2.0]);
    }

    #[test]
    fn volume_scales_every_gain() {
        let loud = BarPlan::new(0.0, 92.0).events(1.0);
        let quiet = BarPlan::new(0.0, 92.0).events(0.25);
        for (a, b) in loud.iter().zip(&quiet) {
            assert!((a.gain.start * 0.25 - b.gain.start).abs() < 1e-6);
        }
        assert!(BarPlan::new(0.0, 92.0).events(0.0).iter().all(|e| e.gain.start == 0.0));
    }

    #[test]
    fn consecutive_bars_are_contiguous() {
        for bpm in [40.0, 60.0, 92.0, 128.0, 174.0, 300.0] {
            let mut plan = BarPlan::new(0.0, bpm);
            for _ in 0..16 {
                let next = BarPlan::new(plan.end_seconds(), bpm);
                let first = next.events(1.0)[0].start_offset_seconds;
                assert!((first - plan.end_seconds()).abs() < EPS);
                assert!(plan.events(1.0).iter().all(|e| e.start_offset_seconds < next.start_seconds));
                assert!(plan.reschedule_at() < next.start_seconds);
                plan = next;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_queues_bars_back_to_back() {
        let (_config_tx, config_rx) = watch::channel(MusicConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = MusicSynthesizer::new(config_rx, PlaybackClock::start()).start(tx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let bar = BarPlan::new(0.0, 92.0).bar_seconds();
        assert!((second[0].start_offset_seconds - first[0].start_offset_seconds - bar).abs() < 1e-6);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn tempo_changes_apply_on_the_next_bar() {
        let (config_tx, config_rx) = watch::channel(MusicConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = MusicSynthesizer::new(config_rx, PlaybackClock::start()).start(tx);

        let first = rx.recv().await.unwrap();
        config_tx.send_replace(MusicConfig {
            bpm: 120.0,
            ..Default::default()
        });
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();

        let old_bar = BarPlan::new(0.0, 92.0).bar_seconds();
        let gap = second[0].start_offset_seconds - first[0].start_offset_seconds;
        assert!((gap - old_bar).abs() < 1e-6);
        let new_gap = third[0].start_offset_seconds - second[0].start_offset_seconds;
        assert!((new_gap - 2.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn muted_bars_are_empty_but_keep_time() {
        let (config_tx, config_rx) = watch::channel(MusicConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = MusicSynthesizer::new(config_rx, PlaybackClock::start()).start(tx);

        assert!(!rx.recv().await.unwrap().is_empty());
        config_tx.send_replace(MusicConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(rx.recv().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_ends_the_schedule() {
        let (_config_tx, config_rx) = watch::channel(MusicConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = MusicSynthesizer::new(config_rx, PlaybackClock::start()).start(tx);

        rx.recv().await.unwrap();
        handle.stop();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels() {
        let (_config_tx, config_rx) = watch::channel(MusicConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = MusicSynthesizer::new(config_rx, PlaybackClock::start()).start(tx);
        rx.recv().await.unwrap();
        drop(handle);
        assert!(rx.recv().await.is_none());
    }
}
