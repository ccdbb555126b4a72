//! Sample-accurate audio engine for the procedural music bed.
//!
//! Events are queued ahead of time on the engine's own sample clock and are
//! mixed into mono `f32` blocks on demand, so the caller decides how far the
//! audio timeline advances.

pub mod input;
#[cfg(feature = "speaker")]
pub mod speaker;
pub mod synth;

use std::f32::consts::TAU;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use input::{
    AudioMonitor, MemoryVoiceInput, NoVoiceInput, VoiceInput, VoiceStream, WavMonitor,
    WavVoiceInput,
};
#[cfg(feature = "speaker")]
pub use speaker::SpeakerMonitor;
pub use synth::{BarPlan, MusicHandle, MusicSynthesizer};

/// Oscillator shapes available to scheduled notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
}

impl Waveform {
    /// Value of the waveform at `phase`, in cycles.
    pub fn sample(self, phase: f32) -> f32 {
        let t = phase.fract();
        match self {
            Waveform::Sine => (t * TAU).sin(),
            Waveform::Square => {
                if t < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * t - 1.0,
        }
    }
}

/// Which instrument of the beat pattern produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instrument {
    Kick,
    Hat,
    Bass,
}

impl Instrument {
    pub fn waveform(self) -> Waveform {
        match self {
            Instrument::Kick => Waveform::Sine,
            Instrument::Hat => Waveform::Square,
            Instrument::Bass => Waveform::Sawtooth,
        }
    }
}

/// A value that moves from `start` to `end` over `seconds` and then holds.
/// Positive endpoints ramp exponentially, otherwise linearly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ramp {
    pub start: f32,
    pub end: f32,
    pub seconds: f32,
}

impl Ramp {
    pub fn constant(value: f32) -> Self {
        Self {
            start: value,
            end: value,
            seconds: 0.0,
        }
    }

    pub fn exponential(start: f32, end: f32, seconds: f32) -> Self {
        Self { start, end, seconds }
    }

    pub fn value_at(&self, t: f32) -> f32 {
        if t <= 0.0 || self.seconds <= 0.0 {
            return if self.seconds <= 0.0 { self.end } else { self.start };
        }
        if t >= self.seconds {
            return self.end;
        }
        let progress = t / self.seconds;
        if self.start > 0.0 && self.end > 0.0 {
            self.start * (self.end / self.start).powf(progress)
        } else {
            self.start + (self.end - self.start) * progress
        }
    }
}

/// One note queued on the audio clock ahead of when it sounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    /// Offset from the start of the audio clock.
    pub start_offset_seconds: f64,
    pub instrument: Instrument,
    pub frequency: Ramp,
    /// Already scaled by the music volume.
    pub gain: Ramp,
    pub duration_seconds: f64,
}

impl ScheduledEvent {
    pub fn end_offset_seconds(&self) -> f64 {
        self.start_offset_seconds + self.duration_seconds
    }
}

/// Note currently producing sound.
#[derive(Debug)]
struct Voice {
    event: ScheduledEvent,
    start_sample: u64,
    end_sample: u64,
    phase: f32,
}

/// Mixes scheduled events into sample blocks.
#[derive(Debug)]
pub struct AudioEngine {
    sample_rate: u32,
    cursor: u64,
    pending: Vec<(u64, ScheduledEvent)>,
    voices: Vec<Voice>,
}

impl AudioEngine {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            cursor: 0,
            pending: Vec::new(),
            voices: Vec::new(),
        }
    }

    /// Returns the sample rate the engine operates at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds of audio rendered so far.
    pub fn elapsed_seconds(&self) -> f64 {
        self.cursor as f64 / self.sample_rate as f64
    }

    /// Queued events that have not started sounding yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Notes that are sounding, including ones in their decay tail.
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Queues events. Events whose start already passed sound immediately.
    pub fn schedule(&mut self, events: impl IntoIterator<Item = ScheduledEvent>) {
        let rate = self.sample_rate as f64;
        for event in events {
            let start = (event.start_offset_seconds.max(0.0) * rate).round() as u64;
            self.pending.push((start, event));
        }
        self.pending.sort_by_key(|(start, _)| *start);
    }

    /// Drops every event that has not fired yet. Sounding notes keep decaying.
    pub fn cancel_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Renders from the current position up to `seconds` on the audio clock.
    /// Returns an empty block if the clock is already there.
    pub fn render_until(&mut self, seconds: f64) -> Vec<f32> {
        let target = (seconds.max(0.0) * self.sample_rate as f64).floor() as u64;
        let count = target.saturating_sub(self.cursor) as usize;
        let mut block = vec![0.0_f32; count];
        self.render_into(&mut block);
        block
    }

    fn render_into(&mut self, block: &mut [f32]) {
        let rate = self.sample_rate as f32;
        let mut next_pending = 0;

        for out in block.iter_mut() {
            let now = self.cursor;

            while let Some((start, _)) = self.pending.get(next_pending) {
                if *start > now {
                    break;
                }
                let (start, event) = self.pending[next_pending].clone();
                let length = (event.duration_seconds * self.sample_rate as f64).round() as u64;
                let start = start.max(now);
                self.voices.push(Voice {
                    event,
                    start_sample: start,
                    end_sample: start + length,
                    phase: 0.0,
                });
                next_pending += 1;
            }

            let mut sum = 0.0;
            for voice in &mut self.voices {
                if now >= voice.end_sample {
                    continue;
                }
                let t = (now - voice.start_sample) as f32 / rate;
                let wave = voice.event.instrument.waveform().sample(voice.phase);
                sum += wave * voice.event.gain.value_at(t);
                voice.phase = (voice.phase + voice.event.frequency.value_at(t) / rate).fract();
            }
            *out = sum;

            self.voices.retain(|voice| now + 1 < voice.end_sample);
            self.cursor += 1;
        }

        self.pending.drain(..next_pending);
    }
}

/// The single audio stream fed to the encoder: the music engine plus an
/// optional voice input, both pulled on the shared clock.
pub struct AudioBus {
    engine: AudioEngine,
    bars: mpsc::UnboundedReceiver<Vec<ScheduledEvent>>,
    music: Option<MusicHandle>,
    voice: Option<Box<dyn VoiceStream>>,
    voice_gain: f32,
}

impl AudioBus {
    pub fn new(
        sample_rate: u32,
        bars: mpsc::UnboundedReceiver<Vec<ScheduledEvent>>,
        music: Option<MusicHandle>,
    ) -> Self {
        Self {
            engine: AudioEngine::new(sample_rate),
            bars,
            music,
            voice: None,
            voice_gain: 1.0,
        }
    }

    pub fn with_voice(mut self, voice: Box<dyn VoiceStream>, gain: f32) -> Self {
        self.voice = Some(voice);
        self.voice_gain = gain;
        self
    }

    pub fn has_voice(&self) -> bool {
        self.voice.is_some()
    }

    /// True while the synthesizer may still deliver bars.
    pub fn music_active(&self) -> bool {
        self.music.is_some()
    }

    /// Waits for the next bar from the synthesizer. Marks the music inactive
    /// once the synthesizer is gone so callers stop polling.
    pub async fn next_bar(&mut self) -> Option<Vec<ScheduledEvent>> {
        let bar = self.bars.recv().await;
        if bar.is_none() {
            self.music = None;
        }
        bar
    }

    pub fn schedule(&mut self, events: Vec<ScheduledEvent>) {
        tracing::debug!(events = events.len(), "scheduling bar");
        self.engine.schedule(events);
    }

    /// Mixes music and voice up to `seconds` on the shared clock.
    pub fn mix_until(&mut self, seconds: f64) -> Vec<f32> {
        let mut block = self.engine.render_until(seconds);
        if let Some(voice) = self.voice.as_mut() {
            let mut live = vec![0.0_f32; block.len()];
            let read = voice.read(&mut live);
            for (out, sample) in block.iter_mut().zip(&live[..read]) {
                *out += sample * self.voice_gain;
            }
        }
        block
    }

    /// Stops the synthesizer and drops notes that have not fired. Notes that
    /// are already sounding finish their decay on later `mix_until` calls.
    pub fn stop_music(&mut self) {
        if let Some(music) = self.music.take() {
            music.stop();
        }
        let dropped = self.engine.cancel_pending();
        self.bars.close();
        tracing::debug!(dropped, "music stopped");
    }

    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }
}

impl std::fmt::Debug for AudioBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBus")
            .field("engine", &self.engine)
            .field("music", &self.music.is_some())
            .field("voice", &self.voice.is_some())
            .finish()
    }
}

/// Convert f32 samples (-1.0 to 1.0) to PCM i16, clamping out-of-range input.
pub fn to_pcm_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}
