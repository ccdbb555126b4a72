use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, SlidecastError};

/// Shortest recording the pipeline produces. Requests below this are raised
/// to it rather than rejected.
pub const MIN_DURATION_SECONDS: f64 = 5.0;

/// Top-level configuration structure for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub render: RenderConfig,
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
}

impl PipelineConfig {
    /// Loads a configuration from a JSON file. Missing fields keep their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.render.width == 0 || self.render.height == 0 {
            return Err(SlidecastError::validation("render surface must not be empty"));
        }
        if !(self.render.refresh_hz.is_finite() && self.render.refresh_hz > 0.0) {
            return Err(SlidecastError::validation("refresh rate must be positive"));
        }
        if self.audio.sample_rate == 0 {
            return Err(SlidecastError::validation("sample rate must be positive"));
        }
        if self.capture.fps == 0 {
            return Err(SlidecastError::validation("capture frame rate must be positive"));
        }
        if self.capture.chunk_interval_ms == 0 {
            return Err(SlidecastError::validation("chunk interval must be positive"));
        }
        Ok(())
    }
}

/// Settings for the live drawing surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    /// Stand-in for the display refresh rate; the render loop ticks at it.
    pub refresh_hz: f64,
    /// Drawn when a slide has no text.
    pub fallback_label: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            refresh_hz: 60.0,
            fallback_label: "Untitled".to_string(),
        }
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Gain applied to the live voice input before it joins the music bus.
    pub voice_gain: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            voice_gain: 0.9,
        }
    }
}

/// Configuration for capturing and encoding a recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub fps: u32,
    /// How often the encoder is asked to emit a chunk.
    pub chunk_interval_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            chunk_interval_ms: 250,
            jpeg_quality: 80,
        }
    }
}

/// Procedural music bed settings. The synthesizer samples these once per bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicConfig {
    pub enabled: bool,
    pub bpm: f64,
    pub volume: f32,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bpm: 92.0,
            volume: 0.15,
        }
    }
}

impl MusicConfig {
    /// Rejects tempos that cannot be scheduled and clamps volume into [0, 1].
    pub fn validated(self) -> Result<Self> {
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(SlidecastError::validation(format!(
                "bpm must be positive, got {}",
                self.bpm
            )));
        }
        let volume = if self.volume.is_finite() {
            self.volume.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Ok(Self { volume, ..self })
    }
}

/// Normalises a requested recording length: rejects empty or non-finite
/// durations and raises short ones to [`MIN_DURATION_SECONDS`].
pub fn normalize_duration(seconds: f64) -> Result<f64> {
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(SlidecastError::validation(format!(
            "target duration must be positive, got {seconds}"
        )));
    }
    Ok(seconds.max(MIN_DURATION_SECONDS))
}
