//! Core library for Slidecast.
//!
//! Turns an ordered list of slide texts into a narrated-style video: slides
//! are drawn onto a raster surface with a little motion, a procedural drum and
//! bass bed is synthesized alongside an optional voice input, and both are
//! captured into a Matroska file plus a PNG thumbnail. Each module owns one
//! stage of that pipeline; [`SessionController`] ties them together.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod record;
pub mod render;
pub mod sink;
pub mod slides;
pub mod timeline;

#[cfg(feature = "speaker")]
pub use audio::SpeakerMonitor;
pub use audio::{
    AudioBus, AudioEngine, AudioMonitor, MemoryVoiceInput, MusicHandle, MusicSynthesizer,
    NoVoiceInput, ScheduledEvent, VoiceInput, WavMonitor, WavVoiceInput,
};
pub use config::{AudioConfig, CaptureConfig, MusicConfig, PipelineConfig, RenderConfig};
pub use controller::{FrameStatus, SessionController, SessionState};
pub use error::{Result, SlidecastError};
pub use record::{Artifact, EncoderFactory, EncoderSettings, MatroskaFactory, MediaEncoder, VideoFrame};
pub use render::{SlideRenderer, Surface};
pub use sink::{ArtifactSink, DirectorySink};
pub use slides::{estimate_reading_seconds, slides_from_script, Slide, SlideDeck};
pub use timeline::{DriveHandle, DriveMode, PlaybackClock, Timeline, TimelineDriver};
