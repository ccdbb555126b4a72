use serde::{Deserialize, Serialize};

use super::matroska::MatroskaEncoder;
use crate::render::Surface;
use crate::{PipelineConfig, Result, SlidecastError};

/// One captured video frame, stamped on the session clock.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub timestamp_seconds: f64,
    pub width: u32,
    pub height: u32,
    /// Packed RGB, row major.
    pub rgb: Vec<u8>,
}

impl VideoFrame {
    /// Copies the current contents of `surface`.
    pub fn capture(surface: &Surface, timestamp_seconds: f64) -> Self {
        Self {
            timestamp_seconds,
            width: surface.width(),
            height: surface.height(),
            rgb: surface.to_rgb(),
        }
    }
}

/// Stream parameters an encoder is built for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
    pub jpeg_quality: u8,
}

impl EncoderSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            width: config.render.width,
            height: config.render.height,
            fps: config.capture.fps,
            sample_rate: config.audio.sample_rate,
            jpeg_quality: config.capture.jpeg_quality,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.width > u16::MAX as u32 || self.height > u16::MAX as u32 {
            return Err(SlidecastError::encoder(format!(
                "unsupported frame size {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.sample_rate == 0 {
            return Err(SlidecastError::encoder("frame rate and sample rate must be positive"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(SlidecastError::encoder(format!(
                "jpeg quality {} is outside 1..=100",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// Turns frames and mono audio into container bytes. Output is pulled in
/// chunks with [`MediaEncoder::drain`]; concatenating every chunk followed by
/// the bytes from [`MediaEncoder::finish`] yields a complete file.
pub trait MediaEncoder: Send {
    fn mime_type(&self) -> &str;

    fn push_video(&mut self, frame: &VideoFrame) -> Result<()>;

    /// Appends mono samples that follow the previous block without a gap.
    fn push_audio(&mut self, samples: &[f32]) -> Result<()>;

    /// Returns everything encoded since the last drain. May be empty.
    fn drain(&mut self) -> Result<Vec<u8>>;

    /// Flushes the remaining data. The encoder must not be used afterwards.
    fn finish(&mut self) -> Result<Vec<u8>>;
}

/// Builds an encoder for each recording.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn MediaEncoder>>;
}

/// Motion-JPEG video with 16-bit PCM audio in Matroska.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatroskaFactory;

impl EncoderFactory for MatroskaFactory {
    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn MediaEncoder>> {
        Ok(Box::new(MatroskaEncoder::new(*settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EncoderSettings {
        EncoderSettings {
            width: 64,
            height: 36,
            fps: 30,
            sample_rate: 8000,
            jpeg_quality: 80,
        }
    }

    #[test]
    fn settings_follow_the_pipeline_config() {
        let settings = EncoderSettings::from_config(&PipelineConfig::default());
        assert_eq!((settings.width, settings.height), (1280, 720));
        assert_eq!(settings.fps, 30);
        assert_eq!(settings.sample_rate, 48_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn unusable_settings_fail_construction() {
        let bad = [
            EncoderSettings { width: 0, ..settings() },
            EncoderSettings { fps: 0, ..settings() },
            EncoderSettings { jpeg_quality: 0, ..settings() },
            EncoderSettings { height: 70_000, ..settings() },
        ];
        for settings in bad {
            let err = MatroskaFactory.create(&settings).err().unwrap();
            assert!(matches!(err, SlidecastError::Encoder(_)));
        }
    }

    #[test]
    fn frames_copy_the_surface() {
        let surface = Surface::new(4, 2).unwrap();
        let frame = VideoFrame::capture(&surface, 1.5);
        assert_eq!(frame.rgb.len(), 4 * 2 * 3);
        assert_eq!((frame.width, frame.height), (4, 2));
    }
}
