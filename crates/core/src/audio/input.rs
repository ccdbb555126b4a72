//! Live voice inputs and audio monitors.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{Result, SlidecastError};

/// A voice source that has to be granted before it yields audio, like a
/// microphone behind a permission prompt.
#[async_trait]
pub trait VoiceInput: Send + Sync {
    /// Requests access and opens a mono stream at `sample_rate`. An error
    /// means access was refused or no device exists.
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn VoiceStream>>;
}

/// Mono samples pulled in step with the audio clock.
pub trait VoiceStream: Send {
    /// Fills `out` with the next samples and returns how many were written.
    /// Fewer than `out.len()` means the source ran dry.
    fn read(&mut self, out: &mut [f32]) -> usize;
}

/// Voice input that is never available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVoiceInput;

#[async_trait]
impl VoiceInput for NoVoiceInput {
    async fn open(&self, _sample_rate: u32) -> Result<Box<dyn VoiceStream>> {
        Err(SlidecastError::Input("no voice input configured".into()))
    }
}

/// Voice input backed by samples already in memory.
#[derive(Debug, Clone)]
pub struct MemoryVoiceInput {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl MemoryVoiceInput {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate: sample_rate.max(1),
        }
    }

    /// Opens a stream without going through the async grant.
    pub fn open_stream(&self, sample_rate: u32) -> Box<dyn VoiceStream> {
        Box::new(BufferedStream::new(resample(
            &self.samples,
            self.sample_rate,
            sample_rate,
        )))
    }
}

#[async_trait]
impl VoiceInput for MemoryVoiceInput {
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn VoiceStream>> {
        Ok(self.open_stream(sample_rate))
    }
}

/// Voice-over read from a WAV file. Channels are averaged to mono.
#[derive(Debug, Clone)]
pub struct WavVoiceInput {
    path: PathBuf,
}

impl WavVoiceInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self, sample_rate: u32) -> Result<Vec<f32>> {
        let mut reader = hound::WavReader::open(&self.path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        Ok(resample(&mono, spec.sample_rate, sample_rate))
    }
}

#[async_trait]
impl VoiceInput for WavVoiceInput {
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn VoiceStream>> {
        let samples = self.load(sample_rate).map_err(|err| {
            SlidecastError::Input(format!("{}: {err}", self.path.display()))
        })?;
        tracing::info!(path = %self.path.display(), samples = samples.len(), "voice input opened");
        Ok(Box::new(BufferedStream::new(samples)))
    }
}

struct BufferedStream {
    samples: Vec<f32>,
    position: usize,
}

impl BufferedStream {
    fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            position: 0,
        }
    }
}

impl VoiceStream for BufferedStream {
    fn read(&mut self, out: &mut [f32]) -> usize {
        let available = &self.samples[self.position..];
        let count = available.len().min(out.len());
        out[..count].copy_from_slice(&available[..count]);
        self.position += count;
        count
    }
}

/// Linear-interpolating sample rate conversion.
pub(crate) fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let length = (samples.len() as f64 / ratio).floor() as usize;
    (0..length)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position.floor() as usize;
            let frac = (position - index as f64) as f32;
            let a = samples[index];
            let b = samples.get(index + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

/// Receives the mixed bed while previewing, standing in for a speaker.
pub trait AudioMonitor: Send {
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Writes monitored audio to a 16-bit mono WAV file.
pub struct WavMonitor {
    writer: hound::WavWriter<BufWriter<File>>,
}

impl WavMonitor {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        Ok(Self {
            writer: hound::WavWriter::create(path, spec)?,
        })
    }
}

impl AudioMonitor for WavMonitor {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        for sample in super::to_pcm_i16(samples) {
            self.writer.write_sample(sample)?;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.writer.finalize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_voice_input_is_denied() {
        let err = NoVoiceInput.open(48_000).await.err().unwrap();
        assert!(matches!(err, SlidecastError::Input(_)));
    }

    #[tokio::test]
    async fn memory_input_runs_dry() {
        let input = MemoryVoiceInput::new(vec![0.25; 10], 100);
        let mut stream = input.open(100).await.unwrap();
        let mut out = [0.0; 8];
        assert_eq!(stream.read(&mut out), 8);
        assert_eq!(stream.read(&mut out), 2);
        assert_eq!(stream.read(&mut out), 0);
    }

    #[test]
    fn resampling_changes_length() {
        let up = resample(&[0.0, 1.0], 1, 2);
        assert_eq!(up, vec![0.0, 0.5, 1.0, 1.0]);
        assert_eq!(resample(&vec![0.5; 480], 48_000, 8_000).len(), 80);
    }

    #[tokio::test]
    async fn wav_input_is_mixed_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 1000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(i16::MAX / 2).unwrap();
            writer.write_sample(0_i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut stream = WavVoiceInput::new(&path).open(1000).await.unwrap();
        let mut out = vec![0.0; 200];
        assert_eq!(stream.read(&mut out), 100);
        assert!((out[0] - 0.25).abs() < 0.01);
    }

    #[tokio::test]
    async fn missing_wav_is_an_input_error() {
        let err = WavVoiceInput::new("/nonexistent/voice.wav")
            .open(1000)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SlidecastError::Input(_)));
    }

    #[test]
    fn wav_monitor_writes_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.wav");
        let mut monitor: Box<dyn AudioMonitor> = Box::new(WavMonitor::create(&path, 8000).unwrap());
        monitor.write(&[0.0, 0.5, -0.5]).unwrap();
        monitor.finish().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 3);
    }
}
