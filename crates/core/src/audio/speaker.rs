//! Preview monitor that plays the bed through the default output device.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::input::{resample, AudioMonitor};
use crate::{Result, SlidecastError};

/// Audio the queue may hold before the oldest samples are dropped.
const MAX_BUFFERED_SECONDS: usize = 2;

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

/// Feeds monitored blocks to a cpal output stream. The stream callback pulls
/// from a shared queue and plays silence when the queue runs dry.
pub struct SpeakerMonitor {
    queue: SampleQueue,
    source_rate: u32,
    device_rate: u32,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SpeakerMonitor {
    /// Opens the default output device. `source_rate` is the rate of the
    /// blocks later passed to `write`.
    pub fn open(source_rate: u32) -> Result<Self> {
        let queue = SampleQueue::default();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown, shutdown_rx) = std_mpsc::channel::<()>();

        let shared = Arc::clone(&queue);
        // cpal streams are not Send, so the stream lives on its own thread.
        let thread = std::thread::Builder::new()
            .name("slidecast-speaker".into())
            .spawn(move || {
                let stream = match open_stream(shared) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        let device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(SlidecastError::Output("speaker thread exited".into()));
            }
        };
        tracing::info!(source_rate, device_rate, "speaker monitor opened");

        Ok(Self {
            queue,
            source_rate,
            device_rate,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    fn close(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("speaker thread panicked");
            }
        }
    }
}

impl AudioMonitor for SpeakerMonitor {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        let block = resample(samples, self.source_rate, self.device_rate);
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| SlidecastError::Output("speaker queue poisoned".into()))?;
        enqueue(&mut queue, &block, self.device_rate as usize * MAX_BUFFERED_SECONDS);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.close();
        Ok(())
    }
}

impl Drop for SpeakerMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(queue: SampleQueue) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SlidecastError::Output("no output device available".into()))?;
    let config = device.default_output_config().map_err(output_error)?;
    let rate = config.sample_rate().0;

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            let config: cpal::StreamConfig = config.into();
            let channels = config.channels as usize;
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    fill_from(&queue, data, channels, |sample| sample)
                },
                report_stream_error,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let config: cpal::StreamConfig = config.into();
            let channels = config.channels as usize;
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    fill_from(&queue, data, channels, to_i16)
                },
                report_stream_error,
                None,
            )
        }
        format => {
            return Err(SlidecastError::Output(format!("unsupported sample format {format:?}")));
        }
    }
    .map_err(output_error)?;

    stream.play().map_err(output_error)?;
    Ok((stream, rate))
}

fn fill_from<T: Copy>(queue: &Mutex<VecDeque<f32>>, data: &mut [T], channels: usize, convert: fn(f32) -> T) {
    match queue.lock() {
        Ok(mut queue) => fill_frames(&mut queue, data, channels, convert),
        Err(_) => data.fill(convert(0.0)),
    }
}

/// Writes one queued mono sample into every channel of each frame.
fn fill_frames<T: Copy>(queue: &mut VecDeque<f32>, data: &mut [T], channels: usize, convert: fn(f32) -> T) {
    for frame in data.chunks_mut(channels.max(1)) {
        frame.fill(convert(queue.pop_front().unwrap_or(0.0)));
    }
}

/// Appends `samples`, then drops the oldest entries beyond `capacity` so a
/// stalled device never lets playback fall further behind.
fn enqueue(queue: &mut VecDeque<f32>, samples: &[f32], capacity: usize) {
    queue.extend(samples.iter().copied());
    let excess = queue.len().saturating_sub(capacity);
    if excess > 0 {
        queue.drain(..excess);
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

fn output_error(err: impl std::fmt::Display) -> SlidecastError {
    SlidecastError::Output(err.to_string())
}

fn report_stream_error(err: cpal::StreamError) {
    tracing::warn!(error = %err, "speaker stream error");
}
