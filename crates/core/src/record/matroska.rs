//! Streaming Matroska writer.
//!
//! The segment is written with an unknown size so clusters can be appended
//! as they are drained, without seeking back. Video is Motion-JPEG on track 1
//! and audio is little-endian 16-bit mono PCM on track 2. Timestamps are in
//! milliseconds.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::encoder::{EncoderSettings, MediaEncoder, VideoFrame};
use crate::audio::to_pcm_i16;
use crate::{Result, SlidecastError};

pub const MIME_TYPE: &str = "video/x-matroska";

const VIDEO_TRACK: u8 = 1;
const AUDIO_TRACK: u8 = 2;
const WRITING_APP: &str = "slidecast";

mod id {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;
    pub const INFO: u32 = 0x1549_A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const CODEC_ID: u32 = 0x86;
    pub const DEFAULT_DURATION: u32 = 0x23_E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
}

const TRACK_TYPE_VIDEO: u64 = 1;
const TRACK_TYPE_AUDIO: u64 = 2;
const KEYFRAME: u8 = 0x80;
const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

struct Block {
    track: u8,
    timestamp_ms: i64,
    data: Vec<u8>,
}

/// [`MediaEncoder`] producing a Matroska stream.
pub struct MatroskaEncoder {
    settings: EncoderSettings,
    header_written: bool,
    pending: Vec<Block>,
    audio_samples: u64,
    finished: bool,
}

impl MatroskaEncoder {
    pub fn new(settings: EncoderSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            header_written: false,
            pending: Vec::new(),
            audio_samples: 0,
            finished: false,
        })
    }

    fn header(&self) -> Vec<u8> {
        let mut ebml = Vec::new();
        put_uint(&mut ebml, id::EBML_VERSION, 1);
        put_uint(&mut ebml, id::EBML_READ_VERSION, 1);
        put_uint(&mut ebml, id::EBML_MAX_ID_LENGTH, 4);
        put_uint(&mut ebml, id::EBML_MAX_SIZE_LENGTH, 8);
        put_str(&mut ebml, id::DOC_TYPE, "matroska");
        put_uint(&mut ebml, id::DOC_TYPE_VERSION, 4);
        put_uint(&mut ebml, id::DOC_TYPE_READ_VERSION, 2);

        let mut info = Vec::new();
        put_uint(&mut info, id::TIMESTAMP_SCALE, 1_000_000);
        put_str(&mut info, id::MUXING_APP, WRITING_APP);
        put_str(&mut info, id::WRITING_APP, WRITING_APP);

        let mut video = Vec::new();
        put_uint(&mut video, id::PIXEL_WIDTH, self.settings.width as u64);
        put_uint(&mut video, id::PIXEL_HEIGHT, self.settings.height as u64);

        let mut video_track = Vec::new();
        put_uint(&mut video_track, id::TRACK_NUMBER, VIDEO_TRACK as u64);
        put_uint(&mut video_track, id::TRACK_UID, VIDEO_TRACK as u64);
        put_uint(&mut video_track, id::TRACK_TYPE, TRACK_TYPE_VIDEO);
        put_uint(&mut video_track, id::FLAG_LACING, 0);
        put_str(&mut video_track, id::CODEC_ID, "V_MJPEG");
        put_uint(
            &mut video_track,
            id::DEFAULT_DURATION,
            1_000_000_000 / self.settings.fps as u64,
        );
        put_element(&mut video_track, id::VIDEO, &video);

        let mut audio = Vec::new();
        put_float(&mut audio, id::SAMPLING_FREQUENCY, self.settings.sample_rate as f64);
        put_uint(&mut audio, id::CHANNELS, 1);
        put_uint(&mut audio, id::BIT_DEPTH, 16);

        let mut audio_track = Vec::new();
        put_uint(&mut audio_track, id::TRACK_NUMBER, AUDIO_TRACK as u64);
        put_uint(&mut audio_track, id::TRACK_UID, AUDIO_TRACK as u64);
        put_uint(&mut audio_track, id::TRACK_TYPE, TRACK_TYPE_AUDIO);
        put_uint(&mut audio_track, id::FLAG_LACING, 0);
        put_str(&mut audio_track, id::CODEC_ID, "A_PCM/INT/LIT");
        put_element(&mut audio_track, id::AUDIO, &audio);

        let mut tracks = Vec::new();
        put_element(&mut tracks, id::TRACK_ENTRY, &video_track);
        put_element(&mut tracks, id::TRACK_ENTRY, &audio_track);

        let mut out = Vec::new();
        put_element(&mut out, id::EBML, &ebml);
        put_id(&mut out, id::SEGMENT);
        out.extend_from_slice(&UNKNOWN_SIZE);
        put_element(&mut out, id::INFO, &info);
        put_element(&mut out, id::TRACKS, &tracks);
        out
    }

    fn encode_jpeg(&self, frame: &VideoFrame) -> Result<Vec<u8>> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.settings.jpeg_quality)
            .encode(&frame.rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|err| SlidecastError::encoder(format!("jpeg encoding failed: {err}")))?;
        Ok(jpeg)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(SlidecastError::encoder("encoder already finished"));
        }
        Ok(())
    }
}

impl MediaEncoder for MatroskaEncoder {
    fn mime_type(&self) -> &str {
        MIME_TYPE
    }

    fn push_video(&mut self, frame: &VideoFrame) -> Result<()> {
        self.ensure_open()?;
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(SlidecastError::encoder(format!(
                "frame is {}x{}, track is {}x{}",
                frame.width, frame.height, self.settings.width, self.settings.height
            )));
        }
        let data = self.encode_jpeg(frame)?;
        self.pending.push(Block {
            track: VIDEO_TRACK,
            timestamp_ms: (frame.timestamp_seconds.max(0.0) * 1000.0).round() as i64,
            data,
        });
        Ok(())
    }

    fn push_audio(&mut self, samples: &[f32]) -> Result<()> {
        self.ensure_open()?;
        if samples.is_empty() {
            return Ok(());
        }
        let timestamp_ms = (self.audio_samples * 1000 / self.settings.sample_rate as u64) as i64;
        let data = to_pcm_i16(samples)
            .into_iter()
            .flat_map(i16::to_le_bytes)
            .collect();
        self.audio_samples += samples.len() as u64;
        self.pending.push(Block {
            track: AUDIO_TRACK,
            timestamp_ms,
            data,
        });
        Ok(())
    }

    fn drain(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if !self.header_written {
            out = self.header();
            self.header_written = true;
        }

        let mut blocks = std::mem::take(&mut self.pending);
        blocks.sort_by_key(|block| block.timestamp_ms);
        for cluster in split_clusters(&blocks) {
            write_cluster(&mut out, cluster);
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        let mut out = self.drain()?;
        if !self.header_written {
            out = self.header();
            self.header_written = true;
        }
        self.finished = true;
        Ok(out)
    }
}

/// Groups sorted blocks so every relative timestamp fits the signed 16-bit
/// block field.
fn split_clusters(blocks: &[Block]) -> Vec<&[Block]> {
    let mut clusters = Vec::new();
    let mut start = 0;
    for (i, block) in blocks.iter().enumerate() {
        if block.timestamp_ms - blocks[start].timestamp_ms > i16::MAX as i64 {
            clusters.push(&blocks[start..i]);
            start = i;
        }
    }
    if start < blocks.len() {
        clusters.push(&blocks[start..]);
    }
    clusters
}

fn write_cluster(out: &mut Vec<u8>, blocks: &[Block]) {
    let Some(first) = blocks.first() else {
        return;
    };
    let base = first.timestamp_ms;
    let mut body = Vec::new();
    put_uint(&mut body, id::TIMESTAMP, base as u64);
    for block in blocks {
        let relative = (block.timestamp_ms - base) as i16;
        let mut payload = Vec::with_capacity(block.data.len() + 4);
        payload.push(0x80 | block.track);
        payload.extend_from_slice(&relative.to_be_bytes());
        payload.push(KEYFRAME);
        payload.extend_from_slice(&block.data);
        put_element(&mut body, id::SIMPLE_BLOCK, &payload);
    }
    put_element(out, id::CLUSTER, &body);
}

fn put_id(out: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(3);
    out.extend_from_slice(&bytes[skip..]);
}

/// EBML variable-length size: the count of leading zero bits in the first
/// byte gives the total length. All-ones values are reserved for "unknown".
fn put_size(out: &mut Vec<u8>, size: u64) {
    let mut length = 1;
    while length < 8 && size >= (1_u64 << (7 * length)) - 1 {
        length += 1;
    }
    let marked = size | (1_u64 << (7 * length));
    out.extend_from_slice(&marked.to_be_bytes()[8 - length..]);
}

fn put_element(out: &mut Vec<u8>, id: u32, payload: &[u8]) {
    put_id(out, id);
    put_size(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

fn put_uint(out: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    put_element(out, id, &bytes[skip..]);
}

fn put_float(out: &mut Vec<u8>, id: u32, value: f64) {
    put_element(out, id, &value.to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, id: u32, value: &str) {
    put_element(out, id, value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> MatroskaEncoder {
        MatroskaEncoder::new(EncoderSettings {
            width: 16,
            height: 8,
            fps: 30,
            sample_rate: 8000,
            jpeg_quality: 75,
        })
        .unwrap()
    }

    fn frame(timestamp_seconds: f64) -> VideoFrame {
        VideoFrame {
            timestamp_seconds,
            width: 16,
            height: 8,
            rgb: vec![200; 16 * 8 * 3],
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn sizes_use_the_shortest_vint() {
        let cases: [(u64, &[u8]); 5] = [
            (0, &[0x80]),
            (5, &[0x85]),
            (126, &[0xFE]),
            (127, &[0x40, 0x7F]),
            (16_382, &[0x7F, 0xFE]),
        ];
        for (size, expected) in cases {
            let mut out = Vec::new();
            put_size(&mut out, size);
            assert_eq!(out, expected, "size {size}");
        }
    }

    #[test]
    fn ids_keep_their_marker_bits() {
        let mut out = Vec::new();
        put_id(&mut out, id::SIMPLE_BLOCK);
        put_id(&mut out, id::CLUSTER);
        assert_eq!(out, [0xA3, 0x1F, 0x43, 0xB6, 0x75]);
    }

    #[test]
    fn nothing_pushed_drains_nothing() {
        let mut encoder = encoder();
        assert!(encoder.drain().unwrap().is_empty());
    }

    #[test]
    fn first_chunk_carries_the_header() {
        let mut encoder = encoder();
        encoder.push_video(&frame(0.0)).unwrap();
        encoder.push_audio(&[0.0; 800]).unwrap();

        let chunk = encoder.drain().unwrap();
        assert_eq!(&chunk[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert!(contains(&chunk, b"matroska"));
        assert!(contains(&chunk, b"V_MJPEG"));
        assert!(contains(&chunk, b"A_PCM/INT/LIT"));
        assert!(contains(&chunk, &[0x1F, 0x43, 0xB6, 0x75]));
        // JPEG start-of-image inside the video block.
        assert!(contains(&chunk, &[0xFF, 0xD8]));

        encoder.push_audio(&[0.0; 800]).unwrap();
        let next = encoder.drain().unwrap();
        assert!(!contains(&next, b"V_MJPEG"));
        assert_eq!(&next[..4], &[0x1F, 0x43, 0xB6, 0x75]);
    }

    #[test]
    fn audio_blocks_are_stamped_by_sample_count() {
        let mut encoder = encoder();
        encoder.push_audio(&[0.5; 4000]).unwrap();
        encoder.push_audio(&[0.5; 4000]).unwrap();
        assert_eq!(encoder.pending[0].timestamp_ms, 0);
        assert_eq!(encoder.pending[1].timestamp_ms, 500);
        assert_eq!(encoder.pending[1].data.len(), 8000);
    }

    #[test]
    fn mismatched_frames_are_rejected() {
        let mut encoder = encoder();
        let mut wrong = frame(0.0);
        wrong.width = 8;
        assert!(encoder.push_video(&wrong).is_err());
    }

    #[test]
    fn long_spans_split_into_clusters() {
        let blocks: Vec<Block> = [0, 1000, 40_000, 41_000]
            .into_iter()
            .map(|timestamp_ms| Block {
                track: AUDIO_TRACK,
                timestamp_ms,
                data: Vec::new(),
            })
            .collect();
        let clusters = split_clusters(&blocks);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[1][0].timestamp_ms, 40_000);
    }

    #[test]
    fn finish_without_data_still_yields_a_header() {
        let mut encoder = encoder();
        let tail = encoder.finish().unwrap();
        assert_eq!(&tail[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert!(encoder.push_audio(&[0.0]).is_err());
    }
}
