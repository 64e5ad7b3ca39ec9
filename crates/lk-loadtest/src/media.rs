/// Synthetic media sources for publishers.
///
/// Nothing is actually encoded: the providers emit frames whose sizes follow
/// what an encoder at the target bitrate would produce, which is all the
/// load tester measures. Every frame ends with the send-time trailer and
/// fits in a subscriber's reorder window.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::BytesMut;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use lk_protocol::packets::MAX_SAMPLE_BYTES;
use lk_protocol::payload::{monotonic_ns, stamp, TIMESTAMP_TRAILER_LEN};

use crate::rtc::{Codec, MediaSample, ProviderError, SampleProvider, VideoQuality};

// ── Presets ──────────────────────────────────────────────────

pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_AUDIO_BITRATE: u32 = 32_000;
pub const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Frames per group of pictures in the looped clip
pub const GOP_LENGTH: usize = 60;
/// Key frame size relative to the average frame
const KEY_FRAME_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoResolution {
    #[default]
    High,
    Medium,
    Low,
}

impl VideoResolution {
    pub fn spec(self) -> VideoSpec {
        let (width, height, bitrate_bps) = match self {
            VideoResolution::High => (1280, 720, 1_700_000),
            VideoResolution::Medium => (640, 360, 500_000),
            VideoResolution::Low => (320, 180, 150_000),
        };
        VideoSpec {
            width,
            height,
            bitrate_bps,
            fps: DEFAULT_FPS,
        }
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VideoResolution::High => "high",
            VideoResolution::Medium => "medium",
            VideoResolution::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for VideoResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(VideoResolution::High),
            "medium" => Ok(VideoResolution::Medium),
            "low" => Ok(VideoResolution::Low),
            other => Err(format!("unknown resolution {other:?} (expected high, medium or low)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Vp8,
}

impl VideoCodec {
    /// Codec for a publisher when none was configured: alternate so both get
    /// exercised in the same room.
    pub fn for_publisher(configured: Option<VideoCodec>, sequence: usize) -> VideoCodec {
        configured.unwrap_or(if sequence % 2 == 0 { VideoCodec::H264 } else { VideoCodec::Vp8 })
    }
}

impl From<VideoCodec> for Codec {
    fn from(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H264 => Codec::H264,
            VideoCodec::Vp8 => Codec::Vp8,
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::H264 => f.write_str("h264"),
            VideoCodec::Vp8 => f.write_str("vp8"),
        }
    }
}

impl FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" => Ok(VideoCodec::H264),
            "vp8" => Ok(VideoCodec::Vp8),
            other => Err(format!("unknown codec {other:?} (expected h264 or vp8)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSpec {
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub fps: u32,
}

impl VideoSpec {
    fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    fn average_frame_bytes(&self) -> usize {
        (self.bitrate_bps / 8 / self.fps.max(1)) as usize
    }
}

/// Dimensions a subscriber requests for a quality tier, `None` for OFF.
pub fn quality_dimensions(quality: VideoQuality) -> Option<(u32, u32)> {
    let resolution = match quality {
        VideoQuality::High => VideoResolution::High,
        VideoQuality::Medium => VideoResolution::Medium,
        VideoQuality::Low => VideoResolution::Low,
        VideoQuality::Off => return None,
    };
    let spec = resolution.spec();
    Some((spec.width, spec.height))
}

/// LOW, MEDIUM and HIGH layers for a simulcast publish: dimensions scaled down
/// by 4, 2 and 1, bitrate by the square of the scale.
pub fn simulcast_specs(base: VideoSpec) -> [(VideoQuality, VideoSpec); 3] {
    let layer = |scale: u32| VideoSpec {
        width: base.width / scale,
        height: base.height / scale,
        bitrate_bps: base.bitrate_bps / (scale * scale),
        fps: base.fps,
    };
    [
        (VideoQuality::Low, layer(4)),
        (VideoQuality::Medium, layer(2)),
        (VideoQuality::High, layer(1)),
    ]
}

fn stamped_frame(len: usize, fill: impl FnOnce(&mut [u8])) -> Result<bytes::Bytes, ProviderError> {
    let mut buf = BytesMut::zeroed(len);
    fill(&mut buf[..len.saturating_sub(TIMESTAMP_TRAILER_LEN)]);
    stamp(&mut buf, monotonic_ns())?;
    Ok(buf.freeze())
}

// ── Audio ────────────────────────────────────────────────────

/// Talk spurt / pause lengths in frames (2 s talking, 1 s silence).
const TALK_FRAMES: u32 = 100;
const SILENCE_FRAMES: u32 = 50;
/// Size of a comfort-noise frame during silence, before the trailer.
const SILENCE_PAYLOAD: usize = 3;

/// Opus-sized frames of noise alternating with near-empty silence frames.
#[derive(Debug)]
pub struct AudioSampleProvider {
    frame_bytes: usize,
    frame: u32,
    rng: SmallRng,
}

impl AudioSampleProvider {
    pub fn new(bitrate_bps: u32, seed: u64) -> Self {
        let per_frame = bitrate_bps as u64 * AUDIO_FRAME_DURATION.as_millis() as u64 / 8_000;
        Self {
            frame_bytes: (per_frame as usize).max(TIMESTAMP_TRAILER_LEN + 1),
            frame: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl SampleProvider for AudioSampleProvider {
    fn next_sample(&mut self) -> Result<MediaSample, ProviderError> {
        let talking = self.frame % (TALK_FRAMES + SILENCE_FRAMES) < TALK_FRAMES;
        self.frame = self.frame.wrapping_add(1);

        let len = if talking {
            self.frame_bytes
        } else {
            SILENCE_PAYLOAD + TIMESTAMP_TRAILER_LEN
        };
        let rng = &mut self.rng;
        let data = stamped_frame(len, |body| {
            if talking {
                rng.fill(body);
            }
        })?;
        Ok(MediaSample {
            data,
            duration: AUDIO_FRAME_DURATION,
        })
    }

    fn frame_duration(&self) -> Duration {
        AUDIO_FRAME_DURATION
    }
}

// ── Video ────────────────────────────────────────────────────

// H.264 NAL headers (IDR slice, non-IDR slice). The H.264 payloader reads
// them; VP8 packetization ignores the payload.
const KEY_FRAME_HEADER: u8 = 0x65;
const DELTA_FRAME_HEADER: u8 = 0x41;

/// Loops a synthetic clip sized for `spec`: one key frame per GOP followed by
/// delta frames, averaging out to the target bitrate. Key frames are capped
/// at [`MAX_SAMPLE_BYTES`] and the deltas make up the difference.
#[derive(Debug)]
pub struct LoopedVideoProvider {
    spec: VideoSpec,
    /// Frame sizes of one GOP, key frame first
    clip: Vec<usize>,
    position: usize,
    key_frame_requested: bool,
    key_frames: u64,
}

impl LoopedVideoProvider {
    pub fn new(spec: VideoSpec, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let avg = spec.average_frame_bytes().max(1);
        let min = TIMESTAMP_TRAILER_LEN + 1;
        let key = (avg * KEY_FRAME_FACTOR).clamp(min, MAX_SAMPLE_BYTES);
        let delta = (avg * GOP_LENGTH).saturating_sub(key) / (GOP_LENGTH - 1);

        let mut clip = Vec::with_capacity(GOP_LENGTH);
        clip.push(key);
        for _ in 1..GOP_LENGTH {
            // +/- 10% jitter around the delta size
            let spread = delta / 10;
            let size = if spread > 0 {
                rng.random_range(delta - spread..=delta + spread)
            } else {
                delta
            };
            clip.push(size.clamp(min, MAX_SAMPLE_BYTES));
        }

        Self {
            spec,
            clip,
            position: 0,
            key_frame_requested: false,
            key_frames: 0,
        }
    }

    /// Key frames emitted so far
    pub fn key_frames(&self) -> u64 {
        self.key_frames
    }
}

impl SampleProvider for LoopedVideoProvider {
    fn next_sample(&mut self) -> Result<MediaSample, ProviderError> {
        if std::mem::take(&mut self.key_frame_requested) {
            self.position = 0;
        }
        let is_key = self.position == 0;
        let len = self.clip[self.position];
        self.position = (self.position + 1) % self.clip.len();
        if is_key {
            self.key_frames += 1;
        }

        let data = stamped_frame(len, |body| {
            if let Some(first) = body.first_mut() {
                *first = if is_key { KEY_FRAME_HEADER } else { DELTA_FRAME_HEADER };
            }
        })?;
        Ok(MediaSample {
            data,
            duration: self.spec.frame_duration(),
        })
    }

    fn frame_duration(&self) -> Duration {
        self.spec.frame_duration()
    }

    fn request_key_frame(&mut self) {
        self.key_frame_requested = true;
    }
}

/// Whether a frame produced by [`LoopedVideoProvider`] is a key frame.
pub fn is_key_frame(frame: &[u8]) -> bool {
    frame.len() > TIMESTAMP_TRAILER_LEN && frame[0] == KEY_FRAME_HEADER
}
