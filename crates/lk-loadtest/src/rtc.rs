/// Boundary to the RTC client SDK.
///
/// The load tester only needs a narrow slice of a real-time client: join a
/// room, publish tracks fed by sample providers, receive RTP for subscribed
/// tracks, steer simulcast layers, send PLIs and fire simulated speaker
/// updates. Everything here is expressed as traits so the orchestrator can run
/// against any SDK binding; `crate::loopback` provides an in-process one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use lk_protocol::auth::AuthError;
use lk_protocol::packets::RtpPacket;
use lk_protocol::payload::PayloadError;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

pub use lk_protocol::packets::Codec;

/// Fixed spacing the SDK enforces between simulated speaker updates.
pub const SPEAKER_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("not connected")]
    NotConnected,
    #[error("cancelled")]
    Cancelled,
    #[error("track closed")]
    TrackClosed,
    #[error("unknown track {0}")]
    UnknownTrack(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

// ── Tracks ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Simulcast layer / requested subscription quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
    Off,
}

impl fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VideoQuality::Low => "LOW",
            VideoQuality::Medium => "MEDIUM",
            VideoQuality::High => "HIGH",
            VideoQuality::Off => "OFF",
        };
        f.write_str(s)
    }
}

/// A media sample handed to the SDK for packetization.
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// Source of media samples for a published track. The SDK pulls one sample
/// per `frame_duration`.
pub trait SampleProvider: Send + 'static {
    fn next_sample(&mut self) -> Result<MediaSample, ProviderError>;

    fn frame_duration(&self) -> Duration;

    /// Called when a subscriber sent a PLI for this track.
    fn request_key_frame(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct TrackPublishOptions {
    pub name: String,
    pub kind: TrackKind,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
}

pub struct SimulcastLayer {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    pub provider: Box<dyn SampleProvider>,
}

#[derive(Debug, Clone)]
pub struct LocalTrackPublication {
    pub sid: String,
    pub ssrcs: Vec<u32>,
}

// ── Remote side ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub sid: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RemoteTrackPublication {
    pub sid: String,
    pub name: String,
    pub kind: TrackKind,
    pub simulcast: bool,
    pub width: u32,
    pub height: u32,
}

/// Receiving end of a subscribed track.
#[derive(Debug)]
pub struct RemoteTrack {
    sid: String,
    kind: TrackKind,
    codec: Codec,
    ssrc: u32,
    packets: mpsc::Receiver<RtpPacket>,
}

impl RemoteTrack {
    pub fn new(sid: String, kind: TrackKind, codec: Codec, ssrc: u32, packets: mpsc::Receiver<RtpPacket>) -> Self {
        Self {
            sid,
            kind,
            codec,
            ssrc,
            packets,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Next RTP packet. Fails once the track is unpublished or the room
    /// disconnects.
    pub async fn read_rtp(&mut self) -> Result<RtpPacket, RtcError> {
        self.packets.recv().await.ok_or(RtcError::TrackClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionSetting {
    Dimensions { width: u32, height: u32 },
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulateScenario {
    SpeakerUpdate,
}

#[derive(Debug)]
pub enum RoomEvent {
    TrackSubscribed {
        track: RemoteTrack,
        publication: RemoteTrackPublication,
        participant: RemoteParticipant,
    },
    TrackSubscriptionFailed {
        track_sid: String,
        participant: RemoteParticipant,
        reason: String,
    },
    ActiveSpeakersChanged {
        identities: Vec<String>,
    },
    Disconnected,
}

pub type RoomEvents = mpsc::UnboundedReceiver<RoomEvent>;

// ── Room / connector ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub room: String,
    pub identity: String,
    pub name: String,
    pub auto_subscribe: bool,
}

#[async_trait]
pub trait Room: Send + Sync {
    fn sid(&self) -> &str;

    fn identity(&self) -> &str;

    async fn publish_track(
        &self,
        options: TrackPublishOptions,
        provider: Box<dyn SampleProvider>,
    ) -> Result<LocalTrackPublication, RtcError>;

    async fn publish_simulcast_track(
        &self,
        options: TrackPublishOptions,
        layers: Vec<SimulcastLayer>,
    ) -> Result<LocalTrackPublication, RtcError>;

    /// Request dimensions on (or disable) a subscribed publication.
    fn update_subscription(&self, track_sid: &str, setting: SubscriptionSetting) -> Result<(), RtcError>;

    /// Ask the publisher of `pli.media_ssrc` for a key frame.
    fn write_pli(&self, pli: PictureLossIndication) -> Result<(), RtcError>;

    fn simulate(&self, scenario: SimulateScenario) -> Result<(), RtcError>;

    /// Leave the room. Idempotent.
    fn disconnect(&self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, info: ConnectInfo) -> Result<(Arc<dyn Room>, RoomEvents), RtcError>;
}
