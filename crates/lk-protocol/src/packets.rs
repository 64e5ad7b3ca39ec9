/// RTP packetization for the codecs a load test publishes.
///
/// Samples go out through the webrtc-rs payloaders and come back through
/// their depacketizers, so what crosses the wire is real Opus, VP8 and H.264
/// RTP. [`CodecDepacketizer`] lets a single sample builder type serve all
/// three.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::codecs::h264::{H264Packet, H264Payloader};
use webrtc::rtp::codecs::opus::{OpusPacket, OpusPayloader};
use webrtc::rtp::codecs::vp8::{Vp8Packet, Vp8Payloader};
use webrtc::rtp::packetizer::{new_packetizer, Depacketizer, Packetizer, Payloader};
use webrtc::rtp::sequence::new_random_sequencer;

pub use webrtc::rtp::packet::Packet as RtpPacket;

use crate::{AUDIO_CLOCK_RATE, DEFAULT_MTU, VIDEO_CLOCK_RATE};

/// Reorder depth of a subscriber's sample builder, in packets
pub const SAMPLE_MAX_LATE: u16 = 10;

/// Largest sample that still fits the reorder window. Every packet loses the
/// RTP header and a payload descriptor out of its MTU.
pub const MAX_SAMPLE_BYTES: usize = SAMPLE_MAX_LATE as usize * (DEFAULT_MTU - 24);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Opus,
    H264,
    Vp8,
}

impl Codec {
    pub fn clock_rate(self) -> u32 {
        match self {
            Codec::Opus => AUDIO_CLOCK_RATE,
            Codec::H264 | Codec::Vp8 => VIDEO_CLOCK_RATE,
        }
    }

    /// Dynamic payload types as browsers usually negotiate them
    pub fn payload_type(self) -> u8 {
        match self {
            Codec::Opus => 111,
            Codec::Vp8 => 96,
            Codec::H264 => 125,
        }
    }

    fn payloader(self) -> Box<dyn Payloader + Send + Sync> {
        match self {
            Codec::Opus => Box::<OpusPayloader>::default(),
            Codec::H264 => Box::<H264Payloader>::default(),
            Codec::Vp8 => Box::<Vp8Payloader>::default(),
        }
    }

    /// Packetizer for one SSRC, starting at a random sequence number and
    /// timestamp.
    pub fn packetizer(self, ssrc: u32, mtu: usize) -> Box<dyn Packetizer + Send + Sync> {
        Box::new(new_packetizer(
            mtu,
            self.payload_type(),
            ssrc,
            self.payloader(),
            Box::new(new_random_sequencer()),
            self.clock_rate(),
        ))
    }

    pub fn depacketizer(self) -> CodecDepacketizer {
        match self {
            Codec::Opus => CodecDepacketizer::Opus(OpusPacket::default()),
            Codec::H264 => CodecDepacketizer::H264(H264Packet::default()),
            Codec::Vp8 => CodecDepacketizer::Vp8(Vp8Packet::default()),
        }
    }

    /// Sample builder a subscriber uses for tracks of this codec.
    pub fn sample_builder(self) -> SampleBuilder<CodecDepacketizer> {
        SampleBuilder::new(SAMPLE_MAX_LATE, self.depacketizer(), self.clock_rate())
    }
}

/// Depacketizer for whichever codec a track carries.
#[derive(Debug)]
pub enum CodecDepacketizer {
    Opus(OpusPacket),
    H264(H264Packet),
    Vp8(Vp8Packet),
}

impl Depacketizer for CodecDepacketizer {
    fn depacketize(&mut self, payload: &Bytes) -> Result<Bytes, webrtc::rtp::Error> {
        match self {
            CodecDepacketizer::Opus(d) => d.depacketize(payload),
            CodecDepacketizer::H264(d) => d.depacketize(payload),
            CodecDepacketizer::Vp8(d) => d.depacketize(payload),
        }
    }

    fn is_partition_head(&self, payload: &Bytes) -> bool {
        match self {
            CodecDepacketizer::Opus(d) => d.is_partition_head(payload),
            CodecDepacketizer::H264(d) => d.is_partition_head(payload),
            CodecDepacketizer::Vp8(d) => d.is_partition_head(payload),
        }
    }

    fn is_partition_tail(&self, marker: bool, payload: &Bytes) -> bool {
        match self {
            CodecDepacketizer::Opus(d) => d.is_partition_tail(marker, payload),
            CodecDepacketizer::H264(d) => d.is_partition_tail(marker, payload),
            CodecDepacketizer::Vp8(d) => d.is_partition_tail(marker, payload),
        }
    }
}

/// RTP timestamp ticks covering `duration` at `clock_rate`.
pub fn samples(duration: Duration, clock_rate: u32) -> u32 {
    (duration.as_secs_f64() * f64::from(clock_rate)).round() as u32
}

/// Key frame request from a subscriber for `media_ssrc`.
pub fn picture_loss(media_ssrc: u32) -> PictureLossIndication {
    PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc,
    }
}
