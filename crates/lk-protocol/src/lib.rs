pub mod auth;
pub mod packets;
pub mod payload;

/// Host suffix of the hosted cloud. Scenarios against these hosts are capped.
pub const CLOUD_HOST_SUFFIX: &str = ".livekit.cloud";

/// Per-role participant cap enforced against cloud hosts
pub const CLOUD_ROLE_LIMIT: u32 = 50;

/// RTP clock rates
pub const AUDIO_CLOCK_RATE: u32 = 48_000;
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Size of an outgoing RTP packet, header included
pub const DEFAULT_MTU: usize = 1200;
