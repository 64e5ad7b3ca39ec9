/// Optional TOML scenario file.
///
/// ```toml
/// [scenario]
/// url = "ws://localhost:7880"
/// video_publishers = 2
/// subscribers = 10
/// duration = "30s"
/// layout = "3x3"
///
/// [loopback]
/// packet_loss = 0.01
/// connect_delay = "50ms"
/// ```
///
/// Every field is optional; whatever is set overrides the built-in defaults
/// and is in turn overridden by command-line flags.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::layout::Layout;
use crate::loadtest::LoadTestParams;
use crate::loopback::LoopbackConfig;
use crate::media::{VideoCodec, VideoResolution};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {source}")]
    Duration {
        field: &'static str,
        #[source]
        source: humantime::DurationError,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub scenario: ScenarioSection,
    pub loopback: LoopbackSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScenarioSection {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub room: Option<String>,
    pub identity_prefix: Option<String>,
    pub video_publishers: Option<u32>,
    pub audio_publishers: Option<u32>,
    pub subscribers: Option<u32>,
    pub video_resolution: Option<VideoResolution>,
    pub video_codec: Option<VideoCodec>,
    /// humantime, e.g. "30s" or "2m"
    pub duration: Option<String>,
    pub num_per_second: Option<f64>,
    pub simulcast: Option<bool>,
    pub simulate_speakers: Option<bool>,
    pub speaker_pause: Option<String>,
    pub layout: Option<Layout>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoopbackSection {
    pub packet_loss: Option<f64>,
    pub connect_delay: Option<String>,
    pub subscriber_buffer: Option<usize>,
}

fn duration(field: &'static str, value: &Option<String>) -> Result<Option<Duration>, ConfigError> {
    value
        .as_deref()
        .map(|s| humantime::parse_duration(s).map_err(|source| ConfigError::Duration { field, source }))
        .transpose()
}

impl FileConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(text)?;
        // Surface bad durations at load time rather than mid-run.
        duration("scenario.duration", &config.scenario.duration)?;
        duration("scenario.speaker_pause", &config.scenario.speaker_pause)?;
        duration("loopback.connect_delay", &config.loopback.connect_delay)?;
        Ok(config)
    }

    pub fn apply_scenario(&self, params: &mut LoadTestParams) -> Result<(), ConfigError> {
        let s = &self.scenario;
        if let Some(v) = &s.url {
            params.url = v.clone();
        }
        if let Some(v) = &s.api_key {
            params.api_key = v.clone();
        }
        if let Some(v) = &s.api_secret {
            params.api_secret = v.clone();
        }
        if let Some(v) = &s.room {
            params.room = v.clone();
        }
        if let Some(v) = &s.identity_prefix {
            params.identity_prefix = v.clone();
        }
        if let Some(v) = s.video_publishers {
            params.video_publishers = v;
        }
        if let Some(v) = s.audio_publishers {
            params.audio_publishers = v;
        }
        if let Some(v) = s.subscribers {
            params.subscribers = v;
        }
        if let Some(v) = s.video_resolution {
            params.video_resolution = v;
        }
        if s.video_codec.is_some() {
            params.video_codec = s.video_codec;
        }
        if let Some(v) = duration("scenario.duration", &s.duration)? {
            params.duration = v;
        }
        if let Some(v) = s.num_per_second {
            params.num_per_second = v;
        }
        if let Some(v) = s.simulcast {
            params.simulcast = v;
        }
        if let Some(v) = s.simulate_speakers {
            params.simulate_speakers = v;
        }
        if let Some(v) = duration("scenario.speaker_pause", &s.speaker_pause)? {
            params.speaker_pause = v;
        }
        if let Some(v) = s.layout {
            params.layout = v;
        }
        Ok(())
    }

    pub fn apply_loopback(&self, config: &mut LoopbackConfig) -> Result<(), ConfigError> {
        let l = &self.loopback;
        if let Some(v) = l.packet_loss {
            config.packet_loss = v.clamp(0.0, 1.0);
        }
        if let Some(v) = duration("loopback.connect_delay", &l.connect_delay)? {
            config.connect_delay = v;
        }
        if let Some(v) = l.subscriber_buffer {
            config.subscriber_buffer = v.max(1);
        }
        Ok(())
    }
}
