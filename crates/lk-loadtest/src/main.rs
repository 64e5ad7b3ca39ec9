/// lk-loadtest: simulate publishers and subscribers in an SFU room and report
/// what the subscribers received.
///
/// Usage:
///   lk-loadtest --video-publishers 2 --subscribers 10 --duration 30s
///   lk-loadtest --audio-publishers 5 --subscribers 20 --layout 3x3 --json
///   lk-loadtest --config scenario.toml --subscribers 50
///
/// Tables go to stdout, logs to stderr (RUST_LOG controls the level).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lk_loadtest::config::FileConfig;
use lk_loadtest::layout::Layout;
use lk_loadtest::media::{VideoCodec, VideoResolution};
use lk_loadtest::{LoadTest, LoadTestParams, LoopbackConfig, LoopbackServer};

// ── CLI ──────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lk-loadtest", about = "Load test an SFU room with simulated participants")]
struct Args {
    /// Server URL
    #[arg(long, env = "LIVEKIT_URL")]
    url: Option<String>,

    #[arg(long, env = "LIVEKIT_API_KEY")]
    api_key: Option<String>,

    #[arg(long, env = "LIVEKIT_API_SECRET", hide_env_values = true)]
    api_secret: Option<String>,

    /// TOML file with [scenario] and [loopback] sections; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Room name (random when unset)
    #[arg(long)]
    room: Option<String>,

    /// Identity prefix (random when unset)
    #[arg(long)]
    identity_prefix: Option<String>,

    #[arg(long)]
    video_publishers: Option<u32>,

    #[arg(long)]
    audio_publishers: Option<u32>,

    #[arg(long)]
    subscribers: Option<u32>,

    /// high, medium or low
    #[arg(long)]
    video_resolution: Option<VideoResolution>,

    /// h264 or vp8 (alternates when unset)
    #[arg(long)]
    video_codec: Option<VideoCodec>,

    /// Test window, e.g. 30s or 5m (runs until Ctrl-C when unset)
    #[arg(short, long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Testers started per second, at most 10
    #[arg(long)]
    num_per_second: Option<f64>,

    /// Publish video as three simulcast layers
    #[arg(long)]
    simulcast: bool,

    /// Rotate the active speaker between publishers
    #[arg(long)]
    simulate_speakers: bool,

    /// speaker, 3x3, 4x4 or 5x5
    #[arg(long)]
    layout: Option<Layout>,

    /// Print the report as JSON instead of tables
    #[arg(long)]
    json: bool,

    #[arg(long, hide = true)]
    run_all: bool,

    /// Forwarding loss on the in-process server, 0.0 to 1.0
    #[arg(long, hide = true)]
    loopback_loss: Option<f64>,
}

impl Args {
    /// Defaults, then the config file, then flags.
    fn scenario(&self, file: &FileConfig) -> anyhow::Result<LoadTestParams> {
        let mut params = LoadTestParams::default();
        file.apply_scenario(&mut params)?;

        if let Some(v) = &self.url {
            params.url = v.clone();
        }
        if let Some(v) = &self.api_key {
            params.api_key = v.clone();
        }
        if let Some(v) = &self.api_secret {
            params.api_secret = v.clone();
        }
        if let Some(v) = &self.room {
            params.room = v.clone();
        }
        if let Some(v) = &self.identity_prefix {
            params.identity_prefix = v.clone();
        }
        if let Some(v) = self.video_publishers {
            params.video_publishers = v;
        }
        if let Some(v) = self.audio_publishers {
            params.audio_publishers = v;
        }
        if let Some(v) = self.subscribers {
            params.subscribers = v;
        }
        if let Some(v) = self.video_resolution {
            params.video_resolution = v;
        }
        if self.video_codec.is_some() {
            params.video_codec = self.video_codec;
        }
        if let Some(v) = self.duration {
            params.duration = v;
        }
        if let Some(v) = self.num_per_second {
            params.num_per_second = v;
        }
        params.simulcast |= self.simulcast;
        params.simulate_speakers |= self.simulate_speakers;
        if let Some(v) = self.layout {
            params.layout = v;
        }

        // The in-process server accepts its own defaults.
        let loopback = LoopbackConfig::default();
        if params.api_key.is_empty() {
            params.api_key = loopback.api_key;
        }
        if params.api_secret.is_empty() {
            params.api_secret = loopback.api_secret;
        }
        Ok(params)
    }

    fn loopback(&self, file: &FileConfig, params: &LoadTestParams) -> anyhow::Result<LoopbackConfig> {
        let mut config = LoopbackConfig {
            api_key: params.api_key.clone(),
            api_secret: params.api_secret.clone(),
            ..Default::default()
        };
        file.apply_loopback(&mut config)?;
        if let Some(loss) = self.loopback_loss {
            config.packet_loss = loss.clamp(0.0, 1.0);
        }
        Ok(config)
    }
}

// ── Main ─────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let file = match &args.config {
        Some(path) => FileConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => FileConfig::default(),
    };
    let params = args.scenario(&file)?;
    if !params.targets_loopback() {
        warn!(
            url = %params.url,
            "only the in-process loopback server is supported; the URL is used for validation and cloud limits"
        );
    }
    let server = LoopbackServer::new(args.loopback(&file, &params)?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing up");
                cancel.cancel();
            }
        }
    });

    let test = LoadTest::new(params, Arc::new(server)).with_cancellation(cancel);
    if args.run_all {
        info!(cases = lk_loadtest::SUITE_CASES.len(), "running suite");
        let suite = test.run_suite().await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&suite)?);
        } else {
            for report in &suite.reports {
                println!("{}", report.render());
            }
            print!("{}", suite.render());
        }
    } else {
        let report = test.run().await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", report.render());
        }
    }

    Ok(())
}
