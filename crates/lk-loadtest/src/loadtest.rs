/// Scenario orchestration: plan testers, start them under the start-rate
/// limiter, hold the test window, stop everything and reduce the counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use lk_protocol::{CLOUD_HOST_SUFFIX, CLOUD_ROLE_LIMIT};

use crate::error::LoadTestError;
use crate::layout::Layout;
use crate::limiter::StartLimiter;
use crate::media::{VideoCodec, VideoResolution};
use crate::render;
use crate::rtc::Connector;
use crate::speaker::SpeakerSimulator;
use crate::stats::{Summary, TesterStats, Totals};
use crate::tester::{LoadTester, TesterParams};

pub const DEFAULT_URL: &str = "ws://localhost:7880";
pub const DEFAULT_NUM_PER_SECOND: f64 = 5.0;
pub const MAX_NUM_PER_SECOND: f64 = 10.0;
/// Test window when no duration is given; cancellation ends it first.
pub const DEFAULT_TEST_WINDOW: Duration = Duration::from_secs(1000 * 60 * 60);
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

// ── Parameters ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LoadTestParams {
    pub url: String,
    pub api_key: String,
    #[serde(skip)]
    pub api_secret: String,
    pub room: String,
    pub identity_prefix: String,
    pub video_publishers: u32,
    pub audio_publishers: u32,
    pub subscribers: u32,
    pub video_resolution: VideoResolution,
    /// `None` alternates H.264 and VP8 across publishers
    pub video_codec: Option<VideoCodec>,
    /// Zero runs until cancelled
    pub duration: Duration,
    pub num_per_second: f64,
    pub simulcast: bool,
    pub simulate_speakers: bool,
    pub speaker_pause: Duration,
    pub layout: Layout,
}

impl Default for LoadTestParams {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            room: String::new(),
            identity_prefix: String::new(),
            video_publishers: 0,
            audio_publishers: 0,
            subscribers: 0,
            video_resolution: VideoResolution::High,
            video_codec: None,
            duration: Duration::ZERO,
            num_per_second: DEFAULT_NUM_PER_SECOND,
            simulcast: false,
            simulate_speakers: false,
            speaker_pause: Duration::ZERO,
            layout: Layout::Speaker,
        }
    }
}

impl LoadTestParams {
    /// Fill in defaults: start rate clamped to (0, 10], random room and
    /// identity prefix, one video publisher and one subscriber when no
    /// participants were asked for.
    pub fn normalized(mut self) -> Self {
        if !(self.num_per_second > 0.0) {
            self.num_per_second = DEFAULT_NUM_PER_SECOND;
        }
        self.num_per_second = self.num_per_second.min(MAX_NUM_PER_SECOND);

        let mut rng = rand::rng();
        if self.room.is_empty() {
            self.room = format!("testroom{}", rng.random_range(0..1000));
        }
        if self.identity_prefix.is_empty() {
            self.identity_prefix = (&mut rng).sample_iter(Alphanumeric).take(5).map(char::from).collect();
        }
        if self.video_publishers == 0 && self.audio_publishers == 0 && self.subscribers == 0 {
            self.video_publishers = 1;
            self.subscribers = 1;
        }
        self
    }

    pub fn publisher_count(&self) -> usize {
        self.video_publishers.max(self.audio_publishers) as usize
    }

    pub fn tester_count(&self) -> usize {
        self.publisher_count() + self.subscribers as usize
    }

    /// Media always flows through the in-process loopback server; any other
    /// URL only drives validation and the cloud participant caps.
    pub fn targets_loopback(&self) -> bool {
        self.url.trim_end_matches('/') == DEFAULT_URL
    }
}

pub fn parse_url(url: &str) -> Result<Url, LoadTestError> {
    let parsed = Url::parse(url).map_err(|e| LoadTestError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(LoadTestError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(parsed)
}

/// Checks that must pass before anything connects.
pub fn preflight(params: &LoadTestParams) -> Result<(), LoadTestError> {
    let url = parse_url(&params.url)?;
    let host = url.host_str().unwrap_or_default();
    if host.ends_with(CLOUD_HOST_SUFFIX) {
        for (role, count) in [
            ("video publisher", params.video_publishers),
            ("audio publisher", params.audio_publishers),
            ("subscriber", params.subscribers),
        ] {
            if count > CLOUD_ROLE_LIMIT {
                return Err(LoadTestError::CloudLimitExceeded {
                    role,
                    count,
                    limit: CLOUD_ROLE_LIMIT,
                });
            }
        }
    }
    Ok(())
}

// ── Planning ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPlan {
    pub video: bool,
    pub audio: bool,
    pub resolution: VideoResolution,
    pub codec: VideoCodec,
    pub simulcast: bool,
}

impl PublishPlan {
    pub fn any(&self) -> bool {
        self.video || self.audio
    }
}

#[derive(Debug, Clone)]
pub struct TesterPlan {
    pub params: TesterParams,
    pub publish: PublishPlan,
}

/// One slot per tester. Index `i` publishes video when `i < video_publishers`
/// and audio when `i < audio_publishers`; every other slot subscribes.
pub fn plan(params: &LoadTestParams) -> Vec<TesterPlan> {
    let expected_tracks = (params.video_publishers + params.audio_publishers) as usize;
    (0..params.tester_count())
        .map(|i| {
            let video = i < params.video_publishers as usize;
            let audio = i < params.audio_publishers as usize;
            let publisher = video || audio;

            let tester = TesterParams {
                url: params.url.clone(),
                api_key: params.api_key.clone(),
                api_secret: params.api_secret.clone(),
                room: params.room.clone(),
                identity_prefix: if publisher {
                    format!("{}_pub", params.identity_prefix)
                } else {
                    params.identity_prefix.clone()
                },
                sequence: i,
                name: if publisher {
                    format!("Pub {i}")
                } else {
                    format!("Sub {}", i - params.video_publishers as usize)
                },
                subscribe: !publisher,
                expected_tracks: if publisher { 0 } else { expected_tracks },
                layout: params.layout,
            };
            TesterPlan {
                params: tester,
                publish: PublishPlan {
                    video,
                    audio,
                    resolution: params.video_resolution,
                    codec: VideoCodec::for_publisher(params.video_codec, i),
                    simulcast: params.simulcast,
                },
            }
        })
        .collect()
}

// ── Report ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TesterSummary {
    pub name: String,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub params: LoadTestParams,
    /// Time between the start barrier and the stop
    pub elapsed: Duration,
    pub testers: Vec<TesterStats>,
    pub summaries: Vec<TesterSummary>,
    pub totals: Totals,
    /// Published track sid -> display name
    pub track_names: BTreeMap<String, String>,
    pub speaker_updates: Option<u64>,
}

impl Report {
    pub fn tester(&self, name: &str) -> Option<&TesterStats> {
        self.testers.iter().find(|t| t.name == name)
    }

    pub fn render(&self) -> String {
        render::report(self)
    }
}

// ── Orchestrator ─────────────────────────────────────────────

/// What a start task reports back to the orchestrator.
#[derive(Debug)]
struct StartOutcome {
    name: String,
    /// (track sid, display name) for each published track
    tracks: Vec<(String, String)>,
    error: Option<String>,
}

pub struct LoadTest {
    pub(crate) params: LoadTestParams,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) cancel: CancellationToken,
}

impl LoadTest {
    pub fn new(params: LoadTestParams, connector: Arc<dyn Connector>) -> Self {
        Self {
            params,
            connector,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `cancel` to end the run early; partial results are still reported.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self) -> Result<Report, LoadTestError> {
        run_scenario(self.params.clone(), &self.connector, &self.cancel).await
    }
}

pub(crate) async fn run_scenario(
    params: LoadTestParams,
    connector: &Arc<dyn Connector>,
    cancel: &CancellationToken,
) -> Result<Report, LoadTestError> {
    let params = params.normalized();
    preflight(&params)?;

    let plans = plan(&params);
    info!(
        url = %params.url,
        room = %params.room,
        prefix = %params.identity_prefix,
        testers = plans.len(),
        video_publishers = params.video_publishers,
        audio_publishers = params.audio_publishers,
        subscribers = params.subscribers,
        rate = params.num_per_second,
        "starting load test"
    );

    let testers: Vec<Arc<LoadTester>> = plans
        .iter()
        .map(|p| Arc::new(LoadTester::new(p.params.clone(), Arc::clone(connector), cancel.child_token())))
        .collect();

    // -- Start under the limiter --
    let limiter = StartLimiter::new(params.num_per_second);
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let mut starts = JoinSet::new();
    for (tester, plan) in testers.iter().zip(&plans) {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = limiter.acquire() => {}
        }
        let tester = Arc::clone(tester);
        let publish = plan.publish;
        let tx = outcome_tx.clone();
        starts.spawn(async move {
            let outcome = start_tester(&tester, publish).await;
            let _ = tx.send(outcome);
        });
    }
    drop(outcome_tx);

    let mut errors: HashMap<String, String> = HashMap::new();
    let mut track_names = BTreeMap::new();
    while let Some(outcome) = outcome_rx.recv().await {
        let StartOutcome { name, tracks, error } = outcome;
        track_names.extend(tracks);
        if let Some(error) = error {
            errors.insert(name, error);
        }
    }
    while let Some(result) = starts.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "start task failed");
        }
    }
    let connected = testers.iter().filter(|t| t.is_running()).count();
    info!(connected, failed = errors.len(), "testers started");

    // -- Speaker simulation --
    let speaker = if params.simulate_speakers {
        let publishers: Vec<Arc<LoadTester>> = testers
            .iter()
            .zip(&plans)
            .filter(|(t, p)| p.publish.any() && t.is_running())
            .map(|(t, _)| Arc::clone(t))
            .collect();
        let sim = SpeakerSimulator::new(publishers, params.speaker_pause);
        sim.start();
        Some(sim)
    } else {
        None
    };

    // -- Test window --
    let window = if params.duration.is_zero() {
        DEFAULT_TEST_WINDOW
    } else {
        params.duration
    };
    let started = Instant::now();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    let mut progress = tokio::time::interval_at(started + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = cancel.cancelled() => {
                info!("load test cancelled, stopping testers");
                break;
            }
            _ = progress.tick() => log_progress(&testers, started.elapsed()),
        }
    }
    let elapsed = started.elapsed();

    // -- Stop --
    let speaker_updates = match speaker {
        Some(sim) => {
            sim.stop().await;
            Some(sim.updates())
        }
        None => None,
    };
    let mut stops = JoinSet::new();
    for tester in &testers {
        let tester = Arc::clone(tester);
        stops.spawn(async move { tester.stop().await });
    }
    while stops.join_next().await.is_some() {}

    // -- Reduce --
    let tester_stats: Vec<TesterStats> = testers
        .iter()
        .map(|t| {
            let mut stats = t.get_stats();
            if let Some(error) = errors.remove(&stats.name) {
                stats.error.get_or_insert(error);
            }
            stats
        })
        .collect();
    let summaries: Vec<TesterSummary> = tester_stats
        .iter()
        .map(|s| TesterSummary {
            name: s.name.clone(),
            summary: Summary::from_tester(s),
        })
        .collect();
    let totals = Totals::from_summaries(summaries.iter().map(|s| &s.summary));
    info!(
        tracks = totals.tracks,
        packets = totals.packets,
        dropped = totals.dropped,
        errors = totals.errors,
        "load test finished"
    );

    Ok(Report {
        params,
        elapsed,
        testers: tester_stats,
        summaries,
        totals,
        track_names,
        speaker_updates,
    })
}

async fn start_tester(tester: &LoadTester, publish: PublishPlan) -> StartOutcome {
    let name = tester.name().to_string();
    let mut outcome = StartOutcome {
        name: name.clone(),
        tracks: Vec::new(),
        error: None,
    };
    if let Err(e) = tester.start().await {
        outcome.error = Some(format!("connect: {e}"));
        return outcome;
    }

    if publish.video {
        let result = if publish.simulcast {
            tester
                .publish_simulcast_track("video", publish.resolution, publish.codec)
                .await
        } else {
            tester.publish_video_track("video", publish.resolution, publish.codec).await
        };
        match result {
            Ok(sid) => outcome.tracks.push((sid, format!("{name} video"))),
            Err(e) => outcome.error = Some(format!("publish video: {e}")),
        }
    }
    if publish.audio {
        match tester.publish_audio_track("audio").await {
            Ok(sid) => outcome.tracks.push((sid, format!("{name} audio"))),
            Err(e) => {
                outcome.error.get_or_insert(format!("publish audio: {e}"));
            }
        }
    }
    outcome
}

fn log_progress(testers: &[Arc<LoadTester>], elapsed: Duration) {
    let (mut connected, mut tracks, mut packets, mut dropped) = (0usize, 0usize, 0u64, 0u64);
    for tester in testers {
        if tester.is_running() {
            connected += 1;
        }
        for track in tester.get_stats().tracks.values() {
            tracks += 1;
            packets += track.packets;
            dropped += track.dropped;
        }
    }
    info!(
        elapsed = elapsed.as_secs(),
        connected,
        tracks,
        packets,
        dropped,
        loss = %render::format_loss(dropped, packets),
        "progress"
    );
}
