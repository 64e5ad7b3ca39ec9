/// One simulated participant.
///
/// A tester connects to the room, optionally publishes audio and video, and
/// when it is a subscriber consumes every remote track it is handed, feeding
/// samples through a sample builder into per-track counters.
///
/// Nothing a tester does fails the run: connect, publish and sample-provider
/// errors are recorded and surface through [`LoadTester::get_stats`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lk_protocol::packets::picture_loss;
use lk_protocol::payload::{monotonic_ns, read_timestamp};

use crate::layout::Layout;
use crate::media::{
    quality_dimensions, simulcast_specs, AudioSampleProvider, LoopedVideoProvider, VideoCodec, VideoResolution,
    DEFAULT_AUDIO_BITRATE,
};
use crate::rtc::{
    Codec, ConnectInfo, Connector, MediaSample, ProviderError, RemoteParticipant, RemoteTrack, RemoteTrackPublication,
    Room, RoomEvent, RoomEvents, RtcError, SampleProvider, SimulateScenario, SimulcastLayer, SubscriptionSetting,
    TrackKind, TrackPublishOptions, VideoQuality,
};
use crate::stats::{accept_latency, TesterStats, TrackStats, TrackStatsMap};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct TesterParams {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub room: String,
    pub identity_prefix: String,
    pub sequence: usize,
    /// Display name, "Pub N" / "Sub N"
    pub name: String,
    pub subscribe: bool,
    /// Remote tracks a subscriber should end up with; 0 for publishers
    pub expected_tracks: usize,
    pub layout: Layout,
}

impl TesterParams {
    pub fn identity(&self) -> String {
        format!("{}_{}", self.identity_prefix, self.sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterState {
    Created,
    Connecting,
    Running,
    Failed,
    Stopped,
}

/// Disconnects the room when dropped.
struct RoomGuard(Arc<dyn Room>);

impl Drop for RoomGuard {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

/// State shared between the tester and the tasks it spawns.
struct Shared {
    name: String,
    layout: Layout,
    stats: TrackStatsMap,
    /// Requested quality per remote participant sid
    qualities: Mutex<HashMap<String, VideoQuality>>,
    error: Mutex<Option<String>>,
}

impl Shared {
    fn record_error(&self, error: String) {
        let mut slot = lock(&self.error);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Tally-then-choose under the lock so concurrent subscriptions can't
    /// both take the last slot.
    fn assign_quality(&self, participant_sid: &str) -> VideoQuality {
        let mut qualities = lock(&self.qualities);
        if let Some(quality) = qualities.get(participant_sid) {
            return *quality;
        }
        let quality = self.layout.select(qualities.values());
        qualities.insert(participant_sid.to_string(), quality);
        quality
    }
}

pub struct LoadTester {
    params: TesterParams,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    state: tokio::sync::Mutex<TesterState>,
    running: AtomicBool,
    room: Mutex<Option<RoomGuard>>,
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

impl LoadTester {
    /// `cancel` is normally a child of the scenario's token.
    pub fn new(params: TesterParams, connector: Arc<dyn Connector>, cancel: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            name: params.name.clone(),
            layout: params.layout,
            stats: TrackStatsMap::new(),
            qualities: Mutex::new(HashMap::new()),
            error: Mutex::new(None),
        });
        Self {
            params,
            connector,
            cancel,
            state: tokio::sync::Mutex::new(TesterState::Created),
            running: AtomicBool::new(false),
            room: Mutex::new(None),
            shared,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> TesterState {
        *self.state.lock().await
    }

    pub fn record_error(&self, error: impl Into<String>) {
        self.shared.record_error(error.into());
    }

    pub async fn start(&self) -> Result<(), RtcError> {
        let mut state = self.state.lock().await;
        match *state {
            TesterState::Running | TesterState::Stopped => return Ok(()),
            TesterState::Created | TesterState::Failed | TesterState::Connecting => {}
        }
        *state = TesterState::Connecting;

        let identity = self.params.identity();
        let info = ConnectInfo {
            url: self.params.url.clone(),
            api_key: self.params.api_key.clone(),
            api_secret: self.params.api_secret.clone(),
            room: self.params.room.clone(),
            identity: identity.clone(),
            name: self.params.name.clone(),
            auto_subscribe: self.params.subscribe,
        };

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => Err(RtcError::Cancelled),
            result = self.connector.connect(info) => result,
        };
        let (room, events) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                *state = TesterState::Failed;
                warn!(tester = %self.params.name, identity = %identity, error = %e, "connect failed");
                self.record_error(format!("connect: {e}"));
                return Err(e);
            }
        };

        *lock(&self.room) = Some(RoomGuard(Arc::clone(&room)));
        lock(&self.tasks).spawn(handle_events(
            Arc::clone(&self.shared),
            room,
            events,
            self.cancel.clone(),
        ));
        self.running.store(true, Ordering::Release);
        *state = TesterState::Running;
        info!(tester = %self.params.name, identity = %identity, room = %self.params.room, "tester connected");
        Ok(())
    }

    fn room(&self) -> Result<Arc<dyn Room>, RtcError> {
        lock(&self.room)
            .as_ref()
            .map(|guard| Arc::clone(&guard.0))
            .ok_or(RtcError::NotConnected)
    }

    fn recording<P: SampleProvider>(&self, provider: P) -> Box<dyn SampleProvider> {
        Box::new(RecordingProvider {
            inner: provider,
            shared: Arc::clone(&self.shared),
        })
    }

    fn publish_failed(&self, track: &str, e: &RtcError) {
        warn!(tester = %self.params.name, track, error = %e, "publish failed");
        self.record_error(format!("publish {track}: {e}"));
    }

    /// Publish an Opus-sized audio track; returns the track sid.
    pub async fn publish_audio_track(&self, name: &str) -> Result<String, RtcError> {
        let result = async {
            let room = self.room()?;
            let provider = AudioSampleProvider::new(DEFAULT_AUDIO_BITRATE, self.params.sequence as u64);
            let options = TrackPublishOptions {
                name: name.to_string(),
                kind: TrackKind::Audio,
                codec: Codec::Opus,
                width: 0,
                height: 0,
            };
            room.publish_track(options, self.recording(provider)).await
        }
        .await;
        match result {
            Ok(publication) => Ok(publication.sid),
            Err(e) => {
                self.publish_failed(name, &e);
                Err(e)
            }
        }
    }

    pub async fn publish_video_track(
        &self,
        name: &str,
        resolution: VideoResolution,
        codec: VideoCodec,
    ) -> Result<String, RtcError> {
        let result = async {
            let room = self.room()?;
            let spec = resolution.spec();
            let provider = LoopedVideoProvider::new(spec, self.params.sequence as u64);
            let options = TrackPublishOptions {
                name: name.to_string(),
                kind: TrackKind::Video,
                codec: codec.into(),
                width: spec.width,
                height: spec.height,
            };
            room.publish_track(options, self.recording(provider)).await
        }
        .await;
        match result {
            Ok(publication) => Ok(publication.sid),
            Err(e) => {
                self.publish_failed(name, &e);
                Err(e)
            }
        }
    }

    /// Three layers (LOW, MEDIUM, HIGH), each from its own provider.
    pub async fn publish_simulcast_track(
        &self,
        name: &str,
        resolution: VideoResolution,
        codec: VideoCodec,
    ) -> Result<String, RtcError> {
        let result = async {
            let room = self.room()?;
            let base = resolution.spec();
            let layers = simulcast_specs(base)
                .into_iter()
                .enumerate()
                .map(|(i, (quality, spec))| SimulcastLayer {
                    quality,
                    width: spec.width,
                    height: spec.height,
                    provider: self.recording(LoopedVideoProvider::new(
                        spec,
                        (self.params.sequence * 3 + i) as u64,
                    )),
                })
                .collect();
            let options = TrackPublishOptions {
                name: name.to_string(),
                kind: TrackKind::Video,
                codec: codec.into(),
                width: base.width,
                height: base.height,
            };
            room.publish_simulcast_track(options, layers).await
        }
        .await;
        match result {
            Ok(publication) => Ok(publication.sid),
            Err(e) => {
                self.publish_failed(name, &e);
                Err(e)
            }
        }
    }

    pub fn simulate_speaker_update(&self) -> Result<(), RtcError> {
        self.room()?.simulate(SimulateScenario::SpeakerUpdate)
    }

    /// Disconnect and wait for every task the tester spawned. Safe to call
    /// from any state and more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        if *state == TesterState::Stopped {
            return;
        }
        *state = TesterState::Stopped;
        self.running.store(false, Ordering::Release);

        let guard = lock(&self.room).take();
        drop(guard);

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(tester = %self.params.name, error = %e, "tester task failed");
            }
        }
        debug!(tester = %self.params.name, "tester stopped");
    }

    pub fn get_stats(&self) -> TesterStats {
        let qualities: BTreeMap<String, VideoQuality> = lock(&self.shared.qualities)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        TesterStats {
            name: self.params.name.clone(),
            identity: self.params.identity(),
            expected_tracks: self.params.expected_tracks,
            tracks: self.shared.stats.snapshot(),
            qualities,
            error: lock(&self.shared.error).clone(),
        }
    }

    /// Live stats for one remote track.
    pub fn track_stats(&self, track_id: &str) -> Option<Arc<TrackStats>> {
        self.shared.stats.get(track_id)
    }
}

// ── Provider wrapper ─────────────────────────────────────────

/// Records the first provider failure against the tester.
struct RecordingProvider<P> {
    inner: P,
    shared: Arc<Shared>,
}

impl<P: SampleProvider> SampleProvider for RecordingProvider<P> {
    fn next_sample(&mut self) -> Result<MediaSample, ProviderError> {
        self.inner.next_sample().map_err(|e| {
            self.shared.record_error(format!("sample provider: {e}"));
            e
        })
    }

    fn frame_duration(&self) -> std::time::Duration {
        self.inner.frame_duration()
    }

    fn request_key_frame(&mut self) {
        self.inner.request_key_frame();
    }
}

// ── Subscriber side ──────────────────────────────────────────

async fn handle_events(shared: Arc<Shared>, room: Arc<dyn Room>, mut events: RoomEvents, cancel: CancellationToken) {
    let mut consumers = JoinSet::new();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            RoomEvent::TrackSubscribed {
                track,
                publication,
                participant,
            } => on_track_subscribed(&shared, &room, &cancel, &mut consumers, track, publication, participant),
            RoomEvent::TrackSubscriptionFailed {
                track_sid,
                participant,
                reason,
            } => {
                warn!(
                    tester = %shared.name,
                    track = %track_sid,
                    participant = %participant.identity,
                    reason = %reason,
                    "track subscription failed"
                );
            }
            RoomEvent::ActiveSpeakersChanged { identities } => {
                debug!(tester = %shared.name, speakers = ?identities, "active speakers changed");
            }
            RoomEvent::Disconnected => {
                info!(tester = %shared.name, "disconnected from room");
                break;
            }
        }
    }
    while consumers.join_next().await.is_some() {}
}

fn on_track_subscribed(
    shared: &Shared,
    room: &Arc<dyn Room>,
    cancel: &CancellationToken,
    consumers: &mut JoinSet<()>,
    track: RemoteTrack,
    publication: RemoteTrackPublication,
    participant: RemoteParticipant,
) {
    let (stats, created) = shared.stats.get_or_insert(track.sid(), track.kind());
    if !created {
        debug!(tester = %shared.name, track = %track.sid(), "track resubscribed");
    }
    info!(
        tester = %shared.name,
        track = %track.sid(),
        kind = %track.kind(),
        participant = %participant.identity,
        "track subscribed"
    );

    if let Err(e) = room.write_pli(picture_loss(track.ssrc())) {
        debug!(tester = %shared.name, error = %e, "initial PLI failed");
    }

    let kind = track.kind();
    consumers.spawn(consume_track(track, stats, Arc::clone(room), cancel.clone()));

    if kind == TrackKind::Video {
        let quality = shared.assign_quality(&participant.sid);
        let setting = match quality_dimensions(quality) {
            Some((width, height)) => SubscriptionSetting::Dimensions { width, height },
            None => SubscriptionSetting::Disabled,
        };
        if let Err(e) = room.update_subscription(&publication.sid, setting) {
            warn!(tester = %shared.name, track = %publication.sid, error = %e, "failed to set video quality");
        }
        debug!(tester = %shared.name, track = %publication.sid, %quality, "video quality selected");
    }
}

async fn consume_track(mut track: RemoteTrack, stats: Arc<TrackStats>, room: Arc<dyn Room>, cancel: CancellationToken) {
    let mut builder = track.codec().sample_builder();
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read_rtp() => match read {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(track = %track.sid(), error = %e, "track read ended");
                    break;
                }
            },
        };
        builder.push(packet);

        while let Some(sample) = builder.pop() {
            let latency = read_timestamp(&sample.data).and_then(|sent| accept_latency(monotonic_ns(), sent));
            let dropped = u64::from(sample.prev_dropped_packets);
            stats.record_sample(sample.data.len(), dropped, latency);
            if dropped > 0 {
                if let Err(e) = room.write_pli(picture_loss(track.ssrc())) {
                    debug!(track = %track.sid(), error = %e, "PLI failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use lk_protocol::payload::{stamp, PayloadError};

    use super::*;
    use crate::loopback::{LoopbackConfig, LoopbackServer};

    const SECRET: &str = "tester-test-secret-0123456789abcdef";

    fn server() -> LoopbackServer {
        LoopbackServer::new(LoopbackConfig {
            api_key: "devkey".into(),
            api_secret: SECRET.into(),
            ..Default::default()
        })
    }

    fn params(sequence: usize, subscribe: bool, expected_tracks: usize) -> TesterParams {
        TesterParams {
            url: "ws://localhost:7880".into(),
            api_key: "devkey".into(),
            api_secret: SECRET.into(),
            room: "room1".into(),
            identity_prefix: if subscribe { "t".into() } else { "t_pub".into() },
            sequence,
            name: if subscribe { format!("Sub {sequence}") } else { format!("Pub {sequence}") },
            subscribe,
            expected_tracks,
            layout: Layout::Speaker,
        }
    }

    fn tester(server: &LoopbackServer, params: TesterParams) -> LoadTester {
        LoadTester::new(params, Arc::new(server.clone()), CancellationToken::new())
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let server = server();
        let t = tester(&server, params(0, false, 0));
        assert_eq!(t.state().await, TesterState::Created);
        t.start().await.unwrap();
        t.start().await.unwrap();
        assert_eq!(server.connect_count(), 1);
        assert!(t.is_running());
        assert_eq!(server.participant_count("room1"), 1);

        t.stop().await;
        t.stop().await;
        assert_eq!(t.state().await, TesterState::Stopped);
        assert!(!t.is_running());
        assert_eq!(server.participant_count("room1"), 0);

        // Stopped is terminal.
        t.start().await.unwrap();
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn connect_failure_is_recorded() {
        let server = server();
        let mut p = params(0, true, 1);
        p.api_secret = "wrong-secret-wrong-secret-wrong-00".into();
        let t = tester(&server, p);
        assert!(t.start().await.is_err());
        assert_eq!(t.state().await, TesterState::Failed);
        let stats = t.get_stats();
        assert!(stats.error.as_deref().unwrap_or_default().starts_with("connect:"));
        t.stop().await;
    }

    #[tokio::test]
    async fn publish_before_start_fails() {
        let server = server();
        let t = tester(&server, params(0, false, 0));
        let err = t.publish_audio_track("audio").await.unwrap_err();
        assert!(matches!(err, RtcError::NotConnected));
        assert!(t.get_stats().error.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscriber_counts_samples() {
        let server = server();
        let publisher = tester(&server, params(0, false, 0));
        let subscriber = tester(&server, params(1, true, 2));
        subscriber.start().await.unwrap();
        publisher.start().await.unwrap();
        let audio = publisher.publish_audio_track("audio").await.unwrap();
        let video = publisher
            .publish_video_track("video", VideoResolution::Low, VideoCodec::Vp8)
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            loop {
                let counted = [&audio, &video]
                    .iter()
                    .filter(|sid| subscriber.track_stats(sid).map_or(false, |s| s.snapshot().packets >= 10))
                    .count();
                if counted == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("samples flow on both tracks");

        publisher.stop().await;
        subscriber.stop().await;

        let stats = subscriber.get_stats();
        assert_eq!(stats.tracks.len(), 2);
        assert_eq!(stats.tracks[&audio].kind, TrackKind::Audio);
        assert_eq!(stats.qualities.values().collect::<Vec<_>>(), [&VideoQuality::High]);
        let video_stats = &stats.tracks[&video];
        assert!(video_stats.latency_count > 0);
        assert!(video_stats.latency_total_ns / video_stats.latency_count < 100_000_000);

        // Publishers never accrue remote tracks.
        assert!(publisher.get_stats().tracks.is_empty());
        assert!(publisher.get_stats().error.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn counters_only_grow() {
        let server = server();
        let publisher = tester(&server, params(0, false, 0));
        let subscriber = tester(&server, params(1, true, 1));
        subscriber.start().await.unwrap();
        publisher.start().await.unwrap();
        let sid = publisher.publish_audio_track("audio").await.unwrap();

        let mut last = None;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            if let Some(stats) = subscriber.track_stats(&sid) {
                let snap = stats.snapshot();
                if let Some((packets, bytes)) = last {
                    assert!(snap.packets >= packets);
                    assert!(snap.bytes >= bytes);
                }
                last = Some((snap.packets, snap.bytes));
            }
        }
        assert!(last.is_some());
        publisher.stop().await;
        subscriber.stop().await;
    }

    /// Yields a few good samples, then fails for good.
    struct FailingProvider {
        remaining: usize,
    }

    impl SampleProvider for FailingProvider {
        fn next_sample(&mut self) -> Result<MediaSample, ProviderError> {
            if self.remaining == 0 {
                return Err(PayloadError::TooShort(3).into());
            }
            self.remaining -= 1;
            let mut buf = vec![0u8; 64];
            stamp(&mut buf, monotonic_ns())?;
            Ok(MediaSample {
                data: bytes::Bytes::from(buf),
                duration: Duration::from_millis(20),
            })
        }

        fn frame_duration(&self) -> Duration {
            Duration::from_millis(20)
        }

        fn request_key_frame(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn provider_failure_is_recorded_on_the_tester() {
        let server = server();
        let t = tester(&server, params(0, false, 0));
        t.start().await.unwrap();
        let options = TrackPublishOptions {
            name: "audio".into(),
            kind: TrackKind::Audio,
            codec: Codec::Opus,
            width: 0,
            height: 0,
        };
        t.room()
            .unwrap()
            .publish_track(options, t.recording(FailingProvider { remaining: 3 }))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), async {
            while t.get_stats().error.is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("provider error recorded");

        let error = t.get_stats().error.unwrap_or_default();
        assert!(error.starts_with("sample provider:"), "{error}");
        assert!(error.contains("3 bytes"), "{error}");
        t.stop().await;
    }

    #[tokio::test]
    async fn cancelled_before_connect() {
        let server = LoopbackServer::new(LoopbackConfig {
            api_key: "devkey".into(),
            api_secret: SECRET.into(),
            connect_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let t = Arc::new(LoadTester::new(params(0, true, 1), Arc::new(server.clone()), cancel.clone()));
        let start = tokio::spawn({
            let t = Arc::clone(&t);
            async move { t.start().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = timeout(Duration::from_secs(1), start).await.unwrap().unwrap();
        assert!(matches!(result, Err(RtcError::Cancelled)));
        t.stop().await;
        assert_eq!(server.participant_count("room1"), 0);
    }
}
