/// In-process selective forwarding unit.
///
/// Implements [`Connector`] without any networking: participants join rooms
/// held in memory, published tracks are driven by their sample providers on
/// their own tasks, and packetized media is forwarded to every subscriber over
/// a bounded channel. A full channel drops the packet, which the subscriber's
/// sample builder then reports as loss.
///
/// Per-subscriber forwarding mirrors what a real SFU does for simulcast: one
/// layer is selected from the requested dimensions, switches happen only on
/// sample boundaries, and outgoing sequence numbers are rewritten so the
/// subscriber sees a single contiguous stream.
///
/// Key frame requests (PLIs and layer switches) are coalesced per layer and
/// honoured at most once per [`KEY_FRAME_MIN_INTERVAL`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lk_protocol::auth::{AccessToken, TokenVerifier, VideoGrants};
use lk_protocol::packets::{samples, Codec, CodecDepacketizer, RtpPacket};
use lk_protocol::DEFAULT_MTU;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packetizer::Depacketizer;

use crate::rtc::{
    ConnectInfo, Connector, LocalTrackPublication, RemoteParticipant, RemoteTrack, RemoteTrackPublication, Room,
    RoomEvent, RoomEvents, RtcError, SampleProvider, SimulateScenario, SimulcastLayer, SubscriptionSetting,
    TrackKind, TrackPublishOptions, VideoQuality,
};

/// Shortest gap between two key frames forced on the same layer.
pub const KEY_FRAME_MIN_INTERVAL: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Config ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Probability in [0, 1] that a forwarded packet is dropped
    pub packet_loss: f64,
    /// Simulated signaling round trip per connect
    pub connect_delay: Duration,
    /// Packets buffered per subscribed track before dropping
    pub subscriber_buffer: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            api_key: "devkey".to_string(),
            api_secret: "secret".to_string(),
            packet_loss: 0.0,
            connect_delay: Duration::ZERO,
            subscriber_buffer: 1024,
        }
    }
}

// ── Server state ─────────────────────────────────────────────

#[derive(Clone)]
pub struct LoopbackServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: LoopbackConfig,
    verifier: TokenVerifier,
    rooms: Mutex<HashMap<String, RoomState>>,
    /// Published media SSRC -> track, for PLI routing
    ssrcs: Mutex<HashMap<u32, Arc<PublishedTrack>>>,
    next_id: AtomicU64,
    connects: Mutex<Vec<Instant>>,
    speaker_updates: AtomicU64,
    plis: AtomicU64,
    key_frame_requests: AtomicU64,
}

struct RoomState {
    sid: String,
    participants: HashMap<String, Participant>,
    tracks: HashMap<String, Arc<PublishedTrack>>,
}

struct Participant {
    sid: String,
    identity: String,
    auto_subscribe: bool,
    can_publish: bool,
    can_subscribe: bool,
    events: mpsc::UnboundedSender<RoomEvent>,
}

struct Layer {
    quality: VideoQuality,
    width: u32,
    height: u32,
    ssrc: u32,
    key_frame_requested: AtomicBool,
}

struct PublishedTrack {
    sid: String,
    name: String,
    kind: TrackKind,
    codec: Codec,
    /// Finds sample heads for layer switching
    depacketizer: CodecDepacketizer,
    simulcast: bool,
    width: u32,
    height: u32,
    owner: RemoteParticipant,
    /// Ascending quality
    layers: Vec<Layer>,
    /// Keyed by subscriber participant sid
    subscribers: Mutex<HashMap<String, Downtrack>>,
    closed: CancellationToken,
}

/// Forwarding state for one subscriber of one track.
struct Downtrack {
    identity: String,
    tx: mpsc::Sender<RtpPacket>,
    ssrc: u32,
    setting: Option<SubscriptionSetting>,
    target: Option<VideoQuality>,
    current: Option<VideoQuality>,
    /// Last forwarded packet was not a sample's final packet
    mid_sample: bool,
    next_sequence: u16,
    /// Added to the source layer's RTP timestamps
    timestamp_offset: u32,
    last_timestamp: Option<u32>,
}

impl Downtrack {
    fn accepts(&mut self, quality: VideoQuality, packet: &RtpPacket, heads: &CodecDepacketizer) -> bool {
        let Some(target) = self.target else {
            self.current = None;
            self.mid_sample = false;
            return false;
        };
        if self.current == Some(quality) {
            self.mid_sample = !packet.header.marker;
            return true;
        }
        if quality == target && !self.mid_sample && heads.is_partition_head(&packet.payload) {
            self.current = Some(quality);
            self.mid_sample = !packet.header.marker;
            // Rebase so timestamps keep increasing across the switch.
            self.timestamp_offset = self
                .last_timestamp
                .map_or(0, |last| last.wrapping_add(1).wrapping_sub(packet.header.timestamp));
            return true;
        }
        false
    }

    /// Rewrite a source packet into this subscriber's stream.
    fn rewrite(&mut self, packet: &RtpPacket) -> RtpPacket {
        let mut out = packet.clone();
        out.header.ssrc = self.ssrc;
        out.header.sequence_number = self.next_sequence;
        out.header.timestamp = packet.header.timestamp.wrapping_add(self.timestamp_offset);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.last_timestamp = Some(out.header.timestamp);
        out
    }
}

impl PublishedTrack {
    fn primary_ssrc(&self) -> u32 {
        self.layers.last().map_or(0, |l| l.ssrc)
    }

    fn default_target(&self) -> Option<VideoQuality> {
        self.layers.last().map(|l| l.quality)
    }

    /// Smallest layer covering the requested dimensions, else the largest.
    fn target_for(&self, setting: SubscriptionSetting) -> Option<VideoQuality> {
        match setting {
            SubscriptionSetting::Disabled => None,
            SubscriptionSetting::Dimensions { width, height } => self
                .layers
                .iter()
                .find(|l| l.width >= width && l.height >= height)
                .or(self.layers.last())
                .map(|l| l.quality),
        }
    }

    fn publication(&self) -> RemoteTrackPublication {
        RemoteTrackPublication {
            sid: self.sid.clone(),
            name: self.name.clone(),
            kind: self.kind,
            simulcast: self.simulcast,
            width: self.width,
            height: self.height,
        }
    }

    fn request_key_frame(&self, quality: Option<VideoQuality>) {
        for layer in &self.layers {
            if quality.map_or(true, |q| q == layer.quality) {
                layer.key_frame_requested.store(true, Ordering::Relaxed);
            }
        }
    }

    fn forward(&self, quality: VideoQuality, packets: &[RtpPacket], loss: f64) {
        let mut subscribers = lock(&self.subscribers);
        let mut gone = Vec::new();
        for (sid, down) in subscribers.iter_mut() {
            for packet in packets {
                if !down.accepts(quality, packet, &self.depacketizer) {
                    continue;
                }
                let out = down.rewrite(packet);
                if loss > 0.0 && rand::random::<f64>() < loss {
                    continue;
                }
                match down.tx.try_send(out) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => {
                        gone.push(sid.clone());
                        break;
                    }
                }
            }
        }
        for sid in gone {
            subscribers.remove(&sid);
        }
    }

    /// Stop the layer tasks and close every subscriber's stream.
    fn close(&self) {
        self.closed.cancel();
        lock(&self.subscribers).clear();
    }
}

impl ServerInner {
    fn next_sid(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn next_ssrc(&self) -> u32 {
        0x1000_0000 | (self.next_id.fetch_add(1, Ordering::Relaxed) as u32 & 0x0FFF_FFFF)
    }

    fn subscribe(&self, track: &Arc<PublishedTrack>, subscriber: &Participant) {
        if !subscriber.can_subscribe {
            let _ = subscriber.events.send(RoomEvent::TrackSubscriptionFailed {
                track_sid: track.sid.clone(),
                participant: track.owner.clone(),
                reason: "subscribe permission denied".to_string(),
            });
            return;
        }

        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let ssrc = track.primary_ssrc();
        lock(&track.subscribers).insert(
            subscriber.sid.clone(),
            Downtrack {
                identity: subscriber.identity.clone(),
                tx,
                ssrc,
                setting: None,
                target: track.default_target(),
                current: None,
                mid_sample: false,
                next_sequence: rand::random(),
                timestamp_offset: 0,
                last_timestamp: None,
            },
        );

        let event = RoomEvent::TrackSubscribed {
            track: RemoteTrack::new(track.sid.clone(), track.kind, track.codec, ssrc, rx),
            publication: track.publication(),
            participant: track.owner.clone(),
        };
        if subscriber.events.send(event).is_err() {
            lock(&track.subscribers).remove(&subscriber.sid);
        }
    }

    fn leave(&self, room_name: &str, participant_sid: &str) {
        let mut rooms = lock(&self.rooms);
        let Some(room) = rooms.get_mut(room_name) else {
            return;
        };
        Self::remove_participant(&self.ssrcs, room, participant_sid);
        if room.participants.is_empty() {
            debug!(room = %room_name, "room closed");
            rooms.remove(room_name);
        }
    }

    fn remove_participant(ssrcs: &Mutex<HashMap<u32, Arc<PublishedTrack>>>, room: &mut RoomState, sid: &str) {
        let Some(participant) = room.participants.remove(sid) else {
            return;
        };
        let _ = participant.events.send(RoomEvent::Disconnected);

        let owned: Vec<String> = room
            .tracks
            .values()
            .filter(|t| t.owner.sid == sid)
            .map(|t| t.sid.clone())
            .collect();
        for track_sid in owned {
            if let Some(track) = room.tracks.remove(&track_sid) {
                track.close();
                let mut ssrcs = lock(ssrcs);
                for layer in &track.layers {
                    ssrcs.remove(&layer.ssrc);
                }
            }
        }
        for track in room.tracks.values() {
            lock(&track.subscribers).remove(sid);
        }
        info!(identity = %participant.identity, "participant left");
    }
}

impl LoopbackServer {
    pub fn new(config: LoopbackConfig) -> Self {
        let verifier = TokenVerifier::new(&config.api_key, &config.api_secret);
        Self {
            inner: Arc::new(ServerInner {
                config,
                verifier,
                rooms: Mutex::new(HashMap::new()),
                ssrcs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connects: Mutex::new(Vec::new()),
                speaker_updates: AtomicU64::new(0),
                plis: AtomicU64::new(0),
                key_frame_requests: AtomicU64::new(0),
            }),
        }
    }

    /// Join with an already minted token.
    pub fn join(&self, token: &str, auto_subscribe: bool) -> Result<(Arc<dyn Room>, RoomEvents), RtcError> {
        let claims = self.inner.verifier.verify(token)?;
        if !claims.video.room_join || claims.video.room.is_empty() {
            return Err(RtcError::Connect("token does not grant room join".to_string()));
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let participant = Participant {
            sid: self.inner.next_sid("PA"),
            identity: claims.sub,
            auto_subscribe,
            can_publish: claims.video.can_publish,
            can_subscribe: claims.video.can_subscribe,
            events,
        };

        let room_name = claims.video.room;
        let mut rooms = lock(&self.inner.rooms);
        let room = rooms.entry(room_name.clone()).or_insert_with(|| RoomState {
            sid: self.inner.next_sid("RM"),
            participants: HashMap::new(),
            tracks: HashMap::new(),
        });

        let duplicate = room
            .participants
            .values()
            .find(|p| p.identity == participant.identity)
            .map(|p| p.sid.clone());
        if let Some(old) = duplicate {
            warn!(identity = %participant.identity, "duplicate identity, replacing previous session");
            ServerInner::remove_participant(&self.inner.ssrcs, room, &old);
        }

        if auto_subscribe {
            for track in room.tracks.values() {
                self.inner.subscribe(track, &participant);
            }
        }

        let handle = LoopbackRoom {
            server: Arc::clone(&self.inner),
            room: room_name.clone(),
            room_sid: room.sid.clone(),
            sid: participant.sid.clone(),
            identity: participant.identity.clone(),
            connected: AtomicBool::new(true),
        };
        room.participants.insert(participant.sid.clone(), participant);
        drop(rooms);

        info!(room = %room_name, identity = %handle.identity, sid = %handle.sid, "participant joined");
        Ok((Arc::new(handle), events_rx))
    }

    // -- Introspection --

    pub fn connect_count(&self) -> usize {
        lock(&self.inner.connects).len()
    }

    /// When each connect attempt started, in call order.
    pub fn connect_times(&self) -> Vec<Instant> {
        lock(&self.inner.connects).clone()
    }

    pub fn speaker_updates(&self) -> u64 {
        self.inner.speaker_updates.load(Ordering::Relaxed)
    }

    /// PLIs received from subscribers
    pub fn pli_count(&self) -> u64 {
        self.inner.plis.load(Ordering::Relaxed)
    }

    /// Key frames actually asked of sample providers, after throttling
    pub fn key_frame_requests(&self) -> u64 {
        self.inner.key_frame_requests.load(Ordering::Relaxed)
    }

    pub fn participant_count(&self, room: &str) -> usize {
        lock(&self.inner.rooms).get(room).map_or(0, |r| r.participants.len())
    }

    pub fn track_count(&self, room: &str) -> usize {
        lock(&self.inner.rooms).get(room).map_or(0, |r| r.tracks.len())
    }

    pub fn track_sids(&self, room: &str) -> Vec<String> {
        let rooms = lock(&self.inner.rooms);
        let mut sids: Vec<String> = rooms.get(room).map(|r| r.tracks.keys().cloned().collect()).unwrap_or_default();
        sids.sort();
        sids
    }

    /// Last setting `subscriber` requested on `track_sid`.
    pub fn subscription_setting(&self, room: &str, subscriber: &str, track_sid: &str) -> Option<SubscriptionSetting> {
        let rooms = lock(&self.inner.rooms);
        let track = rooms.get(room)?.tracks.get(track_sid)?;
        let subscribers = lock(&track.subscribers);
        subscribers
            .values()
            .find(|d| d.identity == subscriber)
            .and_then(|d| d.setting)
    }
}

#[async_trait]
impl Connector for LoopbackServer {
    async fn connect(&self, info: ConnectInfo) -> Result<(Arc<dyn Room>, RoomEvents), RtcError> {
        lock(&self.inner.connects).push(Instant::now());
        let delay = self.inner.config.connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let token = AccessToken::new(&info.api_key, &info.api_secret)
            .with_identity(&info.identity)
            .with_name(&info.name)
            .with_grants(VideoGrants::join(&info.room))
            .to_jwt()?;
        self.join(&token, info.auto_subscribe)
    }
}

// ── Room handle ──────────────────────────────────────────────

struct LoopbackRoom {
    server: Arc<ServerInner>,
    room: String,
    room_sid: String,
    sid: String,
    identity: String,
    connected: AtomicBool,
}

impl LoopbackRoom {
    fn publish_layers(
        &self,
        options: TrackPublishOptions,
        mut layers: Vec<SimulcastLayer>,
        simulcast: bool,
    ) -> Result<LocalTrackPublication, RtcError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(RtcError::NotConnected);
        }
        if layers.is_empty() {
            return Err(RtcError::Publish("no layers".to_string()));
        }
        layers.sort_by_key(|l| l.quality);

        let server = &self.server;
        let mut rooms = lock(&server.rooms);
        let room = rooms.get_mut(&self.room).ok_or(RtcError::NotConnected)?;
        let me = room.participants.get(&self.sid).ok_or(RtcError::NotConnected)?;
        if !me.can_publish {
            return Err(RtcError::Publish("publish permission denied".to_string()));
        }

        let mut providers = Vec::with_capacity(layers.len());
        let mut track_layers = Vec::with_capacity(layers.len());
        for layer in layers {
            track_layers.push(Layer {
                quality: layer.quality,
                width: layer.width,
                height: layer.height,
                ssrc: server.next_ssrc(),
                key_frame_requested: AtomicBool::new(false),
            });
            providers.push(layer.provider);
        }

        let track = Arc::new(PublishedTrack {
            sid: server.next_sid("TR"),
            name: options.name,
            kind: options.kind,
            codec: options.codec,
            depacketizer: options.codec.depacketizer(),
            simulcast,
            width: options.width,
            height: options.height,
            owner: RemoteParticipant {
                sid: self.sid.clone(),
                identity: self.identity.clone(),
            },
            layers: track_layers,
            subscribers: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });

        {
            let mut ssrcs = lock(&server.ssrcs);
            for layer in &track.layers {
                ssrcs.insert(layer.ssrc, Arc::clone(&track));
            }
        }
        for participant in room.participants.values() {
            if participant.sid != self.sid && participant.auto_subscribe {
                server.subscribe(&track, participant);
            }
        }
        room.tracks.insert(track.sid.clone(), Arc::clone(&track));
        drop(rooms);

        let loss = server.config.packet_loss;
        for (index, provider) in providers.into_iter().enumerate() {
            tokio::spawn(drive_layer(Arc::clone(server), Arc::clone(&track), index, provider, loss));
        }

        info!(
            identity = %self.identity,
            track = %track.sid,
            kind = %track.kind,
            layers = track.layers.len(),
            "track published"
        );
        Ok(LocalTrackPublication {
            sid: track.sid.clone(),
            ssrcs: track.layers.iter().map(|l| l.ssrc).collect(),
        })
    }
}

#[async_trait]
impl Room for LoopbackRoom {
    fn sid(&self) -> &str {
        &self.room_sid
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn publish_track(
        &self,
        options: TrackPublishOptions,
        provider: Box<dyn SampleProvider>,
    ) -> Result<LocalTrackPublication, RtcError> {
        let layer = SimulcastLayer {
            quality: VideoQuality::High,
            width: options.width,
            height: options.height,
            provider,
        };
        self.publish_layers(options, vec![layer], false)
    }

    async fn publish_simulcast_track(
        &self,
        options: TrackPublishOptions,
        layers: Vec<SimulcastLayer>,
    ) -> Result<LocalTrackPublication, RtcError> {
        self.publish_layers(options, layers, true)
    }

    fn update_subscription(&self, track_sid: &str, setting: SubscriptionSetting) -> Result<(), RtcError> {
        let rooms = lock(&self.server.rooms);
        let room = rooms.get(&self.room).ok_or(RtcError::NotConnected)?;
        let track = room
            .tracks
            .get(track_sid)
            .ok_or_else(|| RtcError::UnknownTrack(track_sid.to_string()))?;

        let mut subscribers = lock(&track.subscribers);
        let down = subscribers
            .get_mut(&self.sid)
            .ok_or_else(|| RtcError::UnknownTrack(track_sid.to_string()))?;
        let target = track.target_for(setting);
        down.setting = Some(setting);
        if down.target != target {
            down.target = target;
            if target.is_some() {
                track.request_key_frame(target);
            }
        }
        debug!(identity = %self.identity, track = %track_sid, ?setting, ?target, "subscription updated");
        Ok(())
    }

    fn write_pli(&self, pli: PictureLossIndication) -> Result<(), RtcError> {
        self.server.plis.fetch_add(1, Ordering::Relaxed);
        let media_ssrc = pli.media_ssrc;
        let track = lock(&self.server.ssrcs)
            .get(&media_ssrc)
            .cloned()
            .ok_or_else(|| RtcError::UnknownTrack(format!("ssrc {media_ssrc}")))?;
        track.request_key_frame(None);
        Ok(())
    }

    fn simulate(&self, scenario: SimulateScenario) -> Result<(), RtcError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(RtcError::NotConnected);
        }
        match scenario {
            SimulateScenario::SpeakerUpdate => {
                self.server.speaker_updates.fetch_add(1, Ordering::Relaxed);
                let rooms = lock(&self.server.rooms);
                if let Some(room) = rooms.get(&self.room) {
                    for participant in room.participants.values().filter(|p| p.sid != self.sid) {
                        let _ = participant.events.send(RoomEvent::ActiveSpeakersChanged {
                            identities: vec![self.identity.clone()],
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.server.leave(&self.room, &self.sid);
        }
    }
}

// ── Media tasks ──────────────────────────────────────────────

async fn drive_layer(
    server: Arc<ServerInner>,
    track: Arc<PublishedTrack>,
    index: usize,
    mut provider: Box<dyn SampleProvider>,
    loss: f64,
) {
    let layer = &track.layers[index];
    let clock_rate = track.codec.clock_rate();
    let mut packetizer = track.codec.packetizer(layer.ssrc, DEFAULT_MTU);
    let mut ticker = tokio::time::interval(provider.frame_duration().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_key_frame: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = track.closed.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // A request inside the interval stays pending until it has passed.
        let due = last_key_frame.map_or(true, |at| at.elapsed() >= KEY_FRAME_MIN_INTERVAL);
        if due && layer.key_frame_requested.swap(false, Ordering::Relaxed) {
            provider.request_key_frame();
            last_key_frame = Some(Instant::now());
            server.key_frame_requests.fetch_add(1, Ordering::Relaxed);
        }
        let sample = match provider.next_sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(track = %track.sid, quality = %layer.quality, error = %e, "sample provider failed, layer stopped");
                break;
            }
        };
        let packets = match packetizer.packetize(&sample.data, samples(sample.duration, clock_rate)) {
            Ok(packets) => packets,
            Err(e) => {
                warn!(track = %track.sid, quality = %layer.quality, error = %e, "packetize failed, sample skipped");
                continue;
            }
        };
        track.forward(layer.quality, &packets, loss);
    }
    debug!(track = %track.sid, quality = %layer.quality, "layer stopped");
}
