/// Per-track counters written by consumer tasks and the reductions the
/// orchestrator builds from them once a run is over.
///
/// Counters are plain atomics: a single consumer task adds, anyone may load.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::rtc::{TrackKind, VideoQuality};

/// Latencies at or above this are treated as clock noise.
pub const MAX_LATENCY: Duration = Duration::from_millis(100);

/// Accept a one-way latency sample only if `0 <= now - sent < MAX_LATENCY`.
pub fn accept_latency(now_ns: u64, sent_ns: u64) -> Option<u64> {
    let latency = now_ns.checked_sub(sent_ns)?;
    (latency < MAX_LATENCY.as_nanos() as u64).then_some(latency)
}

// ── TrackStats ───────────────────────────────────────────────

#[derive(Debug)]
pub struct TrackStats {
    track_id: String,
    kind: TrackKind,
    started_at: Instant,
    packets: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    latency_total_ns: AtomicU64,
    latency_count: AtomicU64,
}

impl TrackStats {
    pub fn new(track_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            track_id: track_id.into(),
            kind,
            started_at: Instant::now(),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            latency_total_ns: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }

    /// Account one completed sample.
    pub fn record_sample(&self, bytes: usize, dropped: u64, latency_ns: Option<u64>) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        if let Some(ns) = latency_ns {
            self.latency_total_ns.fetch_add(ns, Ordering::Relaxed);
            self.latency_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            track_id: self.track_id.clone(),
            kind: self.kind,
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            latency_total_ns: self.latency_total_ns.load(Ordering::Relaxed),
            latency_count: self.latency_count.load(Ordering::Relaxed),
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// Point-in-time copy of a track's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub track_id: String,
    pub kind: TrackKind,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub latency_total_ns: u64,
    pub latency_count: u64,
    pub elapsed: Duration,
}

impl TrackSnapshot {
    pub fn bitrate_bps(&self) -> f64 {
        bitrate_bps(self.bytes, self.elapsed)
    }

    pub fn loss_rate(&self) -> f64 {
        loss_rate(self.dropped, self.packets)
    }
}

// ── TrackStatsMap ────────────────────────────────────────────

/// Concurrent track-id -> stats map.
#[derive(Debug, Default)]
pub struct TrackStatsMap {
    tracks: DashMap<String, Arc<TrackStats>>,
}

impl TrackStatsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing entry for `track_id`, or a fresh one. The flag is true when
    /// the entry was created by this call.
    pub fn get_or_insert(&self, track_id: &str, kind: TrackKind) -> (Arc<TrackStats>, bool) {
        match self.tracks.entry(track_id.to_string()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let stats = e.insert(Arc::new(TrackStats::new(track_id, kind)));
                (Arc::clone(stats.value()), true)
            }
        }
    }

    pub fn get(&self, track_id: &str) -> Option<Arc<TrackStats>> {
        self.tracks.get(track_id).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, TrackSnapshot> {
        self.tracks
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }
}

// ── TesterStats / Summary ────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TesterStats {
    pub name: String,
    pub identity: String,
    pub expected_tracks: usize,
    pub tracks: BTreeMap<String, TrackSnapshot>,
    /// Requested quality per remote participant sid
    pub qualities: BTreeMap<String, VideoQuality>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub tracks: usize,
    pub expected: usize,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub latency_total_ns: u64,
    pub latency_count: u64,
    /// Sum of per-track elapsed time
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl Summary {
    pub fn from_tester(stats: &TesterStats) -> Self {
        let mut summary = Summary {
            expected: stats.expected_tracks,
            error: stats.error.clone(),
            ..Default::default()
        };
        for track in stats.tracks.values() {
            summary.tracks += 1;
            summary.packets += track.packets;
            summary.bytes += track.bytes;
            summary.dropped += track.dropped;
            summary.latency_total_ns += track.latency_total_ns;
            summary.latency_count += track.latency_count;
            summary.elapsed += track.elapsed;
        }
        summary
    }

    /// Bytes over the accumulated per-track time, so this is the mean
    /// per-track rate.
    pub fn bitrate_bps(&self) -> f64 {
        bitrate_bps(self.bytes, self.elapsed)
    }

    pub fn loss_rate(&self) -> f64 {
        loss_rate(self.dropped, self.packets)
    }

    pub fn avg_latency(&self) -> Option<Duration> {
        average_latency(self.latency_total_ns, self.latency_count)
    }
}

/// Cross-tester totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    pub testers: usize,
    pub subscribers: usize,
    pub errors: usize,
    pub tracks: usize,
    pub expected: usize,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub latency_total_ns: u64,
    pub latency_count: u64,
    /// Sum of the per-tester bitrates
    pub bitrate_bps: f64,
}

impl Totals {
    pub fn from_summaries<'a>(summaries: impl IntoIterator<Item = &'a Summary>) -> Self {
        let mut totals = Totals::default();
        for s in summaries {
            totals.testers += 1;
            if s.expected > 0 {
                totals.subscribers += 1;
            }
            if s.error.is_some() {
                totals.errors += 1;
            }
            totals.tracks += s.tracks;
            totals.expected += s.expected;
            totals.packets += s.packets;
            totals.bytes += s.bytes;
            totals.dropped += s.dropped;
            totals.latency_total_ns += s.latency_total_ns;
            totals.latency_count += s.latency_count;
            totals.bitrate_bps += s.bitrate_bps();
        }
        totals
    }

    pub fn bitrate_per_subscriber_bps(&self) -> f64 {
        if self.subscribers == 0 {
            0.0
        } else {
            self.bitrate_bps / self.subscribers as f64
        }
    }

    pub fn loss_rate(&self) -> f64 {
        loss_rate(self.dropped, self.packets)
    }

    pub fn avg_latency(&self) -> Option<Duration> {
        average_latency(self.latency_total_ns, self.latency_count)
    }
}

// ── Numeric helpers ──────────────────────────────────────────

pub fn bitrate_bps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        bytes as f64 * 8.0 / secs
    }
}

/// `dropped / (packets + dropped)`, 0 when nothing was seen.
pub fn loss_rate(dropped: u64, packets: u64) -> f64 {
    let total = packets + dropped;
    if total == 0 {
        0.0
    } else {
        dropped as f64 / total as f64
    }
}

pub fn average_latency(total_ns: u64, count: u64) -> Option<Duration> {
    (count > 0).then(|| Duration::from_nanos(total_ns / count))
}
