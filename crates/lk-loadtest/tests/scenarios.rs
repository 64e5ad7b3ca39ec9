//! End-to-end scenarios for lk-loadtest.
//!
//! Every scenario runs a full `LoadTest` against the in-process loopback
//! server: testers start under the rate limiter, media flows through the
//! forwarding path and the report is reduced from what subscribers saw.
//! Timing-sensitive cases run on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use lk_loadtest::rtc::{SubscriptionSetting, VideoQuality};
use lk_loadtest::suite::SuiteCase;
use lk_loadtest::{Layout, LoadTest, LoadTestError, LoadTestParams, LoopbackConfig, LoopbackServer};

const SECRET: &str = "scenario-secret-0123456789abcdef0123";

fn server() -> LoopbackServer {
    LoopbackServer::new(LoopbackConfig {
        api_key: "devkey".into(),
        api_secret: SECRET.into(),
        ..Default::default()
    })
}

fn params(room: &str, video: u32, audio: u32, subscribers: u32, duration: Duration) -> LoadTestParams {
    LoadTestParams {
        api_key: "devkey".into(),
        api_secret: SECRET.into(),
        room: room.into(),
        identity_prefix: room.into(),
        video_publishers: video,
        audio_publishers: audio,
        subscribers,
        duration,
        layout: Layout::Speaker,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// 1. Smoke: one video publisher, one subscriber
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn smoke_single_video_track() {
    let server = server();
    let test = LoadTest::new(params("s1", 1, 0, 1, Duration::from_secs(2)), Arc::new(server.clone()));
    let report = test.run().await.expect("run completes");

    assert_eq!(report.testers.len(), 2);
    let sub = report.tester("Sub 0").expect("subscriber present");
    assert_eq!(sub.tracks.len(), 1);
    let track = sub.tracks.values().next().unwrap();
    assert!(track.packets > 0);
    assert!(track.loss_rate() < 0.01, "loss {}", track.loss_rate());
    assert!(sub.error.is_none());

    let rendered = report.render();
    assert_eq!(rendered.lines().filter(|l| l.contains("║ Sub 0 ")).count(), 2);
    assert!(rendered.contains("Pub 0 video"));

    // Every tester disconnected on the way out.
    assert_eq!(server.participant_count("s1"), 0);
}

// ---------------------------------------------------------------------------
// 2. Simulcast: the speaker layout asks for the HIGH layer
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simulcast_subscriber_requests_high_layer() {
    let server = server();
    let mut p = params("s2", 1, 0, 1, Duration::from_secs(2));
    p.simulcast = true;
    let test = LoadTest::new(p, Arc::new(server.clone()));
    let run = tokio::spawn(async move { test.run().await });

    let setting = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(sid) = server.track_sids("s2").first() {
                if let Some(setting) = server.subscription_setting("s2", "s2_1", sid) {
                    return setting;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscriber sets a quality");
    assert_eq!(
        setting,
        SubscriptionSetting::Dimensions {
            width: 1280,
            height: 720
        }
    );

    let report = run.await.unwrap().expect("run completes");
    let sub = report.tester("Sub 0").unwrap();
    assert_eq!(sub.qualities.values().copied().collect::<Vec<_>>(), [VideoQuality::High]);
    assert!(sub.tracks.values().all(|t| t.packets > 0));
}

// ---------------------------------------------------------------------------
// 3. One publisher carries both audio and video
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_publisher_audio_and_video() {
    let server = server();
    let test = LoadTest::new(params("s3", 1, 1, 2, Duration::from_secs(2)), Arc::new(server.clone()));
    let report = test.run().await.expect("run completes");

    assert_eq!(report.testers.len(), 3);
    assert_eq!(report.track_names.len(), 2);
    assert!(report.track_names.values().all(|n| n.starts_with("Pub 0 ")));

    for name in ["Sub 0", "Sub 1"] {
        let summary = &report.summaries.iter().find(|s| s.name == name).unwrap().summary;
        assert_eq!((summary.tracks, summary.expected), (2, 2), "{name}");
        assert!(summary.packets > 0);
    }
    assert_eq!(report.totals.subscribers, 2);
    assert_eq!(report.totals.errors, 0);
}

// ---------------------------------------------------------------------------
// 4. Start rate limit
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn starts_are_rate_limited() {
    let server = server();
    let mut p = params("s4", 0, 0, 20, Duration::from_secs(1));
    p.num_per_second = 5.0;
    let test = LoadTest::new(p, Arc::new(server.clone()));

    let begin = Instant::now();
    let report = test.run().await.expect("run completes");

    let times = server.connect_times();
    assert_eq!(times.len(), 20);
    let first = times[0];
    let last = times[times.len() - 1];
    // Refill math is floating point; allow a millisecond of slack.
    assert!(last - first >= Duration::from_millis(3799), "{:?}", last - first);
    assert!(last - begin >= Duration::from_millis(3999), "{:?}", last - begin);
    // No two starts closer than the rate allows.
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(190));
    }
    assert_eq!(report.testers.len(), 20);
    assert_eq!(report.totals.errors, 0);
}

// ---------------------------------------------------------------------------
// 5. Speaker simulation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn speaker_simulation_runs_during_window() {
    let server = server();
    let mut p = params("s5", 3, 0, 0, Duration::from_secs(6));
    p.simulate_speakers = true;
    let test = LoadTest::new(p, Arc::new(server.clone()));
    let report = test.run().await.expect("run completes");

    assert!(report.speaker_updates.unwrap_or_default() >= 1);
    assert!(server.speaker_updates() >= 1);
    assert_eq!(report.speaker_updates, Some(server.speaker_updates()));
    assert_eq!(report.totals.subscribers, 0);
    assert_eq!(server.participant_count("s5"), 0);
}

// ---------------------------------------------------------------------------
// 6. Cloud cap fails before any connect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cloud_cap_rejects_without_connecting() {
    let server = server();
    let mut p = params("s6", 51, 0, 0, Duration::from_secs(1));
    p.url = "https://x.livekit.cloud".into();
    let test = LoadTest::new(p, Arc::new(server.clone()));

    match test.run().await {
        Err(LoadTestError::CloudLimitExceeded { role, count, limit }) => {
            assert_eq!((role, count, limit), ("video publisher", 51, 50));
        }
        other => panic!("expected cloud cap error, got {other:?}"),
    }
    assert_eq!(server.connect_count(), 0);
}

// ---------------------------------------------------------------------------
// 7. Cancellation ends the window but still reports
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_returns_partial_report() {
    let server = server();
    let cancel = CancellationToken::new();
    // No duration: the window only ends on cancel.
    let test = LoadTest::new(params("s7", 0, 1, 1, Duration::ZERO), Arc::new(server.clone()))
        .with_cancellation(cancel.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
    });
    let report = test.run().await.expect("partial report");
    assert!(report.elapsed < Duration::from_secs(3));
    assert_eq!(report.testers.len(), 2);
    assert_eq!(server.participant_count("s7"), 0);
}

// ---------------------------------------------------------------------------
// 8. Suite: failing cases become rows
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn suite_keeps_going_after_a_failed_case() {
    let server = server();
    let mut base = params("suite", 0, 0, 0, Duration::from_secs(1));
    base.url = "wss://x.livekit.cloud".into();
    let test = LoadTest::new(base, Arc::new(server.clone()));

    let cases = [
        SuiteCase {
            video_publishers: 0,
            audio_publishers: 1,
            subscribers: 1,
        },
        SuiteCase {
            video_publishers: 0,
            audio_publishers: 0,
            subscribers: 51,
        },
        SuiteCase {
            video_publishers: 0,
            audio_publishers: 2,
            subscribers: 0,
        },
    ];
    let suite = test.run_cases(&cases).await.expect("suite completes");

    assert_eq!(suite.rows.len(), 3);
    assert_eq!(suite.reports.len(), 2);
    assert!(suite.rows[0].failure.is_none());
    assert!(suite.rows[0].audio && !suite.rows[0].video);
    assert_eq!(suite.rows[0].tracks, 1);
    assert!(suite.rows[1].failure.as_deref().unwrap_or_default().contains("subscriber"));
    assert!(suite.rows[2].failure.is_none());
    assert_eq!(suite.rows[2].publishers, 2);

    // Only the passing cases connected.
    assert_eq!(server.connect_count(), 4);
    assert_eq!(suite.reports[0].params.room, "suite_0");

    let table = suite.render();
    assert!(table.contains("║ Suite"));
    assert_eq!(table.lines().count(), 6 + 3);
}

#[tokio::test]
async fn suite_rejects_bad_url_and_early_cancel() {
    let server = server();
    let mut bad = params("x", 1, 0, 1, Duration::from_secs(1));
    bad.url = "nope".into();
    let test = LoadTest::new(bad, Arc::new(server.clone()));
    assert!(matches!(test.run_suite().await, Err(LoadTestError::InvalidUrl { .. })));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let test = LoadTest::new(params("x", 1, 0, 1, Duration::from_secs(1)), Arc::new(server.clone()))
        .with_cancellation(cancel);
    assert!(matches!(test.run_suite().await, Err(LoadTestError::Cancelled)));
    assert_eq!(server.connect_count(), 0);
}

// ---------------------------------------------------------------------------
// 9. Forwarding loss shows up in the report and triggers key frames
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarding_loss_is_reported_and_requests_key_frames() {
    let server = LoopbackServer::new(LoopbackConfig {
        api_key: "devkey".into(),
        api_secret: SECRET.into(),
        packet_loss: 0.1,
        ..Default::default()
    });
    let test = LoadTest::new(params("s9", 1, 0, 1, Duration::from_secs(2)), Arc::new(server.clone()));
    let report = test.run().await.expect("run completes");

    let sub = report.tester("Sub 0").expect("subscriber present");
    assert!(sub.error.is_none());
    let track = sub.tracks.values().next().expect("video track");
    assert!(track.packets > 0);
    assert!(track.dropped > 0, "{track:?}");
    assert!(track.loss_rate() > 0.0);

    // Every loss sends a PLI; the server coalesces them into far fewer
    // key frame requests.
    assert!(server.pli_count() > 1);
    assert!(server.key_frame_requests() >= 1);
    assert!(server.key_frame_requests() < server.pli_count());
}
