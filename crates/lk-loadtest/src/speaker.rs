use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rtc::SPEAKER_UPDATE_INTERVAL;
use crate::tester::LoadTester;

/// Pause used when none is configured.
pub const DEFAULT_SPEAKER_PAUSE: Duration = Duration::from_secs(1);

/// Background ticker that makes a random publisher "speak" every
/// `pause + SPEAKER_UPDATE_INTERVAL` (the first one after `pause`).
pub struct SpeakerSimulator {
    publishers: Arc<Vec<Arc<LoadTester>>>,
    pause: Duration,
    updates: Arc<AtomicU64>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SpeakerSimulator {
    pub fn new(publishers: Vec<Arc<LoadTester>>, pause: Duration) -> Self {
        Self {
            publishers: Arc::new(publishers),
            pause: if pause.is_zero() { DEFAULT_SPEAKER_PAUSE } else { pause },
            updates: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Updates successfully handed to a publisher so far.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&self.publishers),
            self.pause,
            Arc::clone(&self.updates),
            cancel.clone(),
        ));
        *worker = Some((cancel, handle));
        info!(publishers = self.publishers.len(), pause = ?self.pause, "speaker simulation started");
    }

    pub async fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((cancel, handle)) = worker else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "speaker simulation task failed");
        }
        info!(updates = self.updates(), "speaker simulation stopped");
    }
}

async fn run(publishers: Arc<Vec<Arc<LoadTester>>>, pause: Duration, updates: Arc<AtomicU64>, cancel: CancellationToken) {
    let mut delay = pause;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = pause + SPEAKER_UPDATE_INTERVAL;

        if publishers.is_empty() {
            continue;
        }
        let index = rand::random_range(0..publishers.len());
        let publisher = &publishers[index];
        match publisher.simulate_speaker_update() {
            Ok(()) => {
                updates.fetch_add(1, Ordering::Relaxed);
                debug!(tester = %publisher.name(), "speaker update");
            }
            Err(e) => warn!(tester = %publisher.name(), error = %e, "speaker update failed"),
        }
    }
}
