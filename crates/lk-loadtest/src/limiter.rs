use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Mutex;

/// Governor clock that reads tokio's clock, so a paused test runtime
/// drives the limiter too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

/// GCRA limiter gating tester starts: `rate` starts per second, no burst.
///
/// The limiter starts drained. Waiters queue on a fair mutex, so starts are
/// handed out in the order `acquire` was called.
pub struct StartLimiter {
    limiter: DirectLimiter,
    queue: Mutex<()>,
}

impl std::fmt::Debug for StartLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartLimiter").finish_non_exhaustive()
    }
}

impl StartLimiter {
    /// `rate` must be positive; callers clamp it first.
    pub fn new(rate: f64) -> Self {
        let quota = Duration::try_from_secs_f64(1.0 / rate)
            .ok()
            .and_then(Quota::with_period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        let limiter = RateLimiter::direct_with_clock(quota, TokioClock);
        // Spend the initial cell so the first start waits one period.
        let _ = limiter.check();
        Self {
            limiter,
            queue: Mutex::new(()),
        }
    }

    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        loop {
            match self.limiter.check() {
                Ok(()) => return,
                Err(not_until) => tokio::time::sleep(not_until.wait_time_from(TokioClock.now())).await,
            }
        }
    }
}
