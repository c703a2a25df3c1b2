//! Wall-clock abstraction, so that expiry decisions can be driven by a
//! controllable time source in tests and simulations.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// Source of "now" plus the ability to wait. Every lease expiry comparison
/// goes through this trait.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current local wall-clock reading.
    fn now(&self) -> SystemTime;

    /// Blocks the calling task for the given duration.
    async fn sleep(&self, dur: Duration);
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

#[derive(Debug)]
struct ManualState {
    now: SystemTime,
    slept: Duration,
}

/// Manually driven clock. `sleep()` advances time instantly instead of
/// waiting, and the total slept duration is recorded.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given instant.
    pub fn starting_at(now: SystemTime) -> Self {
        ManualClock {
            state: Arc::new(Mutex::new(ManualState {
                now,
                slept: Duration::ZERO,
            })),
        }
    }

    /// Creates a manual clock starting at a fixed, arbitrary epoch offset.
    pub fn new() -> Self {
        Self::starting_at(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    /// Moves the clock forward.
    pub fn advance(&self, dur: Duration) {
        let mut state = self.lock();
        state.now += dur;
    }

    /// Total time spent inside `sleep()` calls so far.
    pub fn slept(&self) -> Duration {
        self.lock().slept
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // a poisoned clock is still a valid clock
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.lock().now
    }

    async fn sleep(&self, dur: Duration) {
        {
            let mut state = self.lock();
            state.now += dur;
            state.slept += dur;
        }
        tokio::task::yield_now().await;
    }
}

/// A view of a shared `ManualClock` that reads ahead of (positive offset)
/// or behind (negative offset) it, modelling one node's clock drift.
#[derive(Debug, Clone)]
pub struct SkewedClock {
    base: ManualClock,
    ahead: bool,
    offset: Duration,
}

impl SkewedClock {
    /// Clock running `offset` ahead of `base`.
    pub fn ahead_of(base: ManualClock, offset: Duration) -> Self {
        SkewedClock {
            base,
            ahead: true,
            offset,
        }
    }

    /// Clock running `offset` behind `base`.
    pub fn behind(base: ManualClock, offset: Duration) -> Self {
        SkewedClock {
            base,
            ahead: false,
            offset,
        }
    }
}

#[async_trait]
impl Clock for SkewedClock {
    fn now(&self) -> SystemTime {
        let now = self.base.now();
        if self.ahead {
            now + self.offset
        } else {
            now - self.offset
        }
    }

    async fn sleep(&self, dur: Duration) {
        self.base.sleep(dur).await;
    }
}
