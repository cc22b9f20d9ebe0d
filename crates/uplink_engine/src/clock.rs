//! Time sources.
//!
//! The engine reads a monotonic clock for every interval decision and owns a
//! settable wall clock that transports refresh from the remote service.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A monotonic timer plus a settable wall clock.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin. Never goes backwards.
    fn monotonic_now(&self) -> Duration;

    /// Sets the wall clock to the given Unix time in seconds.
    fn set_wall_clock(&self, unix_secs: i64);

    /// Returns the current wall-clock time in Unix seconds.
    fn wall_clock(&self) -> i64;
}

/// Clock backed by [`Instant`] and [`SystemTime`].
///
/// Setting the wall clock stores an offset from the system time, so the host's
/// real clock is never modified.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    offset_secs: AtomicI64,
}

impl SystemClock {
    /// Creates a system clock with its monotonic origin at now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_secs: AtomicI64::new(0),
        }
    }

    fn system_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn set_wall_clock(&self, unix_secs: i64) {
        self.offset_secs
            .store(unix_secs - Self::system_secs(), Ordering::Relaxed);
    }

    fn wall_clock(&self) -> i64 {
        Self::system_secs() + self.offset_secs.load(Ordering::Relaxed)
    }
}

/// Manually driven clock for tests and simulation.
///
/// Clones share the same time, so a test can keep a handle while the engine
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug, Default)]
struct ManualInner {
    monotonic_nanos: AtomicU64,
    wall_base_secs: AtomicI64,
    wall_base_nanos: AtomicU64,
    wall_syncs: AtomicU64,
}

impl ManualClock {
    /// Creates a clock at monotonic zero and Unix time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves monotonic time forward. The wall clock follows.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.inner.monotonic_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Sets monotonic time. Ignored if it would move backwards. The wall
    /// clock follows.
    pub fn set(&self, to: Duration) {
        let nanos = u64::try_from(to.as_nanos()).unwrap_or(u64::MAX);
        self.inner
            .monotonic_nanos
            .fetch_max(nanos, Ordering::Relaxed);
    }

    /// Number of times the wall clock was set.
    pub fn wall_syncs(&self) -> u64 {
        self.inner.wall_syncs.load(Ordering::Relaxed)
    }
}

impl Clock for ManualClock {
    fn monotonic_now(&self) -> Duration {
        Duration::from_nanos(self.inner.monotonic_nanos.load(Ordering::Relaxed))
    }

    fn set_wall_clock(&self, unix_secs: i64) {
        let now = self.inner.monotonic_nanos.load(Ordering::Relaxed);
        self.inner.wall_base_nanos.store(now, Ordering::Relaxed);
        self.inner.wall_base_secs.store(unix_secs, Ordering::Relaxed);
        self.inner.wall_syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Wall seconds at the last sync plus whole seconds of monotonic time
    /// since then.
    fn wall_clock(&self) -> i64 {
        let now = self.inner.monotonic_nanos.load(Ordering::Relaxed);
        let base = self.inner.wall_base_nanos.load(Ordering::Relaxed);
        let elapsed = now.saturating_sub(base) / 1_000_000_000;
        self.inner.wall_base_secs.load(Ordering::Relaxed) + elapsed as i64
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn monotonic_now(&self) -> Duration {
        (**self).monotonic_now()
    }

    fn set_wall_clock(&self, unix_secs: i64) {
        (**self).set_wall_clock(unix_secs)
    }

    fn wall_clock(&self) -> i64 {
        (**self).wall_clock()
    }
}
