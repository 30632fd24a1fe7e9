//! Time sources and the wall-clock synchronisation collaborator.
//!
//! Every polling loop in the crate asks a [`Clock`] for the current time and
//! calls [`Clock::idle`] between iterations. Boards without a battery-backed
//! clock start at epoch zero and only learn the wall-clock time after a
//! [`TimeSync`] round trip, so the monotonic and wall readings are separate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Earliest wall-clock time (2021-01-01T00:00:00Z) accepted as synchronised.
pub const MIN_VALID_EPOCH: i64 = 1_609_459_200;

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed on a monotonic counter.
    fn now_millis(&self) -> u64;

    /// Wall-clock time in seconds since the Unix epoch.
    fn now_epoch(&self) -> i64;

    /// Yield point for busy-poll loops.
    fn idle(&self);

    /// Whether the wall clock holds a plausible synchronised time.
    fn is_time_valid(&self) -> bool {
        self.now_epoch() >= MIN_VALID_EPOCH
    }
}

/// Clock backed by [`Instant`] and the operating system wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
    idle_sleep: Duration,
}

impl SystemClock {
    /// Create a clock whose monotonic counter starts now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            idle_sleep: Duration::from_millis(1),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn now_epoch(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn idle(&self) {
        std::thread::sleep(self.idle_sleep);
    }
}

#[derive(Debug)]
struct ManualState {
    mono_millis: u64,
    wall_millis: i64,
    idle_step: u64,
}

/// Manually driven clock for tests and simulations.
///
/// Cloning yields a handle onto the same time line. Each call to
/// [`Clock::idle`] advances both readings by the configured idle step, so
/// timeout loops terminate deterministically.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// Create a clock at the given wall-clock epoch with a 1 ms idle step.
    pub fn new(epoch: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                mono_millis: 0,
                wall_millis: epoch * 1000,
                idle_step: 1,
            })),
        }
    }

    /// Set how far each idle call advances time.
    pub fn with_idle_step(self, step: Duration) -> Self {
        self.state.lock().idle_step = step.as_millis() as u64;
        self
    }

    /// Advance both monotonic and wall-clock time.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.mono_millis += by.as_millis() as u64;
        state.wall_millis += by.as_millis() as i64;
    }

    /// Jump the wall clock without touching the monotonic counter.
    pub fn set_epoch(&self, epoch: i64) {
        self.state.lock().wall_millis = epoch * 1000;
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.state.lock().mono_millis
    }

    fn now_epoch(&self) -> i64 {
        self.state.lock().wall_millis.div_euclid(1000)
    }

    fn idle(&self) {
        let mut state = self.state.lock();
        let step = state.idle_step;
        state.mono_millis += step;
        state.wall_millis += step as i64;
    }
}

/// Collaborator that asks an external service (usually NTP) to set the
/// wall clock.
///
/// Requests are fire-and-forget; completion is observed through
/// [`Clock::is_time_valid`].
pub trait TimeSync: Send {
    /// Start or retry a synchronisation round trip.
    fn request_sync(&mut self);
}

impl<F: FnMut() + Send> TimeSync for F {
    fn request_sync(&mut self) {
        self()
    }
}

/// Time sync for hosts whose operating system already keeps the clock set.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSync;

impl TimeSync for SystemTimeSync {
    fn request_sync(&mut self) {
        tracing::trace!("Host clock is managed by the operating system");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(MIN_VALID_EPOCH);
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now_millis(), 3000);
        assert_eq!(clock.now_epoch(), MIN_VALID_EPOCH + 3);
    }

    #[test]
    fn test_manual_clock_idle_step() {
        let clock = ManualClock::new(0).with_idle_step(Duration::from_millis(250));
        for _ in 0..4 {
            clock.idle();
        }
        assert_eq!(clock.now_millis(), 1000);
        assert_eq!(clock.now_epoch(), 1);
    }

    #[test]
    fn test_time_validity() {
        let clock = ManualClock::new(0);
        assert!(!clock.is_time_valid());
        clock.set_epoch(MIN_VALID_EPOCH + 10);
        assert!(clock.is_time_valid());
        assert_eq!(clock.now_millis(), 0);
    }

    #[test]
    fn test_closure_time_sync() {
        let clock = ManualClock::new(0);
        let handle = clock.clone();
        let mut sync = move || handle.set_epoch(MIN_VALID_EPOCH);
        sync.request_sync();
        assert!(clock.is_time_valid());
    }
}
