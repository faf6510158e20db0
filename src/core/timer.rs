//! Cancellable deadline timers driven by the owner's loop.
//!
//! No threads, no callbacks: the owner arms a timer and asks `fire(now)` on
//! each tick. Dropping or cancelling the handle is enough to release it, so
//! dispose is deterministic.
//!
//! # Usage
//! ```ignore
//! // reconnect after close
//! timer.schedule(now, Duration::from_secs(3));
//!
//! // in tick():
//! if timer.fire(now) {
//!     reconnect();
//! }
//! ```

use std::time::{Duration, Instant};

/// One-shot or periodic deadline timer.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline: Option<Instant>,
    /// Re-arm period for periodic timers
    period: Option<Duration>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer. Replaces any pending deadline.
    pub fn schedule(&mut self, now: Instant, delay: Duration) {
        self.deadline = Some(now + delay);
        self.period = None;
        log::trace!("Timer: one-shot in {}ms", delay.as_millis());
    }

    /// Arm a periodic timer, first expiry one period from `now`.
    pub fn start_interval(&mut self, now: Instant, period: Duration) {
        self.deadline = Some(now + period);
        self.period = Some(period);
        log::trace!("Timer: interval every {}ms", period.as_millis());
    }

    pub fn cancel(&mut self) {
        if self.deadline.is_some() {
            log::trace!("Timer: cancelled");
        }
        self.deadline = None;
        self.period = None;
    }

    /// True once per expiry. One-shot timers disarm, periodic timers re-arm
    /// one period after `now` (late ticks don't burst to catch up).
    pub fn fire(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if now < deadline {
            return false;
        }
        self.deadline = self.period.map(|p| now + p);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.schedule(t0, Duration::from_millis(100));
        assert!(timer.is_armed());
        assert!(!timer.fire(t0 + Duration::from_millis(99)));
        assert!(timer.fire(t0 + Duration::from_millis(100)));
        assert!(!timer.is_armed());
        assert!(!timer.fire(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_interval_rearms_from_now() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start_interval(t0, Duration::from_millis(500));
        assert!(timer.fire(t0 + Duration::from_millis(700)));
        assert_eq!(timer.deadline(), Some(t0 + Duration::from_millis(1200)));
        assert!(!timer.fire(t0 + Duration::from_millis(1100)));
    }

    #[test]
    fn test_cancel() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start_interval(t0, Duration::from_millis(10));
        timer.cancel();
        assert!(!timer.fire(t0 + Duration::from_secs(1)));
        assert_eq!(timer.period(), None);
    }
}
