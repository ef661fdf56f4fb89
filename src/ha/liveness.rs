//! Upstream event source liveness tracking

use super::UPSTREAM_ALIVE_THRESHOLD_SECS;
use crate::clock::Clock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Tracks the last moment the upstream event source was seen alive.
///
/// Heartbeats arrive from whatever task consumes the upstream connection;
/// the controller loop only reads. Both sides touch a single atomic.
pub struct UpstreamLiveness {
    clock: Arc<dyn Clock>,
    last_seen: AtomicI64,
}

impl UpstreamLiveness {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last_seen: AtomicI64::new(0),
        }
    }

    /// Record that the upstream was just seen alive.
    pub fn heartbeat(&self) {
        self.last_seen
            .store(self.clock.unix_seconds(), Ordering::SeqCst);
    }

    /// Whether the upstream has been seen within the staleness threshold.
    /// The threshold exceeds both the upstream's own emission interval and
    /// the election heartbeat period by a safe margin.
    pub fn is_alive(&self) -> bool {
        self.clock.unix_seconds() - self.last_seen.load(Ordering::SeqCst)
            < UPSTREAM_ALIVE_THRESHOLD_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn not_alive_before_first_heartbeat() {
        let clock = Arc::new(ManualClock::new(1_000));
        let liveness = UpstreamLiveness::new(clock);
        assert!(!liveness.is_alive());
    }

    #[test]
    fn flips_dead_exactly_at_threshold() {
        let clock = Arc::new(ManualClock::new(100));
        let liveness = UpstreamLiveness::new(clock.clone());

        liveness.heartbeat();
        assert!(liveness.is_alive());

        clock.set(114);
        assert!(liveness.is_alive(), "age 14 is still alive");

        clock.set(115);
        assert!(!liveness.is_alive(), "age 15 crosses the threshold");
    }

    #[test]
    fn heartbeat_revives() {
        let clock = Arc::new(ManualClock::new(100));
        let liveness = UpstreamLiveness::new(clock.clone());

        liveness.heartbeat();
        clock.advance(20);
        assert!(!liveness.is_alive());

        liveness.heartbeat();
        assert!(liveness.is_alive());
    }
}
