//! Critical-operation gate
//!
//! Critical operations are caller-provided units of work (typically
//! database writes of derived state) that must finish before this replica
//! cedes responsibility. The gate counts them while responsibility holds;
//! the demotion path waits until the count is zero and a settling delay
//! has passed.

use super::{Responsibility, ResponsibilityCell, DRAIN_SETTLE_SECS};
use crate::clock::Clock;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Gate for critical operations while responsibility holds.
///
/// Callers may invoke [`run`](Self::run) from any task, concurrently. The
/// gate never blocks promotion; it only delays demotion.
pub struct CriticalOpGate {
    responsibility: Arc<ResponsibilityCell>,
    clock: Arc<dyn Clock>,
    running: AtomicU64,
    last_end: AtomicI64,
}

impl CriticalOpGate {
    pub(crate) fn new(responsibility: Arc<ResponsibilityCell>, clock: Arc<dyn Clock>) -> Self {
        Self {
            responsibility,
            clock,
            running: AtomicU64::new(0),
            last_end: AtomicI64::new(0),
        }
    }

    /// Run `op` if this replica is responsible, returning its error
    /// verbatim. When responsibility is neither `TakeoverSync` nor `Stop`,
    /// `op` is not invoked and the call succeeds.
    ///
    /// The responsibility check precedes the in-flight increment, and the
    /// controller only demotes after observing zero in-flight operations
    /// plus [`DRAIN_SETTLE_SECS`] of quiet. A caller that read
    /// `TakeoverSync` and is pre-empted before incrementing is therefore
    /// still covered: the settling delay outlasts the race window.
    pub async fn run<F, Fut, E>(&self, op: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        match self.responsibility.load() {
            Responsibility::TakeoverSync | Responsibility::Stop => {}
            _ => return Ok(()),
        }

        self.running.fetch_add(1, Ordering::SeqCst);

        let result = op().await;

        self.last_end
            .store(self.clock.unix_seconds(), Ordering::SeqCst);
        self.running.fetch_sub(1, Ordering::SeqCst);

        result
    }

    /// Whether demotion may proceed: nothing in flight and at least
    /// [`DRAIN_SETTLE_SECS`] since the last operation finished. The
    /// settling delay absorbs writers that observed `TakeoverSync` just
    /// before the transition.
    pub fn drained(&self) -> bool {
        self.running.load(Ordering::SeqCst) == 0
            && self.clock.unix_seconds() - self.last_end.load(Ordering::SeqCst)
                >= DRAIN_SETTLE_SECS
    }

    /// Number of critical operations currently running.
    pub fn in_flight(&self) -> u64 {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn gate_with(state: Responsibility, now: i64) -> (Arc<CriticalOpGate>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let cell = Arc::new(ResponsibilityCell::new());
        cell.store(state);
        (
            Arc::new(CriticalOpGate::new(cell, clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn skips_op_when_not_responsible() {
        for state in [
            Responsibility::ReadyForTakeover,
            Responsibility::TakeoverNoSync,
            Responsibility::NotReadyForTakeover,
        ] {
            let (gate, _) = gate_with(state, 100);
            let mut invoked = false;
            let result: Result<(), String> = gate
                .run(|| {
                    invoked = true;
                    async { Ok(()) }
                })
                .await;
            assert!(result.is_ok());
            assert!(!invoked, "op must not run in {state:?}");
        }
    }

    #[tokio::test]
    async fn runs_op_when_responsible_and_counts_it() {
        let (gate, _) = gate_with(Responsibility::TakeoverSync, 100);
        let inner = gate.clone();

        gate.run(|| async move {
            assert_eq!(inner.in_flight(), 1);
            Ok::<_, String>(())
        })
        .await
        .unwrap();

        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn runs_op_while_stopping() {
        let (gate, _) = gate_with(Responsibility::Stop, 100);
        let result: Result<(), String> = gate.run(|| async { Err("boom".to_string()) }).await;
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[tokio::test]
    async fn drained_waits_for_settling_delay() {
        let (gate, clock) = gate_with(Responsibility::TakeoverSync, 100);

        gate.run(|| async { Ok::<_, String>(()) }).await.unwrap();

        // finished at t=100: quiet time still running
        assert!(!gate.drained());
        clock.set(104);
        assert!(!gate.drained());
        clock.set(105);
        assert!(gate.drained());
    }
}
