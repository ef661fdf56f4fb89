//! Periodic cleanup of expired registry rows

use crate::clock::Clock;
use crate::registry::InstanceStore;
use crate::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// How often expired instance rows are swept.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(300);

/// Background task that removes registry rows left behind by replicas
/// that stopped heartbeating. Any replica may sweep any row; the expiry
/// horizon keeps live rows out of reach.
pub struct Sweeper;

impl Sweeper {
    /// Spawn the sweep loop. Errors are reported on `errors` and do not
    /// stop the loop; the task exits once the error channel is closed.
    pub fn spawn(
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
        errors: mpsc::Sender<Error>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut period = tokio::time::interval(SWEEP_PERIOD);
            period.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately; sweep a full period in
            period.tick().await;

            loop {
                period.tick().await;

                info!("Sweeping expired instance rows");
                match store.sweep_expired(clock.unix_seconds()).await {
                    Ok(0) => {}
                    Ok(removed) => info!("Removed {} expired instance rows", removed),
                    Err(err) => {
                        if errors.send(err).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{ElectionOutcome, InMemoryInstanceStore, InstanceRow};
    use crate::{EnvironmentId, Result};
    use async_trait::async_trait;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn sweeps_after_a_full_period() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        store.insert_row(InstanceRow {
            id: Uuid::new_v4(),
            environment_id: EnvironmentId::from("production"),
            heartbeat: 100, // long expired
            responsible: false,
        });

        let (err_tx, _err_rx) = mpsc::channel(1);
        let task = Sweeper::spawn(store.clone(), clock, err_tx);

        // nothing happens before the period elapses
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(store.rows().len(), 1);

        tokio::time::sleep(Duration::from_secs(101)).await;
        tokio::task::yield_now().await;
        assert!(store.rows().is_empty());

        task.abort();
    }

    #[derive(Debug)]
    struct FailingStore;

    #[async_trait]
    impl InstanceStore for FailingStore {
        async fn elect(
            &self,
            _replica: Uuid,
            _environment: &EnvironmentId,
            _now: i64,
        ) -> Result<ElectionOutcome> {
            unimplemented!("not used by the sweeper")
        }

        async fn release_if_others_fresh(
            &self,
            _replica: Uuid,
            _environment: &EnvironmentId,
            _now: i64,
        ) -> Result<bool> {
            unimplemented!("not used by the sweeper")
        }

        async fn sweep_expired(&self, _now: i64) -> Result<u64> {
            Err(crate::Error::Config("registry unavailable".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_reported_and_the_loop_continues() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (err_tx, mut err_rx) = mpsc::channel(4);
        let task = Sweeper::spawn(Arc::new(FailingStore), clock, err_tx);

        tokio::time::sleep(Duration::from_secs(301)).await;
        let first = err_rx.recv().await.unwrap();
        assert!(matches!(first, Error::Config(_)));

        // a second period produces a second error: the task survived
        tokio::time::sleep(Duration::from_secs(300)).await;
        let second = err_rx.recv().await.unwrap();
        assert!(matches!(second, Error::Config(_)));

        task.abort();
    }
}
