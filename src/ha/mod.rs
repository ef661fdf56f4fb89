//! High-availability controller
//!
//! Each replica runs one [`HaController`]. Once the upstream event source
//! announces its environment, the controller ticks every second: it
//! checks upstream liveness, runs one round of the election protocol
//! against the shared registry, applies the resulting state transition,
//! and publishes a wakeup when it is promoted. Demotion drains the
//! critical-operation gate first and never abandons an environment
//! without a fresh standby.

mod gate;
mod liveness;
mod sweeper;

pub use gate::CriticalOpGate;
pub use liveness::UpstreamLiveness;
pub use sweeper::{Sweeper, SWEEP_PERIOD};

use crate::clock::Clock;
use crate::registry::InstanceStore;
use crate::wakeup::WakeupBus;
use crate::{Environment, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The upstream counts as alive while its last heartbeat is younger than
/// this. Must exceed the upstream's own emission interval and the 1 s
/// election heartbeat by a safe margin.
pub const UPSTREAM_ALIVE_THRESHOLD_SECS: i64 = 15;

/// A replica must hold the responsible row this long before it starts
/// syncing, so a flapping registry does not thrash peer services.
pub const CONFIRMATION_WINDOW_SECS: i64 = 5;

/// Quiet time required after the last critical operation before demotion.
pub const DRAIN_SETTLE_SECS: i64 = 5;

/// Cadence of the controller loop.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Whether this replica is responsible for its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Responsibility {
    /// Not responsible, but eligible to take over
    ReadyForTakeover = 0,
    /// Holding the responsible row, waiting out the confirmation window
    TakeoverNoSync = 1,
    /// Responsible and actively syncing
    TakeoverSync = 2,
    /// Responsible but winding down; drains the gate, then cedes
    Stop = 3,
    /// Not responsible and not eligible (upstream not alive)
    NotReadyForTakeover = 4,
}

/// Atomic cell holding the replica's [`Responsibility`].
///
/// Single writer (the controller loop), many readers (critical-operation
/// callers, status surfaces). SeqCst everywhere: the gate's
/// check-then-increment and the controller's drain-check-then-demote must
/// not reorder across these stores.
pub struct ResponsibilityCell(AtomicU8);

impl ResponsibilityCell {
    fn new() -> Self {
        Self(AtomicU8::new(Responsibility::ReadyForTakeover as u8))
    }

    pub fn load(&self) -> Responsibility {
        Self::from_raw(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, responsibility: Responsibility) {
        self.0.store(responsibility as u8, Ordering::SeqCst);
    }

    /// Store and return the previous value.
    fn swap(&self, responsibility: Responsibility) -> Responsibility {
        Self::from_raw(self.0.swap(responsibility as u8, Ordering::SeqCst))
    }

    fn from_raw(raw: u8) -> Responsibility {
        match raw {
            0 => Responsibility::ReadyForTakeover,
            1 => Responsibility::TakeoverNoSync,
            2 => Responsibility::TakeoverSync,
            3 => Responsibility::Stop,
            4 => Responsibility::NotReadyForTakeover,
            _ => unreachable!("invalid responsibility discriminant {raw}"),
        }
    }
}

/// What the controller will do against the registry this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickAction {
    None,
    TryTakeover,
    DoTakeover,
    CeaseOperation,
}

/// The per-replica HA state machine.
///
/// Construct one per process, hand [`HaHandle`]s to the upstream consumer
/// and to critical-operation callers, then drive it with
/// [`run`](Self::run) or [`spawn`](Self::spawn).
pub struct HaController {
    id: Uuid,
    store: Arc<dyn InstanceStore>,
    wakeup: Arc<dyn WakeupBus>,
    clock: Arc<dyn Clock>,
    liveness: Arc<UpstreamLiveness>,
    gate: Arc<CriticalOpGate>,
    responsibility: Arc<ResponsibilityCell>,
    /// When this replica began provisionally holding responsibility;
    /// cleared when the row is released.
    responsible_since: Option<i64>,
}

impl HaController {
    /// Create a controller with a freshly generated replica UUID.
    pub fn new(
        store: Arc<dyn InstanceStore>,
        wakeup: Arc<dyn WakeupBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let responsibility = Arc::new(ResponsibilityCell::new());
        let liveness = Arc::new(UpstreamLiveness::new(clock.clone()));
        let gate = Arc::new(CriticalOpGate::new(responsibility.clone(), clock.clone()));

        Self {
            id: Uuid::new_v4(),
            store,
            wakeup,
            clock,
            liveness,
            gate,
            responsibility,
            responsible_since: None,
        }
    }

    /// This replica's UUID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current responsibility state.
    pub fn responsibility(&self) -> Responsibility {
        self.responsibility.load()
    }

    /// A cloneable handle for heartbeats, critical operations and status.
    pub fn handle(&self) -> HaHandle {
        HaHandle {
            id: self.id,
            liveness: self.liveness.clone(),
            gate: self.gate.clone(),
            responsibility: self.responsibility.clone(),
        }
    }

    /// Run the controller until the environment channel closes.
    ///
    /// Waits for the first environment announcement, then ticks once per
    /// second. An environment update replaces the current environment and
    /// skips one tick edge so the next election already writes the new
    /// environment id. Database and wakeup errors are fatal and surface to
    /// the caller, which owns restart policy.
    pub async fn run(mut self, mut environments: mpsc::Receiver<Environment>) -> Result<()> {
        info!("Waiting for the upstream event source to announce its environment");

        let Some(mut environment) = environments.recv().await else {
            return Ok(());
        };
        info!(
            "Replica {} serving environment {}",
            self.id, environment.name
        );

        // The announcement itself proves the upstream spoke to us, and it
        // may have buffered events worth syncing even if it goes quiet now.
        self.liveness.heartbeat();

        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            self.tick(&environment).await?;

            tokio::select! {
                update = environments.recv() => match update {
                    Some(next) => {
                        info!("Environment changed to {}", next.name);
                        environment = next;
                        // quiesce for one tick edge before electing under
                        // the new environment id
                        ticker.tick().await;
                    }
                    None => return Ok(()),
                },
                _ = ticker.tick() => {}
            }
        }
    }

    /// Spawn the controller loop and the stale-row sweeper as background
    /// tasks. Fatal controller errors and sweeper errors are reported on
    /// `errors`; the sweeper stops with the controller.
    pub fn spawn(
        self,
        environments: mpsc::Receiver<Environment>,
        errors: mpsc::Sender<Error>,
    ) -> tokio::task::JoinHandle<()> {
        let sweeper = Sweeper::spawn(self.store.clone(), self.clock.clone(), errors.clone());

        tokio::spawn(async move {
            if let Err(err) = self.run(environments).await {
                error!("HA controller terminated: {}", err);
                let _ = errors.send(err).await;
            }
            sweeper.abort();
        })
    }

    /// Run one decide/act/transition cycle. Public so deterministic tests
    /// and embedding schedulers can drive the machine without the timer.
    pub async fn tick(&mut self, environment: &Environment) -> Result<()> {
        match self.next_action(environment) {
            TickAction::None => Ok(()),
            TickAction::TryTakeover | TickAction::DoTakeover => {
                self.run_election(environment).await
            }
            TickAction::CeaseOperation => self.cease_operation(environment).await,
        }
    }

    /// Inspect liveness and the current state, applying liveness-driven
    /// transitions. Those transitions re-dispatch immediately instead of
    /// losing a tick, so a replica whose upstream dies moves straight into
    /// the draining path.
    fn next_action(&self, environment: &Environment) -> TickAction {
        loop {
            match self.responsibility.load() {
                Responsibility::ReadyForTakeover => {
                    if !self.liveness.is_alive() {
                        warn!(
                            "Upstream event source for {} detected as not running, standing down",
                            environment.name
                        );
                        self.responsibility.store(Responsibility::NotReadyForTakeover);
                        continue;
                    }
                    return TickAction::TryTakeover;
                }
                Responsibility::TakeoverNoSync => {
                    if !self.liveness.is_alive() {
                        warn!(
                            "Upstream event source for {} detected as not running, stopping",
                            environment.name
                        );
                        self.responsibility.store(Responsibility::Stop);
                        continue;
                    }
                    return TickAction::TryTakeover;
                }
                Responsibility::TakeoverSync => {
                    if !self.liveness.is_alive() {
                        warn!(
                            "Upstream event source for {} detected as not running, stopping",
                            environment.name
                        );
                        self.responsibility.store(Responsibility::Stop);
                        continue;
                    }
                    return TickAction::DoTakeover;
                }
                Responsibility::Stop => {
                    // keep renewing the claim until the gate drains
                    return if self.gate.drained() {
                        TickAction::CeaseOperation
                    } else {
                        TickAction::DoTakeover
                    };
                }
                Responsibility::NotReadyForTakeover => {
                    if self.liveness.is_alive() {
                        info!(
                            "Upstream event source for {} detected as running again",
                            environment.name
                        );
                        self.responsibility.store(Responsibility::ReadyForTakeover);
                        continue;
                    }
                    return TickAction::None;
                }
            }
        }
    }

    /// One round of the election protocol, then the post-commit state
    /// transition. The in-memory state only advances after the registry
    /// transaction has committed.
    async fn run_election(&mut self, environment: &Environment) -> Result<()> {
        let now = self.clock.unix_seconds();
        let outcome = self.store.elect(self.id, &environment.id, now).await?;

        if !outcome.took_over {
            if let Some(incumbent) = outcome.incumbent {
                debug!(
                    "Replica {} is responsible for {}",
                    incumbent, environment.name
                );
            }
            return Ok(());
        }

        // A replica already winding down keeps draining; the renewed claim
        // only refreshed its heartbeat.
        if self.responsibility.load() == Responsibility::Stop {
            return Ok(());
        }

        match self.responsible_since {
            None => {
                self.responsible_since = Some(now);
                self.responsibility.store(Responsibility::TakeoverNoSync);
            }
            Some(since) if now - since >= CONFIRMATION_WINDOW_SECS => {
                let previous = self.responsibility.swap(Responsibility::TakeoverSync);
                if previous == Responsibility::TakeoverNoSync {
                    info!("Taking over responsibility for {}", environment.name);
                    self.wakeup.publish_wakeup(self.id).await?;
                }
            }
            Some(_) => {}
        }

        Ok(())
    }

    /// Cede responsibility, but never without a fresh standby.
    async fn cease_operation(&mut self, environment: &Environment) -> Result<()> {
        let now = self.clock.unix_seconds();
        let released = self
            .store
            .release_if_others_fresh(self.id, &environment.id, now)
            .await?;

        if released {
            info!(
                "Another instance can take over {}. Ceasing operations",
                environment.name
            );
            self.responsible_since = None;
        } else {
            warn!(
                "No fresh standby for {}, keeping the responsible row",
                environment.name
            );
        }

        self.responsibility.store(Responsibility::NotReadyForTakeover);
        Ok(())
    }
}

/// Cloneable handle onto a running controller.
///
/// The upstream consumer calls [`upstream_heartbeat`](Self::upstream_heartbeat);
/// state writers wrap their work in [`run_critical`](Self::run_critical);
/// status surfaces read [`responsibility`](Self::responsibility).
#[derive(Clone)]
pub struct HaHandle {
    id: Uuid,
    liveness: Arc<UpstreamLiveness>,
    gate: Arc<CriticalOpGate>,
    responsibility: Arc<ResponsibilityCell>,
}

impl HaHandle {
    /// The replica UUID this handle belongs to.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Record that the upstream event source was just seen alive.
    pub fn upstream_heartbeat(&self) {
        self.liveness.heartbeat();
    }

    /// Current responsibility state.
    pub fn responsibility(&self) -> Responsibility {
        self.responsibility.load()
    }

    /// Whether this replica is actively syncing its environment.
    pub fn is_responsible(&self) -> bool {
        self.responsibility.load() == Responsibility::TakeoverSync
    }

    /// Number of critical operations currently running through the gate.
    pub fn in_flight_critical_operations(&self) -> u64 {
        self.gate.in_flight()
    }

    /// Run a critical operation through the gate; see
    /// [`CriticalOpGate::run`].
    pub async fn run_critical<F, Fut, E>(&self, op: F) -> std::result::Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), E>>,
    {
        self.gate.run(op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::InMemoryInstanceStore;
    use crate::wakeup::LocalWakeupBus;

    fn make_controller(start: i64) -> (HaController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let controller = HaController::new(
            Arc::new(InMemoryInstanceStore::new()),
            Arc::new(LocalWakeupBus::default()),
            clock.clone(),
        );
        (controller, clock)
    }

    #[test]
    fn starts_ready_for_takeover() {
        let (controller, _) = make_controller(100);
        assert_eq!(
            controller.responsibility(),
            Responsibility::ReadyForTakeover
        );
        assert!(!controller.handle().is_responsible());
    }

    #[test]
    fn responsibility_cell_swap_returns_previous() {
        let cell = ResponsibilityCell::new();
        assert_eq!(cell.load(), Responsibility::ReadyForTakeover);
        assert_eq!(
            cell.swap(Responsibility::TakeoverNoSync),
            Responsibility::ReadyForTakeover
        );
        assert_eq!(
            cell.swap(Responsibility::TakeoverSync),
            Responsibility::TakeoverNoSync
        );
        assert_eq!(cell.load(), Responsibility::TakeoverSync);
    }

    #[tokio::test]
    async fn dead_upstream_sends_an_idle_replica_to_not_ready() {
        let (mut controller, _clock) = make_controller(1_000);
        let environment = Environment::new("e1", "production");

        // no heartbeat ever recorded: not alive
        controller.tick(&environment).await.unwrap();
        assert_eq!(
            controller.responsibility(),
            Responsibility::NotReadyForTakeover
        );

        // upstream comes back: ready again and electing in the same tick
        controller.handle().upstream_heartbeat();
        controller.tick(&environment).await.unwrap();
        assert_eq!(controller.responsibility(), Responsibility::TakeoverNoSync);
    }
}
