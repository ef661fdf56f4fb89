//! Shared instance registry for leader election
//!
//! Every replica keeps one row in the shared `instance_registry` table:
//! its UUID, the environment it serves, a heartbeat refreshed on every
//! controller tick, and whether it currently holds responsibility for the
//! environment. Election is nothing more than reading and rewriting these
//! rows inside serializable transactions.

mod memory;
mod postgres;

pub use memory::InMemoryInstanceStore;
pub use postgres::PgInstanceStore;

use crate::{EnvironmentId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An incumbent whose heartbeat is at least this old may be deposed.
pub const INCUMBENT_STALE_SECS: i64 = 10;

/// Rows whose heartbeat is at least this old are removed by the sweeper.
/// Three times the takeover-eligibility threshold, so a live row is never
/// swept out from under its replica.
pub const EXPIRY_HORIZON_SECS: i64 = 30;

/// One replica's row in the shared registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRow {
    /// Replica UUID (primary key)
    pub id: Uuid,
    /// Environment this replica is serving
    pub environment_id: EnvironmentId,
    /// Unix seconds of the most recent self-update
    pub heartbeat: i64,
    /// Whether this replica holds responsibility for the environment
    pub responsible: bool,
}

/// Result of one election transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOutcome {
    /// Whether this replica holds the responsible row after the commit,
    /// either because it claimed it in this transaction or because it was
    /// already the incumbent.
    pub took_over: bool,
    /// The incumbent observed inside the transaction, if any.
    pub incumbent: Option<Uuid>,
}

/// Instance registry interface
///
/// Each method runs as a single serializable transaction against the
/// shared registry. Serializable isolation is load-bearing: with anything
/// weaker, two replicas can both observe the responsible row as absent or
/// stale and both claim it.
#[async_trait]
pub trait InstanceStore: Send + Sync + std::fmt::Debug {
    /// Run one round of the election protocol for `replica`:
    ///
    /// 1. Upsert the replica's own row, refreshing `environment_id` and
    ///    `heartbeat` (inserted with `responsible = false` if absent).
    /// 2. Fetch the row currently marked responsible for the environment.
    /// 3. Claim responsibility if there is no incumbent or the incumbent's
    ///    heartbeat is at least [`INCUMBENT_STALE_SECS`] old; yield to a
    ///    fresh incumbent otherwise. Claiming clears the responsible flag
    ///    on every other row in the environment, which also converges any
    ///    transient duplicate claims.
    async fn elect(
        &self,
        replica: Uuid,
        environment: &EnvironmentId,
        now: i64,
    ) -> Result<ElectionOutcome>;

    /// Clear the replica's responsible flag, but only if some other row in
    /// the environment is standing by with a heartbeat fresher than
    /// [`INCUMBENT_STALE_SECS`]. Returns whether the row was released.
    ///
    /// A replica must not abandon a live environment when no fresh peer
    /// could take over.
    async fn release_if_others_fresh(
        &self,
        replica: Uuid,
        environment: &EnvironmentId,
        now: i64,
    ) -> Result<bool>;

    /// Delete every row whose heartbeat is at least
    /// [`EXPIRY_HORIZON_SECS`] old. Returns the number of rows removed.
    async fn sweep_expired(&self, now: i64) -> Result<u64>;
}
