//! # Vigil
//!
//! The high-availability coordination core of a monitoring-data ingester.
//!
//! Several replicas of an ingester may run against the same monitoring
//! environment, each observing the same upstream event source and able to
//! write the same derived state into a shared relational database. Vigil
//! makes sure at most one of them is responsible at a time:
//!
//! - **HA controller**: a per-replica state machine that decides each
//!   second whether this replica should sync, stand by, or stand down
//! - **Leader election**: a transactional protocol over a shared
//!   `instance_registry` table driven purely by timed heartbeats, with no
//!   external consensus service
//! - **Safe handoff**: critical write operations are drained before
//!   responsibility is ceded
//! - **Wakeup broadcast**: peers are notified the moment a replica is
//!   promoted, so syncing resumes immediately
//!
//! ## Architecture
//!
//! - `ha`: the controller state machine, upstream liveness tracking, the
//!   critical-operation gate, and the stale-row sweeper
//! - `registry`: the shared `instance_registry` table (Postgres for
//!   production, in-memory for development and tests)
//! - `wakeup`: the promotion broadcast bus

pub mod clock;
pub mod config;
pub mod ha;
pub mod registry;
pub mod wakeup;

mod error;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a monitoring environment, as supplied by the upstream
/// event source. Opaque bytes; the controller only ever compares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentId(Vec<u8>);

impl EnvironmentId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for EnvironmentId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for EnvironmentId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A monitoring environment announced by the upstream event source.
///
/// The controller is scoped to exactly one environment at a time; a new
/// announcement on the control channel replaces the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Opaque environment identifier
    pub id: EnvironmentId,
    /// Human-readable display name
    pub name: String,
}

impl Environment {
    pub fn new(id: impl Into<EnvironmentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Re-exports for convenience
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::ha::{HaController, HaHandle, Responsibility};
    pub use crate::registry::{InstanceStore, PgInstanceStore};
    pub use crate::wakeup::WakeupBus;
    pub use crate::{Environment, EnvironmentId, Error, Result};
}
