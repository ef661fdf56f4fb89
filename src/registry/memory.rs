//! In-memory instance registry for development and tests

use super::{ElectionOutcome, InstanceRow, InstanceStore, EXPIRY_HORIZON_SECS, INCUMBENT_STALE_SECS};
use crate::{EnvironmentId, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// In-memory registry backend.
///
/// All operations take the single map lock for their full duration, which
/// gives them the same serializable semantics the Postgres backend gets
/// from transaction isolation. Suitable for a single-process deployment
/// and for the deterministic tests; multi-replica setups share one
/// instance of this store only within the same process.
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    rows: Mutex<HashMap<Uuid, InstanceRow>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows, unordered.
    pub fn rows(&self) -> Vec<InstanceRow> {
        self.rows.lock().values().cloned().collect()
    }

    /// Fetch a single replica's row.
    pub fn row(&self, id: Uuid) -> Option<InstanceRow> {
        self.rows.lock().get(&id).cloned()
    }

    /// Insert or replace a row directly, bypassing the election protocol.
    /// Used to seed peers and incumbents in tests.
    pub fn insert_row(&self, row: InstanceRow) {
        self.rows.lock().insert(row.id, row);
    }

    fn claim(rows: &mut HashMap<Uuid, InstanceRow>, replica: Uuid, environment: &EnvironmentId) {
        for row in rows.values_mut() {
            if row.environment_id == *environment {
                row.responsible = false;
            }
        }
        if let Some(row) = rows.get_mut(&replica) {
            row.responsible = true;
        }
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn elect(
        &self,
        replica: Uuid,
        environment: &EnvironmentId,
        now: i64,
    ) -> Result<ElectionOutcome> {
        let mut rows = self.rows.lock();

        match rows.get_mut(&replica) {
            Some(row) => {
                row.environment_id = environment.clone();
                row.heartbeat = now;
            }
            None => {
                rows.insert(
                    replica,
                    InstanceRow {
                        id: replica,
                        environment_id: environment.clone(),
                        heartbeat: now,
                        responsible: false,
                    },
                );
            }
        }

        let incumbent = rows
            .values()
            .find(|row| row.environment_id == *environment && row.responsible)
            .map(|row| (row.id, row.heartbeat));

        let took_over = match incumbent {
            None => {
                Self::claim(&mut rows, replica, environment);
                true
            }
            Some((id, _)) if id == replica => true,
            Some((_, heartbeat)) if now - heartbeat >= INCUMBENT_STALE_SECS => {
                Self::claim(&mut rows, replica, environment);
                true
            }
            Some(_) => false,
        };

        Ok(ElectionOutcome {
            took_over,
            incumbent: incumbent.map(|(id, _)| id),
        })
    }

    async fn release_if_others_fresh(
        &self,
        replica: Uuid,
        environment: &EnvironmentId,
        now: i64,
    ) -> Result<bool> {
        let mut rows = self.rows.lock();

        let fresh_standby = rows.values().any(|row| {
            row.environment_id == *environment
                && !row.responsible
                && now - row.heartbeat < INCUMBENT_STALE_SECS
        });
        if !fresh_standby {
            return Ok(false);
        }

        if let Some(row) = rows.get_mut(&replica) {
            row.responsible = false;
        }
        Ok(true)
    }

    async fn sweep_expired(&self, now: i64) -> Result<u64> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| now - row.heartbeat < EXPIRY_HORIZON_SECS);
        Ok((before - rows.len()) as u64)
    }
}
