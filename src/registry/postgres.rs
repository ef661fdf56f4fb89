//! Postgres-backed instance registry

use super::{ElectionOutcome, InstanceStore, EXPIRY_HORIZON_SECS, INCUMBENT_STALE_SECS};
use crate::{EnvironmentId, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Production registry backend over a shared Postgres database.
///
/// All replicas of all processes point at the same `instance_registry`
/// table; this type only issues the transactional operations of the
/// election protocol and never caches registry state.
#[derive(Debug)]
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `instance_registry` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            create table if not exists instance_registry (
                id uuid primary key,
                environment_id bytea not null,
                heartbeat bigint not null,
                responsible boolean not null default false
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "create index if not exists instance_registry_environment_idx
             on instance_registry (environment_id, responsible)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn begin_serializable(&self) -> Result<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("set transaction isolation level serializable")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn claim(
        tx: &mut Transaction<'_, Postgres>,
        replica: Uuid,
        environment: &EnvironmentId,
    ) -> Result<()> {
        sqlx::query("update instance_registry set responsible = false where environment_id = $1")
            .bind(environment.as_bytes())
            .execute(&mut **tx)
            .await?;

        sqlx::query("update instance_registry set responsible = true where id = $1")
            .bind(replica)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn elect(
        &self,
        replica: Uuid,
        environment: &EnvironmentId,
        now: i64,
    ) -> Result<ElectionOutcome> {
        let mut tx = self.begin_serializable().await?;

        sqlx::query(
            r#"
            insert into instance_registry(id, environment_id, heartbeat, responsible)
            values ($1, $2, $3, false)
            on conflict (id) do update
              set environment_id = excluded.environment_id,
                  heartbeat = excluded.heartbeat
            "#,
        )
        .bind(replica)
        .bind(environment.as_bytes())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let incumbent = sqlx::query_as::<_, (Uuid, i64)>(
            "select id, heartbeat from instance_registry
             where environment_id = $1 and responsible
             limit 1",
        )
        .bind(environment.as_bytes())
        .fetch_optional(&mut *tx)
        .await?;

        let took_over = match incumbent {
            None => {
                Self::claim(&mut tx, replica, environment).await?;
                true
            }
            Some((id, _)) if id == replica => true,
            Some((_, heartbeat)) if now - heartbeat >= INCUMBENT_STALE_SECS => {
                Self::claim(&mut tx, replica, environment).await?;
                true
            }
            Some(_) => false,
        };

        tx.commit().await?;

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
        let mut tx = self.begin_serializable().await?;

        let result = sqlx::query(
            r#"
            update instance_registry set responsible = false
            where id = $1
              and exists (
                select 1 from instance_registry
                where environment_id = $2
                  and not responsible
                  and $3 - heartbeat < $4
              )
            "#,
        )
        .bind(replica)
        .bind(environment.as_bytes())
        .bind(now)
        .bind(INCUMBENT_STALE_SECS)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    async fn sweep_expired(&self, now: i64) -> Result<u64> {
        // Single statement, so it gets its own short transaction; the
        // sweep does not need to serialize against elections.
        let result = sqlx::query("delete from instance_registry where $1 - heartbeat >= $2")
            .bind(now)
            .bind(EXPIRY_HORIZON_SECS)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
