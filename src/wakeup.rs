//! Wakeup broadcast to peer services
//!
//! When a replica is promoted to responsibility it publishes its UUID on
//! the `wakeup` channel so that local peer services (the config sync
//! pipeline, state writers) resume work immediately instead of waiting
//! for their own polling intervals.

use crate::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Pub/sub channel the promotion notification is published on.
pub const WAKEUP_CHANNEL: &str = "wakeup";

/// Promotion broadcast interface
#[async_trait]
pub trait WakeupBus: Send + Sync + std::fmt::Debug {
    /// Publish the promoted replica's UUID (textual) on [`WAKEUP_CHANNEL`].
    async fn publish_wakeup(&self, replica: Uuid) -> Result<()>;
}

/// Wakeup bus over Postgres `NOTIFY`, for deployments where peer services
/// already share the database connection.
#[derive(Debug)]
pub struct PgWakeupBus {
    pool: PgPool,
}

impl PgWakeupBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WakeupBus for PgWakeupBus {
    async fn publish_wakeup(&self, replica: Uuid) -> Result<()> {
        sqlx::query("select pg_notify($1, $2)")
            .bind(WAKEUP_CHANNEL)
            .bind(replica.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-process wakeup bus for single-process deployments and tests.
#[derive(Debug)]
pub struct LocalWakeupBus {
    sender: broadcast::Sender<String>,
}

impl LocalWakeupBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to receive wakeup payloads.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Get the current number of receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalWakeupBus {
    fn default() -> Self {
        Self::new(16)
    }
}

impl Clone for LocalWakeupBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[async_trait]
impl WakeupBus for LocalWakeupBus {
    async fn publish_wakeup(&self, replica: Uuid) -> Result<()> {
        // A send error only means there is no subscriber right now; a
        // promotion with nobody listening is not a fault.
        let _ = self.sender.send(replica.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_delivers_replica_uuid() {
        let bus = LocalWakeupBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let replica = Uuid::new_v4();
        bus.publish_wakeup(replica).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), replica.to_string());
        assert_eq!(rx2.recv().await.unwrap(), replica.to_string());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalWakeupBus::new(16);
        assert_eq!(bus.receiver_count(), 0);
        bus.publish_wakeup(Uuid::new_v4()).await.unwrap();
    }
}
