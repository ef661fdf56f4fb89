//! Component factory for environment-based configuration
//!
//! Selects the registry and wakeup backends from environment variables so
//! a single-process development setup (in-memory) and a replicated
//! production deployment (shared Postgres) run the same code.

use crate::registry::{InMemoryInstanceStore, InstanceStore, PgInstanceStore};
use crate::wakeup::{LocalWakeupBus, PgWakeupBus, WakeupBus};
use crate::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use tracing::info;

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the instance registry from environment
    ///
    /// Environment variables:
    /// - VIGIL_REGISTRY_BACKEND: "memory" (default) or "postgres"
    /// - DATABASE_URL: connection string (required for postgres)
    pub async fn create_instance_store() -> Result<Arc<dyn InstanceStore>> {
        let backend =
            std::env::var("VIGIL_REGISTRY_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory instance registry (development mode)");
                Ok(Arc::new(InMemoryInstanceStore::new()))
            }
            "postgres" => {
                let store = PgInstanceStore::new(Self::connect().await?);
                store.ensure_schema().await?;
                info!("Using Postgres instance registry");
                Ok(Arc::new(store))
            }
            _ => Err(Error::Config(format!(
                "Unknown VIGIL_REGISTRY_BACKEND: {}. Use 'memory' or 'postgres'",
                backend
            ))),
        }
    }

    /// Create the wakeup bus from environment
    ///
    /// Environment variables:
    /// - VIGIL_WAKEUP_BACKEND: "local" (default) or "postgres"
    /// - DATABASE_URL: connection string (required for postgres)
    pub async fn create_wakeup_bus() -> Result<Arc<dyn WakeupBus>> {
        let backend =
            std::env::var("VIGIL_WAKEUP_BACKEND").unwrap_or_else(|_| "local".to_string());

        match backend.as_str() {
            "local" => {
                info!("Using in-process wakeup bus (development mode)");
                Ok(Arc::new(LocalWakeupBus::default()))
            }
            "postgres" => {
                info!("Using Postgres NOTIFY wakeup bus");
                Ok(Arc::new(PgWakeupBus::new(Self::connect().await?)))
            }
            _ => Err(Error::Config(format!(
                "Unknown VIGIL_WAKEUP_BACKEND: {}. Use 'local' or 'postgres'",
                backend
            ))),
        }
    }

    async fn connect() -> Result<PgPool> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            Error::Config("DATABASE_URL required for the postgres backend".to_string())
        })?;

        Ok(PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?)
    }
}
