//! Wiring from configuration to a running [`AppContext`].

use crate::config::{AppConfig, BrokerKind, ConfigError};
use crate::processors::Services;
use crate::queues::AppContext;
use crate::storage::{LocalObjectStore, MemoryObjectStore, StorageRegistry};
use crate::transform::PassthroughTransformer;
use mediaflow_db::{DbError, MediaStore};
use mediaflow_jobs::{JobError, QueueManager};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database startup failed: {0}")]
    Database(#[from] DbError),

    #[error("Job broker startup failed: {0}")]
    Broker(#[from] JobError),
}

/// Storage backends named `local` (under `storage_root`) and `memory`.
pub fn storage_registry(config: &AppConfig) -> StorageRegistry {
    StorageRegistry::new(config.default_storage.clone())
        .with_store(Arc::new(LocalObjectStore::new("local", &config.storage_root)))
        .with_store(Arc::new(MemoryObjectStore::new("memory")))
}

async fn queue_manager(config: &AppConfig) -> Result<QueueManager, StartupError> {
    match config.broker {
        BrokerKind::Memory => Ok(QueueManager::in_memory()),
        #[cfg(feature = "postgres")]
        BrokerKind::Postgres => {
            let url = config
                .broker_url
                .as_deref()
                .ok_or_else(|| ConfigError::Invalid("broker_url is required".to_string()))?;
            let backend = mediaflow_jobs::PostgresBackend::connect(url, "mediaflow_jobs", 10).await?;
            Ok(QueueManager::new(Arc::new(backend)))
        }
        #[cfg(not(feature = "postgres"))]
        BrokerKind::Postgres => Err(ConfigError::Invalid(
            "built without the `postgres` feature".to_string(),
        )
        .into()),
    }
}

/// Connect the database and broker, then initialise the queues.
pub async fn build(config: &AppConfig) -> Result<Arc<AppContext>, StartupError> {
    config.validate()?;

    let db = MediaStore::connect(&config.database_url, config.db_max_connections).await?;
    let manager = queue_manager(config).await?;
    info!(broker = ?config.broker, "Job broker ready");

    let services = Services::new(db, storage_registry(config), Arc::new(PassthroughTransformer));
    let ctx = Arc::new(AppContext::new(Arc::new(manager), services));
    ctx.initialize().await?;
    Ok(ctx)
}
