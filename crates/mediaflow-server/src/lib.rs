//! Media ingestion server.
//!
//! Uploads, batch uploads, metadata backups and restores, and storage
//! migrations all run as background jobs. Clients submit over HTTP, get a
//! `202` with a status URL and poll it until the job is terminal.
//!
//! ```text
//! POST /api/jobs/image-processing/upload   -> 202 {jobId, statusUrl, ...}
//! GET  /api/jobs/image-processing/{jobId}  -> {exists, state, progress, result?, error?}
//! ```

pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod processors;
pub mod queues;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod transform;

pub use app::{build, storage_registry, StartupError};
pub use client::{ClientError, MediaflowClient, SubmitOptions};
pub use config::{AppConfig, BrokerKind, ConfigError, Environment};
pub use error::ApiError;
pub use processors::Services;
pub use queues::{AppContext, QueuePlan, BACKUP_QUEUE, IMAGE_QUEUE, MIGRATION_QUEUE};
pub use server::{HttpConfig, HttpServer, ServeError};
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore, StorageError, StorageRegistry};
pub use transform::{PassthroughTransformer, TransformError, TransformOptions, Transformer};
