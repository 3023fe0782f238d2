#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use mediaflow_db::MediaStore;
use mediaflow_jobs::{Backoff, PollConfig, QueueManager, QueueOptions};
use mediaflow_server::{
    AppContext, HttpConfig, HttpServer, LocalObjectStore, MemoryObjectStore, PassthroughTransformer,
    QueuePlan, Services, StorageRegistry,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

fn fast(options: QueueOptions) -> QueueOptions {
    options
        .backoff(Backoff::fixed(Duration::ZERO))
        .poll_interval(Duration::from_millis(10))
}

/// Production attempt budgets with no backoff delay.
pub fn fast_plan() -> QueuePlan {
    let plan = QueuePlan::default();
    QueuePlan {
        image: fast(plan.image),
        backup: fast(plan.backup),
        migration: fast(plan.migration),
    }
}

pub fn fast_polling() -> PollConfig {
    PollConfig {
        interval: Duration::from_millis(20),
        error_interval: Duration::from_millis(50),
        max_attempts: 500,
    }
}

pub fn upload_payload(filename: &str, bytes: &[u8]) -> Value {
    json!({ "filename": filename, "data": STANDARD.encode(bytes) })
}

/// A fully initialised context on in-memory stores plus a `local` store
/// under a fresh temp directory.
pub struct TestContext {
    pub ctx: Arc<AppContext>,
    pub memory: Arc<MemoryObjectStore>,
    pub root: PathBuf,
}

impl TestContext {
    pub async fn start() -> Self {
        let memory = Arc::new(MemoryObjectStore::new("memory"));
        let root = std::env::temp_dir().join(format!("mediaflow-it-{}", uuid::Uuid::new_v4()));
        let storage = StorageRegistry::new("memory")
            .with_store(memory.clone())
            .with_store(Arc::new(LocalObjectStore::new("local", &root)));
        let services = Services::new(
            MediaStore::in_memory().await.unwrap(),
            storage,
            Arc::new(PassthroughTransformer),
        );

        let ctx = Arc::new(AppContext::with_plan(
            Arc::new(QueueManager::in_memory()),
            services,
            fast_plan(),
        ));
        ctx.initialize().await.unwrap();
        Self { ctx, memory, root }
    }

    pub async fn stop(self) {
        self.ctx.shutdown(Duration::from_secs(5)).await.unwrap();
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// The HTTP server on a random local port.
pub struct TestServer {
    pub app: TestContext,
    addr: std::net::SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), mediaflow_server::ServeError>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_body_limit(1024 * 1024).await
    }

    pub async fn with_body_limit(max_body_bytes: usize) -> Self {
        let app = TestContext::start().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(
            app.ctx.clone(),
            HttpConfig {
                public_base_url: String::new(),
                max_body_bytes,
            },
        )
        .unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async {
            let _ = stopped.await;
        }));
        Self {
            app,
            addr,
            stop,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
        self.app.stop().await;
    }
}
