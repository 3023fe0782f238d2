//! Object storage backends, addressed by name.

use async_trait::async_trait;
use bytes::Bytes;
use mediaflow_jobs::JobError;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Io(_))
    }
}

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            JobError::WorkerError(err.to_string())
        } else {
            JobError::Unrecoverable(err.to_string())
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A place objects can be written to and read back from.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store `bytes` under `key`, replacing any previous object. Returns
    /// the object's URL.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> StorageResult<String>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    fn url_for(&self, key: &str) -> String;
}

/// Keys are relative, `/`-separated and never climb out of the store.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let path = Path::new(key);
    let bad = key.is_empty()
        || key.contains('\\')
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Bytes,
    content_type: String,
}

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    name: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .ok()?
            .get(key)
            .map(|o| o.content_type.clone())
    }

    fn poisoned() -> StorageError {
        StorageError::Unavailable("object map lock poisoned".to_string())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> StorageResult<String> {
        validate_key(key)?;
        self.objects.write().map_err(|_| Self::poisoned())?.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(self.url_for(key))
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .read()
            .map_err(|_| Self::poisoned())?
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.write().map_err(|_| Self::poisoned())?.remove(key);
        Ok(())
    }

    fn url_for(&self, key: &str) -> String {
        format!("memory://{}/{}", self.name, key)
    }
}

/// Objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    name: String,
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> StorageResult<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial object
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(self.url_for(key))
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}

/// Named object stores plus the default one.
#[derive(Clone)]
pub struct StorageRegistry {
    stores: HashMap<String, Arc<dyn ObjectStore>>,
    default: String,
}

impl StorageRegistry {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            stores: HashMap::new(),
            default: default.into(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.insert(store.name().to_string(), store);
        self
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn get(&self, name: &str) -> StorageResult<Arc<dyn ObjectStore>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))
    }

    /// The named store, or the default one.
    pub fn resolve(&self, name: Option<&str>) -> StorageResult<Arc<dyn ObjectStore>> {
        self.get(name.unwrap_or(&self.default))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cannot_escape_the_store() {
        assert!(validate_key("uploads/a.png").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/./b").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a\\..\\b").is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryObjectStore::new("memory");
        let url = store
            .put("a/b.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        assert_eq!(url, "memory://memory/a/b.png");
        assert_eq!(store.get("a/b.png").await.unwrap(), Bytes::from_static(b"png"));
        assert_eq!(store.content_type("a/b.png").as_deref(), Some("image/png"));

        store.delete("a/b.png").await.unwrap();
        store.delete("a/b.png").await.unwrap();
        assert!(matches!(
            store.get("a/b.png").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn local_store_writes_under_root() {
        let root = std::env::temp_dir().join(format!("mediaflow-test-{}", uuid::Uuid::new_v4()));
        let store = LocalObjectStore::new("local", &root);

        store
            .put("nested/dir/x.bin", Bytes::from_static(b"abc"), "application/octet-stream")
            .await
            .unwrap();
        assert!(root.join("nested/dir/x.bin").exists());
        assert_eq!(store.get("nested/dir/x.bin").await.unwrap().as_ref(), b"abc");
        assert!(matches!(
            store.get("missing").await,
            Err(StorageError::NotFound(_))
        ));

        store.delete("nested/dir/x.bin").await.unwrap();
        assert!(!root.join("nested/dir/x.bin").exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn registry_resolves_default() {
        let registry = StorageRegistry::new("memory")
            .with_store(Arc::new(MemoryObjectStore::new("memory")));
        assert_eq!(registry.resolve(None).unwrap().name(), "memory");
        assert!(matches!(
            registry.resolve(Some("s3")),
            Err(StorageError::UnknownBackend(_))
        ));
    }

    #[test]
    fn only_infrastructure_errors_are_retried() {
        let err: JobError = StorageError::Unavailable("timeout".into()).into();
        assert!(err.is_retryable());
        let err: JobError = StorageError::NotFound("k".into()).into();
        assert!(!err.is_retryable());
    }
}
