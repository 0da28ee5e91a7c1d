//! Persistence backends
//!
//! A backend stores one opaque byte image (the exported database) and hands
//! it back on load. Backends are independent: the engine tries them in
//! priority order on startup and writes to all of them on every checkpoint.
//!
//! Every image is stored alongside its blake3 checksum; a mismatch on load is
//! reported as [`BackendError::Corrupted`] so recovery can fall through to
//! the next backend.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::error::BackendError;

/// Default quota of the key-value backup store (10 MiB)
pub const DEFAULT_KV_QUOTA_BYTES: usize = 10 * 1024 * 1024;

/// A persistence target for database images
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name used in logs, events and reports
    fn name(&self) -> &str;

    /// Lower values are tried first on recovery
    fn priority(&self) -> u8;

    /// Stored image, `None` when nothing has been saved yet
    async fn load(&self) -> Result<Option<Vec<u8>>, BackendError>;

    /// Replace the stored image
    async fn save(&self, bytes: &[u8]) -> Result<(), BackendError>;
}

fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn verify(backend: &str, bytes: &[u8], expected: Option<&str>) -> Result<(), BackendError> {
    match expected {
        Some(expected) if expected.trim() != checksum(bytes) => Err(BackendError::Corrupted {
            backend: backend.to_string(),
            reason: "checksum mismatch".to_string(),
        }),
        Some(_) => Ok(()),
        None => {
            tracing::warn!("Backend '{}' has no checksum for its image", backend);
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory backend (durable)
// ─────────────────────────────────────────────────────────────────────────────

/// Durable backend: one image file plus a checksum sidecar in a directory
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    name: String,
    priority: u8,
    dir: PathBuf,
    file_name: String,
}

impl DirectoryBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "directory".to_string(),
            priority: 0,
            dir: dir.into(),
            file_name: "capstore.sqlite".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    pub fn checksum_path(&self) -> PathBuf {
        self.dir.join(format!("{}.blake3", self.file_name))
    }

    fn staged(path: &Path) -> PathBuf {
        let mut staged = path.as_os_str().to_owned();
        staged.push(".tmp");
        PathBuf::from(staged)
    }

    fn io_error(&self, path: &Path, e: std::io::Error) -> BackendError {
        BackendError::Io {
            backend: self.name.clone(),
            reason: format!("{}: {}", path.display(), e),
        }
    }

    /// Write `bytes` to `path` and flush them to disk
    async fn write_synced(&self, path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| self.io_error(path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| self.io_error(path, e))?;
        file.sync_all().await.map_err(|e| self.io_error(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| self.io_error(to, e))
    }

    async fn sync_dir(&self) {
        let synced = match tokio::fs::File::open(&self.dir).await {
            Ok(dir) => dir.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = synced {
            tracing::debug!("Directory sync skipped for '{}': {}", self.name, e);
        }
    }

    /// Checksum staged by a save that stopped between its two renames
    async fn staged_checksum(&self) -> Option<String> {
        tokio::fs::read_to_string(Self::staged(&self.checksum_path()))
            .await
            .ok()
    }
}

#[async_trait]
impl Backend for DirectoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, BackendError> {
        let path = self.image_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(&path, e)),
        };
        if bytes.is_empty() {
            return Ok(None);
        }

        let sum_path = self.checksum_path();
        let expected = match tokio::fs::read_to_string(&sum_path).await {
            Ok(sum) => Some(sum),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(self.io_error(&sum_path, e)),
        };
        if let Err(e) = verify(&self.name, &bytes, expected.as_deref()) {
            match self.staged_checksum().await {
                Some(staged) if verify(&self.name, &bytes, Some(&staged)).is_ok() => {
                    tracing::warn!(
                        "Backend '{}' image matches its staged checksum; last save was interrupted",
                        self.name
                    );
                }
                _ => return Err(e),
            }
        }
        Ok(Some(bytes))
    }

    /// Both files are staged and synced before either is renamed into place
    async fn save(&self, bytes: &[u8]) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.io_error(&self.dir, e))?;

        let image = self.image_path();
        let sum = self.checksum_path();
        let (image_tmp, sum_tmp) = (Self::staged(&image), Self::staged(&sum));
        self.write_synced(&image_tmp, bytes).await?;
        self.write_synced(&sum_tmp, checksum(bytes).as_bytes()).await?;

        self.rename(&image_tmp, &image).await?;
        self.rename(&sum_tmp, &sum).await?;
        self.sync_dir().await;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Key-value backend (backup)
// ─────────────────────────────────────────────────────────────────────────────

/// Namespaced get/set primitive a [`KeyValueBackend`] writes through
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> std::io::Result<()>;
}

/// Process-local key-value store
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> std::io::Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// Key-value store kept in one JSON document with hex-encoded values
#[derive(Debug)]
pub struct JsonFileKeyValueStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> std::io::Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileKeyValueStore {
    async fn get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().await;
        let entries = self.read_all().await?;
        entries
            .get(key)
            .map(|v| {
                hex::decode(v).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })
            .transpose()
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), hex::encode(value));

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

/// Size-limited backup backend over any [`KeyValueStore`]
#[derive(Debug)]
pub struct KeyValueBackend<S> {
    name: String,
    priority: u8,
    namespace: String,
    quota_bytes: usize,
    store: S,
}

impl<S: KeyValueStore> KeyValueBackend<S> {
    pub fn new(store: S) -> Self {
        Self {
            name: "key_value".to_string(),
            priority: 1,
            namespace: "capstore".to_string(),
            quota_bytes: DEFAULT_KV_QUOTA_BYTES,
            store,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn image_key(&self) -> String {
        format!("{}:database", self.namespace)
    }

    fn checksum_key(&self) -> String {
        format!("{}:checksum", self.namespace)
    }

    fn io_error(&self, e: std::io::Error) -> BackendError {
        BackendError::Io {
            backend: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl<S: KeyValueStore> Backend for KeyValueBackend<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, BackendError> {
        let bytes = match self
            .store
            .get(&self.image_key())
            .await
            .map_err(|e| self.io_error(e))?
        {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Ok(None),
        };

        let expected = self
            .store
            .get(&self.checksum_key())
            .await
            .map_err(|e| self.io_error(e))?
            .map(|sum| String::from_utf8_lossy(&sum).into_owned());
        verify(&self.name, &bytes, expected.as_deref())?;
        Ok(Some(bytes))
    }

    async fn save(&self, bytes: &[u8]) -> Result<(), BackendError> {
        if bytes.len() > self.quota_bytes {
            return Err(BackendError::QuotaExceeded {
                backend: self.name.clone(),
                size: bytes.len(),
                quota: self.quota_bytes,
            });
        }
        self.store
            .set(&self.image_key(), bytes.to_vec())
            .await
            .map_err(|e| self.io_error(e))?;
        self.store
            .set(&self.checksum_key(), checksum(bytes).into_bytes())
            .await
            .map_err(|e| self.io_error(e))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory backend
// ─────────────────────────────────────────────────────────────────────────────

/// Backend holding its image in process memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    name: String,
    priority: u8,
    image: Mutex<Option<Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, priority: u8) -> Self {
        Self {
            name: name.into(),
            priority,
            image: Mutex::new(None),
        }
    }

    /// Pre-populate the stored image
    pub fn with_bytes(self, bytes: Vec<u8>) -> Self {
        *self.image.lock() = Some(bytes);
        self
    }

    /// Current stored image
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.image.lock().clone()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.image.lock().clone().filter(|b| !b.is_empty()))
    }

    async fn save(&self, bytes: &[u8]) -> Result<(), BackendError> {
        *self.image.lock() = Some(bytes.to_vec());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend set
// ─────────────────────────────────────────────────────────────────────────────

struct Slot {
    backend: Arc<dyn Backend>,
    // One write at a time per backend
    write_lock: tokio::sync::Mutex<()>,
}

/// Outcome of writing one image to several backends
#[derive(Debug, Default)]
pub struct PersistOutcome {
    pub persisted: Vec<String>,
    pub failed: Vec<(String, BackendError)>,
}

impl PersistOutcome {
    pub fn any_succeeded(&self) -> bool {
        !self.persisted.is_empty()
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failed.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Backends ordered by priority
#[derive(Default)]
pub struct BackendSet {
    slots: Vec<Slot>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend, keeping priority order (stable for equal priorities)
    pub fn with(mut self, backend: impl Backend + 'static) -> Self {
        self.push(Arc::new(backend));
        self
    }

    pub fn with_shared(mut self, backend: Arc<dyn Backend>) -> Self {
        self.push(backend);
        self
    }

    pub fn push(&mut self, backend: Arc<dyn Backend>) {
        let at = self
            .slots
            .iter()
            .position(|s| s.backend.priority() > backend.priority())
            .unwrap_or(self.slots.len());
        self.slots.insert(
            at,
            Slot {
                backend,
                write_lock: tokio::sync::Mutex::new(()),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Backend>> {
        self.slots.get(index).map(|s| &s.backend)
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.backend.name().to_string()).collect()
    }

    /// Save to one backend, waiting for any write already targeting it
    pub async fn save_one(&self, index: usize, bytes: &[u8]) -> Result<(), BackendError> {
        let slot = self.slots.get(index).ok_or_else(|| BackendError::Unavailable {
            backend: format!("#{}", index),
            reason: "no such backend".to_string(),
        })?;
        let _guard = slot.write_lock.lock().await;
        slot.backend.save(bytes).await
    }

    /// Save to every backend concurrently. Failures are collected, not raised.
    pub async fn save_all(&self, bytes: &[u8]) -> PersistOutcome {
        let indices: Vec<usize> = (0..self.slots.len()).collect();
        self.save_to(&indices, bytes).await
    }

    /// Save to the listed backends concurrently
    pub async fn save_to(&self, indices: &[usize], bytes: &[u8]) -> PersistOutcome {
        let writes = indices.iter().map(|&i| async move {
            let name = self
                .get(i)
                .map(|b| b.name().to_string())
                .unwrap_or_else(|| format!("#{}", i));
            (name, self.save_one(i, bytes).await)
        });

        let mut outcome = PersistOutcome::default();
        for (name, result) in join_all(writes).await {
            match result {
                Ok(()) => outcome.persisted.push(name),
                Err(e) => {
                    tracing::warn!("Backend '{}' persist failed: {}", name, e);
                    outcome.failed.push((name, e));
                }
            }
        }
        outcome
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field("backends", &self.names())
            .finish()
    }
}
