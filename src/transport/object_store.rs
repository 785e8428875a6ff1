//! Object Store
//!
//! Append-only home for raw-frame archive batches. The contract is an
//! idempotent `put` of an opaque byte stream under a slash-separated
//! key; the archival sink owns key naming and body framing.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Debug)]
pub enum ObjectStoreError {
    Io(std::io::Error),
    Unavailable(String),
}

impl std::fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "object store io: {e}"),
            Self::Unavailable(msg) => write!(f, "object store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for ObjectStoreError {}

impl From<std::io::Error> for ObjectStoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Idempotent whole-object write.
    async fn put(&self, key: &str, body: &[u8]) -> Result<(), ObjectStoreError>;
}

// =============================================================================
// FILESYSTEM IMPLEMENTATION
// =============================================================================

/// Directory-tree store: the object key maps directly onto a relative
/// path under the root, so `2025-06-30/16/00-01-250_host_7.bin` is
/// browsable with ordinary tools.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: &[u8]) -> Result<(), ObjectStoreError> {
        // Keys are generated internally; reject anything that could
        // escape the root.
        if key.contains("..") || key.starts_with('/') {
            return Err(ObjectStoreError::Unavailable(format!("bad key: {key}")));
        }
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

/// Test double with outage injection, mirroring [`MemoryCache`].
///
/// [`MemoryCache`]: crate::transport::cache::MemoryCache
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    available: std::sync::atomic::AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available
            .store(available, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: &[u8]) -> Result<(), ObjectStoreError> {
        if !self.available.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ObjectStoreError::Unavailable("injected outage".into()));
        }
        self.objects
            .write()
            .insert(key.to_string(), body.to_vec());
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
