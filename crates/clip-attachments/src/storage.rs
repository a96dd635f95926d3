//! Storage Abstraction
//!
//! The object storage backend as seen by the persister. Real backends (S3
//! and friends) live in the host application and implement [`Storage`];
//! [`MemoryStorage`] is provided for tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),
    /// Connection refused/reset, DNS failure, client timeout
    #[error("Networking error: {0}")]
    Networking(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

impl StorageError {
    /// Transient connectivity failure, evidence the backend is unavailable
    pub fn is_networking(&self) -> bool {
        matches!(self, StorageError::Networking(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Object metadata returned by a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Object size in bytes
    pub size: u64,
    /// Content type (MIME)
    pub content_type: String,
    /// SHA256 digest
    pub digest: String,
}

impl ObjectMetadata {
    pub fn for_object(path: &str, data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);

        Self {
            size: data.len() as u64,
            content_type: mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string(),
            digest: hex::encode(hasher.finalize()),
        }
    }
}

/// Object storage backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload an object
    async fn put(&self, path: &str, data: Bytes) -> StorageResult<ObjectMetadata>;

    /// Download an object
    async fn get(&self, path: &str) -> StorageResult<Bytes>;

    /// Delete an object
    async fn delete(&self, path: &str) -> StorageResult<()>;
}

/// A call that reached [`MemoryStorage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    Put(String),
    Get(String),
    Delete(String),
}

/// In-memory storage with a call log and fault injection
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Bytes>>,
    calls: Mutex<Vec<StorageCall>>,
    offline: AtomicBool,
    injected: Mutex<VecDeque<StorageError>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a networking error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next call with `error`
    pub fn fail_next(&self, error: StorageError) {
        self.injected.lock().push_back(error);
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        self.calls.lock().clone()
    }

    pub fn puts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                StorageCall::Put(path) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                StorageCall::Delete(path) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn enter(&self, call: StorageCall) -> StorageResult<()> {
        self.calls.lock().push(call);

        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Networking("connection refused".to_string()));
        }
        match self.injected.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, path: &str, data: Bytes) -> StorageResult<ObjectMetadata> {
        self.enter(StorageCall::Put(path.to_string()))?;

        let metadata = ObjectMetadata::for_object(path, &data);
        self.objects.write().insert(path.to_string(), data);
        debug!(path = %path, size = metadata.size, "Object stored");

        Ok(metadata)
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        self.enter(StorageCall::Get(path.to_string()))?;

        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.enter(StorageCall::Delete(path.to_string()))?;

        self.objects.write().remove(path);
        Ok(())
    }
}
