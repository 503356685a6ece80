//! Storage test utilities.

use async_trait::async_trait;
use bytes::Bytes;
use indexgate_storage::traits::{ByteStream, StreamingUpload};
use indexgate_storage::{FilesystemBackend, ObjectStore, StorageError, StorageResult};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A blob store call observed by [`RecordingStore`].
#[allow(dead_code)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCall {
    Upload { key: String, size: u64 },
    Compose { dest: String, sources: Vec<String> },
}

/// Filesystem store that records uploads and compose calls, and can be told
/// to fail compose the way a remote object store would.
#[allow(dead_code)]
pub struct RecordingStore {
    inner: FilesystemBackend,
    calls: Mutex<Vec<StoreCall>>,
    fail_compose: AtomicBool,
}

#[allow(dead_code)]
impl RecordingStore {
    pub async fn new(root: &Path) -> StorageResult<Self> {
        Ok(Self {
            inner: FilesystemBackend::new(root).await?,
            calls: Mutex::new(Vec::new()),
            fail_compose: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::Upload { key, size } => Some((key, size)),
                StoreCall::Compose { .. } => None,
            })
            .collect()
    }

    pub fn composes(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::Compose { dest, sources } => Some((dest, sources)),
                StoreCall::Upload { .. } => None,
            })
            .collect()
    }

    pub fn fail_compose(&self, fail: bool) {
        self.fail_compose.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn compose(&self, dest: &str, sources: &[String]) -> StorageResult<u64> {
        self.record(StoreCall::Compose {
            dest: dest.to_string(),
            sources: sources.to_vec(),
        });
        if self.fail_compose.load(Ordering::SeqCst) {
            return Err(StorageError::MultipartUpload {
                key: dest.to_string(),
                source: Box::new(StorageError::Io(std::io::Error::other(
                    "upload part copy: slow down",
                ))),
            });
        }
        self.inner.compose(dest, sources).await
    }

    async fn upload(&self, key: &str, body: ByteStream) -> StorageResult<u64> {
        let size = self.inner.upload(key, body).await?;
        self.record(StoreCall::Upload {
            key: key.to_string(),
            size,
        });
        Ok(size)
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}
