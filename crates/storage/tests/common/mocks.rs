use async_trait::async_trait;
use bytes::Bytes;
use indexgate_storage::traits::{ObjectStore, StreamingUpload};
use indexgate_storage::{StorageError, StorageResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where a [`FlakyBackend`] fails.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug)]
pub enum FlakyMode {
    /// put_stream itself fails.
    Start,
    /// The nth write (zero-based) fails.
    Write(usize),
    /// finish fails after all writes succeed.
    Finish,
}

/// Backend whose streaming uploads fail at a chosen point and that counts
/// aborts so tests can assert cleanup.
#[allow(dead_code)]
pub struct FlakyBackend {
    pub mode: FlakyMode,
    pub aborts: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FlakyBackend {
    pub fn new(mode: FlakyMode) -> Self {
        Self {
            mode,
            aborts: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn injected() -> StorageError {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "connection reset by object store",
        ))
    }
}

#[async_trait]
impl ObjectStore for FlakyBackend {
    async fn exists(&self, _key: &str) -> StorageResult<bool> {
        Ok(false)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, _key: &str, _data: Bytes) -> StorageResult<()> {
        Err(Self::injected())
    }

    async fn put_stream(&self, _key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        if matches!(self.mode, FlakyMode::Start) {
            return Err(Self::injected());
        }
        Ok(Box::new(FlakyUpload {
            mode: self.mode,
            writes: 0,
            aborts: self.aborts.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn compose(&self, _dest: &str, _sources: &[String]) -> StorageResult<u64> {
        Err(Self::injected())
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

struct FlakyUpload {
    mode: FlakyMode,
    writes: usize,
    aborts: Arc<AtomicUsize>,
}

#[async_trait]
impl StreamingUpload for FlakyUpload {
    async fn write(&mut self, _data: Bytes) -> StorageResult<()> {
        let n = self.writes;
        self.writes += 1;
        match self.mode {
            FlakyMode::Write(fail_at) if fail_at == n => Err(FlakyBackend::injected()),
            _ => Ok(()),
        }
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        match self.mode {
            FlakyMode::Finish => Err(FlakyBackend::injected()),
            _ => Ok(self.writes as u64),
        }
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
