// Error classification of the default streamed upload.

mod common;

use bytes::Bytes;
use common::{FlakyBackend, FlakyMode};
use indexgate_storage::traits::{ByteStream, ObjectStore};
use indexgate_storage::{StorageError, StorageResult};
use std::sync::atomic::Ordering;

fn body(items: Vec<StorageResult<Bytes>>) -> ByteStream {
    Box::pin(futures::stream::iter(items))
}

fn three_chunks() -> ByteStream {
    body(vec![
        Ok(Bytes::from_static(b"a")),
        Ok(Bytes::from_static(b"b")),
        Ok(Bytes::from_static(b"c")),
    ])
}

fn root_cause(err: &StorageError) -> String {
    let mut current: &dyn std::error::Error = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

#[tokio::test]
async fn test_backend_write_failure_is_multipart_and_aborts() {
    let backend = FlakyBackend::new(FlakyMode::Write(1));

    let err = backend
        .upload("upload-9.lsif.gz", three_chunks())
        .await
        .unwrap_err();

    assert!(err.is_multipart_upload(), "got {err:?}");
    assert_eq!(root_cause(&err), "connection reset by object store");
    assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_backend_finish_failure_is_multipart() {
    let backend = FlakyBackend::new(FlakyMode::Finish);

    let err = backend
        .upload("upload-9.lsif.gz", three_chunks())
        .await
        .unwrap_err();

    assert!(err.is_multipart_upload());
    assert_eq!(backend.aborts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_backend_start_failure_is_multipart() {
    let backend = FlakyBackend::new(FlakyMode::Start);

    let err = backend
        .upload("upload-9.lsif.gz", three_chunks())
        .await
        .unwrap_err();

    match err {
        StorageError::MultipartUpload { ref key, .. } => assert_eq!(key, "upload-9.lsif.gz"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_body_failure_is_not_multipart() {
    let backend = FlakyBackend::new(FlakyMode::Finish);

    let err = backend
        .upload(
            "upload-9.lsif.gz",
            body(vec![
                Ok(Bytes::from_static(b"a")),
                Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "request body ended early",
                ))),
            ]),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::Io(_)));
    assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_successful_upload_reports_size() {
    let backend = FlakyBackend::new(FlakyMode::Write(99));
    let written = backend
        .upload("upload-9.lsif.gz", three_chunks())
        .await
        .unwrap();
    assert_eq!(written, 3);
}
