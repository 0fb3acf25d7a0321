//! End-to-end tests of the local filesystem backend and download accounting.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use tempfile::TempDir;

use transfer_core::storage::{
    BodyStream, DownloadLedger, LocalStorage, Range, Storage, StorageError, StorageKind,
};
use transfer_core::token;

fn body(data: &[u8], chunk: usize) -> BodyStream {
    let chunks: Vec<std::io::Result<Bytes>> = data
        .chunks(chunk)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn collect(body: BodyStream) -> Vec<u8> {
    body.try_fold(Vec::new(), |mut acc, chunk| async move {
        acc.extend_from_slice(&chunk);
        Ok(acc)
    })
    .await
    .unwrap()
}

async fn setup() -> (TempDir, Arc<dyn Storage>) {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path()).await.unwrap();
    (dir, Arc::new(storage))
}

#[tokio::test]
async fn test_put_then_get_round_trip() {
    let (_dir, storage) = setup().await;
    let token = token::generate(8);
    let data = b"hello transfer".to_vec();

    storage
        .put(&token, "hello.txt", body(&data, 4), "text/plain", data.len() as u64)
        .await
        .unwrap();

    assert_eq!(storage.kind(), StorageKind::Local);
    assert_eq!(storage.head(&token, "hello.txt").await.unwrap(), data.len() as u64);

    let download = storage.get(&token, "hello.txt", None).await.unwrap();
    assert_eq!(download.content_length, data.len() as u64);
    assert!(download.content_range.is_none());
    assert_eq!(collect(download.body).await, data);
}

#[tokio::test]
async fn test_ranged_get_of_large_object() {
    let (_dir, storage) = setup().await;
    let data = pattern(24_000);

    storage
        .put("abc123", "report.pdf", body(&data, 4096), "application/pdf", 24_000)
        .await
        .unwrap();
    assert_eq!(storage.head("abc123", "report.pdf").await.unwrap(), 24_000);

    let range = Range::new(1000, 500);
    assert_eq!(range.accept_length(24_000), 500);
    let download = storage
        .get("abc123", "report.pdf", Some(range))
        .await
        .unwrap();
    assert_eq!(download.content_length, 500);
    assert_eq!(download.content_range.as_deref(), Some("bytes 1000-1499/24000"));
    assert_eq!(collect(download.body).await, data[1000..1500]);
}

#[tokio::test]
async fn test_open_ended_range_reads_to_end() {
    let (_dir, storage) = setup().await;
    let data = pattern(100);
    storage
        .put("abc", "tail.bin", body(&data, 33), "application/octet-stream", 100)
        .await
        .unwrap();

    let range = Range::parse("bytes=90-").unwrap();
    let download = storage.get("abc", "tail.bin", Some(range)).await.unwrap();
    assert_eq!(download.content_length, 10);
    assert_eq!(download.content_range.as_deref(), Some("bytes 90-99/100"));
    assert_eq!(collect(download.body).await, data[90..]);
}

#[tokio::test]
async fn test_range_past_end_is_empty() {
    let (_dir, storage) = setup().await;
    storage
        .put("abc", "short.txt", body(b"0123456789", 10), "text/plain", 10)
        .await
        .unwrap();

    let download = storage
        .get("abc", "short.txt", Some(Range::new(50, 10)))
        .await
        .unwrap();
    assert_eq!(download.content_length, 0);
    assert!(collect(download.body).await.is_empty());
}

#[tokio::test]
async fn test_missing_object_is_not_found() {
    let (_dir, storage) = setup().await;

    let err = storage.head("nope", "missing.txt").await.unwrap_err();
    assert!(storage.is_not_exist(&err));

    let Err(err) = storage.get("nope", "missing.txt", None).await else {
        panic!("expected not found");
    };
    assert!(matches!(err, StorageError::NotFound { .. }));

    let err = storage.metadata("nope", "missing.txt").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_twice_reports_not_found() {
    let (dir, storage) = setup().await;
    storage
        .put("tok", "gone.txt", body(b"bye", 3), "text/plain", 3)
        .await
        .unwrap();

    storage.delete("tok", "gone.txt").await.unwrap();
    assert!(!dir.path().join("tok/gone.txt").exists());
    assert!(!dir.path().join("tok/gone.txt.metadata").exists());

    let err = storage.delete("tok", "gone.txt").await.unwrap_err();
    assert!(storage.is_not_exist(&err));
}

#[tokio::test]
async fn test_short_body_leaves_nothing_behind() {
    let (dir, storage) = setup().await;

    let err = storage
        .put("tok", "partial.bin", body(&pattern(10), 4), "application/octet-stream", 20)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::LengthMismatch {
            expected: 20,
            actual: 10,
            ..
        }
    ));
    assert!(!dir.path().join("tok/partial.bin").exists());
    assert!(storage.head("tok", "partial.bin").await.is_err());
}

#[tokio::test]
async fn test_failing_body_leaves_nothing_behind() {
    let (dir, storage) = setup().await;
    let failing: BodyStream = stream::iter(vec![
        Ok(Bytes::from_static(b"abc")),
        Err(std::io::Error::other("client went away")),
    ])
    .boxed();

    let err = storage
        .put("tok", "broken.bin", failing, "application/octet-stream", 6)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Io(_)));
    assert!(!dir.path().join("tok/broken.bin").exists());
}

#[tokio::test]
async fn test_metadata_sidecar_is_written_and_updated() {
    let (dir, storage) = setup().await;
    storage
        .put("tok", "doc.pdf", body(b"%PDF", 4), "application/pdf", 4)
        .await
        .unwrap();
    assert!(dir.path().join("tok/doc.pdf.metadata").is_file());

    let mut metadata = storage.metadata("tok", "doc.pdf").await.unwrap();
    assert_eq!(metadata.content_type, "application/pdf");
    assert_eq!(metadata.content_length, 4);
    assert_eq!(metadata.downloads, 0);
    assert_eq!(metadata.max_downloads, None);

    metadata.max_downloads = Some(2);
    metadata.deletion_token = token::deletion_token();
    storage.meta("tok", "doc.pdf", &metadata).await.unwrap();

    let stored = storage.metadata("tok", "doc.pdf").await.unwrap();
    assert_eq!(stored, metadata);
}

#[tokio::test]
async fn test_missing_sidecar_is_integrity_error() {
    let (dir, storage) = setup().await;
    storage
        .put("tok", "orphan.txt", body(b"x", 1), "text/plain", 1)
        .await
        .unwrap();
    std::fs::remove_file(dir.path().join("tok/orphan.txt.metadata")).unwrap();

    let err = storage.metadata("tok", "orphan.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::Integrity { .. }));
    assert!(storage.is_not_exist(&err));
}

#[tokio::test]
async fn test_purge_removes_only_old_files() {
    let (dir, storage) = setup().await;
    storage
        .put("old", "stale.txt", body(b"stale", 5), "text/plain", 5)
        .await
        .unwrap();
    storage
        .put("new", "fresh.txt", body(b"fresh", 5), "text/plain", 5)
        .await
        .unwrap();

    let two_days_ago = SystemTime::now() - Duration::from_secs(2 * 86_400);
    for path in ["old/stale.txt", "old/stale.txt.metadata"] {
        std::fs::File::options()
            .write(true)
            .open(dir.path().join(path))
            .unwrap()
            .set_modified(two_days_ago)
            .unwrap();
    }

    storage.purge(Duration::from_secs(86_400)).await.unwrap();

    assert!(!dir.path().join("old/stale.txt").exists());
    assert!(!dir.path().join("old/stale.txt.metadata").exists());
    assert_eq!(storage.head("new", "fresh.txt").await.unwrap(), 5);
}

#[tokio::test]
async fn test_concurrent_downloads_are_all_counted() {
    let (_dir, storage) = setup().await;
    storage
        .put("tok", "popular.bin", body(b"data", 4), "application/octet-stream", 4)
        .await
        .unwrap();

    let ledger = Arc::new(DownloadLedger::new(storage.clone()));
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.record_download("tok", "popular.bin").await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let metadata = storage.metadata("tok", "popular.bin").await.unwrap();
    assert_eq!(metadata.downloads, 16);
    assert_eq!(ledger.in_flight(), 0);
}

#[tokio::test]
async fn test_download_limit_is_enforced() {
    let (_dir, storage) = setup().await;
    storage
        .put("tok", "once.txt", body(b"1", 1), "text/plain", 1)
        .await
        .unwrap();
    let metadata = storage
        .metadata("tok", "once.txt")
        .await
        .unwrap()
        .with_max_downloads(1);
    storage.meta("tok", "once.txt", &metadata).await.unwrap();

    let ledger = DownloadLedger::new(storage.clone());
    let recorded = ledger.record_download("tok", "once.txt").await.unwrap();
    assert_eq!(recorded.downloads, 1);
    assert_eq!(
        recorded.remaining_limit_header_values(Utc::now()).0,
        "0"
    );

    let err = ledger.record_download("tok", "once.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::DownloadLimitReached { .. }));
    let err = ledger.check_available("tok", "once.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::DownloadLimitReached { .. }));
}

#[tokio::test]
async fn test_expired_object_is_refused() {
    let (_dir, storage) = setup().await;
    storage
        .put("tok", "late.txt", body(b"1", 1), "text/plain", 1)
        .await
        .unwrap();
    let metadata = storage
        .metadata("tok", "late.txt")
        .await
        .unwrap()
        .with_max_date(Utc::now() - ChronoDuration::hours(1));
    storage.meta("tok", "late.txt", &metadata).await.unwrap();

    let ledger = DownloadLedger::new(storage);
    let err = ledger.check_available("tok", "late.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::Expired { .. }));
}

#[tokio::test]
async fn test_failed_overwrite_drops_previous_metadata() {
    let (dir, storage) = setup().await;
    storage
        .put("tok", "report.txt", body(b"version one", 4), "text/plain", 11)
        .await
        .unwrap();
    let metadata = storage
        .metadata("tok", "report.txt")
        .await
        .unwrap()
        .with_max_downloads(5);
    storage.meta("tok", "report.txt", &metadata).await.unwrap();

    let err = storage
        .put("tok", "report.txt", body(&pattern(10), 4), "text/plain", 20)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::LengthMismatch { .. }));

    assert!(!dir.path().join("tok/report.txt").exists());
    assert!(!dir.path().join("tok/report.txt.metadata").exists());
    let err = storage.metadata("tok", "report.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));

    let ledger = DownloadLedger::new(storage.clone());
    let err = ledger.check_available("tok", "report.txt").await.unwrap_err();
    assert!(storage.is_not_exist(&err));
}

#[tokio::test]
async fn test_orphaned_sidecar_is_not_found() {
    let (dir, storage) = setup().await;
    storage
        .put("tok", "lone.txt", body(b"x", 1), "text/plain", 1)
        .await
        .unwrap();
    std::fs::remove_file(dir.path().join("tok/lone.txt")).unwrap();

    let err = storage.metadata("tok", "lone.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metadata_reads_during_rewrites_never_see_partial_json() {
    let (_dir, storage) = setup().await;
    storage
        .put("tok", "hot.bin", body(b"data", 4), "application/octet-stream", 4)
        .await
        .unwrap();

    let ledger = Arc::new(DownloadLedger::new(storage.clone()));
    let writer = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                ledger.record_download("tok", "hot.bin").await.unwrap();
            }
        })
    };
    let reader = {
        let storage = storage.clone();
        tokio::spawn(async move {
            let mut reads = 0usize;
            while reads < 200 {
                storage.metadata("tok", "hot.bin").await.unwrap();
                reads += 1;
                tokio::task::yield_now().await;
            }
        })
    };
    writer.await.unwrap();
    reader.await.unwrap();

    let metadata = storage.metadata("tok", "hot.bin").await.unwrap();
    assert_eq!(metadata.downloads, 50);
}
