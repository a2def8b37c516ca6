//! Tests for the destination writer.

use super::*;
use crate::store::MemoryStore;
use futures::StreamExt;
use mongodb::bson::doc;
use parking_lot::Mutex;

const DEST_TENANT: &str = "9b2d7c1e-0a45-4c8e-b8f1-6a7d3e2c1f00";

#[derive(Default)]
struct Counts {
    seen: Mutex<Vec<u64>>,
}

impl MirrorObserver for Counts {
    fn documents_copied(&self, _name: &str, copied: u64) {
        self.seen.lock().push(copied);
    }
}

fn orders() -> Vec<Document> {
    vec![
        doc! { "_id": 1, "Total": 10, "TenantId": "old" },
        doc! { "_id": 2, "Total": 20 },
        doc! { "_id": 3, "Total": 30 },
    ]
}

#[test]
fn test_write_mode_for_collection() {
    let upsert = CollectionSpec::new("orders");
    let bulk = CollectionSpec {
        upsert: Some(false),
        ..CollectionSpec::new("events")
    };

    assert_eq!(WriteMode::for_collection(&upsert, false), WriteMode::Upsert);
    assert_eq!(WriteMode::for_collection(&bulk, false), WriteMode::BulkInsert);
    assert_eq!(WriteMode::for_collection(&bulk, true), WriteMode::DryRun);
}

#[test]
fn test_tenant_stamp_overwrites() {
    let stamp = TenantStamp::new("TenantId", DEST_TENANT).unwrap();
    let mut document = doc! { "_id": 1, "TenantId": "source-tenant" };
    stamp.apply(&mut document);

    assert_eq!(document.get("TenantId"), Some(stamp.value()));
    assert_eq!(stamp.field(), "TenantId");
    assert!(TenantStamp::new("TenantId", "not-a-uuid").is_err());
}

#[tokio::test]
async fn test_upsert_streams_and_stamps() {
    let store = MemoryStore::new();
    let retry = RetryConfig::no_retry();
    let stamp = TenantStamp::new("TenantId", DEST_TENANT).unwrap();
    let observer = Counts::default();
    let writer = DestinationWriter::new(&store, "_id", &retry)
        .with_stamp(Some(&stamp))
        .with_observer(&observer);

    let copied = AtomicU64::new(0);
    let total = writer
        .drain(
            "orders",
            WriteMode::Upsert,
            DocumentCursor::from_documents(orders()),
            &copied,
        )
        .await
        .unwrap();

    assert_eq!(total, 3);
    assert_eq!(store.upsert_calls(), 3);
    assert_eq!(*observer.seen.lock(), vec![1, 2, 3]);
    for document in store.documents("orders") {
        assert_eq!(document.get("TenantId"), Some(stamp.value()));
    }
}

#[tokio::test]
async fn test_upsert_twice_keeps_one_document_with_latest_values() {
    let store = MemoryStore::new();
    let retry = RetryConfig::no_retry();
    let writer = DestinationWriter::new(&store, "_id", &retry);

    for total in [10, 99] {
        let copied = AtomicU64::new(0);
        writer
            .drain(
                "orders",
                WriteMode::Upsert,
                DocumentCursor::from_documents(vec![doc! { "_id": 1, "Total": total }]),
                &copied,
            )
            .await
            .unwrap();
    }

    assert_eq!(store.documents("orders"), vec![doc! { "_id": 1, "Total": 99 }]);
}

#[tokio::test]
async fn test_upsert_without_id_fails() {
    let store = MemoryStore::new();
    let retry = RetryConfig::no_retry();
    let writer = DestinationWriter::new(&store, "_id", &retry);

    let copied = AtomicU64::new(0);
    let err = writer
        .drain(
            "orders",
            WriteMode::Upsert,
            DocumentCursor::from_documents(vec![doc! { "Total": 1 }]),
            &copied,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WriteFailed { .. }));
    assert_eq!(store.upsert_calls(), 0);
}

#[tokio::test]
async fn test_upsert_failure_keeps_partial_count() {
    let store = MemoryStore::new();
    store.fail_writes_after(2);
    let retry = RetryConfig::no_retry();
    let writer = DestinationWriter::new(&store, "_id", &retry);

    let copied = AtomicU64::new(0);
    let err = writer
        .drain(
            "orders",
            WriteMode::Upsert,
            DocumentCursor::from_documents(orders()),
            &copied,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WriteFailed { ref collection, .. } if collection == "orders"));
    assert_eq!(copied.load(Ordering::SeqCst), 2);
    assert_eq!(store.documents("orders").len(), 2);
}

#[tokio::test]
async fn test_bulk_insert_writes_once() {
    let store = MemoryStore::new();
    let retry = RetryConfig::no_retry();
    let writer = DestinationWriter::new(&store, "_id", &retry);

    let copied = AtomicU64::new(0);
    let total = writer
        .drain(
            "events",
            WriteMode::BulkInsert,
            DocumentCursor::from_documents(orders()),
            &copied,
        )
        .await
        .unwrap();

    assert_eq!(total, 3);
    assert_eq!(store.insert_many_calls(), 1);
    assert_eq!(store.documents("events"), orders());
}

#[tokio::test]
async fn test_bulk_insert_with_nothing_skips_write() {
    let store = MemoryStore::new();
    let retry = RetryConfig::no_retry();
    let writer = DestinationWriter::new(&store, "_id", &retry);

    let copied = AtomicU64::new(0);
    let total = writer
        .drain(
            "events",
            WriteMode::BulkInsert,
            DocumentCursor::from_documents(Vec::new()),
            &copied,
        )
        .await
        .unwrap();

    assert_eq!(total, 0);
    assert_eq!(store.insert_many_calls(), 0);
}

#[tokio::test]
async fn test_bulk_insert_failure_counts_nothing() {
    let store = MemoryStore::new();
    store.fail_writes_after(0);
    let retry = RetryConfig::with_max_retries(5);
    let writer = DestinationWriter::new(&store, "_id", &retry);

    let copied = AtomicU64::new(0);
    let err = writer
        .drain(
            "events",
            WriteMode::BulkInsert,
            DocumentCursor::from_documents(orders()),
            &copied,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "MIRROR-008");
    assert_eq!(copied.load(Ordering::SeqCst), 0);
    assert_eq!(store.insert_many_calls(), 1);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let store = MemoryStore::new();
    let retry = RetryConfig::no_retry();
    let writer = DestinationWriter::new(&store, "_id", &retry);

    let copied = AtomicU64::new(0);
    let total = writer
        .drain(
            "orders",
            WriteMode::DryRun,
            DocumentCursor::from_documents(orders()),
            &copied,
        )
        .await
        .unwrap();

    assert_eq!(total, 3);
    assert_eq!(store.upsert_calls(), 0);
    assert_eq!(store.insert_many_calls(), 0);
    assert!(store.documents("orders").is_empty());
}

#[tokio::test]
async fn test_cursor_failure_is_a_source_error() {
    let store = MemoryStore::new();
    let retry = RetryConfig::no_retry();
    let writer = DestinationWriter::new(&store, "_id", &retry);

    let items: Vec<Result<Document>> = vec![
        Ok(doc! { "_id": 1 }),
        Err(Error::Store {
            message: "cursor killed".to_string(),
            transient: false,
        }),
        Ok(doc! { "_id": 2 }),
    ];
    let cursor = DocumentCursor::new(futures::stream::iter(items).boxed());

    let copied = AtomicU64::new(0);
    let err = writer
        .drain("orders", WriteMode::Upsert, cursor, &copied)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SourceQueryFailed { .. }));
    assert_eq!(copied.load(Ordering::SeqCst), 1);
}
