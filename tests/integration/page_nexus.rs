//! Test: pages owned by a `PageNexus` strand.

use std::time::Duration;

use skein::progs::{builtin_registry, PageNexus};
use skein::storage::StrandStore;

use crate::common::{
    fast_config, test_store, test_worker, tick_until_gone, RecordingPageSink, RecordingRekeyDriver,
};

#[tokio::test]
async fn test_page_lives_until_resolution_requested() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let worker = test_worker(
        &store,
        builtin_registry(sink.clone(), RecordingRekeyDriver::new()),
        &sink,
    );
    let page = PageNexus::assemble(store.as_ref(), "replica lag above threshold")
        .await
        .unwrap();

    let report = worker.tick(&fast_config()).await.unwrap();
    assert_eq!(report.napped, 1);
    assert_eq!(sink.created().len(), 1);
    assert_eq!(sink.created()[0].id, page.id);

    // No request yet: wakes, sees nothing, naps again.
    store.advance(Duration::from_secs(31));
    let report = worker.tick(&fast_config()).await.unwrap();
    assert_eq!(report.napped, 1);
    assert!(store.get_page(page.id).await.unwrap().unwrap().is_open());

    PageNexus::request_resolve(store.as_ref(), page.id).await.unwrap();
    store.advance(Duration::from_secs(31));
    tick_until_gone(&worker, &store, page.id, 3).await;

    let resolved = store.get_page(page.id).await.unwrap().unwrap();
    assert!(!resolved.is_open());
    assert_eq!(sink.resolved().len(), 1);
    assert_eq!(sink.created().len(), 1);
}

#[tokio::test]
async fn test_page_resolved_elsewhere_ends_strand() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let worker = test_worker(
        &store,
        builtin_registry(sink.clone(), RecordingRekeyDriver::new()),
        &sink,
    );
    let page = PageNexus::assemble(store.as_ref(), "certificate expires soon")
        .await
        .unwrap();
    worker.tick(&fast_config()).await.unwrap();

    worker.resolve_page(page.id).await.unwrap();
    store.advance(Duration::from_secs(31));
    tick_until_gone(&worker, &store, page.id, 3).await;

    assert_eq!(sink.resolved().len(), 1);
}

#[tokio::test]
async fn test_request_resolve_without_owner_fails() {
    let store = test_store();
    let page = store.create_page("orphan").await.unwrap();

    assert!(PageNexus::request_resolve(store.as_ref(), page.id).await.is_err());
}
