//! Test: the long-running scheduler loop drives a fan-out to completion
//! and stops on shutdown.

use std::time::Duration;

use serde_json::json;
use skein::models::{Frame, NewStrand};
use skein::progs::{builtin_registry, SubnetRekey};
use skein::storage::{StrandFilter, StrandStore};
use skein::worker::shutdown_signal;

use crate::common::{fast_config, test_store, test_worker, RecordingPageSink, RecordingRekeyDriver};

#[tokio::test]
async fn test_run_loop_completes_rekey_and_shuts_down() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let driver = RecordingRekeyDriver::new();
    let worker = test_worker(&store, builtin_registry(sink.clone(), driver.clone()), &sink);
    let nics = vec!["nic-a".to_string(), "nic-b".to_string(), "nic-c".to_string()];
    let rekey = SubnetRekey::assemble(store.as_ref(), &nics, None).await.unwrap();

    let (shutdown_tx, shutdown_rx) = shutdown_signal();
    let loop_worker = worker.clone();
    let handle = tokio::spawn(async move { loop_worker.run(fast_config(), shutdown_rx).await });

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        while store.get_strand(rekey.id).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "rekey did not finish under the run loop");

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run loop did not stop")
        .unwrap();
    assert!(result.is_ok());

    assert_eq!(driver.calls().len(), 9);
    assert!(store.list_strands(&StrandFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_loop_picks_up_new_work() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let driver = RecordingRekeyDriver::new();
    let worker = test_worker(&store, builtin_registry(sink.clone(), driver.clone()), &sink);

    let (shutdown_tx, shutdown_rx) = shutdown_signal();
    let loop_worker = worker.clone();
    let handle = tokio::spawn(async move { loop_worker.run(fast_config(), shutdown_rx).await });

    // Inserted after the loop started and found nothing to do.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let child = store
        .insert_strand(
            NewStrand::new("NicRekey")
                .with_label("setup_inbound")
                .with_frame(Frame::new().with("nic", json!("nic-z"))),
        )
        .await
        .unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while store.get_strand(child.id).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(driver.calls().len(), 1);
}
