//! Test: subnet rekey runs its phases in order across every nic.

use std::time::Duration;

use serde_json::json;
use skein::models::{Frame, NewStrand};
use skein::progs::{builtin_registry, RekeyPhase, SubnetRekey};
use skein::storage::{StrandFilter, StrandStore};
use skein::worker::Worker;

use crate::common::{
    fast_config, test_store, test_worker, tick_until_gone, FailOn, FlakyStore, RecordingPageSink,
    RecordingRekeyDriver,
};

fn nics() -> Vec<String> {
    vec!["nic-a".to_string(), "nic-b".to_string()]
}

fn touched_by_phase(driver: &RecordingRekeyDriver, phase: RekeyPhase) -> Vec<String> {
    let mut touched: Vec<String> = driver
        .calls()
        .into_iter()
        .filter(|(p, _)| *p == phase)
        .map(|(_, nic)| nic)
        .collect();
    touched.sort_unstable();
    touched
}

#[tokio::test]
async fn test_phases_never_overlap() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let driver = RecordingRekeyDriver::new();
    let worker = test_worker(&store, builtin_registry(sink.clone(), driver.clone()), &sink);
    let rekey = SubnetRekey::assemble(store.as_ref(), &nics(), None).await.unwrap();

    tick_until_gone(&worker, &store, rekey.id, 20).await;

    let calls = driver.calls();
    assert_eq!(calls.len(), 6);
    let phases: Vec<RekeyPhase> = calls.iter().map(|(phase, _)| *phase).collect();
    let mut sorted = phases.clone();
    sorted.sort_by_key(|phase| RekeyPhase::ALL.iter().position(|p| p == phase));
    assert_eq!(phases, sorted, "a phase started before the previous one finished");
    for phase in RekeyPhase::ALL {
        let mut touched: Vec<&str> = calls
            .iter()
            .filter(|(p, _)| *p == phase)
            .map(|(_, nic)| nic.as_str())
            .collect();
        touched.sort_unstable();
        assert_eq!(touched, vec!["nic-a", "nic-b"], "phase {phase}");
    }
    assert!(sink.created().is_empty());
}

#[tokio::test]
async fn test_destroy_cancels_children() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let driver = RecordingRekeyDriver::new();
    let worker = test_worker(&store, builtin_registry(sink.clone(), driver.clone()), &sink);
    let rekey = SubnetRekey::assemble(store.as_ref(), &nics(), None).await.unwrap();

    // Buds the inbound children, then waits on them.
    worker.tick(&fast_config()).await.unwrap();
    assert_eq!(store.count_children(rekey.id).await.unwrap(), 2);

    worker.increment(rekey.id, "destroy").await.unwrap();
    tick_until_gone(&worker, &store, rekey.id, 10).await;

    assert!(driver
        .calls()
        .iter()
        .all(|(phase, _)| *phase == RekeyPhase::SetupInbound));
    assert!(store.list_strands(&StrandFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missed_rekey_deadline_pages() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let driver = RecordingRekeyDriver::new();
    let worker = test_worker(&store, builtin_registry(sink.clone(), driver.clone()), &sink);
    let rekey = SubnetRekey::assemble(store.as_ref(), &nics(), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    // The parent leases first and buds; children are not run yet.
    worker.tick(&fast_config()).await.unwrap();
    store.advance(Duration::from_secs(61));

    tick_until_gone(&worker, &store, rekey.id, 20).await;

    let created = sink.created();
    assert_eq!(created.len(), 1);
    assert!(created[0].summary.contains(&rekey.id.to_string()));
    let resolved = sink.resolved();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, created[0].id);
}

#[tokio::test]
async fn test_failed_fan_out_write_buds_nothing() {
    let memory = test_store();
    let store = FlakyStore::new(memory.clone(), FailOn::FanOut, 1);
    let sink = RecordingPageSink::new();
    let driver = RecordingRekeyDriver::new();
    let worker = Worker::new(store.clone(), builtin_registry(sink.clone(), driver.clone()))
        .with_page_sink(sink.clone());
    let nics = vec!["nic-a".to_string(), "nic-b".to_string(), "nic-c".to_string()];
    let rekey = SubnetRekey::assemble(store.as_ref(), &nics, None).await.unwrap();

    let err = worker
        .run_strand(rekey.id, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(!err.is_fatal(), "{err}");
    assert_eq!(memory.count_children(rekey.id).await.unwrap(), 0);
    let stalled = memory.get_strand(rekey.id).await.unwrap().unwrap();
    assert_eq!(stalled.label, "setup_inbound");
    assert!(stalled.lease.is_none());

    tick_until_gone(&worker, &memory, rekey.id, 20).await;
    for phase in RekeyPhase::ALL {
        assert_eq!(touched_by_phase(&driver, phase), nics, "phase {phase}");
    }
}

#[tokio::test]
async fn test_failed_join_write_keeps_child_results() {
    let memory = test_store();
    let store = FlakyStore::new(memory.clone(), FailOn::Reap, 2);
    let sink = RecordingPageSink::new();
    let driver = RecordingRekeyDriver::new();
    let worker = Worker::new(store.clone(), builtin_registry(sink.clone(), driver.clone()))
        .with_page_sink(sink.clone());

    // Owned by a parked holder so the finished rekey keeps its exitval.
    let later = memory.now().await.unwrap() + chrono::Duration::days(1);
    let holder = memory
        .insert_strand(NewStrand::new("Holder").scheduled_at(later))
        .await
        .unwrap();
    let rekey = memory
        .insert_strand(
            NewStrand::new(SubnetRekey::NAME)
                .with_parent(holder.id)
                .with_frame(Frame::new().with("nics", json!(nics()))),
        )
        .await
        .unwrap();

    let mut exitval = None;
    for _ in 0..20 {
        exitval = memory.get_strand(rekey.id).await.unwrap().unwrap().exitval;
        if exitval.is_some() {
            break;
        }
        worker.tick(&fast_config()).await.unwrap();
    }

    let exitval = exitval.expect("rekey did not finish");
    let completed = exitval["completed"].as_array().unwrap();
    assert_eq!(completed.len(), 6, "child results lost: {exitval}");
    for phase in RekeyPhase::ALL {
        assert_eq!(touched_by_phase(&driver, phase), nics(), "phase {phase}");
    }
}
