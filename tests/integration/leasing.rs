//! Test: a strand runs on at most one worker, and its lease is always
//! given back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skein::models::NewStrand;
use skein::prog::{Flow, Prog, ProgError, ProgRegistry, ProgResult, StrandContext};
use skein::storage::{LeaseAttempt, MemoryStore, StrandStore};
use skein::worker::{EngineError, RunOutcome};
use tokio::task::JoinSet;

use crate::common::{test_store, test_worker, RecordingPageSink};

/// Tracks how many invocations overlap.
#[derive(Default)]
struct Exclusive {
    active: AtomicUsize,
    max_active: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait]
impl Prog for Exclusive {
    fn name(&self) -> &str {
        "Exclusive"
    }

    async fn run_label(&self, label: &str, _ctx: &mut StrandContext) -> ProgResult {
        if label != "start" {
            return Err(ProgError::unknown_label(label));
        }
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(Flow::nap(60))
    }
}

/// Fails or panics depending on the label.
struct Faulty;

#[async_trait]
impl Prog for Faulty {
    fn name(&self) -> &str {
        "Faulty"
    }

    async fn run_label(&self, label: &str, _ctx: &mut StrandContext) -> ProgResult {
        match label {
            "fail" => Err(ProgError::failed("upstream refused")),
            "panic" => panic!("handler exploded"),
            other => Err(ProgError::unknown_label(other)),
        }
    }
}

/// Loses its own lease mid-label by letting it expire and having
/// someone else take it.
struct Stall {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Prog for Stall {
    fn name(&self) -> &str {
        "Stall"
    }

    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
        if label != "start" {
            return Err(ProgError::unknown_label(label));
        }
        self.store.advance(Duration::from_secs(121));
        let stolen = self
            .store
            .acquire_lease(ctx.id(), chrono::Duration::seconds(120))
            .await?;
        assert!(matches!(stolen, LeaseAttempt::Acquired { .. }));
        Ok(Flow::hop("after"))
    }
}

#[tokio::test]
async fn test_concurrent_runs_are_mutually_exclusive() {
    let store = test_store();
    let prog = Arc::new(Exclusive::default());
    let mut registry = ProgRegistry::new();
    registry.register_arc(prog.clone());
    let worker = test_worker(&store, registry, &RecordingPageSink::new());
    let strand = store.insert_strand(NewStrand::new("Exclusive")).await.unwrap();

    let mut runs = JoinSet::new();
    for _ in 0..8 {
        let worker = worker.clone();
        runs.spawn(async move { worker.run_strand(strand.id, Duration::from_secs(1)).await });
    }

    let mut busy = 0;
    while let Some(result) = runs.join_next().await {
        match result.unwrap().unwrap() {
            RunOutcome::Busy => busy += 1,
            RunOutcome::Napped(60) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(prog.max_active.load(Ordering::SeqCst), 1);
    assert!(busy >= 1, "at least one run should have found the lease held");
    assert_eq!(busy + prog.runs.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_lease_released_after_handler_error() {
    let store = test_store();
    let worker = test_worker(&store, ProgRegistry::new().with(Faulty), &RecordingPageSink::new());
    let strand = store
        .insert_strand(NewStrand::new("Faulty").with_label("fail"))
        .await
        .unwrap();

    let err = worker
        .run_strand(strand.id, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Prog { ref label, .. } if label == "fail"));

    let reloaded = store.get_strand(strand.id).await.unwrap().unwrap();
    assert!(reloaded.lease.is_none());
    assert_eq!(reloaded.label, "fail");
}

#[tokio::test]
async fn test_lease_released_after_panic() {
    let store = test_store();
    let worker = test_worker(&store, ProgRegistry::new().with(Faulty), &RecordingPageSink::new());
    let strand = store
        .insert_strand(NewStrand::new("Faulty").with_label("panic"))
        .await
        .unwrap();

    let err = worker
        .run_strand(strand.id, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Panicked { ref message, .. } if message.contains("exploded")));
    assert!(err.is_fatal());
    assert!(store.get_strand(strand.id).await.unwrap().unwrap().lease.is_none());
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let store = test_store();
    let prog = Arc::new(Exclusive::default());
    let mut registry = ProgRegistry::new();
    registry.register_arc(prog.clone());
    let worker = test_worker(&store, registry, &RecordingPageSink::new());
    let strand = store.insert_strand(NewStrand::new("Exclusive")).await.unwrap();

    // A worker that crashed while holding the lease.
    let attempt = store
        .acquire_lease(strand.id, chrono::Duration::seconds(120))
        .await
        .unwrap();
    assert!(matches!(attempt, LeaseAttempt::Acquired { .. }));

    let outcome = worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Busy);
    assert_eq!(prog.runs.load(Ordering::SeqCst), 0);

    store.advance(Duration::from_secs(121));
    let outcome = worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Napped(60));
    assert_eq!(prog.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lost_lease_is_integrity_violation() {
    let store = test_store();
    let registry = ProgRegistry::new().with(Stall {
        store: store.clone(),
    });
    let worker = test_worker(&store, registry, &RecordingPageSink::new());
    let strand = store.insert_strand(NewStrand::new("Stall")).await.unwrap();

    let err = worker
        .run_strand(strand.id, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LeaseIntegrityViolated { strand_id } if strand_id == strand.id));
    assert!(err.is_fatal());

    // The label did not advance under the stolen lease.
    let reloaded = store.get_strand(strand.id).await.unwrap().unwrap();
    assert_eq!(reloaded.label, "start");
}
