//! Test: naps, exits, and what is left of a strand afterwards.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use skein::models::{Frame, NewStrand};
use skein::prog::{Flow, Prog, ProgError, ProgRegistry, ProgResult, StrandContext};
use skein::storage::StrandStore;
use skein::worker::RunOutcome;

use crate::common::{fast_config, test_store, test_worker, RecordingPageSink};

/// Naps once, then exits with how often it ran.
struct Sleepy;

#[async_trait]
impl Prog for Sleepy {
    fn name(&self) -> &str {
        "Sleepy"
    }

    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
        match label {
            "start" => Ok(Flow::hop("doze")),
            "doze" => {
                let dozed: u32 = ctx.get("dozed")?.unwrap_or(0);
                if dozed == 0 {
                    ctx.frame_mut().set("dozed", &1)?;
                    Ok(Flow::nap(60))
                } else {
                    Ok(Flow::pop(json!({ "dozed": dozed })))
                }
            }
            other => Err(ProgError::unknown_label(other)),
        }
    }
}

fn registry() -> ProgRegistry {
    ProgRegistry::new().with(Sleepy)
}

#[tokio::test]
async fn test_nap_sets_schedule_and_keeps_frame() {
    let store = test_store();
    let worker = test_worker(&store, registry(), &RecordingPageSink::new());
    let strand = store.insert_strand(NewStrand::new("Sleepy")).await.unwrap();

    let before = store.now().await.unwrap();
    let outcome = worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Napped(60));

    let napping = store.get_strand(strand.id).await.unwrap().unwrap();
    assert_eq!(napping.label, "doze");
    assert!(napping.schedule >= before + chrono::Duration::seconds(60));
    assert_eq!(napping.top_frame().unwrap().get::<u32>("dozed").unwrap(), Some(1));
    assert!(store.due_strands(10).await.unwrap().is_empty());

    store.advance(Duration::from_secs(61));
    assert_eq!(store.due_strands(10).await.unwrap(), vec![strand.id]);
}

#[tokio::test]
async fn test_napping_strand_is_skipped_by_tick() {
    let store = test_store();
    let worker = test_worker(&store, registry(), &RecordingPageSink::new());
    store.insert_strand(NewStrand::new("Sleepy")).await.unwrap();
    let config = fast_config();

    let first = worker.tick(&config).await.unwrap();
    assert_eq!((first.due, first.napped), (1, 1));

    let idle = worker.tick(&config).await.unwrap();
    assert_eq!(idle.due, 0);
    assert!(!idle.did_work());

    store.advance(Duration::from_secs(61));
    let last = worker.tick(&config).await.unwrap();
    assert_eq!((last.due, last.exited), (1, 1));
}

#[tokio::test]
async fn test_root_exit_deletes_strand_and_semaphores() {
    let store = test_store();
    let worker = test_worker(&store, registry(), &RecordingPageSink::new());
    let strand = store
        .insert_strand(NewStrand::new("Sleepy").with_label("doze").with_frame(Frame::new().with("dozed", 2)))
        .await
        .unwrap();
    worker.increment(strand.id, "noise").await.unwrap();

    let outcome = worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Exited {
            value: json!({ "dozed": 2 }),
            deleted: true
        }
    );
    assert!(store.get_strand(strand.id).await.unwrap().is_none());
    assert_eq!(store.semaphore_count(strand.id, "noise").await.unwrap(), 0);
}

#[tokio::test]
async fn test_child_exit_is_retained_for_parent() {
    let store = test_store();
    let worker = test_worker(&store, registry(), &RecordingPageSink::new());
    let parent = store.insert_strand(NewStrand::new("Sleepy")).await.unwrap();
    let child = store
        .insert_strand(
            NewStrand::new("Sleepy")
                .with_parent(parent.id)
                .with_label("doze")
                .with_frame(Frame::new().with("dozed", 1)),
        )
        .await
        .unwrap();

    let outcome = worker.run_strand(child.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Exited {
            value: json!({ "dozed": 1 }),
            deleted: false
        }
    );

    let exited = store.get_strand(child.id).await.unwrap().unwrap();
    assert!(exited.is_terminal());
    assert_eq!(exited.exitval, Some(json!({ "dozed": 1 })));
    assert!(exited.lease.is_none());
    assert!(!store.due_strands(10).await.unwrap().contains(&child.id));
}

#[tokio::test]
async fn test_late_signal_to_exited_child_is_cleared() {
    let store = test_store();
    let worker = test_worker(&store, registry(), &RecordingPageSink::new());
    let parent = store.insert_strand(NewStrand::new("Sleepy")).await.unwrap();
    let child = store
        .insert_strand(
            NewStrand::new("Sleepy")
                .with_parent(parent.id)
                .with_label("doze")
                .with_frame(Frame::new().with("dozed", 1)),
        )
        .await
        .unwrap();
    worker.run_strand(child.id, Duration::from_secs(1)).await.unwrap();

    worker.increment(child.id, "destroy").await.unwrap();
    let outcome = worker.run_strand(child.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome, RunOutcome::AlreadyExited);
    assert_eq!(store.semaphore_count(child.id, "destroy").await.unwrap(), 0);
    assert!(store.get_strand(child.id).await.unwrap().is_some());
}
