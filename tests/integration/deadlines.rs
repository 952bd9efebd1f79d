//! Test: a frame deadline raises exactly one page, which resolves once
//! the strand reaches the target label.

use std::time::Duration;

use async_trait::async_trait;
use skein::models::NewStrand;
use skein::prog::{Flow, Prog, ProgError, ProgRegistry, ProgResult, StrandContext};
use skein::storage::StrandStore;
use skein::worker::RunOutcome;

use crate::common::{test_store, test_worker, RecordingPageSink};

/// Must get from `start` to `done` within a minute; waits for `go`.
struct Slow;

#[async_trait]
impl Prog for Slow {
    fn name(&self) -> &str {
        "Slow"
    }

    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
        match label {
            "start" => {
                ctx.register_deadline("done", Duration::from_secs(60));
                Ok(Flow::hop("work"))
            }
            "work" => {
                if ctx.check_and_consume("go").await? {
                    Ok(Flow::hop("done"))
                } else {
                    Ok(Flow::nap(30))
                }
            }
            "done" => Ok(Flow::pop("finished")),
            other => Err(ProgError::unknown_label(other)),
        }
    }
}

#[tokio::test]
async fn test_missed_deadline_pages_once_and_resolves() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let worker = test_worker(&store, ProgRegistry::new().with(Slow), &sink);
    let strand = store.insert_strand(NewStrand::new("Slow")).await.unwrap();

    let outcome = worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Napped(30));
    assert!(store.list_pages(false).await.unwrap().is_empty());

    // Inside the deadline: no page.
    store.advance(Duration::from_secs(31));
    worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert!(store.list_pages(false).await.unwrap().is_empty());

    // Past it: one page, referenced from the frame.
    store.advance(Duration::from_secs(31));
    worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    let pages = store.list_pages(true).await.unwrap();
    assert_eq!(pages.len(), 1);
    assert!(pages[0].summary.contains("done"));
    let frame_page = store.get_strand(strand.id).await.unwrap().unwrap().stack[0].page_id;
    assert_eq!(frame_page, Some(pages[0].id));

    // Still late: no second page.
    store.advance(Duration::from_secs(31));
    worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(store.list_pages(false).await.unwrap().len(), 1);
    assert_eq!(sink.created().len(), 1);

    worker.increment(strand.id, "go").await.unwrap();
    store.advance(Duration::from_secs(31));
    let outcome = worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Exited { deleted: true, .. }));

    assert!(store.list_pages(true).await.unwrap().is_empty());
    let resolved = sink.resolved();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, pages[0].id);
}

#[tokio::test]
async fn test_reaching_target_in_time_disarms_deadline() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let worker = test_worker(&store, ProgRegistry::new().with(Slow), &sink);
    let strand = store.insert_strand(NewStrand::new("Slow")).await.unwrap();

    worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    let armed = store.get_strand(strand.id).await.unwrap().unwrap();
    assert_eq!(armed.stack[0].deadline_target.as_deref(), Some("done"));

    worker.increment(strand.id, "go").await.unwrap();
    store.advance(Duration::from_secs(31));
    let outcome = worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Exited { .. }));

    assert!(store.list_pages(false).await.unwrap().is_empty());
    assert!(sink.created().is_empty());
    assert!(sink.resolved().is_empty());
}

#[tokio::test]
async fn test_manually_resolved_page_is_not_resolved_again() {
    let store = test_store();
    let sink = RecordingPageSink::new();
    let worker = test_worker(&store, ProgRegistry::new().with(Slow), &sink);
    let strand = store.insert_strand(NewStrand::new("Slow")).await.unwrap();

    worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    store.advance(Duration::from_secs(61));
    worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    let page = store.list_pages(true).await.unwrap().remove(0);

    worker.resolve_page(page.id).await.unwrap();
    assert_eq!(sink.resolved().len(), 1);

    worker.increment(strand.id, "go").await.unwrap();
    store.advance(Duration::from_secs(31));
    worker.run_strand(strand.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(sink.resolved().len(), 1);
    assert_eq!(store.list_pages(false).await.unwrap().len(), 1);
}
