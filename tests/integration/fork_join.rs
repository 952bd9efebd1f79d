//! Test: a parent buds children, joins on them, and continues exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use skein::models::{Frame, NewStrand};
use skein::prog::{fan_out, Flow, Join, Prog, ProgError, ProgRegistry, ProgResult, StrandContext};
use skein::storage::{StrandFilter, StrandStore};

use crate::common::{test_store, test_worker, tick_until_gone, RecordingPageSink};

/// Buds `width` squarers and sums their results.
#[derive(Default)]
struct Fan {
    after_runs: AtomicUsize,
    result: Mutex<Option<Value>>,
}

#[async_trait]
impl Prog for Fan {
    fn name(&self) -> &str {
        "Fan"
    }

    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
        match label {
            "start" => {
                if ctx.leaf().await? {
                    let width: u64 = ctx.require("width")?;
                    let frames: Vec<Frame> = (1..=width).map(|n| Frame::new().with("n", n)).collect();
                    fan_out(ctx, "Square", "start", frames);
                }
                Ok(Flow::hop("join"))
            }
            "join" => Join::to("after").collecting("squares").poll(ctx).await,
            "after" => {
                self.after_runs.fetch_add(1, Ordering::SeqCst);
                let squares: Vec<u64> = ctx.get("squares")?.unwrap_or_default();
                let result = json!({ "sum": squares.iter().sum::<u64>(), "count": squares.len() });
                *self.result.lock().unwrap() = Some(result.clone());
                Ok(Flow::pop(result))
            }
            other => Err(ProgError::unknown_label(other)),
        }
    }
}

struct Square;

#[async_trait]
impl Prog for Square {
    fn name(&self) -> &str {
        "Square"
    }

    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
        match label {
            "start" => {
                let n: u64 = ctx.require("n")?;
                Ok(Flow::pop(n * n))
            }
            other => Err(ProgError::unknown_label(other)),
        }
    }
}

fn setup() -> (Arc<Fan>, ProgRegistry) {
    let fan = Arc::new(Fan::default());
    let mut registry = ProgRegistry::new().with(Square);
    registry.register_arc(fan.clone());
    (fan, registry)
}

#[tokio::test]
async fn test_fan_out_two_children_joins_once() {
    let store = test_store();
    let (fan, registry) = setup();
    let worker = test_worker(&store, registry, &RecordingPageSink::new());
    let parent = store
        .insert_strand(NewStrand::new("Fan").with_frame(Frame::new().with("width", 2)))
        .await
        .unwrap();

    tick_until_gone(&worker, &store, parent.id, 10).await;

    assert_eq!(fan.after_runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        fan.result.lock().unwrap().clone(),
        Some(json!({ "sum": 5, "count": 2 }))
    );
    let leftovers = store.list_strands(&StrandFilter::default()).await.unwrap();
    assert!(leftovers.is_empty(), "children should be reaped: {leftovers:?}");
}

#[tokio::test]
async fn test_parent_waits_while_children_run() {
    let store = test_store();
    let (fan, registry) = setup();
    let worker = test_worker(&store, registry, &RecordingPageSink::new());
    let parent = store
        .insert_strand(NewStrand::new("Fan").with_frame(Frame::new().with("width", 3)))
        .await
        .unwrap();

    // First tick only knows about the parent: it buds and then waits.
    let report = worker.tick(&crate::common::fast_config()).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.exhausted, 1);

    let waiting = store.get_strand(parent.id).await.unwrap().unwrap();
    assert_eq!(waiting.label, "join");
    assert_eq!(store.count_children(parent.id).await.unwrap(), 3);
    assert_eq!(fan.after_runs.load(Ordering::SeqCst), 0);

    tick_until_gone(&worker, &store, parent.id, 10).await;
    assert_eq!(fan.after_runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        fan.result.lock().unwrap().clone(),
        Some(json!({ "sum": 14, "count": 3 }))
    );
}

#[tokio::test]
async fn test_join_without_children_passes_straight_through() {
    let store = test_store();
    let (fan, registry) = setup();
    let worker = test_worker(&store, registry, &RecordingPageSink::new());
    let parent = store
        .insert_strand(NewStrand::new("Fan").with_frame(Frame::new().with("width", 0)))
        .await
        .unwrap();

    let outcome = worker
        .run_strand(parent.id, std::time::Duration::from_secs(1))
        .await
        .unwrap();
    assert!(matches!(outcome, skein::worker::RunOutcome::Exited { deleted: true, .. }));
    assert_eq!(
        fan.result.lock().unwrap().clone(),
        Some(json!({ "sum": 0, "count": 0 }))
    );
}
