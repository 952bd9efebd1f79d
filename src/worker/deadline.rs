//! Deadline escalation.
//!
//! Runs before every label invocation and looks at every frame of the
//! stack, not only the top one, so a stalled sub-phase pages even while
//! the strand is busy elsewhere.

use chrono::{DateTime, Utc};

use crate::models::{Page, Strand};
use crate::storage::{StorageError, StrandStore};

/// What a deadline check changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadlineReport {
    /// Pages raised for newly missed deadlines.
    pub raised: Vec<Page>,
    /// Pages resolved because their target label is about to run.
    pub resolved: Vec<Page>,
    /// Whether any frame was modified and the stack must be persisted.
    pub changed: bool,
}

/// Summary of the page raised when `strand` misses the deadline for `target`.
#[must_use]
pub fn deadline_summary(strand: &Strand, target: &str) -> String {
    format!(
        "{} {} missed its deadline to reach {target}",
        strand.prog, strand.id
    )
}

/// Checks every frame of `strand` against its current label at store time `now`.
///
/// - A frame whose `deadline_target` is the current label is disarmed and
///   its page, if any, resolved.
/// - Otherwise a frame whose deadline passed gets a page, unless it already
///   references one.
///
/// Frames are edited in place; the caller persists the stack when
/// `changed` is set.
///
/// # Errors
///
/// Returns `StorageError` if a page cannot be created or resolved.
pub async fn check_deadlines(
    store: &dyn StrandStore,
    strand: &mut Strand,
    now: DateTime<Utc>,
) -> Result<DeadlineReport, StorageError> {
    let mut report = DeadlineReport::default();

    for index in 0..strand.stack.len() {
        let frame = &strand.stack[index];
        if frame.deadline_at.is_none() {
            continue;
        }

        if frame.deadline_target.as_deref() == Some(strand.label.as_str()) {
            let page_id = strand.stack[index].page_id.take();
            strand.stack[index].clear_deadline();
            report.changed = true;
            if let Some(page_id) = page_id {
                let open = store.get_page(page_id).await?.is_some_and(|p| p.is_open());
                if open {
                    if let Some(page) = store.resolve_page(page_id).await? {
                        report.resolved.push(page);
                    }
                }
            }
        } else if frame.is_deadline_missed_at(now) && frame.page_id.is_none() {
            let target = frame.deadline_target.clone().unwrap_or_default();
            let page = store.create_page(&deadline_summary(strand, &target)).await?;
            tracing::warn!(
                strand_id = %strand.id,
                prog = %strand.prog,
                label = %strand.label,
                target = %target,
                page_id = %page.id,
                "Deadline missed"
            );
            strand.stack[index].page_id = Some(page.id);
            report.raised.push(page);
            report.changed = true;
        }
    }

    Ok(report)
}
