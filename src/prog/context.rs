//! The view of a strand that a label handler works with.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Frame, NewStrand, Strand};
use crate::storage::{LabelWrites, ReapedChild, StrandStore};
use crate::worker::mailbox;

use super::ProgError;

/// Handle passed to every label invocation.
///
/// Frame edits made through [`frame_mut`](Self::frame_mut), budded and
/// reaped children, and consumed semaphores are all persisted together
/// with the control signal the handler returns. A handler that errors
/// leaves none of them behind.
pub struct StrandContext {
    store: Arc<dyn StrandStore>,
    strand: Strand,
    stack: Vec<Frame>,
    now: DateTime<Utc>,
    writes: LabelWrites,
}

impl StrandContext {
    /// Creates a context over a snapshot of `strand` taken at store time `now`.
    #[must_use]
    pub fn new(store: Arc<dyn StrandStore>, strand: Strand, now: DateTime<Utc>) -> Self {
        let mut stack = strand.stack.clone();
        if stack.is_empty() {
            stack.push(Frame::default());
        }
        Self {
            store,
            strand,
            stack,
            now,
            writes: LabelWrites::default(),
        }
    }

    /// Id of the running strand.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.strand.id
    }

    /// Prog name of the running strand.
    #[must_use]
    pub fn prog(&self) -> &str {
        &self.strand.prog
    }

    /// Label being executed.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.strand.label
    }

    /// Parent strand, if this one was budded.
    #[must_use]
    pub const fn parent_id(&self) -> Option<Uuid> {
        self.strand.parent_id
    }

    /// Store time at the start of this invocation.
    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The strand as loaded for this invocation.
    #[must_use]
    pub const fn strand(&self) -> &Strand {
        &self.strand
    }

    /// The store, for domain work beyond signalling and fork/join.
    #[must_use]
    pub fn store(&self) -> &dyn StrandStore {
        self.store.as_ref()
    }

    /// Innermost frame.
    #[must_use]
    pub fn frame(&self) -> &Frame {
        // The stack is never empty; `new` guarantees a bottom frame.
        &self.stack[self.stack.len() - 1]
    }

    /// Innermost frame, mutably.
    pub fn frame_mut(&mut self) -> &mut Frame {
        let top = self.stack.len() - 1;
        &mut self.stack[top]
    }

    /// Whole stack, outermost first.
    #[must_use]
    pub fn stack(&self) -> &[Frame] {
        &self.stack
    }

    /// Reads a key of the innermost frame.
    ///
    /// # Errors
    ///
    /// Returns `ProgError::Payload` if the key holds a different shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ProgError> {
        Ok(self.frame().get(key)?)
    }

    /// Reads a key that the workflow requires to be present.
    ///
    /// # Errors
    ///
    /// Returns `ProgError::Failed` if the key is missing.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ProgError> {
        self.get(key)?.ok_or_else(|| {
            ProgError::failed(format!(
                "{} frame at label {} is missing '{key}'",
                self.strand.prog, self.strand.label
            ))
        })
    }

    /// Value returned by the last sub-frame that popped back to this label.
    #[must_use]
    pub const fn retval(&self) -> Option<&Value> {
        self.strand.retval.as_ref()
    }

    /// Arms a deadline on the innermost frame: unless `target` runs within
    /// `within`, the strand pages.
    pub fn register_deadline(&mut self, target: &str, within: Duration) {
        let within = chrono::Duration::from_std(within).unwrap_or(chrono::Duration::MAX);
        let at = self.now.checked_add_signed(within).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.frame_mut().set_deadline(target, at);
    }

    fn pending(&self, name: &str) -> u64 {
        self.writes.consumed.get(name).copied().unwrap_or(0)
    }

    /// Consumes one pending increment of the named semaphore.
    ///
    /// # Errors
    ///
    /// Returns `ProgError::Storage` if the store fails.
    pub async fn check_and_consume(&mut self, name: &str) -> Result<bool, ProgError> {
        let count = self.store.semaphore_count(self.id(), name).await?;
        if count <= self.pending(name) {
            return Ok(false);
        }
        *self.writes.consumed.entry(name.to_string()).or_insert(0) += 1;
        tracing::debug!(strand_id = %self.id(), semaphore = %name, "Semaphore consumed");
        Ok(true)
    }

    /// Tests the named semaphore without consuming it.
    ///
    /// # Errors
    ///
    /// Returns `ProgError::Storage` if the store fails.
    pub async fn is_set(&self, name: &str) -> Result<bool, ProgError> {
        Ok(self.store.semaphore_count(self.id(), name).await? > self.pending(name))
    }

    /// Signals another strand (typically the parent).
    ///
    /// # Errors
    ///
    /// Returns `ProgError::Storage` if the target does not exist.
    pub async fn signal(&self, strand_id: Uuid, name: &str) -> Result<(), ProgError> {
        mailbox::increment(self.store(), strand_id, name).await?;
        Ok(())
    }

    /// Spawns a child strand owned by this one. Does not advance this strand.
    ///
    /// The child is inserted when the label's control signal is persisted.
    pub fn bud(&mut self, prog: &str, frame: Frame, label: &str) -> Strand {
        let new = NewStrand::new(prog)
            .with_id(Uuid::new_v4())
            .with_parent(self.id())
            .with_label(label)
            .with_frame(frame);
        let child = new.clone().into_strand(self.now);
        self.writes.budded.push(new);
        tracing::debug!(
            strand_id = %self.id(),
            child_id = %child.id,
            child_prog = %prog,
            child_label = %label,
            "Budded child strand"
        );
        child
    }

    /// Takes every finished child and returns their final values. The
    /// children are deleted when the label's control signal is persisted.
    ///
    /// # Errors
    ///
    /// Returns `ProgError::Storage` if the store fails.
    pub async fn reap(&mut self) -> Result<Vec<ReapedChild>, ProgError> {
        let mut reaped = self.store.finished_children(self.id()).await?;
        reaped.retain(|child| !self.writes.reaped.contains(&child.id));
        self.writes.reaped.extend(reaped.iter().map(|child| child.id));
        Ok(reaped)
    }

    /// True when no unreaped children remain, counting this label's buds.
    ///
    /// # Errors
    ///
    /// Returns `ProgError::Storage` if the store fails.
    pub async fn leaf(&self) -> Result<bool, ProgError> {
        let stored = self.store.count_children(self.id()).await?;
        Ok(stored + self.writes.budded.len() <= self.writes.reaped.len())
    }

    /// Consumes the context, yielding the edited stack and the label's
    /// other writes.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Frame>, LabelWrites) {
        (self.stack, self.writes)
    }
}

impl std::fmt::Debug for StrandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrandContext")
            .field("id", &self.strand.id)
            .field("prog", &self.strand.prog)
            .field("label", &self.strand.label)
            .field("depth", &self.stack.len())
            .finish_non_exhaustive()
    }
}
