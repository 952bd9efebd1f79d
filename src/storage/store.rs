//! The strand store contract.
//!
//! Every operation that changes a leased strand is a single conditional
//! update guarded by the lease token, so a worker whose lease was taken
//! over can never write through a stale view. The children and semaphores
//! a label touched are written in that same update, so a label either
//! commits all of its writes or none of them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Frame, NewStrand, Page, Strand};

use super::StorageError;

/// Proof of lease ownership: the expiry timestamp written at acquire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(DateTime<Utc>);

impl LeaseToken {
    /// Wraps a lease expiry read back from the store.
    #[must_use]
    pub const fn new(expires_at: DateTime<Utc>) -> Self {
        Self(expires_at)
    }

    /// When the lease expires.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Raw result of the acquire conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAttempt {
    /// The update matched; the caller now owns the strand.
    Acquired {
        /// Token to present on every guarded write and on release.
        token: LeaseToken,
        /// Whether the strand already has an `exitval`.
        exited: bool,
    },
    /// A live lease is held by someone else.
    Held,
    /// No such strand.
    NotFound,
}

/// One interpreted control signal, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Stay on the current label. `delay` is `None` for a donate.
    Nap {
        /// How long after the write the strand becomes due again.
        delay: Option<Duration>,
        /// Stack including any frame edits made by the handler.
        stack: Vec<Frame>,
    },
    /// Move to another label (and possibly another prog).
    Hop {
        /// Prog to run next.
        prog: String,
        /// Label to run next.
        label: String,
        /// Stack after applying the frame update.
        stack: Vec<Frame>,
        /// Value returned by a popped sub-frame, if any.
        retval: Option<Value>,
    },
    /// Complete the workflow. Roots are deleted with their semaphores.
    Exit {
        /// Final value.
        exitval: Value,
        /// Stack as it stood when the last frame popped.
        stack: Vec<Frame>,
    },
}

/// Writes a label made besides its control signal.
///
/// They are buffered while the handler runs and applied by
/// [`StrandStore::record_transition`] together with the transition, so a
/// handler error or a failed write leaves none of them behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelWrites {
    /// Children to insert. Ids are assigned before the write.
    pub budded: Vec<NewStrand>,
    /// Terminal children to delete, with their semaphores.
    pub reaped: Vec<Uuid>,
    /// Increments taken from the strand's own semaphores, by name.
    pub consumed: BTreeMap<String, u64>,
}

impl LabelWrites {
    /// Whether the label wrote nothing besides its transition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.budded.is_empty() && self.reaped.is_empty() && self.consumed.is_empty()
    }
}

/// What a persisted transition did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row was updated in place.
    Updated,
    /// The row was deleted (root strand exited).
    Deleted,
}

/// A terminal child, as seen by its parent when reaping.
#[derive(Debug, Clone, PartialEq)]
pub struct ReapedChild {
    /// Id of the deleted child.
    pub id: Uuid,
    /// Workflow type the child ran.
    pub prog: String,
    /// The child's final value.
    pub exitval: Value,
}

/// Filter for listing strands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrandFilter {
    /// Only strands running this prog.
    pub prog: Option<String>,
    /// Only direct children of this strand.
    pub parent_id: Option<Uuid>,
    /// Include strands that have exited but not been reaped.
    pub include_terminal: bool,
    /// Maximum rows returned.
    pub limit: usize,
}

impl Default for StrandFilter {
    fn default() -> Self {
        Self {
            prog: None,
            parent_id: None,
            include_terminal: true,
            limit: 100,
        }
    }
}

impl StrandFilter {
    pub(crate) fn matches(&self, strand: &Strand) -> bool {
        self.prog.as_ref().is_none_or(|p| *p == strand.prog)
            && self.parent_id.is_none_or(|p| strand.parent_id == Some(p))
            && (self.include_terminal || !strand.is_terminal())
    }
}

/// Durable storage for strands, semaphores and pages.
#[async_trait]
pub trait StrandStore: Send + Sync {
    /// The store's clock. All schedule, lease and deadline math uses it.
    async fn now(&self) -> Result<DateTime<Utc>, StorageError>;

    /// Inserts a new strand with a single bottom frame.
    async fn insert_strand(&self, new: NewStrand) -> Result<Strand, StorageError>;

    /// Loads a strand.
    async fn get_strand(&self, id: Uuid) -> Result<Option<Strand>, StorageError>;

    /// Lists strands ordered by schedule.
    async fn list_strands(&self, filter: &StrandFilter) -> Result<Vec<Strand>, StorageError>;

    /// Deletes a strand and its semaphores. Returns false if it did not exist.
    async fn delete_strand(&self, id: Uuid) -> Result<bool, StorageError>;

    /// Ids of non-terminal strands whose schedule has passed and whose
    /// lease is free, oldest schedule first.
    async fn due_strands(&self, limit: usize) -> Result<Vec<Uuid>, StorageError>;

    /// Conditionally takes the lease: succeeds only when the stored lease
    /// is null or expired, sets it to `now + ttl` and resets `schedule`
    /// to `now`.
    async fn acquire_lease(&self, id: Uuid, ttl: Duration) -> Result<LeaseAttempt, StorageError>;

    /// Clears the lease if it still equals `token`. Returns whether a row matched.
    async fn release_lease(&self, id: Uuid, token: LeaseToken) -> Result<bool, StorageError>;

    /// Persists one control signal for a strand leased under `token`,
    /// together with the label's other writes, atomically.
    async fn record_transition(
        &self,
        id: Uuid,
        token: LeaseToken,
        transition: Transition,
        writes: LabelWrites,
    ) -> Result<TransitionOutcome, StorageError>;

    /// Persists the stack of a strand leased under `token`.
    async fn update_stack(
        &self,
        id: Uuid,
        token: LeaseToken,
        stack: &[Frame],
    ) -> Result<(), StorageError>;

    /// Upserts the named semaphore and increments it. Returns the new count.
    async fn increment_semaphore(&self, strand_id: Uuid, name: &str) -> Result<u64, StorageError>;

    /// Atomically decrements the named semaphore if positive.
    async fn consume_semaphore(&self, strand_id: Uuid, name: &str) -> Result<bool, StorageError>;

    /// Current count of the named semaphore (0 if absent).
    async fn semaphore_count(&self, strand_id: Uuid, name: &str) -> Result<u64, StorageError>;

    /// Deletes every semaphore of a strand. Returns how many were removed.
    async fn clear_semaphores(&self, strand_id: Uuid) -> Result<u64, StorageError>;

    /// Number of direct children not yet reaped.
    async fn count_children(&self, parent_id: Uuid) -> Result<usize, StorageError>;

    /// Terminal direct children, oldest first. Nothing is deleted; reaping
    /// happens through [`LabelWrites::reaped`].
    async fn finished_children(&self, parent_id: Uuid) -> Result<Vec<ReapedChild>, StorageError>;

    /// Raises a new open page.
    async fn create_page(&self, summary: &str) -> Result<Page, StorageError>;

    /// Raises a page and inserts the strand that owns it, in one write.
    /// The page takes the strand's id. Neither row exists if either
    /// insert fails.
    async fn create_owned_page(
        &self,
        summary: &str,
        owner: NewStrand,
    ) -> Result<(Page, Strand), StorageError>;

    /// Loads a page.
    async fn get_page(&self, id: Uuid) -> Result<Option<Page>, StorageError>;

    /// Resolves a page. Already-resolved pages are returned unchanged.
    async fn resolve_page(&self, id: Uuid) -> Result<Option<Page>, StorageError>;

    /// Lists pages, oldest first.
    async fn list_pages(&self, open_only: bool) -> Result<Vec<Page>, StorageError>;
}
