//! The strand: one persisted instance of a running workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Frame;

/// Label every workflow starts at unless told otherwise.
pub const START_LABEL: &str = "start";

/// A persisted workflow instance.
///
/// A strand is mutated only by the worker holding its lease. The presence
/// of `exitval` marks it terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strand {
    /// Stable identifier, often shared with the resource the strand manages.
    pub id: Uuid,

    /// Strand that budded this one. `None` for roots.
    pub parent_id: Option<Uuid>,

    /// Name of the workflow type to load.
    pub prog: String,

    /// Current step within the workflow type.
    pub label: String,

    /// Frame stack. The last element is the innermost active frame.
    pub stack: Vec<Frame>,

    /// Lease expiry. `Some` while a worker owns execution rights.
    pub lease: Option<DateTime<Utc>>,

    /// The strand must not run before this time.
    pub schedule: DateTime<Utc>,

    /// Final value. Set once, when the workflow completes.
    pub exitval: Option<Value>,

    /// Value handed back by the last popped sub-frame.
    pub retval: Option<Value>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Strand {
    /// Returns true once the workflow has completed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.exitval.is_some()
    }

    /// Returns true if no other strand owns this one.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns true if a lease is held and has not expired at `now`.
    #[must_use]
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some_and(|lease| lease >= now)
    }

    /// Returns true if the scheduler should pick the strand up at `now`.
    #[must_use]
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.schedule <= now && !self.is_leased_at(now)
    }

    /// Innermost active frame.
    #[must_use]
    pub fn top_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }
}

/// Parameters for creating a strand.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStrand {
    /// Explicit id; a fresh v4 id is generated when `None`.
    pub id: Option<Uuid>,
    /// Owning parent for join purposes.
    pub parent_id: Option<Uuid>,
    /// Workflow type name.
    pub prog: String,
    /// Initial label.
    pub label: String,
    /// Initial (bottom) frame.
    pub frame: Frame,
    /// Earliest run time; store time `now` when `None`.
    pub schedule: Option<DateTime<Utc>>,
}

impl NewStrand {
    /// Creates parameters for a root strand of `prog` at the start label.
    #[must_use]
    pub fn new(prog: impl Into<String>) -> Self {
        Self {
            id: None,
            parent_id: None,
            prog: prog.into(),
            label: START_LABEL.to_string(),
            frame: Frame::default(),
            schedule: None,
        }
    }

    /// Uses a caller-chosen id.
    #[must_use]
    pub const fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the owning parent.
    #[must_use]
    pub const fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Starts at `label` instead of the start label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sets the initial frame.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = frame;
        self
    }

    /// Delays the first run.
    #[must_use]
    pub const fn scheduled_at(mut self, schedule: DateTime<Utc>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Materializes the strand row at store time `now`.
    #[must_use]
    pub fn into_strand(self, now: DateTime<Utc>) -> Strand {
        Strand {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            parent_id: self.parent_id,
            prog: self.prog,
            label: self.label,
            stack: vec![self.frame],
            lease: None,
            schedule: self.schedule.unwrap_or(now),
            exitval: None,
            retval: None,
            created_at: now,
        }
    }
}
