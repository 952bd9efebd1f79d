//! Control signals returned by label handlers.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::Frame;

/// The control signal a label handler returns.
///
/// Exactly one is produced per invocation: the handler's return type
/// leaves no way to emit none or several.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Suspend for the given number of seconds. Zero donates: the worker
    /// re-invokes the same label without giving up the lease.
    Nap(u64),
    /// Move to another label.
    Hop(Hop),
    /// Pop the current frame with a value. Popping the last frame exits.
    Pop(Value),
}

impl Flow {
    /// Suspends for `seconds`.
    #[must_use]
    pub const fn nap(seconds: u64) -> Self {
        Self::Nap(seconds)
    }

    /// Yields to children and polls again on the same lease.
    #[must_use]
    pub const fn donate() -> Self {
        Self::Nap(0)
    }

    /// Hops to `label`, leaving the frame as the handler left it.
    #[must_use]
    pub fn hop(label: impl Into<String>) -> Self {
        Self::Hop(Hop::new(label))
    }

    /// Pops with a JSON value.
    #[must_use]
    pub fn pop(value: impl Into<Value>) -> Self {
        Self::Pop(value.into())
    }

    /// Pops with any serializable value; unserializable values pop `null`.
    #[must_use]
    pub fn pop_with<T: Serialize>(value: &T) -> Self {
        Self::Pop(serde_json::to_value(value).unwrap_or_default())
    }

    /// Enters a sub-phase: pushes `frame` and continues at `label` of `prog`.
    /// When that frame pops, control returns to the current label with the
    /// popped value available as `retval`.
    #[must_use]
    pub fn push(prog: impl Into<String>, frame: Frame, label: impl Into<String>) -> Self {
        Self::Hop(Hop::new(label).with_prog(prog).pushing(frame))
    }

    /// Returns true for `Nap(0)`.
    #[must_use]
    pub const fn is_donate(&self) -> bool {
        matches!(self, Self::Nap(0))
    }

    /// Short name used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Nap(0) => "donate",
            Self::Nap(_) => "nap",
            Self::Hop(_) => "hop",
            Self::Pop(_) => "pop",
        }
    }
}

impl From<Hop> for Flow {
    fn from(hop: Hop) -> Self {
        Self::Hop(hop)
    }
}

/// A label transition with an optional frame mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    /// Label to run next.
    pub label: String,
    /// Prog to switch to; `None` stays in the current prog.
    pub prog: Option<String>,
    /// Mutation applied to the stack before persisting.
    pub frame: FrameUpdate,
}

impl Hop {
    /// Hops to `label` without touching the frame.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            prog: None,
            frame: FrameUpdate::Keep,
        }
    }

    /// Switches prog as part of the hop.
    #[must_use]
    pub fn with_prog(mut self, prog: impl Into<String>) -> Self {
        self.prog = Some(prog.into());
        self
    }

    /// Replaces the top frame.
    #[must_use]
    pub fn replacing(mut self, frame: Frame) -> Self {
        self.frame = FrameUpdate::Replace(frame);
        self
    }

    /// Merges keys into the top frame's payload.
    #[must_use]
    pub fn merging(mut self, payload: Map<String, Value>) -> Self {
        self.frame = FrameUpdate::Merge(payload);
        self
    }

    /// Pushes a new frame.
    #[must_use]
    pub fn pushing(mut self, frame: Frame) -> Self {
        self.frame = FrameUpdate::Push(frame);
        self
    }
}

/// How a hop changes the stack.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FrameUpdate {
    /// Leave the stack alone.
    #[default]
    Keep,
    /// Replace the top frame. Its return link is kept.
    Replace(Frame),
    /// Insert or overwrite payload keys of the top frame.
    Merge(Map<String, Value>),
    /// Push a new frame linked back to the hopping label.
    Push(Frame),
}
