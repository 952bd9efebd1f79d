//! Fan-out-then-join.
//!
//! A parent buds its children with [`fan_out`], hops to a waiting label,
//! and answers every invocation of that label with [`Join::poll`]. The
//! join reaps whatever finished, keeps their exitvals if asked to, and
//! either moves past the join or donates so the children can progress.
//! Reaped children are deleted only when the join's control signal is
//! persisted, so their exitvals cannot be lost to a failed write.

use serde_json::Value;

use crate::models::Frame;

use super::{Flow, ProgError, ProgResult, StrandContext};

/// Buds one child of `prog` at `label` per frame. Returns how many were budded.
///
/// The children are inserted together with the label's control signal,
/// so a fan-out is written whole or not at all.
pub fn fan_out<I>(ctx: &mut StrandContext, prog: &str, label: &str, frames: I) -> usize
where
    I: IntoIterator<Item = Frame>,
{
    let mut budded = 0;
    for frame in frames {
        ctx.bud(prog, frame, label);
        budded += 1;
    }
    budded
}

/// Join point over all children of the running strand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    next: String,
    collect_into: Option<String>,
}

impl Join {
    /// Joins, then hops to `next`.
    #[must_use]
    pub fn to(next: impl Into<String>) -> Self {
        Self {
            next: next.into(),
            collect_into: None,
        }
    }

    /// Appends each reaped child's exitval to the array at `key` of the
    /// innermost frame.
    #[must_use]
    pub fn collecting(mut self, key: impl Into<String>) -> Self {
        self.collect_into = Some(key.into());
        self
    }

    /// Reaps, then hops past the join when no children remain or donates otherwise.
    ///
    /// Safe to call any number of times at the same label.
    ///
    /// # Errors
    ///
    /// Returns `ProgError::Storage` if reaping fails, or `ProgError::Payload`
    /// if the collection key holds something other than an array.
    pub async fn poll(&self, ctx: &mut StrandContext) -> ProgResult {
        let reaped = ctx.reap().await?;

        if let Some(key) = &self.collect_into {
            if !reaped.is_empty() {
                let mut values: Vec<Value> = ctx.get(key)?.unwrap_or_default();
                values.extend(reaped.into_iter().map(|child| child.exitval));
                ctx.frame_mut().set(key, &values)?;
            }
        }

        if ctx.leaf().await? {
            Ok(Flow::hop(&self.next))
        } else {
            Ok(Flow::donate())
        }
    }
}
