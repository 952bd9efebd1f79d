//! Running one strand for a time budget.
//!
//! Algorithm:
//! 1. Lease the strand (busy or missing strands return immediately)
//! 2. If it already exited, clear its semaphores and stop
//! 3. Force the cancellation hop if the prog's cancel semaphore is set
//! 4. Loop: deadline check, invoke the label, persist the control signal
//! 5. Stop on a nap, an exit, or when the budget runs out
//! 6. Release the lease, whatever happened in 3-5

use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::{Frame, FrameLink, Strand};
use crate::prog::{Flow, FrameUpdate, Hop, ProgError, StrandContext};
use crate::storage::{LabelWrites, LeaseToken, Transition, TransitionOutcome};

use super::{deadline, lease, mailbox, EngineError, LeaseResult, Worker};

/// How a call to [`Worker::run_strand`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another worker holds the lease.
    Busy,
    /// The strand had already exited; its late semaphores were cleared.
    AlreadyExited,
    /// The time budget ran out mid-run. The strand is due again immediately.
    BudgetExhausted,
    /// The strand napped for this many seconds.
    Napped(u64),
    /// The workflow completed.
    Exited {
        /// Final value.
        value: Value,
        /// Whether the row was deleted (root strands).
        deleted: bool,
    },
}

impl RunOutcome {
    /// The terminal or long-term suspending signal, or `None` when the run
    /// ended for any other reason.
    #[must_use]
    pub fn flow(&self) -> Option<Flow> {
        match self {
            Self::Napped(seconds) => Some(Flow::Nap(*seconds)),
            Self::Exited { value, .. } => Some(Flow::Pop(value.clone())),
            Self::Busy | Self::AlreadyExited | Self::BudgetExhausted => None,
        }
    }
}

/// Pause after a donate before re-running the label on the same lease.
const DONATE_PAUSE: Duration = Duration::from_millis(10);

/// Result of one label invocation.
enum Step {
    Continue,
    Donated,
    Napped(u64),
    Exited { value: Value, deleted: bool },
}

impl Worker {
    /// Runs a strand until it naps, exits, or `budget` is used up.
    ///
    /// At least one label runs whenever the lease is acquired. The lease is
    /// released on every path, including handler errors and panics, except
    /// when the run deleted the strand.
    ///
    /// # Errors
    ///
    /// - `EngineError::StrandNotFound` if the strand does not exist
    /// - fatal errors (see [`EngineError::is_fatal`]) for programmer defects
    /// - `EngineError::Storage` for store failures
    pub async fn run_strand(&self, strand_id: Uuid, budget: Duration) -> Result<RunOutcome, EngineError> {
        let (token, exited) = match lease::acquire_lease(self.store(), strand_id, self.lease_ttl()).await? {
            LeaseResult::Acquired { token, exited } => (token, exited),
            LeaseResult::Busy => return Ok(RunOutcome::Busy),
            LeaseResult::NotFound => return Err(EngineError::StrandNotFound(strand_id)),
        };

        if exited {
            let cleared = mailbox::clear(self.store(), strand_id).await;
            lease::release_lease(self.store(), strand_id, token, false).await?;
            cleared?;
            return Ok(RunOutcome::AlreadyExited);
        }

        // The body runs as its own task so a panicking handler still
        // reaches the release below.
        let worker = self.clone();
        let body = tokio::spawn(async move { worker.drive(strand_id, token, budget).await });
        let result = match body.await {
            Ok(result) => result,
            Err(join_err) => Err(EngineError::Panicked {
                strand_id,
                message: panic_message(join_err),
            }),
        };

        let deleted = matches!(result, Ok(RunOutcome::Exited { deleted: true, .. }));
        let released = lease::release_lease(self.store(), strand_id, token, deleted).await;

        match (result, released) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    tracing::error!(
                        strand_id = %strand_id,
                        error = %release_err,
                        "Failed to release lease after error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        strand_id: Uuid,
        token: LeaseToken,
        budget: Duration,
    ) -> Result<RunOutcome, EngineError> {
        let budget_ends = Instant::now() + budget;
        let mut strand = self
            .store()
            .get_strand(strand_id)
            .await?
            .ok_or(EngineError::StrandNotFound(strand_id))?;

        self.apply_cancellation(&mut strand, token).await?;

        loop {
            match self.step(&mut strand, token).await? {
                Step::Napped(seconds) => return Ok(RunOutcome::Napped(seconds)),
                Step::Exited { value, deleted } => return Ok(RunOutcome::Exited { value, deleted }),
                Step::Continue | Step::Donated if Instant::now() >= budget_ends => {
                    tracing::debug!(
                        strand_id = %strand.id,
                        label = %strand.label,
                        "Time budget exhausted"
                    );
                    return Ok(RunOutcome::BudgetExhausted);
                }
                Step::Continue => tokio::task::yield_now().await,
                Step::Donated => tokio::time::sleep(DONATE_PAUSE).await,
            }
        }
    }

    /// Hops to the prog's cleanup label if its cancel semaphore is set.
    async fn apply_cancellation(&self, strand: &mut Strand, token: LeaseToken) -> Result<(), EngineError> {
        let prog = self.registry().resolve(&strand.prog)?;
        let Some(cancel) = prog.cancellation() else {
            return Ok(());
        };
        if strand.label == cancel.label || !mailbox::is_set(self.store(), strand.id, cancel.semaphore).await? {
            return Ok(());
        }

        tracing::info!(
            strand_id = %strand.id,
            prog = %strand.prog,
            from = %strand.label,
            to = %cancel.label,
            "Cancellation requested"
        );
        self.store()
            .record_transition(
                strand.id,
                token,
                Transition::Hop {
                    prog: strand.prog.clone(),
                    label: cancel.label.to_string(),
                    stack: strand.stack.clone(),
                    retval: None,
                },
                LabelWrites::default(),
            )
            .await
            .map_err(EngineError::from_guarded)?;
        strand.label = cancel.label.to_string();
        strand.retval = None;
        Ok(())
    }

    /// Runs the current label once and persists its control signal.
    async fn step(&self, strand: &mut Strand, token: LeaseToken) -> Result<Step, EngineError> {
        let now = self.store().now().await?;

        let report = deadline::check_deadlines(self.store(), strand, now).await?;
        if report.changed {
            self.store()
                .update_stack(strand.id, token, &strand.stack)
                .await
                .map_err(EngineError::from_guarded)?;
        }
        for page in &report.raised {
            self.page_sink().page_created(page).await;
        }
        for page in &report.resolved {
            self.page_sink().page_resolved(page).await;
        }

        let prog = self.registry().resolve(&strand.prog)?;
        let mut ctx = StrandContext::new(self.store_arc(), strand.clone(), now);
        let flow = match prog.run_label(&strand.label, &mut ctx).await {
            Ok(flow) => flow,
            Err(ProgError::UnknownLabel { label }) => {
                return Err(EngineError::FlowControlNotProvided {
                    prog: strand.prog.clone(),
                    label,
                });
            }
            Err(source) => {
                return Err(EngineError::Prog {
                    prog: strand.prog.clone(),
                    label: strand.label.clone(),
                    source,
                });
            }
        };
        let (stack, writes) = ctx.into_parts();

        counter!("skein.transitions", "kind" => flow.kind()).increment(1);
        tracing::debug!(
            strand_id = %strand.id,
            prog = %strand.prog,
            label = %strand.label,
            flow = flow.kind(),
            "Label executed"
        );

        let (transition, step) = self.interpret(strand, stack, flow)?;
        let (budded, reaped) = (writes.budded.len(), writes.reaped.len());
        let consumed: u64 = writes.consumed.values().sum();
        let outcome = self
            .store()
            .record_transition(strand.id, token, transition.clone(), writes)
            .await
            .map_err(EngineError::from_guarded)?;

        if reaped > 0 {
            counter!("skein.strands.reaped").increment(reaped as u64);
        }
        if consumed > 0 {
            counter!("skein.semaphores.consumed").increment(consumed);
        }
        if budded + reaped > 0 {
            tracing::debug!(strand_id = %strand.id, budded, reaped, "Children written");
        }

        let deleted = outcome == TransitionOutcome::Deleted;
        match transition {
            Transition::Nap { stack, .. } => strand.stack = stack,
            Transition::Hop {
                prog,
                label,
                stack,
                retval,
            } => {
                strand.prog = prog;
                strand.label = label;
                strand.stack = stack;
                strand.retval = retval;
            }
            Transition::Exit { .. } => {
                tracing::info!(
                    strand_id = %strand.id,
                    prog = %strand.prog,
                    deleted,
                    "Strand exited"
                );
            }
        }

        Ok(match step {
            Step::Exited { value, .. } => Step::Exited { value, deleted },
            other => other,
        })
    }

    /// Turns a control signal into the transition to persist.
    fn interpret(
        &self,
        strand: &Strand,
        mut stack: Vec<Frame>,
        flow: Flow,
    ) -> Result<(Transition, Step), EngineError> {
        match flow {
            Flow::Nap(0) => Ok((Transition::Nap { delay: None, stack }, Step::Donated)),
            Flow::Nap(seconds) => {
                // The store adds the delay to its clock at write time, so
                // time spent in the handler does not shorten the nap.
                let delay = i64::try_from(seconds)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .unwrap_or(chrono::Duration::MAX);
                Ok((
                    Transition::Nap {
                        delay: Some(delay),
                        stack,
                    },
                    Step::Napped(seconds),
                ))
            }
            Flow::Hop(Hop { label, prog, frame }) => {
                let prog = match prog {
                    Some(prog) => {
                        self.registry().resolve(&prog)?;
                        prog
                    }
                    None => strand.prog.clone(),
                };
                apply_frame_update(&mut stack, frame, strand);
                Ok((
                    Transition::Hop {
                        prog,
                        label,
                        stack,
                        retval: None,
                    },
                    Step::Continue,
                ))
            }
            Flow::Pop(value) => {
                let popped = stack.pop();
                if stack.is_empty() {
                    return Ok((
                        Transition::Exit {
                            exitval: value.clone(),
                            stack: popped.into_iter().collect(),
                        },
                        Step::Exited {
                            value,
                            deleted: false,
                        },
                    ));
                }
                let FrameLink { prog, label } = popped.and_then(|f| f.link).unwrap_or_else(|| FrameLink {
                    prog: strand.prog.clone(),
                    label: strand.label.clone(),
                });
                Ok((
                    Transition::Hop {
                        prog,
                        label,
                        stack,
                        retval: Some(value),
                    },
                    Step::Continue,
                ))
            }
        }
    }
}

fn apply_frame_update(stack: &mut Vec<Frame>, update: FrameUpdate, strand: &Strand) {
    if stack.is_empty() {
        stack.push(Frame::default());
    }
    let top = stack.len() - 1;
    match update {
        FrameUpdate::Keep => {}
        FrameUpdate::Replace(mut frame) => {
            frame.link = stack[top].link.take();
            stack[top] = frame;
        }
        FrameUpdate::Merge(payload) => stack[top].payload.extend(payload),
        FrameUpdate::Push(mut frame) => {
            frame.link = Some(FrameLink {
                prog: strand.prog.clone(),
                label: strand.label.clone(),
            });
            stack.push(frame);
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
