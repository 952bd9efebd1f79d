//! Subnet key rotation.
//!
//! Rotating keys for a subnet happens in three phases that must not
//! overlap across nics: every nic installs inbound state, then every nic
//! switches outbound policy, then every nic drops the old state. The
//! parent `SubnetRekey` buds one `NicRekey` child per nic for a phase and
//! joins on all of them before starting the next phase.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::{Frame, NewStrand, Strand};
use crate::prog::{fan_out, Cancellation, Flow, Join, Prog, ProgError, ProgResult, StrandContext};
use crate::storage::{StorageError, StrandFilter, StrandStore};

/// One phase of a rekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RekeyPhase {
    /// Install the new inbound state alongside the old.
    SetupInbound,
    /// Point outbound policy at the new state.
    SetupOutbound,
    /// Remove state no policy references anymore.
    DropOldState,
}

impl RekeyPhase {
    /// Phases in execution order.
    pub const ALL: [Self; 3] = [Self::SetupInbound, Self::SetupOutbound, Self::DropOldState];

    /// Label both parent and children run this phase at.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SetupInbound => "setup_inbound",
            Self::SetupOutbound => "setup_outbound",
            Self::DropOldState => "drop_old_state",
        }
    }

    /// Label the parent joins this phase at.
    #[must_use]
    pub const fn wait_label(self) -> &'static str {
        match self {
            Self::SetupInbound => "wait_setup_inbound",
            Self::SetupOutbound => "wait_setup_outbound",
            Self::DropOldState => "wait_drop_old_state",
        }
    }

    /// Parses a phase label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| phase.label() == label)
    }

    fn from_wait_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| phase.wait_label() == label)
    }

    const fn next(self) -> Option<Self> {
        match self {
            Self::SetupInbound => Some(Self::SetupOutbound),
            Self::SetupOutbound => Some(Self::DropOldState),
            Self::DropOldState => None,
        }
    }
}

impl fmt::Display for RekeyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Applies one phase to one nic. Implementations must be idempotent: a
/// phase can be replayed after a crash or lease loss.
#[async_trait]
pub trait RekeyDriver: Send + Sync {
    /// Applies `phase` on `nic`.
    async fn apply(&self, phase: RekeyPhase, nic: &str) -> Result<(), ProgError>;
}

/// Driver that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRekeyDriver;

#[async_trait]
impl RekeyDriver for LoggingRekeyDriver {
    async fn apply(&self, phase: RekeyPhase, nic: &str) -> Result<(), ProgError> {
        tracing::info!(nic = %nic, phase = %phase, "Applying rekey phase");
        Ok(())
    }
}

/// Parent workflow rotating keys across a subnet's nics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubnetRekey;

impl SubnetRekey {
    /// Registered prog name.
    pub const NAME: &'static str = "SubnetRekey";

    const FINISH: &'static str = "finish";
    const COMPLETED: &'static str = "completed";
    const CANCEL_SIGNALLED: &'static str = "cancel_signalled";

    /// Starts a rekey over `nics`. With `deadline`, a page is raised if the
    /// rekey has not finished within it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the strand cannot be inserted.
    pub async fn assemble(
        store: &dyn StrandStore,
        nics: &[String],
        deadline: Option<Duration>,
    ) -> Result<Strand, StorageError> {
        let mut frame = Frame::new().with("nics", json!(nics));
        if let Some(deadline) = deadline {
            frame = frame.with("deadline_secs", deadline.as_secs());
        }
        store
            .insert_strand(NewStrand::new(Self::NAME).with_frame(frame))
            .await
    }

    async fn start_phase(phase: RekeyPhase, ctx: &mut StrandContext) -> ProgResult {
        // Buds commit with the hop below, so a phase label that runs again
        // sees either every child of this phase or none of them.
        if ctx.leaf().await? {
            let nics: Vec<String> = ctx.require("nics")?;
            let frames: Vec<Frame> = nics
                .iter()
                .map(|nic| Frame::new().with("nic", nic.as_str()))
                .collect();
            let budded = fan_out(ctx, NicRekey::NAME, phase.label(), frames);
            tracing::info!(strand_id = %ctx.id(), phase = %phase, nics = budded, "Rekey phase started");
        }
        Ok(Flow::hop(phase.wait_label()))
    }

    async fn cancel(ctx: &mut StrandContext) -> ProgResult {
        if !ctx.get::<bool>(Self::CANCEL_SIGNALLED)?.unwrap_or(false) {
            let filter = StrandFilter {
                parent_id: Some(ctx.id()),
                include_terminal: false,
                limit: 10_000,
                ..StrandFilter::default()
            };
            for child in ctx.store().list_strands(&filter).await? {
                ctx.signal(child.id, Cancellation::destroy().semaphore).await?;
            }
            ctx.frame_mut().set(Self::CANCEL_SIGNALLED, &true)?;
        }

        ctx.reap().await?;
        if ctx.leaf().await? {
            tracing::info!(strand_id = %ctx.id(), "Rekey cancelled");
            Ok(Flow::pop("rekey cancelled"))
        } else {
            Ok(Flow::donate())
        }
    }
}

#[async_trait]
impl Prog for SubnetRekey {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn cancellation(&self) -> Option<Cancellation> {
        Some(Cancellation::destroy())
    }

    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
        match label {
            "start" => {
                if let Some(secs) = ctx.get::<u64>("deadline_secs")? {
                    ctx.register_deadline(Self::FINISH, Duration::from_secs(secs));
                }
                Ok(Flow::hop(RekeyPhase::SetupInbound.label()))
            }
            Self::FINISH => {
                let nics: Vec<String> = ctx.require("nics")?;
                let completed: Vec<Value> = ctx.get(Self::COMPLETED)?.unwrap_or_default();
                Ok(Flow::pop(json!({
                    "nics": nics.len(),
                    "completed": completed,
                })))
            }
            "destroy" => Self::cancel(ctx).await,
            other => {
                if let Some(phase) = RekeyPhase::from_label(other) {
                    return Self::start_phase(phase, ctx).await;
                }
                if let Some(phase) = RekeyPhase::from_wait_label(other) {
                    let next = phase.next().map_or(Self::FINISH, RekeyPhase::label);
                    return Join::to(next).collecting(Self::COMPLETED).poll(ctx).await;
                }
                Err(ProgError::unknown_label(other))
            }
        }
    }
}

/// Child workflow applying one phase to one nic.
pub struct NicRekey {
    driver: Arc<dyn RekeyDriver>,
}

impl NicRekey {
    /// Registered prog name.
    pub const NAME: &'static str = "NicRekey";

    /// Creates the prog with the driver that touches the nics.
    #[must_use]
    pub fn new(driver: Arc<dyn RekeyDriver>) -> Self {
        Self { driver }
    }
}

impl fmt::Debug for NicRekey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NicRekey").finish_non_exhaustive()
    }
}

#[async_trait]
impl Prog for NicRekey {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn cancellation(&self) -> Option<Cancellation> {
        Some(Cancellation::destroy())
    }

    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
        if label == "destroy" {
            return Ok(Flow::pop(json!({ "cancelled": true })));
        }
        let phase = RekeyPhase::from_label(label).ok_or_else(|| ProgError::unknown_label(label))?;
        let nic: String = ctx.require("nic")?;
        self.driver.apply(phase, &nic).await?;
        Ok(Flow::pop(json!({ "nic": nic, "phase": phase.label() })))
    }
}
