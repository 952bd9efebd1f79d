//! Workflow types ("progs") and the pieces their label handlers use.
//!
//! A prog is a named state machine. Each label maps to a handler that
//! does one idempotent step of domain work and returns a [`Flow`]:
//!
//! ```ignore
//! #[async_trait]
//! impl Prog for Provision {
//!     fn name(&self) -> &str {
//!         "Provision"
//!     }
//!
//!     async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
//!         match label {
//!             "start" => Ok(Flow::hop("wait")),
//!             "wait" if ctx.check_and_consume("ready").await? => Ok(Flow::pop("done")),
//!             "wait" => Ok(Flow::nap(30)),
//!             other => Err(ProgError::unknown_label(other)),
//!         }
//!     }
//! }
//! ```

mod context;
mod error;
mod flow;
pub mod join;
mod registry;

use async_trait::async_trait;

pub use context::StrandContext;
pub use error::{ProgError, ProgResult};
pub use flow::{Flow, FrameUpdate, Hop};
pub use join::{fan_out, Join};
pub use registry::{ProgRegistry, UnknownWorkflowType};

/// Cooperative cancellation declared by a prog.
///
/// When `semaphore` is set at the start of a lease and the strand is not
/// already at `label`, the worker hops to `label` before invoking anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    /// Semaphore that requests cancellation.
    pub semaphore: &'static str,
    /// Cleanup label to force.
    pub label: &'static str,
}

impl Cancellation {
    /// The conventional `destroy` semaphore hopping to the `destroy` label.
    #[must_use]
    pub const fn destroy() -> Self {
        Self {
            semaphore: "destroy",
            label: "destroy",
        }
    }
}

/// A workflow type.
#[async_trait]
pub trait Prog: Send + Sync {
    /// Name strands use to refer to this prog.
    fn name(&self) -> &str;

    /// Cancellation semaphore and cleanup label, if the prog supports it.
    fn cancellation(&self) -> Option<Cancellation> {
        None
    }

    /// Runs one label. Labels the prog does not define must return
    /// [`ProgError::UnknownLabel`].
    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult;
}
