//! skein - durable, lease-based workflow engine
//!
//! Long-running control plane operations are modeled as strands: persisted
//! state machines whose position is a label and whose working data is a
//! stack of frames. Workers lease a due strand, run label handlers until the
//! strand naps, exits or runs out of time, and release the lease. Every
//! step is committed atomically with the label change, so a crashed worker
//! only costs the current label, which is replayed by whoever leases the
//! strand next.
//!
//! Parents fork children with `bud`, wait with `reap`/`leaf`, and are woken
//! through semaphores. Frames may carry a deadline that raises a page when
//! the strand has not reached its target label in time.

pub mod cli;
pub mod config;
pub mod models;
pub mod prog;
pub mod progs;
pub mod storage;
pub mod worker;

pub use models::{Frame, NewStrand, Page, Strand};
pub use prog::{
    Cancellation, Flow, Join, Prog, ProgError, ProgRegistry, ProgResult, StrandContext,
    UnknownWorkflowType,
};
pub use storage::{MemoryStore, StorageError, StrandStore};
pub use worker::{EngineError, RunOutcome, RunnerConfig, TickReport, Worker};
