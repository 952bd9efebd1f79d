//! Strand store abstraction and backends.

mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod store;

pub use error::StorageError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{insert_strand_with, PgStore};
pub use store::{
    LabelWrites, LeaseAttempt, LeaseToken, ReapedChild, StrandFilter, StrandStore, Transition,
    TransitionOutcome,
};
