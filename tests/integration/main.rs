//! Integration tests for the skein workflow engine.
//!
//! Every test runs against the in-memory store, whose clock can be moved
//! forward to exercise schedules, lease expiry and deadlines.
//! Run: cargo test --test integration

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod deadlines;
mod fork_join;
mod leasing;
mod lifecycle;
mod page_nexus;
mod rekey;
mod scheduler;
