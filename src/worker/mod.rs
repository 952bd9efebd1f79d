//! Strand execution engine.
//!
//! This module provides:
//! - Strand leasing with a fixed TTL and guaranteed release
//! - The run loop that drives a strand's labels for a time budget
//! - Deadline escalation and page lifecycle events
//! - The semaphore mailbox
//! - The scheduler loop with graceful shutdown

mod deadline;
mod error;
mod lease;
pub mod mailbox;
mod pages;
mod polling;
mod run;
mod runner;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::models::Page;
use crate::prog::ProgRegistry;
use crate::storage::StrandStore;

pub use deadline::{check_deadlines, deadline_summary, DeadlineReport};
pub use error::EngineError;
pub use lease::{acquire_lease, release_lease, LeaseResult, LEASE_TTL};
pub use pages::{LogPageSink, PageSink};
pub use polling::PollingStrategy;
pub use run::RunOutcome;
pub use runner::{shutdown_signal, wait_for_shutdown_signal, RunnerConfig, TickReport};

/// A worker that runs due strands using registered progs.
///
/// Cheap to clone; clones share the store, registry and page sink.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgRegistry>,
    pages: Arc<dyn PageSink>,
    lease_ttl: Duration,
    worker_id: String,
}

impl Worker {
    /// Creates a worker with the default lease TTL and a logging page sink.
    #[must_use]
    pub fn new(store: Arc<dyn StrandStore>, registry: ProgRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            pages: Arc::new(LogPageSink),
            lease_ttl: LEASE_TTL,
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
        }
    }

    /// Replaces the page sink.
    #[must_use]
    pub fn with_page_sink(mut self, sink: Arc<dyn PageSink>) -> Self {
        self.pages = sink;
        self
    }

    /// Overrides the lease TTL.
    #[must_use]
    pub const fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Sets the identifier used in logs.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// The strand store.
    #[must_use]
    pub fn store(&self) -> &dyn StrandStore {
        self.store.as_ref()
    }

    /// A shared handle to the strand store.
    #[must_use]
    pub fn store_arc(&self) -> Arc<dyn StrandStore> {
        Arc::clone(&self.store)
    }

    /// The prog registry.
    #[must_use]
    pub fn registry(&self) -> &ProgRegistry {
        &self.registry
    }

    /// The page sink.
    #[must_use]
    pub fn page_sink(&self) -> &dyn PageSink {
        self.pages.as_ref()
    }

    /// Lease TTL used for every acquire.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Identifier used in logs.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Signals a strand.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Storage` if the strand does not exist or the
    /// store fails.
    pub async fn increment(&self, strand_id: Uuid, name: &str) -> Result<u64, EngineError> {
        Ok(mailbox::increment(self.store(), strand_id, name).await?)
    }

    /// Resolves a page by hand. Emits the resolved event only when this call
    /// closed it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::PageNotFound` if no page has this id.
    pub async fn resolve_page(&self, id: Uuid) -> Result<Page, EngineError> {
        let page = self
            .store
            .get_page(id)
            .await?
            .ok_or(EngineError::PageNotFound(id))?;
        if !page.is_open() {
            return Ok(page);
        }

        let page = self
            .store
            .resolve_page(id)
            .await?
            .ok_or(EngineError::PageNotFound(id))?;
        self.pages.page_resolved(&page).await;
        Ok(page)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("registry", &self.registry)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}
