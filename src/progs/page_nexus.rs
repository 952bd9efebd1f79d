//! A strand that owns one page until someone resolves it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{NewStrand, Page};
use crate::prog::{Flow, Prog, ProgError, ProgResult, StrandContext};
use crate::storage::{StorageError, StrandStore};
use crate::worker::{mailbox, PageSink};

/// Page lifecycle as a workflow.
///
/// The strand shares its id with the page. `start` announces the page to
/// the sink; `wait` naps until the `resolve` semaphore arrives, then
/// resolves the page and exits.
pub struct PageNexus {
    sink: Arc<dyn PageSink>,
}

impl PageNexus {
    /// Registered prog name.
    pub const NAME: &'static str = "PageNexus";
    /// Semaphore that resolves the page.
    pub const RESOLVE: &'static str = "resolve";

    const WAIT_NAP_SECS: u64 = 30;

    /// Creates the prog, announcing pages through `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn PageSink>) -> Self {
        Self { sink }
    }

    /// Raises a page and starts the strand that owns it, in one write.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails; neither row is left behind.
    pub async fn assemble(store: &dyn StrandStore, summary: &str) -> Result<Page, StorageError> {
        let (page, _) = store
            .create_owned_page(summary, NewStrand::new(Self::NAME))
            .await?;
        tracing::info!(page_id = %page.id, summary = %summary, "Page assembled");
        Ok(page)
    }

    /// Asks the owning strand to resolve the page on its next run.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::StrandNotFound` if no strand owns the page.
    pub async fn request_resolve(store: &dyn StrandStore, page_id: uuid::Uuid) -> Result<u64, StorageError> {
        mailbox::increment(store, page_id, Self::RESOLVE).await
    }

    async fn page(ctx: &StrandContext) -> Result<Page, ProgError> {
        ctx.store()
            .get_page(ctx.id())
            .await?
            .ok_or_else(|| ProgError::failed(format!("page {} is missing", ctx.id())))
    }
}

#[async_trait]
impl Prog for PageNexus {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run_label(&self, label: &str, ctx: &mut StrandContext) -> ProgResult {
        match label {
            "start" => {
                let page = Self::page(ctx).await?;
                self.sink.page_created(&page).await;
                Ok(Flow::hop("wait"))
            }
            "wait" => {
                let requested = ctx.check_and_consume(Self::RESOLVE).await?;
                let page = Self::page(ctx).await?;
                if !requested && page.is_open() {
                    return Ok(Flow::nap(Self::WAIT_NAP_SECS));
                }
                if page.is_open() {
                    if let Some(page) = ctx.store().resolve_page(page.id).await? {
                        self.sink.page_resolved(&page).await;
                    }
                }
                Ok(Flow::pop("page is resolved"))
            }
            other => Err(ProgError::unknown_label(other)),
        }
    }
}
