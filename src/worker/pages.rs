//! Page lifecycle events.
//!
//! Pages are raised by missed deadlines and by the `PageNexus` prog. A
//! [`PageSink`] receives a created event and a resolved event for each;
//! delivering them to humans is the sink's business.

use async_trait::async_trait;
use metrics::counter;

use crate::models::Page;

/// Receiver of page lifecycle events. Called after the store commits.
#[async_trait]
pub trait PageSink: Send + Sync {
    /// A page was raised.
    async fn page_created(&self, page: &Page);

    /// A page was resolved.
    async fn page_resolved(&self, page: &Page);
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPageSink;

#[async_trait]
impl PageSink for LogPageSink {
    async fn page_created(&self, page: &Page) {
        counter!("skein.pages.created").increment(1);
        tracing::warn!(page_id = %page.id, summary = %page.summary, "Page created");
    }

    async fn page_resolved(&self, page: &Page) {
        counter!("skein.pages.resolved").increment(1);
        tracing::info!(page_id = %page.id, summary = %page.summary, "Page resolved");
    }
}
