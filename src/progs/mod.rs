//! Built-in workflows.

mod page_nexus;
mod rekey;

use std::sync::Arc;

pub use page_nexus::PageNexus;
pub use rekey::{LoggingRekeyDriver, NicRekey, RekeyDriver, RekeyPhase, SubnetRekey};

use crate::prog::ProgRegistry;
use crate::worker::PageSink;

/// Registry holding every built-in prog.
#[must_use]
pub fn builtin_registry(sink: Arc<dyn PageSink>, driver: Arc<dyn RekeyDriver>) -> ProgRegistry {
    ProgRegistry::new()
        .with(PageNexus::new(sink))
        .with(SubnetRekey)
        .with(NicRekey::new(driver))
}
