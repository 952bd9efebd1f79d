use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator-facing escalation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable description of what needs attention.
    pub summary: String,
    /// When the page was raised.
    pub created_at: DateTime<Utc>,
    /// When the page was resolved. `None` while open.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Page {
    /// Returns true while the page awaits resolution.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
