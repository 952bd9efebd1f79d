//! Strand leasing.
//!
//! A lease is a time-boxed claim on a strand, taken with one conditional
//! update that only succeeds when the stored lease is null or expired. The
//! expiry written at acquire time doubles as the token: release clears the
//! lease only if it still carries that exact value.

use std::time::Duration;

use metrics::counter;
use uuid::Uuid;

use crate::storage::{LeaseAttempt, LeaseToken, StorageError, StrandStore};

use super::EngineError;

/// Fixed lease TTL.
pub const LEASE_TTL: Duration = Duration::from_secs(120);

/// Result of a lease attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseResult {
    /// The lease is ours until the token expires.
    Acquired {
        /// Token to present when writing and releasing.
        token: LeaseToken,
        /// The strand already exited; no label may run.
        exited: bool,
    },
    /// Another worker holds a live lease. Normal under contention.
    Busy,
    /// The strand does not exist.
    NotFound,
}

/// Attempts to lease a strand for `ttl`.
///
/// On success the strand's `schedule` is reset to now, so a strand that
/// keeps running inside its lease is never considered overdue.
///
/// # Errors
///
/// Returns `StorageError` if the store fails.
pub async fn acquire_lease(
    store: &dyn StrandStore,
    strand_id: Uuid,
    ttl: Duration,
) -> Result<LeaseResult, StorageError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| StorageError::ConfigurationError(format!("lease ttl out of range: {e}")))?;

    match store.acquire_lease(strand_id, ttl).await? {
        LeaseAttempt::Acquired { token, exited } => {
            counter!("skein.leases.acquired").increment(1);
            tracing::trace!(strand_id = %strand_id, expires_at = %token.expires_at(), "Lease acquired");
            Ok(LeaseResult::Acquired { token, exited })
        }
        LeaseAttempt::Held => {
            counter!("skein.leases.busy").increment(1);
            tracing::debug!(strand_id = %strand_id, "Strand is leased by another worker");
            Ok(LeaseResult::Busy)
        }
        LeaseAttempt::NotFound => Ok(LeaseResult::NotFound),
    }
}

/// Releases a lease taken by [`acquire_lease`].
///
/// When the attempt deleted the strand (self-reap) there is nothing to
/// release. Otherwise the conditional update must match exactly one row.
///
/// # Errors
///
/// Returns `EngineError::LeaseIntegrityViolated` if the lease is no longer
/// ours, or `EngineError::Storage` if the store fails.
pub async fn release_lease(
    store: &dyn StrandStore,
    strand_id: Uuid,
    token: LeaseToken,
    deleted: bool,
) -> Result<(), EngineError> {
    if deleted {
        return Ok(());
    }

    if store.release_lease(strand_id, token).await? {
        counter!("skein.leases.released").increment(1);
        Ok(())
    } else {
        tracing::error!(
            strand_id = %strand_id,
            expires_at = %token.expires_at(),
            "Lease release matched no row"
        );
        Err(EngineError::LeaseIntegrityViolated { strand_id })
    }
}
