//! Semaphore mailbox.
//!
//! Semaphores let anyone signal a strand without calling into it. The
//! signaller increments a named counter; the owning workflow observes
//! each increment once via [`check_and_consume`] at a label boundary.

use metrics::counter;
use uuid::Uuid;

use crate::storage::{StorageError, StrandStore};

/// Signals a strand. Callable from anywhere, with or without a lease.
///
/// # Errors
///
/// Returns `StorageError::StrandNotFound` if the strand no longer exists.
pub async fn increment(
    store: &dyn StrandStore,
    strand_id: Uuid,
    name: &str,
) -> Result<u64, StorageError> {
    let count = store.increment_semaphore(strand_id, name).await?;
    counter!("skein.semaphores.incremented").increment(1);
    tracing::debug!(strand_id = %strand_id, semaphore = %name, count, "Semaphore incremented");
    Ok(count)
}

/// Consumes one increment if any is pending. For the owning workflow only.
///
/// # Errors
///
/// Returns `StorageError` if the store fails.
pub async fn check_and_consume(
    store: &dyn StrandStore,
    strand_id: Uuid,
    name: &str,
) -> Result<bool, StorageError> {
    let consumed = store.consume_semaphore(strand_id, name).await?;
    if consumed {
        counter!("skein.semaphores.consumed").increment(1);
        tracing::debug!(strand_id = %strand_id, semaphore = %name, "Semaphore consumed");
    }
    Ok(consumed)
}

/// Tests a semaphore without consuming it.
///
/// # Errors
///
/// Returns `StorageError` if the store fails.
pub async fn is_set(
    store: &dyn StrandStore,
    strand_id: Uuid,
    name: &str,
) -> Result<bool, StorageError> {
    Ok(store.semaphore_count(strand_id, name).await? > 0)
}

/// Deletes every semaphore of a strand.
///
/// # Errors
///
/// Returns `StorageError` if the store fails.
pub async fn clear(store: &dyn StrandStore, strand_id: Uuid) -> Result<u64, StorageError> {
    let cleared = store.clear_semaphores(strand_id).await?;
    if cleared > 0 {
        tracing::debug!(strand_id = %strand_id, cleared, "Cleared semaphores");
    }
    Ok(cleared)
}
