//! In-process strand store.
//!
//! All tables live behind one mutex, so each trait method is atomic with
//! respect to every other. The clock can be moved forward to exercise
//! schedules, lease expiry and deadlines without sleeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Frame, NewStrand, Page, Strand};

use super::{
    LabelWrites, LeaseAttempt, LeaseToken, ReapedChild, StorageError, StrandFilter, StrandStore, Transition,
    TransitionOutcome,
};

#[derive(Debug, Default)]
struct Tables {
    strands: HashMap<Uuid, Strand>,
    semaphores: HashMap<(Uuid, String), u64>,
    pages: HashMap<Uuid, Page>,
}

impl Tables {
    fn delete_strand(&mut self, id: Uuid) -> Option<Strand> {
        self.semaphores.retain(|(strand_id, _), _| *strand_id != id);
        self.strands.remove(&id)
    }

    fn leased_strand(&mut self, id: Uuid, token: LeaseToken) -> Result<&mut Strand, StorageError> {
        let strand = self
            .strands
            .get_mut(&id)
            .ok_or(StorageError::StrandNotFound { id })?;
        if strand.lease != Some(token.expires_at()) {
            return Err(StorageError::LeaseMismatch { id });
        }
        Ok(strand)
    }

    fn apply_writes(
        &mut self,
        parent_id: Uuid,
        budded: Vec<Strand>,
        reaped: &[Uuid],
        consumed: &BTreeMap<String, u64>,
    ) {
        for (name, taken) in consumed {
            let key = (parent_id, name.clone());
            let remaining = match self.semaphores.get_mut(&key) {
                Some(count) => {
                    *count = count.saturating_sub(*taken);
                    *count
                }
                None => continue,
            };
            if remaining == 0 {
                self.semaphores.remove(&key);
            }
        }
        for child_id in reaped {
            let finished = self
                .strands
                .get(child_id)
                .is_some_and(|c| c.parent_id == Some(parent_id) && c.is_terminal());
            if finished {
                self.delete_strand(*child_id);
            }
        }
        for child in budded {
            self.strands.insert(child.id, child);
        }
    }
}

/// Strand store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    clock_offset_ms: AtomicI64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the store clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.clock_offset_ms.fetch_add(ms, Ordering::SeqCst);
    }

    fn clock(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.clock_offset_ms.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl StrandStore for MemoryStore {
    async fn now(&self) -> Result<DateTime<Utc>, StorageError> {
        Ok(self.clock())
    }

    async fn insert_strand(&self, new: NewStrand) -> Result<Strand, StorageError> {
        let strand = new.into_strand(self.clock());
        let mut tables = self.tables.lock().await;
        if tables.strands.contains_key(&strand.id) {
            return Err(StorageError::AlreadyExists { id: strand.id });
        }
        tables.strands.insert(strand.id, strand.clone());
        Ok(strand)
    }

    async fn get_strand(&self, id: Uuid) -> Result<Option<Strand>, StorageError> {
        Ok(self.tables.lock().await.strands.get(&id).cloned())
    }

    async fn list_strands(&self, filter: &StrandFilter) -> Result<Vec<Strand>, StorageError> {
        let tables = self.tables.lock().await;
        let mut strands: Vec<Strand> = tables
            .strands
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        strands.sort_by_key(|s| (s.schedule, s.created_at));
        strands.truncate(filter.limit);
        Ok(strands)
    }

    async fn delete_strand(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.tables.lock().await.delete_strand(id).is_some())
    }

    async fn due_strands(&self, limit: usize) -> Result<Vec<Uuid>, StorageError> {
        let now = self.clock();
        let tables = self.tables.lock().await;
        let mut due: Vec<&Strand> = tables
            .strands
            .values()
            .filter(|s| s.is_due_at(now))
            .collect();
        due.sort_by_key(|s| (s.schedule, s.created_at));
        Ok(due.into_iter().take(limit).map(|s| s.id).collect())
    }

    async fn acquire_lease(&self, id: Uuid, ttl: Duration) -> Result<LeaseAttempt, StorageError> {
        let now = self.clock();
        let mut tables = self.tables.lock().await;
        let Some(strand) = tables.strands.get_mut(&id) else {
            return Ok(LeaseAttempt::NotFound);
        };
        if strand.is_leased_at(now) {
            return Ok(LeaseAttempt::Held);
        }
        let expires_at = now + ttl;
        strand.lease = Some(expires_at);
        strand.schedule = now;
        Ok(LeaseAttempt::Acquired {
            token: LeaseToken::new(expires_at),
            exited: strand.is_terminal(),
        })
    }

    async fn release_lease(&self, id: Uuid, token: LeaseToken) -> Result<bool, StorageError> {
        let mut tables = self.tables.lock().await;
        match tables.strands.get_mut(&id) {
            Some(strand) if strand.lease == Some(token.expires_at()) => {
                strand.lease = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_transition(
        &self,
        id: Uuid,
        token: LeaseToken,
        transition: Transition,
        writes: LabelWrites,
    ) -> Result<TransitionOutcome, StorageError> {
        let now = self.clock();
        let mut tables = self.tables.lock().await;
        if tables.leased_strand(id, token)?.is_terminal() {
            return Err(StorageError::Terminal { id });
        }

        // Every check happens before the first mutation.
        let mut budded: Vec<Strand> = Vec::with_capacity(writes.budded.len());
        for new in writes.budded {
            let child = new.into_strand(now);
            if tables.strands.contains_key(&child.id) || budded.iter().any(|c| c.id == child.id) {
                return Err(StorageError::AlreadyExists { id: child.id });
            }
            budded.push(child);
        }
        tables.apply_writes(id, budded, &writes.reaped, &writes.consumed);

        let strand = tables.leased_strand(id, token)?;
        match transition {
            Transition::Nap { delay, stack } => {
                if let Some(delay) = delay {
                    strand.schedule = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
                }
                strand.stack = stack;
            }
            Transition::Hop {
                prog,
                label,
                stack,
                retval,
            } => {
                strand.prog = prog;
                strand.label = label;
                strand.stack = stack;
                strand.retval = retval;
            }
            Transition::Exit { exitval, stack } => {
                if strand.is_root() {
                    tables.delete_strand(id);
                    return Ok(TransitionOutcome::Deleted);
                }
                strand.exitval = Some(exitval);
                strand.retval = None;
                strand.stack = stack;
            }
        }
        Ok(TransitionOutcome::Updated)
    }

    async fn update_stack(
        &self,
        id: Uuid,
        token: LeaseToken,
        stack: &[Frame],
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.leased_strand(id, token)?.stack = stack.to_vec();
        Ok(())
    }

    async fn increment_semaphore(&self, strand_id: Uuid, name: &str) -> Result<u64, StorageError> {
        let mut tables = self.tables.lock().await;
        if !tables.strands.contains_key(&strand_id) {
            return Err(StorageError::StrandNotFound { id: strand_id });
        }
        let count = tables
            .semaphores
            .entry((strand_id, name.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn consume_semaphore(&self, strand_id: Uuid, name: &str) -> Result<bool, StorageError> {
        let mut tables = self.tables.lock().await;
        let key = (strand_id, name.to_string());
        match tables.semaphores.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(true)
            }
            Some(_) => {
                tables.semaphores.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn semaphore_count(&self, strand_id: Uuid, name: &str) -> Result<u64, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .semaphores
            .get(&(strand_id, name.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn clear_semaphores(&self, strand_id: Uuid) -> Result<u64, StorageError> {
        let mut tables = self.tables.lock().await;
        let before = tables.semaphores.len();
        tables.semaphores.retain(|(id, _), _| *id != strand_id);
        Ok((before - tables.semaphores.len()) as u64)
    }

    async fn count_children(&self, parent_id: Uuid) -> Result<usize, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .strands
            .values()
            .filter(|s| s.parent_id == Some(parent_id))
            .count())
    }

    async fn finished_children(&self, parent_id: Uuid) -> Result<Vec<ReapedChild>, StorageError> {
        let tables = self.tables.lock().await;
        let mut finished: Vec<&Strand> = tables
            .strands
            .values()
            .filter(|s| s.parent_id == Some(parent_id) && s.is_terminal())
            .collect();
        finished.sort_by_key(|s| (s.created_at, s.id));
        Ok(finished
            .into_iter()
            .map(|child| ReapedChild {
                id: child.id,
                prog: child.prog.clone(),
                exitval: child.exitval.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn create_page(&self, summary: &str) -> Result<Page, StorageError> {
        let page = Page {
            id: Uuid::new_v4(),
            summary: summary.to_string(),
            created_at: self.clock(),
            resolved_at: None,
        };
        self.tables
            .lock()
            .await
            .pages
            .insert(page.id, page.clone());
        Ok(page)
    }

    async fn create_owned_page(
        &self,
        summary: &str,
        owner: NewStrand,
    ) -> Result<(Page, Strand), StorageError> {
        let now = self.clock();
        let strand = owner.into_strand(now);
        let mut tables = self.tables.lock().await;
        if tables.strands.contains_key(&strand.id) || tables.pages.contains_key(&strand.id) {
            return Err(StorageError::AlreadyExists { id: strand.id });
        }
        let page = Page {
            id: strand.id,
            summary: summary.to_string(),
            created_at: now,
            resolved_at: None,
        };
        tables.pages.insert(page.id, page.clone());
        tables.strands.insert(strand.id, strand.clone());
        Ok((page, strand))
    }

    async fn get_page(&self, id: Uuid) -> Result<Option<Page>, StorageError> {
        Ok(self.tables.lock().await.pages.get(&id).cloned())
    }

    async fn resolve_page(&self, id: Uuid) -> Result<Option<Page>, StorageError> {
        let now = self.clock();
        let mut tables = self.tables.lock().await;
        Ok(tables.pages.get_mut(&id).map(|page| {
            if page.resolved_at.is_none() {
                page.resolved_at = Some(now);
            }
            page.clone()
        }))
    }

    async fn list_pages(&self, open_only: bool) -> Result<Vec<Page>, StorageError> {
        let tables = self.tables.lock().await;
        let mut pages: Vec<Page> = tables
            .pages
            .values()
            .filter(|p| !open_only || p.is_open())
            .cloned()
            .collect();
        pages.sort_by_key(|p| p.created_at);
        Ok(pages)
    }
}
