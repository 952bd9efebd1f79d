//! Postgres strand store.
//!
//! Leasing is one conditional `UPDATE ... RETURNING`, so two workers
//! racing for the same strand are serialized by the row lock and exactly
//! one of them sees a returned row.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgExecutor, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::{Frame, NewStrand, Page, Strand};

use super::{
    LabelWrites, LeaseAttempt, LeaseToken, ReapedChild, StorageError, StrandFilter, StrandStore, Transition,
    TransitionOutcome,
};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS strand (
        id UUID PRIMARY KEY,
        parent_id UUID NULL,
        prog TEXT NOT NULL,
        label TEXT NOT NULL,
        stack JSONB NOT NULL DEFAULT '[]',
        lease TIMESTAMPTZ NULL,
        schedule TIMESTAMPTZ NOT NULL DEFAULT now(),
        exitval JSONB NULL,
        retval JSONB NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    "CREATE INDEX IF NOT EXISTS strand_schedule_idx ON strand (schedule) WHERE exitval IS NULL",
    "CREATE INDEX IF NOT EXISTS strand_parent_idx ON strand (parent_id)",
    r"
    CREATE TABLE IF NOT EXISTS semaphore (
        strand_id UUID NOT NULL REFERENCES strand (id),
        name TEXT NOT NULL,
        count BIGINT NOT NULL,
        PRIMARY KEY (strand_id, name)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS page (
        id UUID PRIMARY KEY,
        summary TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        resolved_at TIMESTAMPTZ NULL
    )
    ",
];

const STRAND_COLUMNS: &str =
    "id, parent_id, prog, label, stack, lease, schedule, exitval, retval, created_at";

const UNIQUE_VIOLATION: &str = "23505";
/// Longest nap written as an interval; Postgres intervals overflow long
/// before chrono durations do.
const MAX_NAP_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;
const FOREIGN_KEY_VIOLATION: &str = "23503";

fn strand_from_row(row: &PgRow) -> Result<Strand, StorageError> {
    let Json(stack): Json<Vec<Frame>> = row.try_get("stack")?;
    Ok(Strand {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        prog: row.try_get("prog")?,
        label: row.try_get("label")?,
        stack,
        lease: row.try_get("lease")?,
        schedule: row.try_get("schedule")?,
        exitval: row.try_get("exitval")?,
        retval: row.try_get("retval")?,
        created_at: row.try_get("created_at")?,
    })
}

fn page_from_row(row: &PgRow) -> Result<Page, StorageError> {
    Ok(Page {
        id: row.try_get("id")?,
        summary: row.try_get("summary")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

/// Inserts a strand through any executor, typically an open transaction
/// that also writes the domain record the strand manages.
///
/// # Errors
///
/// Returns `StorageError::AlreadyExists` on an id collision.
pub async fn insert_strand_with<'e, E: PgExecutor<'e>>(
    executor: E,
    new: NewStrand,
) -> Result<Strand, StorageError> {
    let id = new.id.unwrap_or_else(Uuid::new_v4);
    let row = sqlx::query(&format!(
        "INSERT INTO strand (id, parent_id, prog, label, stack, schedule) \
         VALUES ($1, $2, $3, $4, $5, COALESCE($6, now())) \
         RETURNING {STRAND_COLUMNS}"
    ))
    .bind(id)
    .bind(new.parent_id)
    .bind(&new.prog)
    .bind(&new.label)
    .bind(Json(vec![new.frame]))
    .bind(new.schedule)
    .fetch_one(executor)
    .await
    .map_err(|e| unique_violation_as_exists(e, id))?;
    strand_from_row(&row)
}

/// Strand store backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects and creates the schema if missing.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConnectionError` if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::ConnectionError(format!("postgres connect failed: {e}")))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wraps an existing pool. The schema is assumed to exist.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for callers that write domain rows in the same
    /// transaction as a strand (see [`insert_strand_with`]).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Works out why a lease-guarded write matched no row.
    async fn explain_miss(&self, id: Uuid) -> StorageError {
        match self.get_strand(id).await {
            Ok(None) => StorageError::StrandNotFound { id },
            Ok(Some(strand)) if strand.is_terminal() => StorageError::Terminal { id },
            Ok(Some(_)) => StorageError::LeaseMismatch { id },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl StrandStore for PgStore {
    async fn now(&self) -> Result<DateTime<Utc>, StorageError> {
        Ok(sqlx::query_scalar("SELECT now()")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn insert_strand(&self, new: NewStrand) -> Result<Strand, StorageError> {
        insert_strand_with(&self.pool, new).await
    }

    async fn get_strand(&self, id: Uuid) -> Result<Option<Strand>, StorageError> {
        sqlx::query(&format!("SELECT {STRAND_COLUMNS} FROM strand WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(strand_from_row)
            .transpose()
    }

    async fn list_strands(&self, filter: &StrandFilter) -> Result<Vec<Strand>, StorageError> {
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {STRAND_COLUMNS} FROM strand \
             WHERE ($1::text IS NULL OR prog = $1) \
               AND ($2::uuid IS NULL OR parent_id = $2) \
               AND ($3 OR exitval IS NULL) \
             ORDER BY schedule, created_at \
             LIMIT $4"
        ))
        .bind(filter.prog.as_deref())
        .bind(filter.parent_id)
        .bind(filter.include_terminal)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(strand_from_row).collect()
    }

    async fn delete_strand(&self, id: Uuid) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM semaphore WHERE strand_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM strand WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted == 1)
    }

    async fn due_strands(&self, limit: usize) -> Result<Vec<Uuid>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(sqlx::query_scalar(
            "SELECT id FROM strand \
             WHERE schedule <= now() AND exitval IS NULL \
               AND (lease IS NULL OR lease < now()) \
             ORDER BY schedule, created_at \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn acquire_lease(&self, id: Uuid, ttl: Duration) -> Result<LeaseAttempt, StorageError> {
        let row = sqlx::query(
            "UPDATE strand \
             SET lease = now() + ($2::bigint * interval '1 millisecond'), schedule = now() \
             WHERE id = $1 AND (lease IS NULL OR lease < now()) \
             RETURNING lease, exitval IS NOT NULL AS exited",
        )
        .bind(id)
        .bind(ttl.num_milliseconds())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let lease: DateTime<Utc> = row.try_get("lease")?;
            return Ok(LeaseAttempt::Acquired {
                token: LeaseToken::new(lease),
                exited: row.try_get("exited")?,
            });
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM strand WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(if exists {
            LeaseAttempt::Held
        } else {
            LeaseAttempt::NotFound
        })
    }

    async fn release_lease(&self, id: Uuid, token: LeaseToken) -> Result<bool, StorageError> {
        let updated = sqlx::query("UPDATE strand SET lease = NULL WHERE id = $1 AND lease = $2")
            .bind(id)
            .bind(token.expires_at())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn record_transition(
        &self,
        id: Uuid,
        token: LeaseToken,
        transition: Transition,
        writes: LabelWrites,
    ) -> Result<TransitionOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let parent: Option<Option<Uuid>> = sqlx::query_scalar(
            "SELECT parent_id FROM strand \
             WHERE id = $1 AND lease = $2 AND exitval IS NULL \
             FOR UPDATE",
        )
        .bind(id)
        .bind(token.expires_at())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(parent) = parent else {
            tx.rollback().await?;
            return Err(self.explain_miss(id).await);
        };

        apply_writes(&mut tx, id, writes).await?;

        let outcome = match transition {
            Transition::Nap { delay, stack } => {
                sqlx::query(
                    "UPDATE strand SET stack = $2, schedule = CASE WHEN $3::bigint IS NULL \
                     THEN schedule ELSE now() + ($3::bigint * interval '1 millisecond') END \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(Json(stack))
                .bind(delay.map(|d| d.num_milliseconds().min(MAX_NAP_MS)))
                .execute(&mut *tx)
                .await?;
                TransitionOutcome::Updated
            }
            Transition::Hop {
                prog,
                label,
                stack,
                retval,
            } => {
                sqlx::query(
                    "UPDATE strand SET prog = $2, label = $3, stack = $4, retval = $5 WHERE id = $1",
                )
                .bind(id)
                .bind(prog)
                .bind(label)
                .bind(Json(stack))
                .bind(retval)
                .execute(&mut *tx)
                .await?;
                TransitionOutcome::Updated
            }
            Transition::Exit { exitval, stack } => {
                if parent.is_none() {
                    sqlx::query("DELETE FROM semaphore WHERE strand_id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM strand WHERE id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    TransitionOutcome::Deleted
                } else {
                    sqlx::query(
                        "UPDATE strand SET exitval = $2, retval = NULL, stack = $3 WHERE id = $1",
                    )
                    .bind(id)
                    .bind(exitval)
                    .bind(Json(stack))
                    .execute(&mut *tx)
                    .await?;
                    TransitionOutcome::Updated
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn update_stack(
        &self,
        id: Uuid,
        token: LeaseToken,
        stack: &[Frame],
    ) -> Result<(), StorageError> {
        let updated = sqlx::query("UPDATE strand SET stack = $3 WHERE id = $1 AND lease = $2")
            .bind(id)
            .bind(token.expires_at())
            .bind(Json(stack))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 1 {
            Ok(())
        } else {
            Err(self.explain_miss(id).await)
        }
    }

    async fn increment_semaphore(&self, strand_id: Uuid, name: &str) -> Result<u64, StorageError> {
        let result = sqlx::query_scalar::<_, i64>(
            "INSERT INTO semaphore (strand_id, name, count) VALUES ($1, $2, 1) \
             ON CONFLICT (strand_id, name) DO UPDATE SET count = semaphore.count + 1 \
             RETURNING count",
        )
        .bind(strand_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(count) => Ok(u64::try_from(count).unwrap_or_default()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                Err(StorageError::StrandNotFound { id: strand_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn consume_semaphore(&self, strand_id: Uuid, name: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE semaphore SET count = count - 1 \
             WHERE strand_id = $1 AND name = $2 AND count > 0 \
             RETURNING count",
        )
        .bind(strand_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        if remaining == Some(0) {
            sqlx::query("DELETE FROM semaphore WHERE strand_id = $1 AND name = $2 AND count = 0")
                .bind(strand_id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(remaining.is_some())
    }

    async fn semaphore_count(&self, strand_id: Uuid, name: &str) -> Result<u64, StorageError> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT count FROM semaphore WHERE strand_id = $1 AND name = $2")
                .bind(strand_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.and_then(|c| u64::try_from(c).ok()).unwrap_or(0))
    }

    async fn clear_semaphores(&self, strand_id: Uuid) -> Result<u64, StorageError> {
        Ok(sqlx::query("DELETE FROM semaphore WHERE strand_id = $1")
            .bind(strand_id)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn count_children(&self, parent_id: Uuid) -> Result<usize, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM strand WHERE parent_id = $1")
            .bind(parent_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn finished_children(&self, parent_id: Uuid) -> Result<Vec<ReapedChild>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, prog, exitval FROM strand \
             WHERE parent_id = $1 AND exitval IS NOT NULL \
             ORDER BY created_at, id",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ReapedChild {
                    id: row.try_get("id")?,
                    prog: row.try_get("prog")?,
                    exitval: row.try_get::<Option<Value>, _>("exitval")?.unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn create_page(&self, summary: &str) -> Result<Page, StorageError> {
        let row = sqlx::query(
            "INSERT INTO page (id, summary) VALUES ($1, $2) \
             RETURNING id, summary, created_at, resolved_at",
        )
        .bind(Uuid::new_v4())
        .bind(summary)
        .fetch_one(&self.pool)
        .await?;
        page_from_row(&row)
    }

    async fn create_owned_page(
        &self,
        summary: &str,
        owner: NewStrand,
    ) -> Result<(Page, Strand), StorageError> {
        let id = owner.id.unwrap_or_else(Uuid::new_v4);
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO page (id, summary) VALUES ($1, $2) \
             RETURNING id, summary, created_at, resolved_at",
        )
        .bind(id)
        .bind(summary)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| unique_violation_as_exists(e, id))?;
        let page = page_from_row(&row)?;
        let strand = insert_strand_with(&mut *tx, owner.with_id(id)).await?;
        tx.commit().await?;
        Ok((page, strand))
    }

    async fn get_page(&self, id: Uuid) -> Result<Option<Page>, StorageError> {
        sqlx::query("SELECT id, summary, created_at, resolved_at FROM page WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(page_from_row)
            .transpose()
    }

    async fn resolve_page(&self, id: Uuid) -> Result<Option<Page>, StorageError> {
        sqlx::query(
            "UPDATE page SET resolved_at = COALESCE(resolved_at, now()) WHERE id = $1 \
             RETURNING id, summary, created_at, resolved_at",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(page_from_row)
        .transpose()
    }

    async fn list_pages(&self, open_only: bool) -> Result<Vec<Page>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, summary, created_at, resolved_at FROM page \
             WHERE NOT $1 OR resolved_at IS NULL \
             ORDER BY created_at",
        )
        .bind(open_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(page_from_row).collect()
    }
}

/// Applies a label's buffered writes inside the transition's transaction.
async fn apply_writes(
    tx: &mut Transaction<'_, Postgres>,
    parent_id: Uuid,
    writes: LabelWrites,
) -> Result<(), StorageError> {
    for (name, taken) in &writes.consumed {
        sqlx::query(
            "UPDATE semaphore SET count = GREATEST(count - $3, 0) \
             WHERE strand_id = $1 AND name = $2",
        )
        .bind(parent_id)
        .bind(name)
        .bind(i64::try_from(*taken).unwrap_or(i64::MAX))
        .execute(&mut **tx)
        .await?;
    }
    if !writes.consumed.is_empty() {
        sqlx::query("DELETE FROM semaphore WHERE strand_id = $1 AND count = 0")
            .bind(parent_id)
            .execute(&mut **tx)
            .await?;
    }

    if !writes.reaped.is_empty() {
        let finished: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM strand \
             WHERE id = ANY($1) AND parent_id = $2 AND exitval IS NOT NULL \
             FOR UPDATE",
        )
        .bind(&writes.reaped)
        .bind(parent_id)
        .fetch_all(&mut **tx)
        .await?;
        sqlx::query("DELETE FROM semaphore WHERE strand_id = ANY($1)")
            .bind(&finished)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM strand WHERE id = ANY($1)")
            .bind(&finished)
            .execute(&mut **tx)
            .await?;
    }

    for child in writes.budded {
        insert_strand_with(&mut **tx, child).await?;
    }
    Ok(())
}

fn unique_violation_as_exists(err: sqlx::Error, id: Uuid) -> StorageError {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            StorageError::AlreadyExists { id }
        }
        other => other.into(),
    }
}
