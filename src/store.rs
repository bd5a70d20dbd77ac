//! The durable store gateway: every SQL statement the processor issues
//! against its own bookkeeping database lives here, behind a narrow,
//! typed API. Nothing else in the crate holds a `PgPool` or writes SQL.
//!
//! Queries are written with the runtime `sqlx::query`/`query_as` API rather
//! than the `query!` macros: the macros need either a live database or a
//! checked-in offline cache at build time, and this process has neither.

use anyhow::Context;
use serde_json::Value;
use sqlx::PgPool;

use crate::models::{Query, RunningByUser, User, UserSettings};
use crate::util::IntoPgInterval;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// All queries still waiting to be admitted, oldest first. The scheduler
    /// applies its own fairness ordering on top of this; the store only
    /// guarantees FIFO-by-creation as the base ordering (data model
    /// invariant: fair admission never starves oldest work indefinitely).
    pub async fn list_pending(&self) -> anyhow::Result<Vec<Query>> {
        sqlx::query_as::<_, Query>(
            "SELECT id, user_id, query_text, db_username, db_password, db_tns,
                    export_location, export_type, export_filename, ssh_hostname,
                    status, error_message, result_metadata,
                    created_at, started_at, updated_at, completed_at
               FROM queries
              WHERE status = 'pending'
              ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending queries")
    }

    /// Queries the store considers active (`running` or `transferring`),
    /// grouped by owner. Used once at startup to seed the scheduler's
    /// in-memory admission ledger; thereafter the ledger is authoritative.
    pub async fn running_counts_by_user(&self) -> anyhow::Result<RunningByUser> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT user_id, COUNT(*) FROM queries
              WHERE status IN ('running', 'transferring')
              GROUP BY user_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to count active queries by user")?;

        Ok(rows
            .into_iter()
            .map(|(user_id, count)| (user_id, count as usize))
            .collect())
    }

    pub async fn user(&self, user_id: i64) -> anyhow::Result<User> {
        sqlx::query_as::<_, User>(
            "SELECT id, email, hashed_password, is_active FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to load user {user_id}"))
    }

    pub async fn user_settings(&self, user_id: i64) -> anyhow::Result<Option<UserSettings>> {
        sqlx::query_as::<_, UserSettings>(
            "SELECT id, user_id, export_location, export_type, max_parallel_queries,
                    ssh_hostname, ssh_port, ssh_username, ssh_password, ssh_key,
                    ssh_key_passphrase
               FROM user_settings
              WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load settings for user {user_id}"))
    }

    pub async fn query_by_id(&self, query_id: i64) -> anyhow::Result<Query> {
        sqlx::query_as::<_, Query>(
            "SELECT id, user_id, query_text, db_username, db_password, db_tns,
                    export_location, export_type, export_filename, ssh_hostname,
                    status, error_message, result_metadata,
                    created_at, started_at, updated_at, completed_at
               FROM queries
              WHERE id = $1",
        )
        .bind(query_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to load query {query_id}"))
    }

    /// Move a query to `running`, stamping `started_at` the first time this
    /// happens (idempotent across retries of the same transition).
    pub async fn mark_running(&self, query_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE queries
                SET status = 'running',
                    started_at = COALESCE(started_at, CURRENT_TIMESTAMP),
                    updated_at = CURRENT_TIMESTAMP
              WHERE id = $1",
        )
        .bind(query_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark query {query_id} running"))?;
        Ok(())
    }

    /// Merge `metadata` into the row's existing `result_metadata` JSON
    /// object (data model invariant 3) and move it to `transferring`.
    pub async fn mark_transferring(&self, query_id: i64, metadata: Value) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE queries
                SET status = 'transferring',
                    updated_at = CURRENT_TIMESTAMP,
                    result_metadata = result_metadata || $2
              WHERE id = $1",
        )
        .bind(query_id)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark query {query_id} transferring"))?;
        Ok(())
    }

    /// Merge `metadata` into the row's existing `result_metadata` JSON
    /// object (data model invariant 3) and move it to `completed`.
    pub async fn mark_completed(&self, query_id: i64, metadata: Value) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE queries
                SET status = 'completed',
                    completed_at = CURRENT_TIMESTAMP,
                    updated_at = CURRENT_TIMESTAMP,
                    result_metadata = result_metadata || $2
              WHERE id = $1",
        )
        .bind(query_id)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark query {query_id} completed"))?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        query_id: i64,
        error_message: &str,
        metadata: Value,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE queries
                SET status = 'failed',
                    error_message = $2,
                    completed_at = CURRENT_TIMESTAMP,
                    updated_at = CURRENT_TIMESTAMP,
                    result_metadata = result_metadata || $3
              WHERE id = $1",
        )
        .bind(query_id)
        .bind(error_message)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark query {query_id} failed"))?;
        Ok(())
    }

    /// Queries left in an active state for longer than `threshold`, with no
    /// worker that could plausibly still be driving them. Used by the
    /// startup reaper to reconcile state left behind by a prior process
    /// that crashed mid-run.
    pub async fn find_stuck(
        &self,
        threshold: std::time::Duration,
    ) -> anyhow::Result<Vec<Query>> {
        sqlx::query_as::<_, Query>(
            "SELECT id, user_id, query_text, db_username, db_password, db_tns,
                    export_location, export_type, export_filename, ssh_hostname,
                    status, error_message, result_metadata,
                    created_at, started_at, updated_at, completed_at
               FROM queries
              WHERE status IN ('running', 'transferring')
                AND updated_at < CURRENT_TIMESTAMP - $1::interval",
        )
        .bind(threshold.into_pg_interval())
        .fetch_all(&self.pool)
        .await
        .context("failed to list stuck queries")
    }

    /// Insert a rerun of `source` as a brand new `pending` row. The source
    /// row is never mutated (data model invariant: reruns are isolated).
    pub async fn rerun(&self, source: &Query) -> anyhow::Result<i64> {
        let inputs = source.rerun_inputs();

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO queries
                (user_id, query_text, db_username, db_password, db_tns,
                 export_location, export_type, export_filename, ssh_hostname, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
             RETURNING id",
        )
        .bind(inputs.user_id)
        .bind(inputs.query_text)
        .bind(inputs.db_username)
        .bind(inputs.db_password)
        .bind(inputs.db_tns)
        .bind(inputs.export_location)
        .bind(inputs.export_type)
        .bind(inputs.export_filename)
        .bind(inputs.ssh_hostname)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert rerun query")?;

        Ok(id)
    }
}
