//! Postgres queue store via direct SQLx.
//!
//! The claim is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)`:
//! concurrent claimers never wait on each other's rows, they move on to the
//! next eligible one. All timestamps come from the database clock so workers
//! on different hosts agree on lease expiry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::warn;

use super::{Abandoned, Claim, ClaimOptions, QueueStore, check_delay, lease_expired_error};
use crate::error::{Error, Result};
use crate::model::{Lease, QueueStats, State, UnitId, WorkUnit};
use crate::telemetry::metrics;

const UNIT_COLUMNS: &str = "id, kind, payload, state, owner, lease_expires_at, attempt_count, last_error, not_before, created_at, settled_at";

/// Postgres-backed store. Owns the connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_state(&self, id: UnitId) -> Result<Option<State>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT state FROM work_units WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(s,)| s.parse()).transpose()
    }

    /// Map a settle that touched no rows to the reason why.
    async fn reject(&self, lease: &Lease) -> Error {
        match self.current_state(lease.unit_id).await {
            Ok(current) => lease.rejection(current),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn enqueue(&self, kind: &str, payload: serde_json::Value) -> Result<UnitId> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO work_units (kind, payload, state) VALUES ($1, $2, 'pending') RETURNING id",
        )
        .bind(kind)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;

        metrics::units_enqueued().add(1, &[KeyValue::new("kind", kind.to_string())]);
        Ok(UnitId(id))
    }

    async fn get(&self, id: UnitId) -> Result<WorkUnit> {
        let row: Option<WorkUnitRow> =
            sqlx::query_as(&format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(Error::NotFound(id))?.try_into_work_unit()
    }

    async fn claim(&self, worker_id: &str, opts: &ClaimOptions) -> Result<Claim> {
        check_delay("lease duration", opts.lease_duration)?;
        let max_attempts = opts.max_attempts as i32;
        let mut tx = self.pool.begin().await?;

        // Expired leases that already used every attempt are settled, not reclaimed.
        let abandoned: Vec<(i64, Option<String>, i32)> = sqlx::query_as(
            "SELECT id, owner, attempt_count FROM work_units
             WHERE state = 'owned' AND lease_expires_at < now() AND attempt_count >= $1
             ORDER BY id
             FOR UPDATE SKIP LOCKED",
        )
        .bind(max_attempts)
        .fetch_all(&mut *tx)
        .await?;

        let mut claim = Claim::default();
        for (id, owner, attempts) in abandoned {
            let error = lease_expired_error(attempts.max(0) as u32);
            warn!(id, attempts, "abandoning unit with expired lease");
            sqlx::query(
                "UPDATE work_units
                 SET state = 'failed', owner = NULL, lease_expires_at = NULL,
                     last_error = $2, settled_at = now()
                 WHERE id = $1",
            )
            .bind(id)
            .bind(&error)
            .execute(&mut *tx)
            .await?;
            claim.abandoned.push(Abandoned {
                id: UnitId(id),
                owner: owner.unwrap_or_default(),
                attempt: attempts.max(0) as u32,
                error,
            });
        }

        let row: Option<ClaimedRow> = sqlx::query_as(&format!(
            "WITH picked AS (
                 SELECT id AS picked_id, owner AS previous_owner FROM work_units
                 WHERE (state = 'pending' AND (not_before IS NULL OR not_before <= now()))
                    OR (state = 'owned' AND lease_expires_at < now() AND attempt_count < $3)
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE work_units
             SET state = 'owned',
                 owner = $1,
                 lease_expires_at = now() + make_interval(secs => $2),
                 attempt_count = attempt_count + 1,
                 not_before = NULL
             FROM picked
             WHERE id = picked.picked_id
             RETURNING {UNIT_COLUMNS}, picked.previous_owner"
        ))
        .bind(worker_id)
        .bind(opts.lease_duration.as_secs_f64())
        .bind(max_attempts)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(row) = row {
            claim.previous_owner = row.previous_owner;
            claim.unit = Some(row.unit.try_into_work_unit()?);
        }
        Ok(claim)
    }

    async fn settle_completed(&self, lease: &Lease) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE work_units
             SET state = 'completed', owner = NULL, lease_expires_at = NULL, settled_at = now()
             WHERE id = $1 AND state = 'owned' AND owner = $2 AND attempt_count = $3",
        )
        .bind(lease.unit_id.0)
        .bind(&lease.worker_id)
        .bind(lease.attempt as i32)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.reject(lease).await);
        }
        Ok(())
    }

    async fn settle_failed(&self, lease: &Lease, error: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE work_units
             SET state = 'failed', owner = NULL, lease_expires_at = NULL,
                 last_error = $4, settled_at = now()
             WHERE id = $1 AND state = 'owned' AND owner = $2 AND attempt_count = $3",
        )
        .bind(lease.unit_id.0)
        .bind(&lease.worker_id)
        .bind(lease.attempt as i32)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.reject(lease).await);
        }
        Ok(())
    }

    async fn requeue(&self, lease: &Lease, error: &str, delay: Duration) -> Result<()> {
        check_delay("retry delay", delay)?;
        let rows_affected = sqlx::query(
            "UPDATE work_units
             SET state = 'pending', owner = NULL, lease_expires_at = NULL,
                 last_error = $4, not_before = now() + make_interval(secs => $5)
             WHERE id = $1 AND state = 'owned' AND owner = $2 AND attempt_count = $3",
        )
        .bind(lease.unit_id.0)
        .bind(&lease.worker_id)
        .bind(lease.attempt as i32)
        .bind(error)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.reject(lease).await);
        }
        Ok(())
    }

    async fn count_by_state(&self, state: State) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_units WHERE state = $1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT state,
                    COUNT(*),
                    COUNT(*) FILTER (WHERE state = 'owned' AND lease_expires_at < now())
             FROM work_units
             GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (state, count, expired) in rows {
            stats.bump(state.parse()?, count as u64);
            stats.expired_leases += expired as u64;
        }
        Ok(stats)
    }

    async fn expired_leases(&self, limit: usize) -> Result<Vec<WorkUnit>> {
        let rows: Vec<WorkUnitRow> = sqlx::query_as(&format!(
            "SELECT {UNIT_COLUMNS} FROM work_units
             WHERE state = 'owned' AND lease_expires_at < now()
             ORDER BY lease_expires_at ASC, id ASC
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(WorkUnitRow::try_into_work_unit)
            .collect()
    }

    /// Simple health check: run a SELECT 1.
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkUnitRow {
    id: i64,
    kind: String,
    payload: serde_json::Value,
    state: String,
    owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_error: Option<String>,
    not_before: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

/// A claimed row plus its owner before the claim.
#[derive(sqlx::FromRow)]
struct ClaimedRow {
    #[sqlx(flatten)]
    unit: WorkUnitRow,
    previous_owner: Option<String>,
}

impl WorkUnitRow {
    fn try_into_work_unit(self) -> Result<WorkUnit> {
        let state: State = self.state.parse()?;
        let owned = state == State::Owned;
        Ok(WorkUnit {
            id: UnitId(self.id),
            kind: self.kind,
            payload: self.payload,
            state,
            owner: self.owner.filter(|_| owned),
            lease_expires_at: self.lease_expires_at.filter(|_| owned),
            attempt_count: self.attempt_count.max(0) as u32,
            last_error: self.last_error,
            not_before: self.not_before,
            created_at: self.created_at,
            settled_at: self.settled_at,
        })
    }
}
