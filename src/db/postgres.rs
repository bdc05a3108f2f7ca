//! Postgres-backed serial store.
//!
//! Schema lives in `migrations/` and is applied with `sqlx::migrate!`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{SerialStore, record_enqueued, record_transition, validate_transition};
use crate::error::{Error, Result};
use crate::model::{
    self, NewOperation, Operation, OperationId, RegisteredWorker, SerialLockState, Status,
};

const OPERATION_COLUMNS: &str = "id, name, worker_name, status, extras, expected, affected, created_at, updated_at, started_at, ended_at, log";

/// Database handle. Owns the connection pool shared with the item catalog.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Connection pool, for collaborators sharing the database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_status(&self, id: OperationId) -> Result<Status> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM serial_operations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("operation {id}")))?
            .0
            .parse()
    }
}

#[async_trait]
impl SerialStore for PgStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn enqueue(&self, new: NewOperation) -> Result<OperationId> {
        let now = model::now();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO serial_operations (name, status, extras, expected, affected, created_at, updated_at)
             VALUES ($1, 'created', $2, 0, 0, $3, $3)
             RETURNING id",
        )
        .bind(&new.name)
        .bind(&new.extras)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        record_enqueued(&new.name);
        Ok(id)
    }

    async fn peek_and_claim(&self, worker_name: &str) -> Result<Option<Operation>> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM serial_operations WHERE status = 'created' ORDER BY id LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = model::now();
        let rows_affected = sqlx::query(
            "UPDATE serial_operations
             SET status = 'processing', worker_name = $1, updated_at = $2, started_at = COALESCE(started_at, $2)
             WHERE id = $3 AND status = 'created'",
        )
        .bind(worker_name)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected != 1 {
            tx.commit().await?;
            return Ok(None);
        }

        let row: OperationRow = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM serial_operations WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record_transition(Status::Created, Status::Processing);
        row.try_into_operation().map(Some)
    }

    async fn complete(
        &self,
        operation: &Operation,
        affected: i64,
        log: Option<&str>,
    ) -> Result<()> {
        validate_transition(operation.status, Status::Done)?;

        let now = model::now();
        let rows_affected = sqlx::query(
            "UPDATE serial_operations
             SET status = 'done', updated_at = $1, ended_at = $1, expected = $2, affected = $3, log = COALESCE($4, log)
             WHERE id = $5 AND status = 'processing'",
        )
        .bind(now)
        .bind(operation.expected)
        .bind(affected)
        .bind(log)
        .bind(operation.id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let from = self.current_status(operation.id).await?;
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: Status::Done.to_string(),
            });
        }

        record_transition(Status::Processing, Status::Done);
        Ok(())
    }

    async fn fail(&self, operation: &Operation, error: &str) -> Result<()> {
        validate_transition(operation.status, Status::Failed)?;

        let now = model::now();
        let rows_affected = sqlx::query(
            "UPDATE serial_operations
             SET status = 'failed', updated_at = $1, ended_at = COALESCE(ended_at, $1),
                 expected = $2, affected = $3,
                 log = CASE WHEN log IS NULL OR log = '' THEN $4 ELSE log || E'\\n' || $4 END
             WHERE id = $5 AND status IN ('processing', 'failed')",
        )
        .bind(now)
        .bind(operation.expected)
        .bind(operation.affected)
        .bind(error)
        .bind(operation.id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let from = self.current_status(operation.id).await?;
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: Status::Failed.to_string(),
            });
        }

        record_transition(operation.status, Status::Failed);
        Ok(())
    }

    async fn get(&self, id: OperationId) -> Result<Operation> {
        let row: Option<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM serial_operations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("operation {id}")))?
            .try_into_operation()
    }

    async fn list(&self, status: Option<Status>, limit: i64) -> Result<Vec<Operation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM serial_operations
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY id DESC LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(OperationRow::try_into_operation)
            .collect()
    }

    async fn try_lock(&self, worker_name: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE serial_lock SET worker_name = $1, last_update = $2
             WHERE id = 1 AND worker_name IS NULL",
        )
        .bind(worker_name)
        .bind(model::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn refresh_lock(&self, worker_name: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE serial_lock SET last_update = $1 WHERE id = 1 AND worker_name = $2",
        )
        .bind(model::now())
        .bind(worker_name)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn take_over_lock(&self, worker_name: &str, seen: &SerialLockState) -> Result<bool> {
        let Some(ref holder) = seen.worker_name else {
            return Ok(false);
        };
        let rows_affected = sqlx::query(
            "UPDATE serial_lock SET worker_name = $1, last_update = $2
             WHERE id = 1 AND worker_name = $3 AND last_update = $4",
        )
        .bind(worker_name)
        .bind(model::now())
        .bind(holder)
        .bind(seen.last_update)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn release_lock(&self, worker_name: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE serial_lock SET worker_name = NULL, last_update = $2
             WHERE id = 1 AND worker_name = $1",
        )
        .bind(worker_name)
        .bind(model::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn clear_lock(&self) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;
        let previous: Option<(Option<String>,)> =
            sqlx::query_as("SELECT worker_name FROM serial_lock WHERE id = 1 FOR UPDATE")
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query("UPDATE serial_lock SET worker_name = NULL, last_update = $1 WHERE id = 1")
            .bind(model::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(previous.and_then(|(holder,)| holder))
    }

    async fn lock_state(&self) -> Result<SerialLockState> {
        let row: Option<(Option<String>, DateTime<Utc>)> =
            sqlx::query_as("SELECT worker_name, last_update FROM serial_lock WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        let (worker_name, last_update) =
            row.ok_or_else(|| Error::NotFound("serial lock row".to_string()))?;
        Ok(SerialLockState {
            worker_name,
            last_update,
        })
    }

    async fn register_worker(&self, worker_name: &str) -> Result<RegisteredWorker> {
        let row: Option<WorkerRow> = sqlx::query_as(
            "UPDATE registered_workers SET last_restart = $1 WHERE worker_name = $2
             RETURNING id, worker_name, last_restart",
        )
        .bind(model::now())
        .bind(worker_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into)
            .ok_or_else(|| Error::UnknownWorker(worker_name.to_string()))
    }

    async fn provision_worker(&self, worker_name: &str) -> Result<RegisteredWorker> {
        sqlx::query(
            "INSERT INTO registered_workers (worker_name, last_restart) VALUES ($1, $2)
             ON CONFLICT (worker_name) DO NOTHING",
        )
        .bind(worker_name)
        .bind(model::now())
        .execute(&self.pool)
        .await?;

        let row: WorkerRow = sqlx::query_as(
            "SELECT id, worker_name, last_restart FROM registered_workers WHERE worker_name = $1",
        )
        .bind(worker_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn list_workers(&self) -> Result<Vec<RegisteredWorker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            "SELECT id, worker_name, last_restart FROM registered_workers ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct OperationRow {
    id: i64,
    name: String,
    worker_name: Option<String>,
    status: String,
    extras: serde_json::Value,
    expected: i64,
    affected: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    log: Option<String>,
}

impl OperationRow {
    fn try_into_operation(self) -> Result<Operation> {
        Ok(Operation {
            id: self.id,
            name: self.name,
            worker_name: self.worker_name,
            status: self.status.parse()?,
            extras: self.extras,
            expected: self.expected,
            affected: self.affected,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            log: self.log,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: i64,
    worker_name: String,
    last_restart: DateTime<Utc>,
}

impl From<WorkerRow> for RegisteredWorker {
    fn from(row: WorkerRow) -> Self {
        Self {
            id: row.id,
            worker_name: row.worker_name,
            last_restart: row.last_restart,
        }
    }
}
