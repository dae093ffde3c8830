//! `PostgreSQL` saga execution ledger.
//!
//! Table:
//!
//! ```sql
//! CREATE TABLE saga_executions (
//!     id UUID PRIMARY KEY,
//!     saga_name TEXT NOT NULL,
//!     status TEXT NOT NULL,
//!     current_step INT NOT NULL,
//!     completed_steps JSONB NOT NULL DEFAULT '[]',
//!     failed_step TEXT,
//!     error TEXT,
//!     started_at TIMESTAMPTZ NOT NULL,
//!     completed_at TIMESTAMPTZ,
//!     context JSONB NOT NULL DEFAULT '{}'
//! );
//! CREATE INDEX idx_saga_executions_name ON saga_executions (saga_name, started_at DESC);
//! ```
//!
//! The orchestrator persists after every transition (step start, step
//! completion, compensation boundary), so a crash leaves a ledger showing
//! exactly how far the execution got.

use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use taskflow_core::saga::{
    SagaContext, SagaError, SagaExecution, SagaStatRow, SagaStatus, SagaStore,
};
use uuid::Uuid;

/// `PostgreSQL`-backed [`SagaStore`].
pub struct PostgresSagaStore {
    pool: PgPool,
}

const COLUMNS: &str = "id, saga_name, status, current_step, completed_steps, failed_step, \
     error, started_at, completed_at, context";

impl PostgresSagaStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<SagaExecution, SagaError> {
        let status_str: String = row.get("status");
        let completed_steps: serde_json::Value = row.get("completed_steps");
        let context: serde_json::Value = row.get("context");

        Ok(SagaExecution {
            id: row.get("id"),
            saga_name: row.get("saga_name"),
            status: SagaStatus::parse(&status_str)?,
            current_step: row.get("current_step"),
            completed_steps: serde_json::from_value(completed_steps)
                .map_err(|e| SagaError::Database(format!("invalid completed_steps: {e}")))?,
            failed_step: row.get("failed_step"),
            error: row.get("error"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            context: serde_json::from_value::<SagaContext>(context)
                .map_err(|e| SagaError::Database(format!("invalid context: {e}")))?,
        })
    }

    fn context_json(execution: &SagaExecution) -> Result<serde_json::Value, SagaError> {
        serde_json::to_value(&execution.context)
            .map_err(|e| SagaError::Database(format!("context not serializable: {e}")))
    }

    fn completed_steps_json(execution: &SagaExecution) -> serde_json::Value {
        serde_json::Value::Array(
            execution
                .completed_steps
                .iter()
                .map(|s| serde_json::Value::String(s.clone()))
                .collect(),
        )
    }
}

impl SagaStore for PostgresSagaStore {
    fn insert(
        &self,
        execution: &SagaExecution,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>> {
        let execution = execution.clone();

        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO saga_executions (
                    id, saga_name, status, current_step, completed_steps,
                    failed_step, error, started_at, completed_at, context
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ",
            )
            .bind(execution.id)
            .bind(&execution.saga_name)
            .bind(execution.status.as_str())
            .bind(execution.current_step)
            .bind(Self::completed_steps_json(&execution))
            .bind(&execution.failed_step)
            .bind(&execution.error)
            .bind(execution.started_at)
            .bind(execution.completed_at)
            .bind(Self::context_json(&execution)?)
            .execute(&self.pool)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

            Ok(())
        })
    }

    fn update(
        &self,
        execution: &SagaExecution,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>> {
        let execution = execution.clone();

        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE saga_executions
                SET status = $2, current_step = $3, completed_steps = $4,
                    failed_step = $5, error = $6, completed_at = $7, context = $8
                WHERE id = $1
                ",
            )
            .bind(execution.id)
            .bind(execution.status.as_str())
            .bind(execution.current_step)
            .bind(Self::completed_steps_json(&execution))
            .bind(&execution.failed_step)
            .bind(&execution.error)
            .bind(execution.completed_at)
            .bind(Self::context_json(&execution)?)
            .execute(&self.pool)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(SagaError::ExecutionNotFound(execution.id));
            }
            Ok(())
        })
    }

    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<SagaExecution, SagaError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM saga_executions WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SagaError::Database(e.to_string()))?;

            row.as_ref()
                .map(Self::row_to_execution)
                .transpose()?
                .ok_or(SagaError::ExecutionNotFound(id))
        })
    }

    fn history(
        &self,
        saga_name: Option<&str>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaExecution>, SagaError>> + Send + '_>> {
        let saga_name = saga_name.map(ToString::to_string);

        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // History limits are small
            let rows = sqlx::query(&format!(
                r"
                SELECT {COLUMNS}
                FROM saga_executions
                WHERE ($1::text IS NULL OR saga_name = $1)
                ORDER BY started_at DESC
                LIMIT $2
                "
            ))
            .bind(&saga_name)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

            rows.iter().map(Self::row_to_execution).collect()
        })
    }

    fn stats(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaStatRow>, SagaError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT saga_name, status, COUNT(*) AS count
                FROM saga_executions
                GROUP BY saga_name, status
                ORDER BY saga_name ASC, status ASC
                ",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

            rows.iter()
                .map(|row| {
                    let status_str: String = row.get("status");
                    Ok(SagaStatRow {
                        saga_name: row.get("saga_name"),
                        status: SagaStatus::parse(&status_str)?,
                        count: row.get("count"),
                    })
                })
                .collect()
        })
    }
}

impl std::fmt::Debug for PostgresSagaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSagaStore").finish_non_exhaustive()
    }
}

// Exercised against a real database in tests/integration_tests.rs.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PostgresSagaStore>();
        assert_sync::<PostgresSagaStore>();
    }
}
