//! PostgreSQL [`WorkflowStore`] over a sqlx pool.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;
use uuid::Uuid;

use crate::{DbError, DbPool, ExecutionFilter, ExecutionRow, WorkflowRow, WorkflowStore};

const WORKFLOW_COLUMNS: &str = "id, name, version, definition, created_at, updated_at";
const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_version, status, priority, input, context, \
     steps, metrics, error, created_at, started_at, finished_at, updated_at";

#[derive(Clone)]
pub struct PgStorage {
    pool: DbPool,
}

impl PgStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowStore for PgStorage {
    #[instrument(skip(self, row), fields(workflow_id = %row.id, version = row.version))]
    async fn upsert_definition(&self, row: &WorkflowRow) -> Result<WorkflowRow, DbError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let stored = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            INSERT INTO workflows (id, name, version, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name,
                    version = EXCLUDED.version,
                    definition = EXCLUDED.definition,
                    updated_at = EXCLUDED.updated_at
            RETURNING {WORKFLOW_COLUMNS}
            "#
        ))
        .bind(row.id)
        .bind(&row.name)
        .bind(row.version)
        .bind(&row.definition)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_versions (workflow_id, version, name, definition, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_id, version) DO UPDATE
                SET name = EXCLUDED.name, definition = EXCLUDED.definition
            "#,
        )
        .bind(row.id)
        .bind(row.version)
        .bind(&row.name)
        .bind(&row.definition)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_definition_version(&self, id: Uuid, version: i32) -> Result<Option<WorkflowRow>, DbError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT v.workflow_id AS id, v.name, v.version, v.definition, v.created_at, w.updated_at
            FROM workflow_versions v
            JOIN workflows w ON w.id = v.workflow_id
            WHERE v.workflow_id = $1 AND v.version = $2
            "#,
        )
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_definitions(&self, limit: i64, offset: i64) -> Result<Vec<WorkflowRow>, DbError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY name, id LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_definitions(&self) -> Result<i64, DbError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM workflows")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_execution(&self, row: &ExecutionRow) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions
                (id, workflow_id, workflow_version, status, priority, input, context,
                 steps, metrics, error, created_at, started_at, finished_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.workflow_id)
        .bind(row.workflow_version)
        .bind(&row.status)
        .bind(&row.priority)
        .bind(&row.input)
        .bind(&row.context)
        .bind(&row.steps)
        .bind(&row.metrics)
        .bind(&row.error)
        .bind(row.created_at)
        .bind(row.started_at)
        .bind(row.finished_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Conflict(format!("execution {} already exists", row.id)));
        }
        Ok(())
    }

    async fn update_execution(&self, row: &ExecutionRow) -> Result<(), DbError> {
        // The status guard and the write are one statement, so a concurrent
        // terminal transition cannot be overwritten.
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, steps = $3, metrics = $4, error = $5,
                started_at = $6, finished_at = $7, updated_at = $8
            WHERE id = $1
              AND (status NOT IN ('completed', 'failed', 'cancelled') OR status = $2)
            "#,
        )
        .bind(row.id)
        .bind(&row.status)
        .bind(&row.steps)
        .bind(&row.metrics)
        .bind(&row.error)
        .bind(row.started_at)
        .bind(row.finished_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_execution(row.id).await? {
            None => Err(DbError::NotFound),
            Some(stored) => Err(DbError::Conflict(format!(
                "execution {} is already {} and cannot become {}",
                row.id, stored.status, row.status
            ))),
        }
    }

    async fn delete_execution(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM executions WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DbError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRow>, DbError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM executions
            WHERE ($1::uuid IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.workflow_id)
        .bind(&filter.status)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_executions_by_status(&self) -> Result<HashMap<String, i64>, DbError> {
        let rows = sqlx::query_as::<_, (String, i64)>("SELECT status, COUNT(*) FROM executions GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
