//! In-memory [`WorkflowStore`] for tests and single-node runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::is_terminal;
use crate::{DbError, ExecutionFilter, ExecutionRow, WorkflowRow, WorkflowStore};

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, WorkflowRow>,
    versions: BTreeMap<(Uuid, i32), WorkflowRow>,
    executions: HashMap<Uuid, ExecutionRow>,
}

/// All tables behind one lock, so multi-row writes are atomic.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStorage {
    async fn upsert_definition(&self, row: &WorkflowRow) -> Result<WorkflowRow, DbError> {
        let mut tables = self.tables.write().await;
        let mut stored = row.clone();
        if let Some(existing) = tables.workflows.get(&row.id) {
            stored.created_at = existing.created_at;
        }
        stored.updated_at = Utc::now();
        tables.versions.insert((row.id, row.version), stored.clone());
        tables.workflows.insert(row.id, stored.clone());
        Ok(stored)
    }

    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError> {
        Ok(self.tables.read().await.workflows.get(&id).cloned())
    }

    async fn get_definition_version(&self, id: Uuid, version: i32) -> Result<Option<WorkflowRow>, DbError> {
        Ok(self.tables.read().await.versions.get(&(id, version)).cloned())
    }

    async fn list_definitions(&self, limit: i64, offset: i64) -> Result<Vec<WorkflowRow>, DbError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<WorkflowRow> = tables.workflows.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rows.into_iter().skip(offset.max(0) as usize).take(limit.max(0) as usize).collect())
    }

    async fn count_definitions(&self) -> Result<i64, DbError> {
        Ok(self.tables.read().await.workflows.len() as i64)
    }

    async fn insert_execution(&self, row: &ExecutionRow) -> Result<(), DbError> {
        let mut tables = self.tables.write().await;
        if tables.executions.contains_key(&row.id) {
            return Err(DbError::Conflict(format!("execution {} already exists", row.id)));
        }
        tables.executions.insert(row.id, row.clone());
        Ok(())
    }

    async fn update_execution(&self, row: &ExecutionRow) -> Result<(), DbError> {
        let mut tables = self.tables.write().await;
        let stored = tables.executions.get_mut(&row.id).ok_or(DbError::NotFound)?;
        if is_terminal(&stored.status) && stored.status != row.status {
            return Err(DbError::Conflict(format!(
                "execution {} is already {} and cannot become {}",
                row.id, stored.status, row.status
            )));
        }
        *stored = row.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_execution(&self, id: Uuid) -> Result<bool, DbError> {
        Ok(self.tables.write().await.executions.remove(&id).is_some())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DbError> {
        Ok(self.tables.read().await.executions.get(&id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRow>, DbError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ExecutionRow> = tables
            .executions
            .values()
            .filter(|r| filter.workflow_id.map_or(true, |w| r.workflow_id == w))
            .filter(|r| filter.status.as_deref().map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn count_executions_by_status(&self) -> Result<HashMap<String, i64>, DbError> {
        let mut counts = HashMap::new();
        for row in self.tables.read().await.executions.values() {
            *counts.entry(row.status.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), DbError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn workflow(version: i32) -> WorkflowRow {
        let now = Utc::now();
        WorkflowRow {
            id: Uuid::nil(),
            name: "line-check".into(),
            version,
            definition: json!({ "version": version }),
            created_at: now,
            updated_at: now,
        }
    }

    fn execution(status: &str, age_secs: i64) -> ExecutionRow {
        let created = Utc::now() - Duration::seconds(age_secs);
        ExecutionRow {
            id: Uuid::new_v4(),
            workflow_id: Uuid::nil(),
            workflow_version: 1,
            status: status.into(),
            priority: "normal".into(),
            input: json!({}),
            context: json!({}),
            steps: json!([]),
            metrics: json!({}),
            error: None,
            created_at: created,
            started_at: None,
            finished_at: None,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_version_history() {
        let db = InMemoryStorage::new();
        db.upsert_definition(&workflow(1)).await.unwrap();
        db.upsert_definition(&workflow(2)).await.unwrap();

        assert_eq!(db.count_definitions().await.unwrap(), 1);
        assert_eq!(db.get_definition(Uuid::nil()).await.unwrap().unwrap().version, 2);
        let v1 = db.get_definition_version(Uuid::nil(), 1).await.unwrap().unwrap();
        assert_eq!(v1.definition["version"], 1);
    }

    #[tokio::test]
    async fn terminal_status_is_frozen() {
        let db = InMemoryStorage::new();
        let mut row = execution("running", 0);
        db.insert_execution(&row).await.unwrap();

        row.status = "completed".into();
        db.update_execution(&row).await.unwrap();
        // Same status may still be rewritten (e.g. final metrics).
        db.update_execution(&row).await.unwrap();

        row.status = "failed".into();
        assert!(matches!(db.update_execution(&row).await, Err(DbError::Conflict(_))));
        assert_eq!(db.get_execution(row.id).await.unwrap().unwrap().status, "completed");
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let db = InMemoryStorage::new();
        let row = execution("queued", 0);
        db.insert_execution(&row).await.unwrap();
        assert!(matches!(db.insert_execution(&row).await, Err(DbError::Conflict(_))));
        assert!(db.delete_execution(row.id).await.unwrap());
        assert!(db.get_execution(row.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lists_newest_first_with_filter_and_paging() {
        let db = InMemoryStorage::new();
        let old = execution("failed", 30);
        let mid = execution("completed", 20);
        let new = execution("completed", 10);
        for r in [&old, &mid, &new] {
            db.insert_execution(r).await.unwrap();
        }

        let completed = db
            .list_executions(&ExecutionFilter { status: Some("completed".into()), ..ExecutionFilter::default() })
            .await
            .unwrap();
        assert_eq!(completed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![new.id, mid.id]);

        let page = db
            .list_executions(&ExecutionFilter { limit: 1, offset: 1, ..ExecutionFilter::default() })
            .await
            .unwrap();
        assert_eq!(page[0].id, mid.id);

        let counts = db.count_executions_by_status().await.unwrap();
        assert_eq!(counts.get("completed"), Some(&2));
    }
}
