//! Pooled access to the workflow store.
//!
//! Every persistence call from the engine borrows a [`StorageHandle`] from a
//! [`ConnectionPool`], which bounds concurrent storage work and health-checks
//! handles on return.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use db::{DbError, WorkflowStore};
use pool::{ConnectionFactory, ConnectionPool, PoolError, PoolResult};
use tracing::warn;

pub type StoragePool = ConnectionPool<StorageFactory>;

pub struct StorageHandle {
    store: Arc<dyn WorkflowStore>,
    opened_at: DateTime<Utc>,
}

impl StorageHandle {
    pub fn store(&self) -> &dyn WorkflowStore {
        self.store.as_ref()
    }

    pub fn shared(&self) -> Arc<dyn WorkflowStore> {
        self.store.clone()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

pub struct StorageFactory {
    store: Arc<dyn WorkflowStore>,
}

impl StorageFactory {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConnectionFactory for StorageFactory {
    type Connection = StorageHandle;

    async fn create(&self) -> PoolResult<StorageHandle> {
        self.store.health_check().await.map_err(|e: DbError| PoolError::Create(e.to_string()))?;
        Ok(StorageHandle { store: self.store.clone(), opened_at: Utc::now() })
    }

    async fn validate(&self, conn: &mut StorageHandle) -> bool {
        match conn.store.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "storage handle failed health check");
                false
            }
        }
    }
}
