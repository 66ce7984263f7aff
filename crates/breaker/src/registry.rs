//! Named breakers sharing one store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use coord::{CoordError, CoordinationStore};

use crate::circuit_breaker::{BreakerConfig, CircuitBreakerState, DistributedCircuitBreaker};

/// Hands out one [`DistributedCircuitBreaker`] per name.
pub struct BreakerRegistry {
    store: Arc<dyn CoordinationStore>,
    default_config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<DistributedCircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, default_config: BreakerConfig) -> Self {
        Self { store, default_config, breakers: RwLock::new(HashMap::new()) }
    }

    /// Breaker for `name`, created with the default config on first use.
    pub fn get(&self, name: &str) -> Arc<DistributedCircuitBreaker> {
        self.with_config(name, self.default_config.clone())
    }

    /// Breaker for `name`; `config` only applies if it does not exist yet.
    pub fn with_config(&self, name: &str, config: BreakerConfig) -> Arc<DistributedCircuitBreaker> {
        if let Ok(map) = self.breakers.read() {
            if let Some(existing) = map.get(name) {
                return existing.clone();
            }
        }
        let mut map = match self.breakers.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(DistributedCircuitBreaker::new(name, self.store.clone(), config)))
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.breakers.read() {
            Ok(map) => map.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        names.sort();
        names
    }

    /// Fresh state of every registered breaker, sorted by name.
    pub async fn snapshots(&self) -> Result<Vec<(String, CircuitBreakerState)>, CoordError> {
        let mut out = Vec::new();
        for name in self.names() {
            let breaker = self.get(&name);
            out.push((name, breaker.snapshot().await?));
        }
        Ok(out)
    }
}
