pub mod executions;
pub mod metrics;
pub mod webhooks;
pub mod workflows;

use serde::Deserialize;

fn default_limit() -> i64 {
    50
}

/// `?limit=&offset=` on list routes.
#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl Page {
    pub fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, 500), self.offset.max(0))
    }
}
