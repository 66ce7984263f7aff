//! Scheduled pruning of conversational / operational memory entries.
//!
//! Input: `{"entries": [{"timestamp": "<rfc3339>", ...}, ...]}`.
//! Config: `max_age_secs` (drop older entries) and `max_entries` (keep the newest N).

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use crate::{Agent, AgentError, AgentRequest};

pub struct MemoryPruningAgent;

fn timestamp(entry: &Value) -> Option<DateTime<Utc>> {
    entry
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl Agent for MemoryPruningAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let entries = request
            .input
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| AgentError::Fatal("'entries' must be an array".into()))?;
        let max_age = request.setting("max_age_secs").and_then(Value::as_i64);
        let max_entries = request.setting("max_entries").and_then(Value::as_u64).map(|n| n as usize);

        let now = Utc::now();
        let mut kept: Vec<(Option<DateTime<Utc>>, &Value)> = entries
            .iter()
            .map(|e| (timestamp(e), e))
            .filter(|(ts, _)| match (max_age, ts) {
                (Some(secs), Some(ts)) => now.signed_duration_since(*ts) <= ChronoDuration::seconds(secs),
                // Entries without a timestamp cannot be aged out.
                _ => true,
            })
            .collect();

        if let Some(limit) = max_entries {
            // Newest first, undated entries last.
            kept.sort_by(|a, b| b.0.cmp(&a.0));
            kept.truncate(limit);
        }

        let pruned = entries.len() - kept.len();
        Ok(json!({
            "entries": kept.into_iter().map(|(_, e)| e.clone()).collect::<Vec<_>>(),
            "pruned": pruned,
        }))
    }
}
