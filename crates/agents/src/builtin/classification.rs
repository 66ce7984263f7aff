//! Keyword classification of free text.
//!
//! Config: `{"labels": {"<label>": ["keyword", ...]}, "field": "text", "default_label": "other"}`.
//! The label with the most keyword hits wins; confidence is its share of all hits.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{required_str, string_list};
use crate::{Agent, AgentError, AgentRequest};

pub struct ClassificationAgent;

#[async_trait]
impl Agent for ClassificationAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let field = request.config.get("field").and_then(Value::as_str).unwrap_or("text");
        let text = match &request.input {
            Value::String(s) => s.as_str(),
            other => required_str(other.get(field), field)?,
        };
        let labels = request
            .config
            .get("labels")
            .and_then(Value::as_object)
            .ok_or_else(|| AgentError::Fatal("'labels' must be an object of keyword lists".into()))?;

        let lower = text.to_lowercase();
        let mut scores: Vec<(String, usize, Vec<String>)> = labels
            .iter()
            .map(|(label, keywords)| {
                let hits: Vec<String> = string_list(Some(keywords))
                    .into_iter()
                    .filter(|k| lower.contains(&k.to_lowercase()))
                    .collect();
                (label.clone(), hits.len(), hits)
            })
            .collect();
        // Highest score first; label name breaks ties so the result is stable.
        scores.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let total: usize = scores.iter().map(|s| s.1).sum();
        let default_label = request.config.get("default_label").and_then(Value::as_str).unwrap_or("other");

        Ok(match scores.first() {
            Some((label, score, hits)) if *score > 0 => json!({
                "label": label,
                "confidence": *score as f64 / total as f64,
                "matches": hits,
            }),
            _ => json!({ "label": default_label, "confidence": 0.0, "matches": [] }),
        })
    }
}
