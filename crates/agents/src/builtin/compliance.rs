//! Rule-based compliance check over the step input.
//!
//! Config: `{"rules": [{"field": "temp", "op": "max", "value": 80}, ...]}` with
//! ops `required`, `min`, `max`, `equals`, `one_of`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{Agent, AgentError, AgentRequest};

#[derive(Debug, Deserialize)]
struct Rule {
    field: String,
    op: String,
    #[serde(default)]
    value: Value,
}

pub struct ComplianceCheckAgent;

impl ComplianceCheckAgent {
    fn check(rule: &Rule, input: &Value) -> Result<Option<String>, AgentError> {
        let actual = input.pointer(&format!("/{}", rule.field.replace('.', "/")));
        let violation = match rule.op.as_str() {
            "required" => actual.map_or(true, Value::is_null).then(|| format!("'{}' is required", rule.field)),
            "min" | "max" => {
                let limit = rule
                    .value
                    .as_f64()
                    .ok_or_else(|| AgentError::Fatal(format!("rule on '{}' needs a numeric value", rule.field)))?;
                match actual.and_then(Value::as_f64) {
                    None => Some(format!("'{}' is not a number", rule.field)),
                    Some(v) if rule.op == "min" && v < limit => Some(format!("'{}' = {v} is below {limit}", rule.field)),
                    Some(v) if rule.op == "max" && v > limit => Some(format!("'{}' = {v} exceeds {limit}", rule.field)),
                    Some(_) => None,
                }
            }
            "equals" => (actual != Some(&rule.value)).then(|| format!("'{}' must equal {}", rule.field, rule.value)),
            "one_of" => {
                let allowed = rule
                    .value
                    .as_array()
                    .ok_or_else(|| AgentError::Fatal(format!("rule on '{}' needs an array value", rule.field)))?;
                (!actual.is_some_and(|a| allowed.contains(a)))
                    .then(|| format!("'{}' must be one of {}", rule.field, rule.value))
            }
            other => return Err(AgentError::Fatal(format!("unknown rule op '{other}'"))),
        };
        Ok(violation)
    }
}

#[async_trait]
impl Agent for ComplianceCheckAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let rules: Vec<Rule> = match request.config.get("rules") {
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| AgentError::Fatal(format!("invalid compliance rules: {e}")))?,
            None => return Err(AgentError::Fatal("'rules' is required".into())),
        };

        let mut violations = Vec::new();
        for rule in &rules {
            if let Some(v) = Self::check(rule, &request.input)? {
                violations.push(v);
            }
        }
        Ok(json!({
            "compliant": violations.is_empty(),
            "checked": rules.len(),
            "violations": violations,
        }))
    }
}
