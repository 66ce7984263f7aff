//! Execution input validation.

use serde_json::{Map, Value};

use crate::{EngineError, EngineResult};

/// Deepest nesting accepted in an execution input.
pub const MAX_INPUT_DEPTH: usize = 32;

/// Normalize and check an execution input.
///
/// `null` becomes `{}`; anything other than an object is rejected. Keys with a
/// `__` prefix are reserved and stripped at every level.
pub fn sanitize_input(input: Value, max_bytes: usize) -> EngineResult<Value> {
    let input = match input {
        Value::Null => Value::Object(Map::new()),
        Value::Object(_) => input,
        other => {
            return Err(EngineError::InvalidInput(format!("input must be a JSON object, got {}", kind(&other))));
        }
    };

    let size = serde_json::to_vec(&input)?.len();
    if size > max_bytes {
        return Err(EngineError::InputTooLarge { size, max: max_bytes });
    }
    if depth(&input) > MAX_INPUT_DEPTH {
        return Err(EngineError::InvalidInput(format!("input nests deeper than {MAX_INPUT_DEPTH} levels")));
    }
    Ok(strip_reserved(input))
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn depth(v: &Value) -> usize {
    match v {
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn strip_reserved(v: Value) -> Value {
    match v {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !k.starts_with("__"))
                .map(|(k, v)| (k, strip_reserved(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_reserved).collect()),
        other => other,
    }
}
