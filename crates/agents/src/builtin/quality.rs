//! Statistical quality analysis: mean, sample standard deviation and, when
//! specification limits are given, process capability (Cp / Cpk).

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Agent, AgentError, AgentRequest};

pub struct QualityAnalysisAgent;

#[async_trait]
impl Agent for QualityAnalysisAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let values: Vec<f64> = request
            .setting("values")
            .and_then(Value::as_array)
            .ok_or_else(|| AgentError::Fatal("'values' must be an array of numbers".into()))?
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| AgentError::Fatal(format!("non-numeric sample {v}"))))
            .collect::<Result<_, _>>()?;
        if values.len() < 2 {
            return Err(AgentError::Fatal("at least two samples are required".into()));
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let usl = request.setting("usl").and_then(Value::as_f64);
        let lsl = request.setting("lsl").and_then(Value::as_f64);
        let (cp, cpk) = match (usl, lsl) {
            (Some(u), Some(l)) if std_dev > 0.0 => {
                let cp = (u - l) / (6.0 * std_dev);
                let cpk = ((u - mean).min(mean - l)) / (3.0 * std_dev);
                (Some(cp), Some(cpk))
            }
            (Some(u), None) if std_dev > 0.0 => (None, Some((u - mean) / (3.0 * std_dev))),
            (None, Some(l)) if std_dev > 0.0 => (None, Some((mean - l) / (3.0 * std_dev))),
            _ => (None, None),
        };
        let out_of_spec = values
            .iter()
            .filter(|v| usl.is_some_and(|u| **v > u) || lsl.is_some_and(|l| **v < l))
            .count();

        Ok(json!({
            "count": values.len(),
            "mean": mean,
            "std_dev": std_dev,
            "min": min,
            "max": max,
            "cp": cp,
            "cpk": cpk,
            "out_of_spec": out_of_spec,
            "capable": cpk.map(|c| c >= 1.33),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionContext;

    #[tokio::test]
    async fn computes_capability() {
        let req = AgentRequest::new(
            "quality_analysis",
            json!({ "values": [9.8, 10.0, 10.2, 10.0] }),
            ExecutionContext::default(),
        )
        .with_config(json!({ "usl": 11.0, "lsl": 9.0 }));

        let out = QualityAnalysisAgent.execute(&req).await.unwrap();
        assert!((out["mean"].as_f64().unwrap() - 10.0).abs() < 1e-9);
        let sd = out["std_dev"].as_f64().unwrap();
        assert!((sd - (0.08f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!((out["cpk"].as_f64().unwrap() - 1.0 / (3.0 * sd)).abs() < 1e-9);
        assert_eq!(out["out_of_spec"], 0);
    }

    #[tokio::test]
    async fn rejects_single_sample() {
        let req = AgentRequest::new("quality_analysis", json!({ "values": [1.0] }), ExecutionContext::default());
        assert!(matches!(QualityAnalysisAgent.execute(&req).await, Err(AgentError::Fatal(_))));
    }
}
