//! Parsing of the device-submitted results payload.
//!
//! Contract: `{ subtaskId, completedAtUtc, metrics: { durationSeconds?,
//! costUsd?, device? }, outputs: [ { tensorName, fileUrl, payloadType,
//! format } ] }`. The core only interprets the metrics block; the rest
//! is stored opaquely on the subtask row.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

/// Metrics the lifecycle engine lifts out of a results payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultMetrics {
    pub duration_seconds: Option<f64>,
    pub cost_usd: Option<Decimal>,
    pub device: Option<String>,
}

/// Extract metrics from a results payload.
///
/// `costUsd` is parsed as an exact decimal from the JSON number's text,
/// falling back to a lossy double conversion when that fails. Missing or
/// malformed fields read as `None`; the payload is device-supplied and
/// never trusted to be complete.
pub fn parse_metrics(results: &Value) -> ResultMetrics {
    let Some(metrics) = results.get("metrics") else {
        return ResultMetrics::default();
    };

    let duration_seconds = metrics.get("durationSeconds").and_then(Value::as_f64);

    let cost_usd = metrics.get("costUsd").and_then(|v| match v {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(Decimal::from_f64_retain)),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    });

    let device = metrics
        .get("device")
        .and_then(Value::as_str)
        .map(str::to_owned);

    ResultMetrics {
        duration_seconds,
        cost_usd,
        device,
    }
}
