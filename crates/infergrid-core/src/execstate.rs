//! The execution-state blob stored on every subtask row.
//!
//! Kept as an opaque JSON column rather than normalized fields so the
//! device protocol can grow metadata without schema churn. The struct
//! below is the schema the core reads and writes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Coarse phase of a subtask's execution, mirrored into the blob for
/// frontend consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// Execution-state JSON stored on a subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub phase: ExecutionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onnx_model_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_gpu_preferred: Option<bool>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extended_metadata: Map<String, Value>,
}

impl ExecutionState {
    /// Fresh state for a subtask claimed by a provider.
    pub fn claimed(provider_user_id: &str, web_gpu_preferred: bool) -> Self {
        Self {
            phase: ExecutionPhase::Executing,
            message: None,
            provider_user_id: Some(provider_user_id.to_owned()),
            onnx_model_ready: None,
            web_gpu_preferred: Some(web_gpu_preferred),
            extended_metadata: Map::new(),
        }
    }

    /// Parse the stored blob, tolerating legacy/partial shapes.
    ///
    /// Anything unparseable degrades to a bare `pending` state rather
    /// than failing the lifecycle operation that wanted to update it.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or(Self {
            phase: ExecutionPhase::Pending,
            message: None,
            provider_user_id: None,
            onnx_model_ready: None,
            web_gpu_preferred: None,
            extended_metadata: Map::new(),
        })
    }

    /// Serialize back to the stored JSON shape.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("execution state serializes")
    }

    /// Set the phase and optional message, returning self for chaining.
    pub fn with_phase(mut self, phase: ExecutionPhase, message: Option<&str>) -> Self {
        self.phase = phase;
        self.message = message.map(str::to_owned);
        self
    }

    /// Insert one extended-metadata entry, returning self for chaining.
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.extended_metadata.insert(key.to_owned(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_camel_case() {
        let state = ExecutionState::claimed("prov-1", true);
        let value = state.to_value();
        assert_eq!(value["phase"], "executing");
        assert_eq!(value["providerUserId"], "prov-1");
        assert_eq!(value["webGpuPreferred"], true);
        assert!(value.get("onnxModelReady").is_none());
    }

    #[test]
    fn round_trips() {
        let state = ExecutionState::claimed("prov-1", false)
            .with_phase(ExecutionPhase::Failed, Some("oom"))
            .with_metadata("failureReason", json!("oom"));
        let back = ExecutionState::from_value(&state.to_value());
        assert_eq!(back, state);
    }

    #[test]
    fn tolerates_unknown_blobs() {
        let state = ExecutionState::from_value(&json!({"not": "a state"}));
        assert_eq!(state.phase, ExecutionPhase::Pending);

        let state = ExecutionState::from_value(&json!({"phase": "pending"}));
        assert_eq!(state.phase, ExecutionPhase::Pending);
        assert!(state.extended_metadata.is_empty());
    }
}
