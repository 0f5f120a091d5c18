//! Wire types for the device dispatch channel.
//!
//! Messages travel as framed JSON envelopes `{ "method": ..., "args":
//! [...] }` over a persistent bidirectional connection. Ordering is FIFO
//! per device; there is no cross-device ordering.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// The JSON frame every channel message is wrapped in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Hardware capabilities a device reports when joining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HardwareCapabilities {
    pub cpu_tops: f64,
    pub gpu_tops: f64,
    pub npu_tops: f64,
    pub ram_gb: f64,
}

/// Errors from decoding an inbound envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("bad arguments for {method}: {reason}")]
    BadArgs {
        method: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Server -> device
// ---------------------------------------------------------------------------

/// Reference to the ONNX model blob a device must fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnnxModelRef {
    pub read_uri: String,
}

/// The subtask payload pushed to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSubtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub parameters_json: Value,
    pub onnx_model: OnnxModelRef,
}

/// Messages the server pushes down a device channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ExecutionRequested { subtask: ExecutionSubtask },
}

impl ServerMessage {
    /// Encode to the wire envelope.
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Self::ExecutionRequested { subtask } => Envelope {
                method: "OnExecutionRequested".to_owned(),
                args: vec![json!({
                    "subtask": subtask,
                })],
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Device -> server
// ---------------------------------------------------------------------------

/// Messages a device sends up its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// Register for work after (re)connection, reporting hardware.
    JoinAvailableTasks { capabilities: HardwareCapabilities },
    /// The device has started running the subtask.
    AcknowledgeExecutionStart { subtask_id: Uuid },
    /// Periodic progress, percent in 0..=100 (clamped server-side).
    ReportProgress { subtask_id: Uuid, percent: f64 },
    /// Terminal success with the results payload.
    SubmitResult { subtask_id: Uuid, result: Value },
    /// Terminal failure with a free-form error payload.
    FailedResult { subtask_id: Uuid, error: Value },
}

impl DeviceMessage {
    /// Decode an inbound envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, DecodeError> {
        match envelope.method.as_str() {
            "JoinAvailableTasks" => {
                let capabilities = match envelope.args.first() {
                    Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                        DecodeError::BadArgs {
                            method: "JoinAvailableTasks",
                            reason: e.to_string(),
                        }
                    })?,
                    None => HardwareCapabilities::default(),
                };
                Ok(Self::JoinAvailableTasks { capabilities })
            }
            "AcknowledgeExecutionStart" => Ok(Self::AcknowledgeExecutionStart {
                subtask_id: arg_subtask_id(envelope, "AcknowledgeExecutionStart")?,
            }),
            "ReportProgress" => {
                let subtask_id = arg_subtask_id(envelope, "ReportProgress")?;
                let percent = envelope
                    .args
                    .get(1)
                    .and_then(Value::as_f64)
                    .ok_or(DecodeError::BadArgs {
                        method: "ReportProgress",
                        reason: "args[1] must be a number".to_owned(),
                    })?;
                Ok(Self::ReportProgress {
                    subtask_id,
                    percent,
                })
            }
            "SubmitResult" => Ok(Self::SubmitResult {
                subtask_id: arg_subtask_id(envelope, "SubmitResult")?,
                result: envelope.args.get(1).cloned().unwrap_or(Value::Null),
            }),
            "FailedResult" => Ok(Self::FailedResult {
                subtask_id: arg_subtask_id(envelope, "FailedResult")?,
                error: envelope.args.get(1).cloned().unwrap_or(Value::Null),
            }),
            other => Err(DecodeError::UnknownMethod(other.to_owned())),
        }
    }

    /// Encode to the wire envelope (used by device-side clients and
    /// tests).
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Self::JoinAvailableTasks { capabilities } => Envelope {
                method: "JoinAvailableTasks".to_owned(),
                args: vec![serde_json::to_value(capabilities).expect("capabilities serialize")],
            },
            Self::AcknowledgeExecutionStart { subtask_id } => Envelope {
                method: "AcknowledgeExecutionStart".to_owned(),
                args: vec![json!(subtask_id)],
            },
            Self::ReportProgress {
                subtask_id,
                percent,
            } => Envelope {
                method: "ReportProgress".to_owned(),
                args: vec![json!(subtask_id), json!(percent)],
            },
            Self::SubmitResult { subtask_id, result } => Envelope {
                method: "SubmitResult".to_owned(),
                args: vec![json!(subtask_id), result.clone()],
            },
            Self::FailedResult { subtask_id, error } => Envelope {
                method: "FailedResult".to_owned(),
                args: vec![json!(subtask_id), error.clone()],
            },
        }
    }
}

fn arg_subtask_id(envelope: &Envelope, method: &'static str) -> Result<Uuid, DecodeError> {
    envelope
        .args
        .first()
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(DecodeError::BadArgs {
            method,
            reason: "args[0] must be a subtask id".to_owned(),
        })
}

/// Pull a human-readable reason out of a `FailedResult` error payload.
///
/// The device sends a free-form `error` field; anything else degrades to
/// a generic reason so the failure path always has a non-empty string.
pub fn failure_reason(error: &Value) -> String {
    error
        .get("error")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| "Execution failed on device".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_request_envelope_shape() {
        let subtask_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let msg = ServerMessage::ExecutionRequested {
            subtask: ExecutionSubtask {
                id: subtask_id,
                task_id,
                parameters_json: json!({"bindings": []}),
                onnx_model: OnnxModelRef {
                    read_uri: "https://blobs/models/m.onnx?sig=abc".to_owned(),
                },
            },
        };
        let envelope = msg.to_envelope();
        assert_eq!(envelope.method, "OnExecutionRequested");
        let subtask = &envelope.args[0]["subtask"];
        assert_eq!(subtask["id"], json!(subtask_id));
        assert_eq!(subtask["taskId"], json!(task_id));
        assert_eq!(
            subtask["onnxModel"]["readUri"],
            "https://blobs/models/m.onnx?sig=abc"
        );
    }

    #[test]
    fn device_messages_round_trip() {
        let subtask_id = Uuid::new_v4();
        let messages = [
            DeviceMessage::JoinAvailableTasks {
                capabilities: HardwareCapabilities {
                    cpu_tops: 1.5,
                    gpu_tops: 20.0,
                    npu_tops: 0.0,
                    ram_gb: 16.0,
                },
            },
            DeviceMessage::AcknowledgeExecutionStart { subtask_id },
            DeviceMessage::ReportProgress {
                subtask_id,
                percent: 50.0,
            },
            DeviceMessage::SubmitResult {
                subtask_id,
                result: json!({"metrics": {"costUsd": 0.25}}),
            },
            DeviceMessage::FailedResult {
                subtask_id,
                error: json!({"error": "oom"}),
            },
        ];
        for msg in messages {
            let decoded = DeviceMessage::from_envelope(&msg.to_envelope()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn join_without_args_defaults_capabilities() {
        let envelope = Envelope {
            method: "JoinAvailableTasks".to_owned(),
            args: vec![],
        };
        let msg = DeviceMessage::from_envelope(&envelope).unwrap();
        assert_eq!(
            msg,
            DeviceMessage::JoinAvailableTasks {
                capabilities: HardwareCapabilities::default()
            }
        );
    }

    #[test]
    fn unknown_method_rejected() {
        let envelope = Envelope {
            method: "SelfDestruct".to_owned(),
            args: vec![],
        };
        let err = DeviceMessage::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownMethod(m) if m == "SelfDestruct"));
    }

    #[test]
    fn missing_subtask_id_rejected() {
        let envelope = Envelope {
            method: "ReportProgress".to_owned(),
            args: vec![json!(42)],
        };
        assert!(DeviceMessage::from_envelope(&envelope).is_err());
    }

    #[test]
    fn failure_reason_extraction() {
        assert_eq!(failure_reason(&json!({"error": "oom"})), "oom");
        assert_eq!(
            failure_reason(&json!({"error": ""})),
            "Execution failed on device"
        );
        assert_eq!(failure_reason(&json!(null)), "Execution failed on device");
    }
}
