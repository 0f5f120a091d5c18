use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid status/type string.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------

/// Kind of work a task requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Train,
    Inference,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Train => "train",
            Self::Inference => "inference",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "inference" => Ok(Self::Inference),
            other => Err(ParseEnumError::new("task type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Aggregate status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a subtask, the unit of schedulable work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Assigned,
    Executing,
    Completed,
    Failed,
}

impl SubtaskStatus {
    /// Whether a provider may report progress/completion/failure in this
    /// status.
    pub fn is_executable(self) -> bool {
        matches!(self, Self::Assigned | Self::Executing)
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("subtask status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a provider earning record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EarningStatus {
    Pending,
    Paid,
}

impl fmt::Display for EarningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        };
        f.write_str(s)
    }
}

impl FromStr for EarningStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            other => Err(ParseEnumError::new("earning status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a requestor withdrawal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Settled,
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Settled => "settled",
        };
        f.write_str(s)
    }
}

impl FromStr for WithdrawalStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "settled" => Ok(Self::Settled),
            other => Err(ParseEnumError::new("withdrawal status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Tag of a subtask timeline event.
///
/// Persisted as kebab-case text, which is the wire/audit convention for
/// event tags throughout the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TimelineEventType {
    Assignment,
    Progress,
    ExecutionAcknowledged,
    Completion,
    Failure,
    ReassignmentRequested,
    DeviceDisconnectionFailure,
    TaskFailed,
}

impl fmt::Display for TimelineEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Assignment => "assignment",
            Self::Progress => "progress",
            Self::ExecutionAcknowledged => "execution-acknowledged",
            Self::Completion => "completion",
            Self::Failure => "failure",
            Self::ReassignmentRequested => "reassignment-requested",
            Self::DeviceDisconnectionFailure => "device-disconnection-failure",
            Self::TaskFailed => "task-failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TimelineEventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assignment" => Ok(Self::Assignment),
            "progress" => Ok(Self::Progress),
            "execution-acknowledged" => Ok(Self::ExecutionAcknowledged),
            "completion" => Ok(Self::Completion),
            "failure" => Ok(Self::Failure),
            "reassignment-requested" => Ok(Self::ReassignmentRequested),
            "device-disconnection-failure" => Ok(Self::DeviceDisconnectionFailure),
            "task-failed" => Ok(Self::TaskFailed),
            other => Err(ParseEnumError::new("timeline event type", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the requestor-owned aggregate referencing an ONNX model.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub owner_user_id: String,
    pub task_type: TaskType,
    pub model_uri: String,
    pub fill_bindings_via_api: bool,
    pub status: TaskStatus,
    pub partition_status: Option<String>,
    pub total_cost: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A subtask -- one independently schedulable portion of a task,
/// executed by a single provider device.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: SubtaskStatus,
    pub assigned_provider_user_id: Option<String>,
    pub assigned_device_id: Option<String>,
    pub parameters: serde_json::Value,
    pub results: Option<serde_json::Value>,
    pub progress: i32,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_command_at: Option<DateTime<Utc>>,
    pub next_heartbeat_due: Option<DateTime<Utc>>,
    pub requires_reassignment: bool,
    pub reassignment_requested_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub duration_seconds: Option<f64>,
    pub cost: Option<Decimal>,
    pub execution_state: serde_json::Value,
}

/// An append-only audit event owned by a subtask.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TimelineEvent {
    pub id: i64,
    pub subtask_id: Uuid,
    pub event_type: TimelineEventType,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A marketplace user. The same user may act as requestor and provider.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub active: bool,
    pub balance: Decimal,
    pub resource_capabilities: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A provider-side ledger entry created when a subtask settles.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Earning {
    pub id: Uuid,
    pub provider_user_id: String,
    pub task_id: Uuid,
    pub subtask_id: Uuid,
    pub amount: Decimal,
    pub status: EarningStatus,
    pub created_at: DateTime<Utc>,
}

/// The requestor-side mirror of an [`Earning`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Withdrawal {
    pub id: Uuid,
    pub requestor_user_id: String,
    pub task_id: Uuid,
    pub subtask_id: Uuid,
    pub amount: Decimal,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
}

/// A provider machine, identified by a persistent device identifier.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: String,
    pub owner_user_id: String,
    pub cpu_tops: f64,
    pub gpu_tops: f64,
    pub npu_tops: f64,
    pub ram_gb: f64,
    pub session_id: Option<Uuid>,
    pub last_seen_at: DateTime<Utc>,
}

/// An intake API key. Only the SHA-256 hash of the key is stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: String,
    pub key_hash: String,
    pub label: String,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_display_roundtrip() {
        for v in [TaskType::Train, TaskType::Inference] {
            let parsed: TaskType = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ];
        for v in variants {
            let parsed: TaskStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn subtask_status_display_roundtrip() {
        let variants = [
            SubtaskStatus::Pending,
            SubtaskStatus::Assigned,
            SubtaskStatus::Executing,
            SubtaskStatus::Completed,
            SubtaskStatus::Failed,
        ];
        for v in variants {
            let parsed: SubtaskStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn subtask_status_executable() {
        assert!(SubtaskStatus::Assigned.is_executable());
        assert!(SubtaskStatus::Executing.is_executable());
        assert!(!SubtaskStatus::Pending.is_executable());
        assert!(!SubtaskStatus::Completed.is_executable());
        assert!(!SubtaskStatus::Failed.is_executable());
    }

    #[test]
    fn ledger_status_display_roundtrip() {
        for v in [EarningStatus::Pending, EarningStatus::Paid] {
            let parsed: EarningStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
        for v in [WithdrawalStatus::Pending, WithdrawalStatus::Settled] {
            let parsed: WithdrawalStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn timeline_event_type_is_kebab_case() {
        assert_eq!(
            TimelineEventType::ExecutionAcknowledged.to_string(),
            "execution-acknowledged"
        );
        assert_eq!(
            TimelineEventType::DeviceDisconnectionFailure.to_string(),
            "device-disconnection-failure"
        );
        let parsed: TimelineEventType = "reassignment-requested".parse().expect("should parse");
        assert_eq!(parsed, TimelineEventType::ReassignmentRequested);
    }

    #[test]
    fn invalid_strings_rejected() {
        assert!("bogus".parse::<TaskType>().is_err());
        assert!("bogus".parse::<TaskStatus>().is_err());
        assert!("bogus".parse::<SubtaskStatus>().is_err());
        assert!("bogus".parse::<EarningStatus>().is_err());
        assert!("bogus".parse::<WithdrawalStatus>().is_err());
        assert!("bogus".parse::<TimelineEventType>().is_err());
    }
}
