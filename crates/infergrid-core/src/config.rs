use std::time::Duration;

use rust_decimal::Decimal;

/// Engine tunables.
///
/// Defaults match production behavior; tests pin the fields they depend
/// on explicitly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a device may go without progress/ack before its subtask
    /// is considered abandoned.
    pub heartbeat_interval: Duration,
    /// Cadence of the heartbeat monitor sweep.
    pub heartbeat_sweep_interval: Duration,
    /// Serialization-conflict retries before surfacing `Conflict`.
    pub max_serialization_retries: u32,
    /// Requestors are debited `cost * margin`; providers are credited
    /// `cost`. The difference is the marketplace margin.
    pub requestor_margin_ratio: Decimal,
    /// Allow a provider to claim subtasks of their own tasks. Defaults
    /// on in debug builds only; production keeps the guard.
    pub allow_self_assignment: bool,
    /// TTL for signed blob upload/read URLs handed out by the intake.
    pub upload_url_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(300),
            heartbeat_sweep_interval: Duration::from_secs(30),
            max_serialization_retries: 3,
            requestor_margin_ratio: Decimal::new(120, 2),
            allow_self_assignment: cfg!(debug_assertions),
            upload_url_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl EngineConfig {
    /// A config with the production self-assignment guard regardless of
    /// build profile. Used by tests exercising the guard.
    pub fn strict() -> Self {
        Self {
            allow_self_assignment: false,
            ..Self::default()
        }
    }
}
