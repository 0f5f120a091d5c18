//! In-memory registry of connected provider devices.
//!
//! The registry is the only correctness-irrelevant mutable state in the
//! engine: it maps a device id to its live session (session id, owning
//! provider, reported hardware, and the FIFO outbound channel). All
//! durable facts about devices live in the `devices` table; losing this
//! map on restart just means every device re-registers.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dispatch::{HardwareCapabilities, ServerMessage};
use crate::error::EngineError;

/// One live device connection.
#[derive(Debug)]
struct DeviceSession {
    session_id: Uuid,
    provider_user_id: String,
    capabilities: HardwareCapabilities,
    outbound: mpsc::Sender<ServerMessage>,
}

/// Registry of live device sessions behind a single mutex.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    sessions: Mutex<HashMap<String, DeviceSession>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection, replacing any previous session for
    /// the device (a reconnect wins). Returns the new session id.
    pub fn attach(
        &self,
        device_id: &str,
        provider_user_id: &str,
        capabilities: HardwareCapabilities,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Uuid {
        let session_id = Uuid::new_v4();
        let mut sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions.insert(
            device_id.to_owned(),
            DeviceSession {
                session_id,
                provider_user_id: provider_user_id.to_owned(),
                capabilities,
                outbound,
            },
        );
        session_id
    }

    /// Remove a session, but only when it is still the current one for
    /// the device. A stale close after a reconnect is a no-op.
    /// Returns whether the session was removed.
    pub fn detach(&self, device_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.lock().expect("registry mutex poisoned");
        match sessions.get(device_id) {
            Some(current) if current.session_id == session_id => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// The provider that owns a device's current session.
    pub fn provider_for(&self, device_id: &str) -> Option<String> {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions
            .get(device_id)
            .map(|s| s.provider_user_id.clone())
    }

    /// The hardware a device reported on join.
    pub fn capabilities_for(&self, device_id: &str) -> Option<HardwareCapabilities> {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions.get(device_id).map(|s| s.capabilities)
    }

    /// Record the hardware a device reported in `JoinAvailableTasks`.
    /// No-op when the device has no live session.
    pub fn set_capabilities(&self, device_id: &str, capabilities: HardwareCapabilities) {
        let mut sessions = self.sessions.lock().expect("registry mutex poisoned");
        if let Some(session) = sessions.get_mut(device_id) {
            session.capabilities = capabilities;
        }
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions.contains_key(device_id)
    }

    pub fn connected_count(&self) -> usize {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions.len()
    }

    /// Push a message down a device's FIFO channel.
    ///
    /// The sender is cloned out of the lock before awaiting so the mutex
    /// is never held across a suspension point.
    pub async fn send(
        &self,
        device_id: &str,
        message: ServerMessage,
    ) -> Result<(), EngineError> {
        let sender = {
            let sessions = self.sessions.lock().expect("registry mutex poisoned");
            sessions.get(device_id).map(|s| s.outbound.clone())
        }
        .ok_or_else(|| EngineError::Transport(format!("device {device_id} is not connected")))?;

        sender
            .send(message)
            .await
            .map_err(|_| EngineError::Transport(format!("device {device_id} channel closed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ExecutionSubtask, OnnxModelRef};
    use serde_json::json;

    fn caps() -> HardwareCapabilities {
        HardwareCapabilities {
            cpu_tops: 1.0,
            gpu_tops: 8.0,
            npu_tops: 0.0,
            ram_gb: 16.0,
        }
    }

    fn message() -> ServerMessage {
        ServerMessage::ExecutionRequested {
            subtask: ExecutionSubtask {
                id: Uuid::new_v4(),
                task_id: Uuid::new_v4(),
                parameters_json: json!({}),
                onnx_model: OnnxModelRef {
                    read_uri: "https://blobs/m.onnx".to_owned(),
                },
            },
        }
    }

    #[tokio::test]
    async fn attach_send_detach() {
        let registry = DeviceRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);

        let session = registry.attach("dev-1", "prov-1", caps(), tx);
        assert!(registry.is_connected("dev-1"));
        assert_eq!(registry.provider_for("dev-1").as_deref(), Some("prov-1"));

        registry.send("dev-1", message()).await.unwrap();
        assert!(rx.recv().await.is_some());

        assert!(registry.detach("dev-1", session));
        assert!(!registry.is_connected("dev-1"));
    }

    #[tokio::test]
    async fn stale_detach_is_noop() {
        let registry = DeviceRegistry::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        let old_session = registry.attach("dev-1", "prov-1", caps(), tx1);
        // Reconnect replaces the session.
        let new_session = registry.attach("dev-1", "prov-1", caps(), tx2);

        assert!(!registry.detach("dev-1", old_session));
        assert!(registry.is_connected("dev-1"));
        assert!(registry.detach("dev-1", new_session));
    }

    #[tokio::test]
    async fn send_to_unknown_device_is_transport_error() {
        let registry = DeviceRegistry::new();
        let err = registry.send("ghost", message()).await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }
}
