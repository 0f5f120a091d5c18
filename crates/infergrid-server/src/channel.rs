//! WebSocket dispatch channel between the server and provider devices.
//!
//! A device connects to `/api/dispatch?deviceId=...` with an HMAC device
//! token in the Authorization header. Frames are JSON envelopes
//! (`{ "method": ..., "args": [...] }`), FIFO per device. The device
//! pulls work by sending `JoinAvailableTasks`; the server pushes at most
//! one `OnExecutionRequested` in response and then waits for lifecycle
//! messages. A dropped connection runs the disconnect sweep over
//! everything the device still held.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use infergrid_core::auth::{TokenClaims, validate_device_token};
use infergrid_core::dispatch::{
    DeviceMessage, Envelope, ExecutionSubtask, HardwareCapabilities, OnnxModelRef, ServerMessage,
    failure_reason,
};
use infergrid_core::error::EngineError;
use infergrid_core::{assignment, lifecycle};
use infergrid_db::queries::{devices as device_db, users as user_db};

use crate::error::AppError;
use crate::routes::{AppState, bearer_token};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchParams {
    pub device_id: String,
}

/// Handshake: bearer token + device id query parameter, then upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<DispatchParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| AppError::unauthorized("missing bearer credential"))?;
    let claims = validate_device_token(&state.tokens, token)
        .map_err(|_| AppError::unauthorized("invalid device token"))?;
    if claims.device_id != params.device_id {
        return Err(AppError::forbidden("token is bound to a different device"));
    }

    let provider = user_db::get_user(&state.pool, &claims.user_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::forbidden("unknown provider"))?;
    if !provider.active {
        return Err(AppError::forbidden("provider is inactive"));
    }

    Ok(ws.on_upgrade(move |socket| handle_device_socket(state, socket, claims)))
}

async fn handle_device_socket(state: AppState, socket: WebSocket, claims: TokenClaims) {
    let (mut sink, mut stream) = socket.split();

    // One outstanding execution request per device: a capacity-1 channel
    // is the back-pressure.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(1);
    let session_id = state.registry.attach(
        &claims.device_id,
        &claims.user_id,
        HardwareCapabilities::default(),
        out_tx,
    );
    info!(
        device = %claims.device_id,
        provider = %claims.user_id,
        session = %session_id,
        "device connected"
    );

    // Writer: drain the outbound queue onto the socket in FIFO order.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let frame = serde_json::to_string(&message.to_envelope())
                .expect("envelope serializes");
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: decode envelopes and drive the engine.
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(device = %claims.device_id, error = %err, "unparseable frame");
                continue;
            }
        };
        let message = match DeviceMessage::from_envelope(&envelope) {
            Ok(message) => message,
            Err(err) => {
                warn!(device = %claims.device_id, error = %err, "rejected frame");
                continue;
            }
        };

        if let Err(err) = handle_device_message(&state, &claims, session_id, message).await {
            // The device gets nothing back for an invalid attempt; the
            // error is server-side telemetry only.
            warn!(
                device = %claims.device_id,
                error = %err,
                "device message failed"
            );
        }
    }

    // Disconnect path. Only the current session cleans up; a stale
    // socket closing after a reconnect must not fail the new session's
    // work.
    let was_current = state.registry.detach(&claims.device_id, session_id);
    writer.abort();

    if was_current {
        info!(device = %claims.device_id, session = %session_id, "device disconnected");
        if let Err(err) =
            device_db::detach_device(&state.pool, &claims.device_id, session_id).await
        {
            warn!(device = %claims.device_id, error = %err, "failed to detach device row");
        }
        match lifecycle::fail_all_for_device(
            &state.pool,
            &state.engine,
            &claims.device_id,
            &claims.user_id,
        )
        .await
        {
            Ok(outcomes) if outcomes.is_empty() => {}
            Ok(outcomes) => {
                info!(
                    device = %claims.device_id,
                    count = outcomes.len(),
                    "swept in-flight subtasks after disconnect"
                );
            }
            Err(err) => {
                warn!(device = %claims.device_id, error = %err, "disconnect sweep failed");
            }
        }
    } else {
        debug!(device = %claims.device_id, session = %session_id, "stale session closed");
    }
}

async fn handle_device_message(
    state: &AppState,
    claims: &TokenClaims,
    session_id: Uuid,
    message: DeviceMessage,
) -> Result<(), EngineError> {
    match message {
        DeviceMessage::JoinAvailableTasks { capabilities } => {
            state
                .registry
                .set_capabilities(&claims.device_id, capabilities);
            device_db::attach_device(
                &state.pool,
                &claims.device_id,
                &claims.user_id,
                capabilities.cpu_tops,
                capabilities.gpu_tops,
                capabilities.npu_tops,
                capabilities.ram_gb,
                session_id,
            )
            .await?;
            offer_next(state, claims).await
        }
        DeviceMessage::AcknowledgeExecutionStart { subtask_id } => {
            device_db::touch_last_seen(&state.pool, &claims.device_id).await?;
            lifecycle::acknowledge_execution_start(
                &state.pool,
                &state.engine,
                subtask_id,
                &claims.user_id,
            )
            .await
        }
        DeviceMessage::ReportProgress {
            subtask_id,
            percent,
        } => {
            device_db::touch_last_seen(&state.pool, &claims.device_id).await?;
            lifecycle::update_progress(
                &state.pool,
                &state.engine,
                subtask_id,
                &claims.user_id,
                percent,
            )
            .await
            .map(|_| ())
        }
        DeviceMessage::SubmitResult { subtask_id, result } => lifecycle::complete(
            &state.pool,
            &state.engine,
            subtask_id,
            &claims.user_id,
            &result,
        )
        .await
        .map(|_| ()),
        DeviceMessage::FailedResult { subtask_id, error } => {
            let reason = failure_reason(&error);
            lifecycle::fail(
                &state.pool,
                &state.engine,
                subtask_id,
                &claims.user_id,
                &reason,
            )
            .await
            .map(|_| ())
        }
    }
}

/// Claim the next eligible subtask for this device and push it.
///
/// A push failure leaves the claim in place on purpose: the device may
/// reconnect and resume, and the heartbeat monitor reaps the claim if it
/// never does.
async fn offer_next(state: &AppState, claims: &TokenClaims) -> Result<(), EngineError> {
    let Some(assignment) = assignment::try_offer_next(
        &state.pool,
        &state.engine,
        &claims.user_id,
        &claims.device_id,
    )
    .await?
    else {
        debug!(device = %claims.device_id, "no work available");
        return Ok(());
    };

    let read_uri = state.uploads.sign_read(&assignment.task.model_uri);
    let message = ServerMessage::ExecutionRequested {
        subtask: ExecutionSubtask {
            id: assignment.subtask.id,
            task_id: assignment.task.id,
            parameters_json: assignment.subtask.parameters.clone(),
            onnx_model: OnnxModelRef { read_uri },
        },
    };
    state.registry.send(&claims.device_id, message).await
}
