//! HTTP intake: task creation, upload URLs, and read views.
//!
//! Intake requests authenticate with an API key in the Authorization
//! header; only the SHA-256 hash of the key is ever stored or compared.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use infergrid_core::auth::TokenConfig;
use infergrid_core::config::EngineConfig;
use infergrid_core::registry::DeviceRegistry;
use infergrid_db::models::{Subtask, Task, TaskStatus, TaskType, TimelineEvent, User};
use infergrid_db::queries::{
    api_keys, subtasks as subtask_db, tasks as task_db, timeline,
};

use crate::channel;
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::uploads::{FileKind, SignedUpload, UploadSigner};

/// Shared server state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub engine: Arc<EngineConfig>,
    pub registry: Arc<DeviceRegistry>,
    pub tokens: Arc<TokenConfig>,
    pub uploads: Arc<UploadSigner>,
}

impl AppState {
    pub fn new(pool: PgPool, config: &ServerConfig) -> Self {
        let engine = EngineConfig {
            upload_url_ttl: config.upload_url_ttl,
            ..EngineConfig::default()
        };
        Self {
            pool,
            engine: Arc::new(engine),
            registry: Arc::new(DeviceRegistry::new()),
            tokens: Arc::new(TokenConfig::new(config.token_secret.clone())),
            uploads: Arc::new(UploadSigner::new(
                &config.blob_store_url,
                &config.inference_container,
                config.token_secret.clone(),
                config.upload_url_ttl,
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks/create", post(create_task))
        .route("/api/tasks/upload-url", post(upload_url))
        .route("/api/tasks/my-tasks", get(my_tasks))
        .route("/api/tasks/{id}/subtasks", get(task_subtasks))
        .route("/api/subtasks/{id}/timeline", get(subtask_timeline))
        .route("/api/dispatch", get(channel::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Pull a bearer credential out of the Authorization header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Hash an API key the way the `api_keys` table stores it.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let key = bearer_token(headers)
        .ok_or_else(|| AppError::unauthorized("missing bearer credential"))?;
    api_keys::find_user_by_key_hash(&state.pool, &hash_api_key(key))
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::unauthorized("unknown api key"))
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferencePayload {
    #[serde(default)]
    pub bindings: Vec<Value>,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub cost_usd: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub task_id: Option<Uuid>,
    pub task_type: TaskType,
    pub model_uri: String,
    #[serde(default)]
    pub fill_bindings_via_api: bool,
    pub initial_subtask_id: Option<Uuid>,
    pub inference: Option<InferencePayload>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    #[serde(flatten)]
    pub task: Task,
    pub subtasks: Vec<Subtask>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    pub file_type: u8,
    pub file_name: String,
}

#[derive(Debug, Deserialize)]
pub struct MyTasksQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubtaskListResponse {
    #[serde(flatten)]
    pub task: Task,
    pub subtasks: Vec<Subtask>,
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub subtask_id: Uuid,
    pub events: Vec<TimelineEvent>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;

    if req.model_uri.is_empty() {
        return Err(AppError::bad_request("modelUri must not be empty"));
    }

    let (bindings, outputs, cost) = match &req.inference {
        Some(inference) => (
            inference.bindings.clone(),
            inference.outputs.clone(),
            inference.cost_usd,
        ),
        None => (Vec::new(), Vec::new(), None),
    };
    let parameters = json!({"bindings": bindings, "outputs": outputs});

    let mut tx = state.pool.begin().await.map_err(|e| {
        AppError::internal(anyhow::Error::new(e).context("failed to begin transaction"))
    })?;

    let task = task_db::insert_task(
        &mut *tx,
        req.task_id,
        &user.id,
        req.task_type,
        &req.model_uri,
        req.fill_bindings_via_api,
    )
    .await
    .map_err(AppError::internal)?;

    let subtask = subtask_db::insert_subtask(
        &mut *tx,
        req.initial_subtask_id,
        task.id,
        &parameters,
        cost,
    )
    .await
    .map_err(AppError::internal)?;

    tx.commit().await.map_err(|e| {
        AppError::internal(anyhow::Error::new(e).context("failed to commit task creation"))
    })?;

    tracing::info!(task_id = %task.id, owner = %user.id, "task created");

    Ok(Json(CreateTaskResponse {
        task,
        subtasks: vec![subtask],
    }))
}

async fn upload_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UploadUrlRequest>,
) -> Result<Json<SignedUpload>, AppError> {
    authenticate(&state, &headers).await?;

    let kind = FileKind::from_wire(req.file_type)
        .ok_or_else(|| AppError::bad_request("fileType must be 0 (model), 1 (input), or 2 (output)"))?;
    if req.file_name.is_empty()
        || req.file_name.contains('/')
        || req.file_name.contains("..")
    {
        return Err(AppError::bad_request("fileName must be a bare file name"));
    }

    Ok(Json(state.uploads.sign_upload(kind, &req.file_name)))
}

async fn my_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MyTasksQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let user = authenticate(&state, &headers).await?;

    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<TaskStatus>()
                .map_err(|e| AppError::bad_request(e.to_string()))?,
        ),
        None => None,
    };

    let tasks = task_db::list_tasks_for_owner(&state.pool, &user.id, status)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tasks))
}

async fn task_subtasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SubtaskListResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;

    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    if task.owner_user_id != user.id {
        return Err(AppError::forbidden("task belongs to another user"));
    }

    let subtasks = subtask_db::list_for_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(SubtaskListResponse { task, subtasks }))
}

async fn subtask_timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<TimelineResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;

    let subtask = subtask_db::get_subtask(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("subtask {id} not found")))?;
    let task = task_db::get_task(&state.pool, subtask.task_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found("parent task not found"))?;
    if task.owner_user_id != user.id {
        return Err(AppError::forbidden("subtask belongs to another user"));
    }

    let events = timeline::list_for_subtask(&state.pool, id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(TimelineResponse {
        subtask_id: id,
        events,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
