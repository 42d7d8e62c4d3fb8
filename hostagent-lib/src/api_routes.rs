use axum::{
    extract::{rejection::JsonRejection, Json, Path, Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use hostagent_common::{
    CreateInstanceRequest, CreateInstanceResponse, InstanceStatus, InstanceView,
    ManageInstanceRequest, SshKeyRequest, SshKeysResponse, StatusResponse,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api_server::{ApiError, ApiState};

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub ok: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetInstanceQuery {
    #[serde(default)]
    pub include_logs: bool,
}

pub async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse { ok: true })
}

#[instrument(skip(state, body))]
pub async fn create_instance_handler(
    State(state): State<ApiState>,
    body: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateInstanceResponse>), ApiError> {
    let Json(request) = body?;
    let created = state.controller.create(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_instances_handler(State(state): State<ApiState>) -> Json<Vec<InstanceView>> {
    Json(state.controller.list())
}

#[instrument(skip(state))]
pub async fn get_instance_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Query(query): Query<GetInstanceQuery>,
) -> Result<Json<InstanceView>, ApiError> {
    let view = state
        .controller
        .get_state(&instance_id, query.include_logs)
        .await?;
    Ok(Json(view))
}

#[instrument(skip(state, body))]
pub async fn manage_instance_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    body: Result<Json<ManageInstanceRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(request) = body?;
    let status = state.controller.apply(&instance_id, request.action).await?;
    Ok(Json(StatusResponse { status }))
}

#[instrument(skip(state))]
pub async fn delete_instance_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.controller.delete(&instance_id).await?;
    Ok(Json(StatusResponse {
        status: InstanceStatus::Deleted,
    }))
}

#[instrument(skip(state))]
pub async fn list_keys_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<Json<SshKeysResponse>, ApiError> {
    let keys = state.keys.list_keys(&instance_id).await?;
    Ok(Json(SshKeysResponse { keys }))
}

#[instrument(skip(state, body))]
pub async fn add_key_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    body: Result<Json<SshKeyRequest>, JsonRejection>,
) -> Result<Json<SshKeysResponse>, ApiError> {
    let Json(request) = body?;
    state.keys.add_key(&instance_id, &request.ssh_pubkey).await?;
    let keys = state.keys.list_keys(&instance_id).await?;
    Ok(Json(SshKeysResponse { keys }))
}

#[instrument(skip(state, body))]
pub async fn remove_key_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    body: Result<Json<SshKeyRequest>, JsonRejection>,
) -> Result<Json<SshKeysResponse>, ApiError> {
    let Json(request) = body?;
    state
        .keys
        .remove_key(&instance_id, &request.ssh_pubkey)
        .await?;
    let keys = state.keys.list_keys(&instance_id).await?;
    Ok(Json(SshKeysResponse { keys }))
}

pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route(
            "/instances",
            get(list_instances_handler).post(create_instance_handler),
        )
        .route(
            "/instances/:id",
            get(get_instance_handler)
                .put(manage_instance_handler)
                .delete(delete_instance_handler),
        )
        .route(
            "/instances/:id/ssh",
            get(list_keys_handler)
                .post(add_key_handler)
                .delete(remove_key_handler),
        )
        .with_state(state)
}
