use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use broker_api::{
    AddChallengeRequest, ApiError, ApiResult, CreateInstanceRequest, InstanceResponse,
    ResetRequest, StatsResponse,
};
use broker_common::{BrokerError, Challenge};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::instrument;

use crate::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/", post(create_instance).get(list_instances))
        .route("/:id", get(get_instance))
        .route("/:id/docker_stats", get(docker_stats))
        .route("/user/:user", get(get_instance_for_user))
        .route("/reset/:id", post(reset_instance))
        .route("/disconnect/:user", post(disconnect_user))
        .route("/challenges", post(add_challenge))
        .route("/challenges/:id", delete(remove_challenge))
        .route("/stats", get(stats))
        .route("/log/:id", get(instance_log))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[instrument]
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

#[instrument(skip(state))]
async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateInstanceRequest>,
) -> ApiResult<Json<InstanceResponse>> {
    state
        .catalog
        .require(&req.challenge)
        .await
        .map_err(BrokerError::from)?;

    let existing = state.scheduler.assignment_for(&req.user).await?;
    if existing.is_some() {
        return Err(ApiError(BrokerError::AlreadyAssigned(req.user)));
    }

    let inst = state.scheduler.get_instance_for(&req.user, &req.challenge).await?;
    Ok(Json(inst.into()))
}

#[instrument(skip(state))]
async fn list_instances(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<String>>> {
    let ids = state.scheduler.repository().all_instance_ids().await?;
    Ok(Json(ids))
}

#[instrument(skip(state))]
async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceResponse>> {
    let inst = state
        .scheduler
        .repository()
        .get(&id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
    Ok(Json(inst.into()))
}

#[instrument(skip(state))]
async fn docker_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .scheduler
        .repository()
        .get(&id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
    let stats = state
        .scheduler
        .runtime()
        .await
        .stats(&id)
        .await
        .map_err(BrokerError::from)?;
    Ok(Json(stats))
}

#[instrument(skip(state))]
async fn get_instance_for_user(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> ApiResult<Json<InstanceResponse>> {
    let container_id = state
        .scheduler
        .assignment_for(&user)
        .await?
        .ok_or_else(|| BrokerError::NotFound(user.clone()))?;
    let inst = state
        .scheduler
        .repository()
        .get(&container_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(container_id))?;
    Ok(Json(inst.into()))
}

#[instrument(skip(state))]
async fn reset_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResetRequest>,
) -> ApiResult<Json<InstanceResponse>> {
    let inst = state.scheduler.request_reset(&req.user, &id).await?;
    Ok(Json(inst.into()))
}

#[instrument(skip(state))]
async fn disconnect_user(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> ApiResult<Json<&'static str>> {
    state.scheduler.disconnect(&user).await?;
    Ok(Json("disconnected"))
}

#[instrument(skip(state))]
async fn add_challenge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddChallengeRequest>,
) -> ApiResult<Json<&'static str>> {
    if let Some(field) = req.missing_field() {
        return Err(ApiError(BrokerError::MissingField(field.to_string())));
    }

    let name = req.name.clone().unwrap_or_default();
    let challenge = Challenge {
        name: name.clone(),
        internal_port: req.port.unwrap_or_default(),
        mem_limit_mb: req.mem_limit.unwrap_or_default(),
        user_limit: req.user_limit.unwrap_or_default(),
        lifetime_seconds: req.lifetime.unwrap_or_default(),
        can_prestart: req.can_prestart,
    };
    let context_path = std::path::Path::new(&state.config.challenge_dir).join(&name);

    state
        .catalog
        .register(challenge, &context_path)
        .await
        .map_err(BrokerError::from)?;

    if req.can_prestart {
        state.scheduler.start_instance(&name, None).await?;
    }

    Ok(Json("ok"))
}

#[instrument(skip(state))]
async fn remove_challenge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<&'static str>> {
    state.catalog.remove(&id).await;
    Ok(Json("deleted"))
}

#[instrument(skip(state))]
async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatsResponse>> {
    let current_instances = state.scheduler.repository().all_instance_count().await?;
    let total_instances = state.scheduler.total_instance_count().await?;
    let current_users = state.scheduler.current_user_count().await?;
    let challenges = state.catalog.len().await;

    Ok(Json(StatsResponse {
        current_instances,
        total_instances,
        current_users,
        challenges,
    }))
}

#[instrument(skip(state))]
async fn instance_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<u8>> {
    state
        .scheduler
        .repository()
        .get(&id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
    let logs = state
        .scheduler
        .runtime()
        .await
        .logs(&id)
        .await
        .map_err(BrokerError::from)?;
    Ok(logs)
}
