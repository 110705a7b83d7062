use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use loft_core::Caller;
use loft_domain::{EnvironmentId, Template, TemplateId};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

fn caller(principal: &Principal) -> Caller {
    Caller::User(principal.0.clone())
}

fn parse_env_id(raw: &str) -> Result<EnvironmentId, ApiError> {
    Uuid::parse_str(raw)
        .map(EnvironmentId)
        .map_err(|_| ApiError::bad_request(format!("not an environment id: {raw}")))
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .list_environments(&Caller::System)
        .await?;
    Ok(StatusCode::OK)
}

// ── Environments ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(rename = "templateId")]
    pub template_id: String,
    pub name: String,
}

pub async fn create_environment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let handle = state
        .orchestrator
        .create(&caller(&principal), &TemplateId::new(body.template_id), &body.name)
        .await?;
    // the provisioning task continues on the worker pool
    Ok((StatusCode::ACCEPTED, Json(json!(handle.environment))))
}

pub async fn list_environments(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Value>, ApiError> {
    let environments = state.orchestrator.list_environments(&caller(&principal)).await?;
    Ok(Json(json!(environments)))
}

pub async fn get_environment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let env_id = parse_env_id(&id)?;
    let env = state.orchestrator.get_environment(&caller(&principal), env_id).await?;
    state.orchestrator.record_access(env_id).await;
    Ok(Json(json!(env)))
}

pub async fn start_environment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let env_id = parse_env_id(&id)?;
    let handle = state.orchestrator.start(&caller(&principal), env_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(handle.environment))))
}

pub async fn stop_environment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let env_id = parse_env_id(&id)?;
    let handle = state.orchestrator.stop(&caller(&principal), env_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(handle.environment))))
}

pub async fn delete_environment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let env_id = parse_env_id(&id)?;
    let handle = state.orchestrator.delete(&caller(&principal), env_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(handle.environment))))
}

pub async fn list_containers(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let env_id = parse_env_id(&id)?;
    let containers = state.orchestrator.list_containers(&caller(&principal), env_id).await?;
    Ok(Json(json!(containers)))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

pub async fn list_metrics(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let env_id = parse_env_id(&id)?;
    let samples = state
        .orchestrator
        .list_metrics(&caller(&principal), env_id, query.limit)
        .await?;
    Ok(Json(json!(samples)))
}

pub async fn list_events(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let env_id = parse_env_id(&id)?;
    // ownership gate before touching the audit trail
    state.orchestrator.get_environment(&caller(&principal), env_id).await?;
    let events = state
        .orchestrator
        .repository()
        .list_events(Some(&env_id), query.limit)
        .await
        .map_err(loft_core::OrchError::from)?;
    Ok(Json(json!(events)))
}

pub async fn usage(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Value>, ApiError> {
    let report = state.orchestrator.usage(&caller(&principal)).await?;
    Ok(Json(json!(report)))
}

// ── Templates ─────────────────────────────────────────────────────────────────

pub async fn list_templates(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Value>, ApiError> {
    let templates = state.orchestrator.list_templates(&caller(&principal)).await?;
    Ok(Json(json!(templates)))
}

pub async fn put_template(
    State(state): State<AppState>,
    Json(template): Json<Template>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.put_template(&template).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_template(&TemplateId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
