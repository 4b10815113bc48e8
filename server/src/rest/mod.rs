use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::auth::tokens_match;
use crate::core::registry::{Priority, SessionId, SessionSummary};
use crate::core::restart::RestartManager;
use crate::core::{AgentMuxError, Registry, ToolKind};

type AppState = (Arc<Config>, Arc<Registry>, Arc<RestartManager>);

pub fn router() -> Router<AppState> {
    let authenticated = Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/priority", post(set_priority))
        .route("/api/sessions/:id/start/:tool", post(start_tool))
        .route("/api/sessions/:id/stop", post(stop_tool))
        .route("/api/sessions/:id/input", post(send_input))
        .route("/api/sessions/:id/resize", post(resize_session))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/:tool/recheck", post(recheck_tool))
        .route("/api/restart", post(trigger_restart))
        .route("/api/config", get(get_config))
        .route("/api/set-working-dir", post(set_working_dir))
        .route("/api/files", get(files_not_implemented))
        .route("/api/tunnel", get(tunnel_not_implemented))
        .route_layer(middleware::from_fn(require_auth));

    let unauthenticated = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/health", get(api_health))
        .route("/auth-status", get(auth_status))
        .route("/auth-verify", post(auth_verify));

    unauthenticated.merge(authenticated)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn api_health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthStatusBody {
    auth_required: bool,
}

async fn auth_status(State((config, _, _)): State<AppState>) -> Json<AuthStatusBody> {
    Json(AuthStatusBody { auth_required: config.auth_token.is_some() })
}

#[derive(Debug, Deserialize)]
struct AuthVerifyBody {
    token: String,
}

async fn auth_verify(
    State((config, _, _)): State<AppState>,
    Json(body): Json<AuthVerifyBody>,
) -> Result<StatusCode, AgentMuxError> {
    match &config.auth_token {
        Some(expected) if tokens_match(expected, &body.token) => Ok(StatusCode::NO_CONTENT),
        Some(_) => Err(AgentMuxError::AuthFailure),
        None => Ok(StatusCode::NO_CONTENT),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigBody {
    tools: Vec<ToolAvailability>,
    root_dir: String,
    hostname: String,
    tunnel_enabled: bool,
}

async fn get_config(State((config, registry, _)): State<AppState>) -> Json<ConfigBody> {
    let tools = ToolKind::all().into_iter().map(|tool| tool_availability(&registry, tool)).collect();
    Json(ConfigBody {
        tools,
        root_dir: config.root_dir.display().to_string(),
        hostname: hostname_best_effort(),
        tunnel_enabled: false,
    })
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Deserialize)]
struct SetWorkingDirBody {
    path: String,
}

async fn set_working_dir(
    State((config, _, _)): State<AppState>,
    Json(body): Json<SetWorkingDirBody>,
) -> Result<StatusCode, AgentMuxError> {
    let guard = crate::core::pathguard::PathGuard::new(config.root_dir.clone());
    guard.validate(&body.path)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn files_not_implemented() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

async fn tunnel_not_implemented() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

/// Rejects every request whose bearer token or `?token=` query doesn't match
/// the configured token. A no-op when no token is configured.
async fn require_auth(
    State((config, _, _)): State<AppState>,
    Query(query): Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Result<Response, AgentMuxError> {
    if let Some(expected) = &config.auth_token {
        let header_token = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let provided = header_token.or(query.token.as_deref());
        let ok = provided.map(|t| tokens_match(expected, t)).unwrap_or(false);
        if !ok {
            return Err(AgentMuxError::AuthFailure);
        }
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    name: Option<String>,
    working_dir: Option<String>,
}

async fn list_sessions(State((_, registry, _)): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(registry.list_sessions())
}

async fn create_session(
    State((_, registry, _)): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<SessionSummary>, AgentMuxError> {
    registry.create_session(body.name, body.working_dir).map(Json)
}

async fn get_session(State((_, registry, _)): State<AppState>, Path(id): Path<SessionId>) -> Result<Json<SessionSummary>, AgentMuxError> {
    registry
        .get_summary(id)
        .map(Json)
        .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))
}

async fn delete_session(State((_, registry, _)): State<AppState>, Path(id): Path<SessionId>) -> Result<StatusCode, AgentMuxError> {
    registry.delete_session(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct PriorityBody {
    priority: Priority,
}

async fn set_priority(
    State((_, registry, _)): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<PriorityBody>,
) -> Result<StatusCode, AgentMuxError> {
    registry.set_priority(id, body.priority)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
struct StartToolBody {
    cols: Option<u16>,
    rows: Option<u16>,
    #[serde(default)]
    dangerously_skip_permissions: bool,
}

async fn start_tool(
    State((_, registry, _)): State<AppState>,
    Path((id, tool)): Path<(SessionId, String)>,
    body: Option<Json<StartToolBody>>,
) -> Result<StatusCode, AgentMuxError> {
    let tool = ToolKind::from_str_opt(&tool).ok_or_else(|| AgentMuxError::Validation(format!("unknown tool '{tool}'")))?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    registry
        .start_tool(id, tool, body.cols.unwrap_or(80), body.rows.unwrap_or(24), body.dangerously_skip_permissions)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_tool(State((_, registry, _)): State<AppState>, Path(id): Path<SessionId>) -> Result<StatusCode, AgentMuxError> {
    registry.stop_tool(id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct InputBody {
    data: String,
}

async fn send_input(
    State((_, registry, _)): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<InputBody>,
) -> Result<StatusCode, AgentMuxError> {
    registry.write_input(id, &body.data)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

async fn resize_session(
    State((_, registry, _)): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<ResizeBody>,
) -> Result<StatusCode, AgentMuxError> {
    if body.cols == 0 || body.rows == 0 || body.cols > 500 || body.rows > 500 {
        return Err(AgentMuxError::Validation("cols/rows must be in 1..=500".into()));
    }
    registry.resize(id, body.cols, body.rows)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct ToolAvailability {
    tool: ToolKind,
    available: bool,
    aliases: &'static [&'static str],
}

fn tool_availability(registry: &Registry, tool: ToolKind) -> ToolAvailability {
    ToolAvailability {
        tool,
        available: registry.resolver().is_available(tool),
        aliases: tool.binary_names(),
    }
}

async fn list_tools(State((_, registry, _)): State<AppState>) -> Json<Vec<ToolAvailability>> {
    let list = ToolKind::all().into_iter().map(|tool| tool_availability(&registry, tool)).collect();
    Json(list)
}

async fn recheck_tool(State((_, registry, _)): State<AppState>, Path(tool): Path<String>) -> Result<Json<ToolAvailability>, AgentMuxError> {
    let tool = ToolKind::from_str_opt(&tool).ok_or_else(|| AgentMuxError::Validation(format!("unknown tool '{tool}'")))?;
    registry.resolver().invalidate(tool);
    Ok(Json(tool_availability(&registry, tool)))
}

#[derive(Debug, Deserialize, Default)]
struct RestartBody {
    reason: Option<String>,
}

/// Asks the restart manager to broadcast `server_restarting` and exit with
/// the supervisor's restart code. `initiate_restart` never returns on
/// success (the process exits first); a response only comes back at all
/// when the 5-minute rate limit rejects the request.
async fn trigger_restart(
    State((_, _, restart_manager)): State<AppState>,
    body: Option<Json<RestartBody>>,
) -> Result<StatusCode, AgentMuxError> {
    let reason = body.and_then(|Json(b)| b.reason).unwrap_or_else(|| "requested over the REST API".to_string());
    if restart_manager.initiate_restart(&reason).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AgentMuxError::RateLimit("a restart was already requested within the last 5 minutes".into()))
    }
}
