//! HTTP 接口（axum）
//!
//! 路由：
//! - POST /api/chat
//! - POST /api/confirmations/:id/confirm、POST /api/confirmations/:id/reject
//! - GET  /api/confirmations/pending?user_id=
//! - POST /api/confirmations/sweep
//! - GET  /api/audit?tool_name=&status=&start=&end=&limit=&offset=
//! - GET  /api/audit/stats?user_id=&start=&end=
//! - GET  /api/conversations/:id/messages?user_id=
//! - GET  /api/health
//!
//! user_id 视为上游身份校验后的结果，直接取自请求。

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    AgentError, AppComponents, ChatResponse, ConfirmationStatus, PendingConfirmation,
    RequestContext,
};
use crate::memory::Message;
use crate::tools::{AuditFilter, ToolCallRecord, ToolCallStatus, ToolOutcome, UsageStats};

/// 错误响应：稳定错误码 + 可读信息，能追溯时附带审计记录 id
#[derive(Debug)]
pub struct ApiError {
    error: AgentError,
    audit_record_id: Option<String>,
}

impl ApiError {
    fn with_audit_record(mut self, audit_record_id: Option<String>) -> Self {
        self.audit_record_id = audit_record_id;
        self
    }
}

impl From<AgentError> for ApiError {
    fn from(error: AgentError) -> Self {
        Self {
            error,
            audit_record_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error_code: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.error);
        }
        let body = ErrorResponse {
            success: false,
            error_code: self.error.code().to_string(),
            error_message: self.error.to_string(),
            details: self
                .audit_record_id
                .map(|id| serde_json::json!({ "audit_record_id": id })),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RejectResponse {
    pub id: String,
    pub status: ConfirmationStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResponse {
    pub expired: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub tool_name: Option<String>,
    pub status: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub user_id: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub anomalies: Vec<ToolCallRecord>,
    pub pending_confirmations_swept: usize,
}

pub fn router(components: AppComponents) -> Router {
    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/confirmations/pending", get(api_pending))
        .route("/api/confirmations/sweep", post(api_sweep))
        .route("/api/confirmations/:id/confirm", post(api_confirm))
        .route("/api/confirmations/:id/reject", post(api_reject))
        .route("/api/audit", get(api_audit))
        .route("/api/audit/stats", get(api_audit_stats))
        .route("/api/conversations/:id/messages", get(api_history))
        .route("/api/health", get(api_health))
        .with_state(components)
}

async fn api_chat(
    State(app): State<AppComponents>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let response = app
        .orchestrator
        .handle(&req.user_id, req.conversation_id.as_deref(), &req.message)
        .await?;
    Ok(Json(response))
}

/// 确认失败时附上挂起调用的审计记录 id（仅限确认属于调用者本人）
async fn confirmation_error(app: &AppComponents, id: &str, user_id: &str, error: AgentError) -> ApiError {
    let audit_record_id = match &error {
        AgentError::ConfirmationExpired(_) | AgentError::AlreadyResolved { .. } => app
            .dispatcher()
            .confirmations()
            .get(id)
            .await
            .ok()
            .flatten()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.audit_record_id),
        _ => None,
    };
    ApiError::from(error).with_audit_record(audit_record_id)
}

async fn api_confirm(
    State(app): State<AppComponents>,
    Path(id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<ToolOutcome> {
    let ctx = RequestContext::new(&req.user_id);
    match app.dispatcher().confirm(&ctx, &id).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => Err(confirmation_error(&app, &id, &req.user_id, e).await),
    }
}

async fn api_reject(
    State(app): State<AppComponents>,
    Path(id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<RejectResponse> {
    let ctx = RequestContext::new(&req.user_id);
    match app.dispatcher().reject(&ctx, &id).await {
        Ok(rejected) => Ok(Json(RejectResponse {
            id: rejected.id,
            status: rejected.status,
        })),
        Err(e) => Err(confirmation_error(&app, &id, &req.user_id, e).await),
    }
}

async fn api_pending(
    State(app): State<AppComponents>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Vec<PendingConfirmation>> {
    let pending = app
        .dispatcher()
        .confirmations()
        .list_pending(&q.user_id)
        .await?;
    Ok(Json(pending))
}

async fn api_sweep(State(app): State<AppComponents>) -> ApiResult<SweepResponse> {
    let expired = app.dispatcher().confirmations().sweep_expired().await?;
    Ok(Json(SweepResponse { expired }))
}

async fn api_audit(
    State(app): State<AppComponents>,
    Query(q): Query<AuditQuery>,
) -> ApiResult<Vec<ToolCallRecord>> {
    let status = match q.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(ToolCallStatus::parse(s).ok_or_else(|| {
            AgentError::Validation(format!("unknown audit status: {}", s))
        })?),
    };
    let audit_cfg = &app.config.audit;
    let limit = q
        .limit
        .unwrap_or(audit_cfg.default_limit)
        .clamp(1, audit_cfg.max_limit.max(1));

    let filter = AuditFilter {
        tool_name: q.tool_name.filter(|t| !t.is_empty()),
        status,
        start: q.start,
        end: q.end,
        user_id: q.user_id,
        conversation_id: q.conversation_id,
    };
    let records = app
        .dispatcher()
        .ledger()
        .query(&filter, limit, q.offset.unwrap_or(0))
        .await?;
    Ok(Json(records))
}

async fn api_audit_stats(
    State(app): State<AppComponents>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<UsageStats> {
    if q.user_id.trim().is_empty() {
        return Err(AgentError::Validation("user_id is required".to_string()).into());
    }
    let stats = app
        .dispatcher()
        .ledger()
        .usage_stats(&q.user_id, q.start, q.end)
        .await?;
    Ok(Json(stats))
}

async fn api_history(
    State(app): State<AppComponents>,
    Path(id): Path<String>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Vec<Message>> {
    let messages = app.orchestrator.history(&id, &q.user_id).await?;
    Ok(Json(messages))
}

async fn api_health(State(app): State<AppComponents>) -> ApiResult<HealthResponse> {
    let swept = app.dispatcher().confirmations().sweep_expired().await?;
    let anomalies = app
        .dispatcher()
        .ledger()
        .anomalies(Duration::from_secs(app.config.audit.anomaly_after_secs))
        .await?;
    let status = if anomalies.is_empty() { "ok" } else { "degraded" };
    Ok(Json(HealthResponse {
        status: status.to_string(),
        anomalies,
        pending_confirmations_swept: swept,
    }))
}

/// 绑定地址并服务，直到 shutdown 完成
pub async fn serve(
    components: AppComponents,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Taskmate API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(components))
        .with_graceful_shutdown(shutdown)
        .await
}
