//! 健康检查和服务列表 API
//!
//! 包含 /health, /status, /services 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::config::ServiceMapping;
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    /// 白名单中的服务数量
    whitelisted_services: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    whitelist_error: Option<String>,
    active_deploys: usize,
    active_services: Vec<String>,
}

/// 服务列表项
#[derive(Debug, Serialize)]
struct ServiceSummary {
    name: String,
    cluster_service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest_repo: Option<String>,
}

impl From<ServiceMapping> for ServiceSummary {
    fn from(mapping: ServiceMapping) -> Self {
        Self {
            cluster_service: mapping.cluster_service_name().to_string(),
            manifest_repo: mapping.manifest.as_ref().map(|m| m.repo_id.clone()),
            name: mapping.name,
        }
    }
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(health_check))
        .route("/services", get(list_services))
}

/// 健康检查 - 返回状态、版本、运行时间等信息
///
/// GET /health, GET /status
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let running = state.task_store.get_all().await;
    let mut active_services: Vec<String> = running
        .iter()
        .filter(|task| !task.status.is_terminal())
        .flat_map(|task| task.services.iter().cloned())
        .collect();
    active_services.sort();
    active_services.dedup();

    let (whitelisted_services, whitelist_error) = match state.services.list().await {
        Ok(mappings) => (mappings.len(), None),
        Err(e) => (0, Some(e.to_string())),
    };

    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: if whitelist_error.is_none() { "ok" } else { "degraded" },
        service: "rollout-agent",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        whitelisted_services,
        whitelist_error,
        active_deploys: running.len(),
        active_services,
    })
}

/// 列出白名单中的服务
///
/// GET /services
/// 需要 API Key 认证
async fn list_services(_auth: RequireApiKey, State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let services: Vec<ServiceSummary> = state
        .services
        .list()
        .await?
        .into_iter()
        .map(ServiceSummary::from)
        .collect();
    Ok(Json(serde_json::json!({ "services": services })))
}
