//! 统一错误处理
//!
//! - `ApiError`：HTTP 层错误，实现 `IntoResponse`
//! - `DeployError`：部署引擎中会中断单个服务部署的错误

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::infra::{ClusterError, RegistryError, SourceControlError};

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突（如：服务已有部署在进行）
    Conflict(String),
    /// 500 - 内部错误
    Internal(String),
    /// 503 - 服务不可用
    ServiceUnavailable(String),
}

impl ApiError {
    /// 创建未授权错误
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    /// 创建未找到错误
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// 创建请求无效错误
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// 创建冲突错误
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// 创建内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 创建服务不可用错误
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing API key".to_string(),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

/// 部署引擎错误
///
/// 节点级和任务级失败以数据形式记录在结果里，不会出现在这里
#[derive(Debug, Error)]
pub enum DeployError {
    /// 服务不在白名单中
    #[error("service '{0}' is not whitelisted")]
    NotWhitelisted(String),

    #[error("service '{0}' not found in cluster")]
    ServiceNotFound(String),

    /// 所有节点都拉取失败，不会继续更新服务
    #[error("image {image} could not be pulled on any of {attempted} nodes")]
    TotalPullFailure { image: String, attempted: usize },

    /// 乐观并发版本号已过期，调用方可以重新读取后重试
    #[error("version conflict updating '{service}': index {version} is stale, re-read and retry")]
    VersionConflict { service: String, version: u64 },

    #[error("manifest validation failed: {0}")]
    ManifestValidation(String),

    #[error("registry credential unavailable: {0}")]
    Credential(#[from] RegistryError),

    #[error("cluster API error: {0}")]
    Cluster(ClusterError),

    #[error("source control error: {0}")]
    SourceControl(#[from] SourceControlError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ClusterError> for DeployError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Conflict { service, version } => DeployError::VersionConflict { service, version },
            ClusterError::NotFound(name) => DeployError::ServiceNotFound(name),
            other => DeployError::Cluster(other),
        }
    }
}

impl DeployError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DeployError::VersionConflict { .. })
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::NotWhitelisted(name) => ApiError::not_found(format!("Service '{}'", name)),
            DeployError::ServiceNotFound(name) => ApiError::not_found(format!("Cluster service '{}'", name)),
            DeployError::VersionConflict { .. } => ApiError::conflict(e.to_string()),
            DeployError::ManifestValidation(_) => ApiError::bad_request(e.to_string()),
            DeployError::Config(_) => ApiError::service_unavailable(e.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}
