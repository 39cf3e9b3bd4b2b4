//! 镜像仓库令牌签发 Client

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// 令牌签发错误
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },

    #[error("token endpoint returned no authorization data")]
    Empty,

    #[error("invalid authorization token: {0}")]
    InvalidToken(String),
}

/// 签发的原始令牌
#[derive(Clone, Debug)]
pub struct IssuedToken {
    /// base64("username:password")
    pub authorization_token: String,
    pub registry_host: String,
    /// 未返回时由调用方使用默认有效期
    pub expires_at: Option<DateTime<Utc>>,
}

/// 仓库令牌签发 API
#[async_trait]
pub trait RegistryTokenApi: Send + Sync {
    async fn issue_token(&self) -> Result<IssuedToken, RegistryError>;
}

/// 基于 HTTP 的令牌签发客户端
///
/// 响应格式与 ECR `GetAuthorizationToken` 一致：
/// `{"authorizationData":[{"authorizationToken":"...","expiresAt":...,"proxyEndpoint":"https://..."}]}`
pub struct HttpTokenIssuer {
    client: Client,
    token_url: String,
    bearer: Option<String>,
    /// 响应未带 proxyEndpoint 时使用
    default_registry: String,
}

impl HttpTokenIssuer {
    pub fn new(token_url: impl Into<String>, bearer: Option<String>, default_registry: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            token_url: token_url.into(),
            bearer,
            default_registry: default_registry.into(),
        }
    }
}

#[async_trait]
impl RegistryTokenApi for HttpTokenIssuer {
    async fn issue_token(&self) -> Result<IssuedToken, RegistryError> {
        let mut request = self.client.post(&self.token_url);
        if let Some(ref bearer) = self.bearer {
            request = request.bearer_auth(bearer);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Status { status, body });
        }

        let body: TokenResponse = resp.json().await?;
        let data = body.authorization_data.into_iter().next().ok_or(RegistryError::Empty)?;

        let registry_host = data
            .proxy_endpoint
            .as_deref()
            .map(strip_scheme)
            .unwrap_or(&self.default_registry)
            .to_string();

        Ok(IssuedToken {
            authorization_token: data.authorization_token,
            registry_host,
            expires_at: data.expires_at.and_then(ExpiresAt::into_datetime),
        })
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    authorization_data: Vec<AuthorizationData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationData {
    authorization_token: String,
    #[serde(default)]
    expires_at: Option<ExpiresAt>,
    #[serde(default)]
    proxy_endpoint: Option<String>,
}

/// 过期时间可能是 epoch 秒数或 RFC3339 字符串
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresAt {
    Epoch(f64),
    Rfc3339(DateTime<Utc>),
}

impl ExpiresAt {
    fn into_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            ExpiresAt::Epoch(secs) => Utc.timestamp_opt(secs as i64, 0).single(),
            ExpiresAt::Rfc3339(at) => Some(at),
        }
    }
}
