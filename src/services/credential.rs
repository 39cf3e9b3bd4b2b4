//! 镜像仓库凭证缓存
//!
//! 进程内只保存一份凭证，过期后重新签发。并发刷新时可能重复签发，缓存只做原子替换。

use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::env::constants::DEFAULT_CREDENTIAL_LIFETIME_HOURS;
use crate::domain::registry::RegistryCredential;
use crate::infra::registry::{IssuedToken, RegistryError, RegistryTokenApi};

pub struct CredentialCache {
    issuer: Arc<dyn RegistryTokenApi>,
    cached: ArcSwapOption<RegistryCredential>,
}

impl CredentialCache {
    pub fn new(issuer: Arc<dyn RegistryTokenApi>) -> Self {
        Self {
            issuer,
            cached: ArcSwapOption::empty(),
        }
    }

    /// 获取有效凭证，过期或不存在时重新签发
    ///
    /// 签发失败不会写入缓存，下次调用会重试
    pub async fn get_credential(&self) -> Result<Arc<RegistryCredential>, RegistryError> {
        if let Some(cached) = self.cached.load_full() {
            if cached.is_valid_at(Utc::now()) {
                return Ok(cached);
            }
            debug!(registry = %cached.registry_host, "Registry credential expired, refreshing");
        }

        let issued = self.issuer.issue_token().await.map_err(|e| {
            warn!(error = %e, "Failed to obtain registry credential");
            e
        })?;
        let credential = Arc::new(decode(issued)?);

        info!(
            registry = %credential.registry_host,
            expires_at = %credential.expires_at,
            "Registry credential refreshed"
        );
        self.cached.store(Some(credential.clone()));
        Ok(credential)
    }
}

/// 令牌是 base64("username:password")
fn decode(issued: IssuedToken) -> Result<RegistryCredential, RegistryError> {
    let raw = STANDARD
        .decode(issued.authorization_token.trim())
        .map_err(|e| RegistryError::InvalidToken(e.to_string()))?;
    let text = String::from_utf8(raw).map_err(|e| RegistryError::InvalidToken(e.to_string()))?;
    let (username, password) = text
        .split_once(':')
        .ok_or_else(|| RegistryError::InvalidToken("missing ':' separator".to_string()))?;

    let expires_at = issued
        .expires_at
        .unwrap_or_else(|| Utc::now() + Duration::hours(DEFAULT_CREDENTIAL_LIFETIME_HOURS));

    Ok(RegistryCredential {
        username: username.to_string(),
        password: password.to_string(),
        registry_host: issued.registry_host,
        expires_at,
    })
}
