//! 服务白名单
//!
//! 逻辑服务名 → 集群服务 / 镜像仓库 / manifest 位置 的映射。
//! 从 JSON 文件加载，短 TTL 缓存，过期后整体替换。

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::DeployError;

/// manifest 在源码仓库中的位置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManifestLocation {
    pub repo_id: String,
    pub file_path: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// manifest 中的服务 key，默认与逻辑服务名相同
    #[serde(default)]
    pub key: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// 单个服务的映射配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceMapping {
    /// 逻辑服务名
    pub name: String,
    /// 集群中的服务名，默认与逻辑服务名相同
    #[serde(default)]
    pub cluster_service: Option<String>,
    /// 覆盖镜像仓库（不含 tag），默认沿用服务当前镜像
    #[serde(default)]
    pub image_repository: Option<String>,
    /// 镜像仓库中的项目 ID
    #[serde(default)]
    pub registry_project_id: Option<String>,
    #[serde(default)]
    pub manifest: Option<ManifestLocation>,
}

impl ServiceMapping {
    pub fn cluster_service_name(&self) -> &str {
        self.cluster_service.as_deref().unwrap_or(&self.name)
    }

    pub fn manifest_key(&self) -> Option<&str> {
        self.manifest
            .as_ref()
            .map(|m| m.key.as_deref().unwrap_or(&self.name))
    }
}

/// 服务解析接口，部署编排通过它查找白名单
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<ServiceMapping, DeployError>;

    async fn list(&self) -> Result<Vec<ServiceMapping>, DeployError>;
}

enum MappingSource {
    File(PathBuf),
    Static,
}

struct CachedMappings {
    mappings: HashMap<String, ServiceMapping>,
    loaded_at: Instant,
}

/// 服务白名单
///
/// 并发读取无锁；过期时可能被多个请求同时刷新，结果相同所以无害
pub struct ServiceRegistry {
    source: MappingSource,
    ttl: Duration,
    cache: ArcSwapOption<CachedMappings>,
}

impl ServiceRegistry {
    /// 从 JSON 文件加载（数组格式）
    pub fn from_file(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            source: MappingSource::File(path.into()),
            ttl,
            cache: ArcSwapOption::empty(),
        }
    }

    /// 固定映射，不会过期
    pub fn from_static(mappings: Vec<ServiceMapping>) -> Self {
        let cached = CachedMappings {
            mappings: index(mappings),
            loaded_at: Instant::now(),
        };
        Self {
            source: MappingSource::Static,
            ttl: Duration::MAX,
            cache: ArcSwapOption::from_pointee(cached),
        }
    }

    async fn snapshot(&self) -> Result<Arc<CachedMappings>, DeployError> {
        let current = self.cache.load_full();
        if let Some(ref cached) = current {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.clone());
            }
        }

        let path = match &self.source {
            MappingSource::File(path) => path,
            MappingSource::Static => {
                return current.ok_or_else(|| DeployError::Config("empty service mapping".to_string()))
            }
        };

        match load_file(path).await {
            Ok(mappings) => {
                let fresh = Arc::new(CachedMappings {
                    mappings: index(mappings),
                    loaded_at: Instant::now(),
                });
                debug!(path = %path.display(), count = fresh.mappings.len(), "Service mapping refreshed");
                self.cache.store(Some(fresh.clone()));
                Ok(fresh)
            }
            Err(e) => match current {
                // 刷新失败时继续使用旧快照
                Some(stale) => {
                    warn!(path = %path.display(), error = %e, "Failed to refresh service mapping, serving stale copy");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }
}

#[async_trait]
impl ServiceResolver for ServiceRegistry {
    async fn resolve(&self, name: &str) -> Result<ServiceMapping, DeployError> {
        self.snapshot()
            .await?
            .mappings
            .get(name)
            .cloned()
            .ok_or_else(|| DeployError::NotWhitelisted(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<ServiceMapping>, DeployError> {
        let snapshot = self.snapshot().await?;
        let mut mappings: Vec<ServiceMapping> = snapshot.mappings.values().cloned().collect();
        mappings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(mappings)
    }
}

fn index(mappings: Vec<ServiceMapping>) -> HashMap<String, ServiceMapping> {
    mappings.into_iter().map(|m| (m.name.clone(), m)).collect()
}

async fn load_file(path: &Path) -> Result<Vec<ServiceMapping>, DeployError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DeployError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let mappings: Vec<ServiceMapping> = serde_json::from_str(&content)
        .map_err(|e| DeployError::Config(format!("invalid {}: {}", path.display(), e)))?;
    info!(path = %path.display(), count = mappings.len(), "Loaded service mapping");
    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(name: &str) -> ServiceMapping {
        ServiceMapping {
            name: name.to_string(),
            cluster_service: None,
            image_repository: None,
            registry_project_id: None,
            manifest: None,
        }
    }

    #[test]
    fn test_defaults_fall_back_to_logical_name() {
        let json = r#"{"name":"api","manifest":{"repo_id":"ops/deploy","file_path":"stack.yml"}}"#;
        let m: ServiceMapping = serde_json::from_str(json).unwrap();
        assert_eq!(m.cluster_service_name(), "api");
        assert_eq!(m.manifest_key(), Some("api"));
        assert_eq!(m.manifest.as_ref().unwrap().branch, "main");

        let aliased = ServiceMapping {
            cluster_service: Some("prod_api".to_string()),
            ..m
        };
        assert_eq!(aliased.cluster_service_name(), "prod_api");
    }

    #[tokio::test]
    async fn test_static_registry_resolve() {
        let registry = ServiceRegistry::from_static(vec![mapping("api"), mapping("worker")]);
        assert_eq!(registry.resolve("api").await.unwrap().name, "api");
        assert!(matches!(
            registry.resolve("unknown").await,
            Err(DeployError::NotWhitelisted(_))
        ));

        let names: Vec<String> = registry.list().await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["api", "worker"]);
    }

    #[tokio::test]
    async fn test_file_registry_reloads_and_keeps_stale_copy() {
        let path = std::env::temp_dir().join(format!("rollout-mapping-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"[{"name":"api"}]"#).await.unwrap();

        let registry = ServiceRegistry::from_file(&path, Duration::ZERO);
        assert!(registry.resolve("api").await.is_ok());

        // 文件损坏后仍使用上一次成功加载的内容
        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(registry.resolve("api").await.is_ok());

        tokio::fs::write(&path, r#"[{"name":"worker"}]"#).await.unwrap();
        assert!(registry.resolve("worker").await.is_ok());
        assert!(registry.resolve("api").await.is_err());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let registry = ServiceRegistry::from_file("/nonexistent/rollout-services.json", Duration::from_secs(30));
        assert!(matches!(registry.resolve("api").await, Err(DeployError::Config(_))));
    }
}
