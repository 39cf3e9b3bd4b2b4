//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{EnvConfig, ServiceRegistry, ServiceResolver};
use crate::infra::{CallbackNotifier, FanoutSink, GitLabClient, HttpTokenIssuer, PipelineEventSink, SwarmClient};
use crate::services::credential::CredentialCache;
use crate::services::deploy::{DeploymentOrchestrator, EngineSettings};

use super::event_hub::EventHub;
use super::task_store::TaskStore;

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 部署 ==========
    /// 服务白名单
    pub services: Arc<dyn ServiceResolver>,
    /// 部署编排器
    pub orchestrator: Arc<DeploymentOrchestrator>,

    // ========== 任务管理 ==========
    /// 部署记录
    pub task_store: TaskStore,
    /// 部署事件通道
    pub event_hub: Arc<EventHub>,
}

impl AppState {
    /// 用已构建好的组件创建
    pub fn new(
        config: EnvConfig,
        services: Arc<dyn ServiceResolver>,
        orchestrator: Arc<DeploymentOrchestrator>,
        event_hub: Arc<EventHub>,
    ) -> Self {
        Self {
            api_key: config.api_key.clone(),
            started_at: Utc::now(),
            services,
            orchestrator,
            task_store: TaskStore::new(),
            event_hub,
            config,
        }
    }

    /// 根据环境配置创建所有外部客户端
    pub fn from_config(config: EnvConfig) -> Self {
        tracing::info!(
            api_key_len = config.api_key.len(),
            port = config.port,
            cluster_api = %config.cluster.api_url,
            source_control = %config.source_control.api_url,
            registry_auth = config.registry.is_some(),
            callback_url = ?config.callback_url,
            service_mapping = %config.service_mapping_file,
            "Loaded configuration"
        );

        let cluster = Arc::new(SwarmClient::new(
            config.cluster.api_url.clone(),
            config.cluster.api_token.clone(),
            config.cluster.node_target_header.clone(),
        ));

        let credentials = config.registry.as_ref().map(|registry| {
            Arc::new(CredentialCache::new(Arc::new(HttpTokenIssuer::new(
                registry.token_url.clone(),
                registry.token_auth.clone(),
                registry.registry_host.clone(),
            ))))
        });
        if credentials.is_none() {
            tracing::warn!("REGISTRY_TOKEN_URL not set, images will be pulled anonymously");
        }

        let source_control = Arc::new(GitLabClient::new(
            config.source_control.api_url.clone(),
            config.source_control.token.clone(),
        ));

        let services: Arc<dyn ServiceResolver> = Arc::new(ServiceRegistry::from_file(
            config.service_mapping_file.clone(),
            config.service_mapping_ttl,
        ));

        let event_hub = Arc::new(EventHub::new());
        let sink = Arc::new(FanoutSink::new(vec![
            event_hub.clone() as Arc<dyn PipelineEventSink>,
            Arc::new(CallbackNotifier::new(config.callback_url.clone())),
        ]));

        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            services.clone(),
            cluster,
            credentials,
            source_control,
            sink,
            EngineSettings {
                health: config.health.clone(),
                pipeline: config.pipeline.clone(),
                policy: config.manifest_policy.clone(),
            },
        ));

        Self::new(config, services, orchestrator, event_hub)
    }
}
