//! 环境变量配置加载

use std::env;
use std::time::Duration;
use tracing::warn;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 集群 API 配置
    pub cluster: ClusterConfig,
    /// 仓库令牌配置（未配置时匿名拉取）
    pub registry: Option<RegistryConfig>,
    /// 源码托管平台配置
    pub source_control: SourceControlConfig,
    /// 服务白名单文件
    pub service_mapping_file: String,
    /// 白名单缓存时间
    pub service_mapping_ttl: Duration,
    /// 流水线事件回调 URL
    pub callback_url: Option<String>,
    /// 健康检查配置
    pub health: HealthSettings,
    /// 流水线监控配置
    pub pipeline: MonitorSettings,
    /// manifest 提交策略
    pub manifest_policy: ManifestPolicy,
}

/// 集群 API 配置
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    /// 按节点路由请求时使用的 header
    pub node_target_header: String,
}

/// 仓库令牌配置
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub token_url: String,
    pub token_auth: Option<String>,
    /// 令牌响应未带 endpoint 时使用的 registry 主机
    pub registry_host: String,
}

/// 源码托管平台配置
#[derive(Clone, Debug)]
pub struct SourceControlConfig {
    pub api_url: String,
    pub token: Option<String>,
}

/// 健康检查参数
#[derive(Clone, Debug)]
pub struct HealthSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(constants::HEALTH_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(constants::HEALTH_POLL_INTERVAL_SECS),
        }
    }
}

/// 流水线监控参数
#[derive(Clone, Debug)]
pub struct MonitorSettings {
    /// 提交后等待流水线注册的时间
    pub grace_period: Duration,
    pub poll_interval: Duration,
    /// 监控时间上限
    pub ceiling: Duration,
    /// 超过此时间仍无流水线，视为未配置 CI
    pub absent_after: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_secs(15),
            ceiling: Duration::from_secs(600),
            absent_after: Duration::from_secs(30),
        }
    }
}

/// manifest 提交策略
///
/// 决定镜像上线后在什么条件下才记录到 manifest
#[derive(Clone, Debug, Default)]
pub struct ManifestPolicy {
    /// 所有就绪节点都拉取成功才提交
    pub require_all_nodes: bool,
    /// 健康检查通过才提交
    pub require_healthy: bool,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("ROLLOUT_AGENT_API_KEY", "API_KEY")
            .unwrap_or_else(|| "change-me-in-production".to_string());
        if env::var("API_KEY").is_ok() {
            warn!("Deprecated environment variable API_KEY detected. Please use ROLLOUT_AGENT_API_KEY");
        }

        let port = parse_var("PORT").unwrap_or(9877);

        let cluster = ClusterConfig {
            api_url: env::var("CLUSTER_API_URL").unwrap_or_else(|_| "http://127.0.0.1:2375".to_string()),
            api_token: non_empty_var("CLUSTER_API_TOKEN"),
            node_target_header: env::var("CLUSTER_NODE_TARGET_HEADER")
                .unwrap_or_else(|_| "X-PortainerAgent-Target".to_string()),
        };

        let registry = non_empty_var("REGISTRY_TOKEN_URL").map(|token_url| RegistryConfig {
            token_url,
            token_auth: non_empty_var("REGISTRY_TOKEN_AUTH"),
            registry_host: env::var("REGISTRY_HOST").unwrap_or_default(),
        });

        let source_control = SourceControlConfig {
            api_url: env::var("SOURCE_CONTROL_URL")
                .unwrap_or_else(|_| "https://gitlab.com/api/v4".to_string()),
            token: non_empty_var("SOURCE_CONTROL_TOKEN"),
        };

        let service_mapping_file =
            env::var("SERVICE_MAPPING_FILE").unwrap_or_else(|_| "services.json".to_string());
        let service_mapping_ttl = Duration::from_secs(
            parse_var("SERVICE_MAPPING_TTL_SECS").unwrap_or(constants::SERVICE_MAPPING_TTL_SECS),
        );

        let callback_url = non_empty_var("DEPLOY_CALLBACK_URL");

        let health_defaults = HealthSettings::default();
        let health = HealthSettings {
            timeout: secs_var("HEALTH_TIMEOUT_SECS").unwrap_or(health_defaults.timeout),
            poll_interval: secs_var("HEALTH_POLL_INTERVAL_SECS").unwrap_or(health_defaults.poll_interval),
        };

        let monitor_defaults = MonitorSettings::default();
        let pipeline = MonitorSettings {
            grace_period: secs_var("PIPELINE_GRACE_SECS").unwrap_or(monitor_defaults.grace_period),
            poll_interval: secs_var("PIPELINE_POLL_INTERVAL_SECS").unwrap_or(monitor_defaults.poll_interval),
            ceiling: secs_var("PIPELINE_CEILING_SECS").unwrap_or(monitor_defaults.ceiling),
            absent_after: secs_var("PIPELINE_ABSENT_AFTER_SECS").unwrap_or(monitor_defaults.absent_after),
        };

        let manifest_policy = ManifestPolicy {
            require_all_nodes: bool_var("MANIFEST_REQUIRE_ALL_NODES").unwrap_or(false),
            require_healthy: bool_var("MANIFEST_REQUIRE_HEALTHY").unwrap_or(false),
        };

        Self {
            api_key,
            port,
            cluster,
            registry,
            source_control,
            service_mapping_file,
            service_mapping_ttl,
            callback_url,
            health,
            pipeline,
            manifest_policy,
        }
    }
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn secs_var(key: &str) -> Option<Duration> {
    parse_var(key).map(Duration::from_secs)
}

fn bool_var(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// 常量
pub mod constants {
    /// 单节点镜像拉取超时（秒）
    pub const PULL_TIMEOUT_SECS: u64 = 300;

    /// 单服务部署的健康检查超时（秒）
    pub const HEALTH_TIMEOUT_SECS: u64 = 60;

    /// 健康检查轮询间隔（秒）
    pub const HEALTH_POLL_INTERVAL_SECS: u64 = 3;

    /// 健康检查失败详情最多保留条数
    pub const MAX_FAILED_TASK_DETAILS: usize = 3;

    /// 令牌未返回过期时间时的默认有效期（小时）
    pub const DEFAULT_CREDENTIAL_LIFETIME_HOURS: i64 = 12;

    /// manifest 文件被并发修改时最多提交几次
    pub const MANIFEST_COMMIT_ATTEMPTS: usize = 3;

    /// 服务白名单缓存时间（秒）
    pub const SERVICE_MAPPING_TTL_SECS: u64 = 30;

    /// 部署历史最大保存数量
    pub const MAX_TASK_HISTORY: usize = 100;

    /// 最大活跃部署数
    pub const MAX_ACTIVE_TASKS: usize = 50;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
