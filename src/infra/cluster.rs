//! 集群管理 HTTP Client
//!
//! 通过 Docker Engine / Swarm API（可经由管理代理转发）完成：
//! - 节点列表
//! - 服务查询与更新（乐观并发）
//! - 在指定节点上拉取镜像、列出本地镜像
//! - 服务任务列表

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::env::constants::PULL_TIMEOUT_SECS;
use crate::domain::cluster::{
    ClusterNode, ClusterTask, ImageRef, NodeImage, NodeRole, NodeState, ServiceSpec, TaskState,
};
use crate::domain::registry::RegistryCredential;

/// 集群 API 错误
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("cluster API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("service '{0}' not found")]
    NotFound(String),

    /// 版本号已过期，其他写入者先更新了服务
    #[error("update of '{service}' rejected: version {version} is stale")]
    Conflict { service: String, version: u64 },

    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// 集群管理 API
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// 列出集群节点
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError>;

    /// 按名称获取服务规格
    async fn get_service(&self, name: &str) -> Result<ServiceSpec, ClusterError>;

    /// 在指定节点拉取镜像
    async fn pull_image(
        &self,
        node: &ClusterNode,
        image: &ImageRef,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), ClusterError>;

    /// 列出节点本地镜像
    async fn list_node_images(&self, node: &ClusterNode) -> Result<Vec<NodeImage>, ClusterError>;

    /// 提交服务更新，`expected_version` 必须等于服务当前版本
    async fn update_service(
        &self,
        spec: &ServiceSpec,
        expected_version: u64,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), ClusterError>;

    /// 列出服务的任务
    async fn list_tasks(&self, service_id: &str) -> Result<Vec<ClusterTask>, ClusterError>;
}

/// Swarm 集群客户端
#[derive(Clone)]
pub struct SwarmClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    /// 管理代理用来把请求路由到具体节点的 header
    node_target_header: String,
}

impl SwarmClient {
    /// 创建新的集群客户端
    pub fn new(base_url: impl Into<String>, api_token: Option<String>, node_target_header: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
            node_target_header: node_target_header.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => builder.header("x-api-key", token),
            None => builder,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.post(self.url(path)))
    }

    fn on_node(&self, builder: RequestBuilder, node: &ClusterNode) -> RequestBuilder {
        builder.header(self.node_target_header.as_str(), node.hostname.as_str())
    }

    async fn fetch_services(&self, name: &str) -> Result<Vec<SwarmService>, ClusterError> {
        let filters = serde_json::json!({ "name": [name] }).to_string();
        let resp = self
            .get("/services")
            .query(&[("filters", filters)])
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}

#[async_trait]
impl ClusterApi for SwarmClient {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        let resp = self.get("/nodes").send().await?;
        let nodes: Vec<SwarmNode> = check(resp).await?.json().await?;
        Ok(nodes.into_iter().map(SwarmNode::into_node).collect())
    }

    async fn get_service(&self, name: &str) -> Result<ServiceSpec, ClusterError> {
        // name 过滤是前缀匹配，这里再做一次精确匹配
        let service = self
            .fetch_services(name)
            .await?
            .into_iter()
            .find(|s| s.spec.get("Name").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;

        let global = service.spec.pointer("/Mode/Global").is_some();
        let mut spec = service.into_spec()?;
        if global {
            spec.desired_replicas = self
                .list_nodes()
                .await?
                .iter()
                .filter(|n| n.is_ready())
                .count() as u64;
        }
        Ok(spec)
    }

    async fn pull_image(
        &self,
        node: &ClusterNode,
        image: &ImageRef,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), ClusterError> {
        let mut builder = self
            .on_node(self.post("/images/create"), node)
            .query(&[("fromImage", image.name()), ("tag", image.tag_or_latest().to_string())])
            .timeout(Duration::from_secs(PULL_TIMEOUT_SECS));
        if let Some(credential) = credential {
            builder = builder.header("X-Registry-Auth", credential.registry_auth_header());
        }

        let resp = check(builder.send().await?).await?;

        // 拉取进度以 JSON 行流返回，错误可能出现在 200 响应体中
        let body = resp.text().await?;
        if let Some(message) = stream_error(&body) {
            return Err(ClusterError::Pull(message));
        }

        debug!(node = %node.hostname, image = %image, "Image pulled");
        Ok(())
    }

    async fn list_node_images(&self, node: &ClusterNode) -> Result<Vec<NodeImage>, ClusterError> {
        let resp = self.on_node(self.get("/images/json"), node).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn update_service(
        &self,
        spec: &ServiceSpec,
        expected_version: u64,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), ClusterError> {
        let mut body = spec.raw_spec.clone();
        set_path(&mut body, &["TaskTemplate", "ContainerSpec", "Image"], Value::from(spec.image.clone()))?;
        set_path(&mut body, &["TaskTemplate", "ForceUpdate"], Value::from(spec.force_update))?;

        let mut builder = self
            .post(&format!("/services/{}/update", spec.id))
            .query(&[("version", expected_version)])
            .json(&body);
        if let Some(credential) = credential {
            builder = builder.header("X-Registry-Auth", credential.registry_auth_header());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            info!(service = %spec.name, image = %spec.image, version = expected_version, "Service update accepted");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT || body.contains("out of sequence") {
            return Err(ClusterError::Conflict {
                service: spec.name.clone(),
                version: expected_version,
            });
        }
        Err(ClusterError::Status { status, body })
    }

    async fn list_tasks(&self, service_id: &str) -> Result<Vec<ClusterTask>, ClusterError> {
        let filters = serde_json::json!({ "service": [service_id] }).to_string();
        let resp = self.get("/tasks").query(&[("filters", filters)]).send().await?;
        let tasks: Vec<SwarmTask> = check(resp).await?.json().await?;
        Ok(tasks.into_iter().map(SwarmTask::into_task).collect())
    }
}

/// 非 2xx 响应转换为错误
async fn check(resp: Response) -> Result<Response, ClusterError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClusterError::Status { status, body })
}

/// 从拉取进度流中提取错误信息
fn stream_error(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find_map(|value| {
            value
                .get("error")
                .and_then(Value::as_str)
                .or_else(|| value.pointer("/errorDetail/message").and_then(Value::as_str))
                .map(String::from)
        })
}

/// 按路径写入 JSON 字段，中间对象不存在时创建
fn set_path(root: &mut Value, path: &[&str], value: Value) -> Result<(), ClusterError> {
    let mut current = root;
    for (i, key) in path.iter().enumerate() {
        let map = current
            .as_object_mut()
            .ok_or_else(|| ClusterError::Malformed(format!("spec field '{}' is not an object", key)))?;
        if i == path.len() - 1 {
            map.insert((*key).to_string(), value);
            return Ok(());
        }
        current = map
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmNode {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    description: Value,
    #[serde(default)]
    spec: Value,
    #[serde(default)]
    status: Value,
}

impl SwarmNode {
    fn into_node(self) -> ClusterNode {
        let hostname = self
            .description
            .get("Hostname")
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
            .to_string();
        let role = match self.spec.get("Role").and_then(Value::as_str) {
            Some("manager") => NodeRole::Manager,
            _ => NodeRole::Worker,
        };
        let state = self
            .status
            .get("State")
            .and_then(Value::as_str)
            .map(NodeState::from_str)
            .unwrap_or(NodeState::Unknown);

        ClusterNode {
            id: self.id,
            hostname,
            role,
            state,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmService {
    #[serde(rename = "ID")]
    id: String,
    version: SwarmVersion,
    spec: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmVersion {
    index: u64,
}

impl SwarmService {
    fn into_spec(self) -> Result<ServiceSpec, ClusterError> {
        let name = self
            .spec
            .get("Name")
            .and_then(Value::as_str)
            .ok_or_else(|| ClusterError::Malformed(format!("service {} has no name", self.id)))?
            .to_string();
        let image = self
            .spec
            .pointer("/TaskTemplate/ContainerSpec/Image")
            .and_then(Value::as_str)
            .ok_or_else(|| ClusterError::Malformed(format!("service {} has no image", name)))?
            .to_string();
        let desired_replicas = self
            .spec
            .pointer("/Mode/Replicated/Replicas")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        let force_update = self
            .spec
            .pointer("/TaskTemplate/ForceUpdate")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(ServiceSpec {
            id: self.id,
            name,
            version_index: self.version.index,
            image,
            desired_replicas,
            force_update,
            raw_spec: self.spec,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmTask {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "NodeID", default)]
    node_id: Option<String>,
    status: SwarmTaskStatus,
    #[serde(default)]
    desired_state: String,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmTaskStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl SwarmTask {
    fn into_task(self) -> ClusterTask {
        let updated_at = self
            .status
            .timestamp
            .or(self.updated_at)
            .unwrap_or_default();

        ClusterTask {
            id: self.id,
            node_id: self.node_id.unwrap_or_default(),
            state: TaskState::from_str(&self.status.state),
            desired_state: TaskState::from_str(&self.desired_state),
            error: self.status.err,
            updated_at,
        }
    }
}
