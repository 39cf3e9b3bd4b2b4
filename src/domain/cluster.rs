//! 集群相关领域模型
//!
//! 节点、服务规格、任务以及镜像引用

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 节点角色
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Manager,
    Worker,
}

/// 节点就绪状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Ready,
    Down,
    Disconnected,
    Unknown,
}

impl NodeState {
    /// 从集群 API 返回的字符串解析
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ready" => NodeState::Ready,
            "down" => NodeState::Down,
            "disconnected" => NodeState::Disconnected,
            _ => NodeState::Unknown,
        }
    }
}

/// 集群节点快照
///
/// 每次操作重新获取，不跨调用缓存
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub hostname: String,
    pub role: NodeRole,
    pub state: NodeState,
}

impl ClusterNode {
    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }
}

/// 服务规格
#[derive(Clone, Debug, Serialize)]
pub struct ServiceSpec {
    pub id: String,
    pub name: String,
    /// 乐观并发版本号，更新时必须回传
    pub version_index: u64,
    /// 当前镜像 (registry/repo:tag[@digest])
    pub image: String,
    pub desired_replicas: u64,
    /// 强制更新计数器
    pub force_update: u64,
    /// 集群 API 返回的原始 Spec，更新时整体回写
    #[serde(skip)]
    pub raw_spec: serde_json::Value,
}

/// 任务状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Orphaned,
    Remove,
}

impl TaskState {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "new" => TaskState::New,
            "pending" => TaskState::Pending,
            "assigned" => TaskState::Assigned,
            "accepted" => TaskState::Accepted,
            "preparing" => TaskState::Preparing,
            "ready" | "starting" => TaskState::Starting,
            "running" => TaskState::Running,
            "complete" => TaskState::Complete,
            "failed" => TaskState::Failed,
            "rejected" => TaskState::Rejected,
            "orphaned" => TaskState::Orphaned,
            "remove" => TaskState::Remove,
            _ => TaskState::Shutdown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Accepted => "accepted",
            TaskState::Preparing => "preparing",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Shutdown => "shutdown",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Orphaned => "orphaned",
            TaskState::Remove => "remove",
        }
    }

    /// 任务处于启动过程中（尚未 running）
    pub fn is_starting(&self) -> bool {
        matches!(
            self,
            TaskState::New
                | TaskState::Pending
                | TaskState::Assigned
                | TaskState::Accepted
                | TaskState::Preparing
                | TaskState::Starting
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Rejected)
    }
}

/// 服务任务（一个副本实例）
#[derive(Clone, Debug, Serialize)]
pub struct ClusterTask {
    pub id: String,
    pub node_id: String,
    pub state: TaskState,
    pub desired_state: TaskState,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// 节点本地镜像
#[derive(Clone, Debug, Deserialize)]
pub struct NodeImage {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "RepoDigests", default)]
    pub repo_digests: Option<Vec<String>>,
}

/// 镜像引用 `registry/repository:tag@digest`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// 解析镜像字符串
    ///
    /// 第一段包含 `.` 或 `:`，或等于 `localhost` 时视为 registry 主机
    pub fn parse(image: &str) -> Self {
        let image = image.trim();
        let (rest, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (image, None),
        };

        // tag 分隔符只能出现在最后一个 '/' 之后，避免把 registry 端口当作 tag
        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder.to_string())
            }
            _ => (None, name.to_string()),
        };

        Self {
            registry,
            repository,
            tag: tag.filter(|t| !t.is_empty()),
            digest,
        }
    }

    /// 不含 tag 与 digest 的仓库名（含 registry）
    pub fn name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// 替换 tag，同时丢弃 digest
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    pub fn without_digest(&self) -> Self {
        Self {
            digest: None,
            ..self.clone()
        }
    }

    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
