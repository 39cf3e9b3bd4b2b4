//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 部署任务状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Running,
    Success,
    /// 部分服务失败，或镜像已上线但 manifest 记录失败
    Partial,
    Failed,
}

impl DeployStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Running => "running",
            DeployStatus::Success => "success",
            DeployStatus::Partial => "partial",
            DeployStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeployStatus::Running)
    }

    /// 根据一组部署结果汇总状态
    pub fn summarize(outcomes: &[DeploymentOutcome]) -> Self {
        if outcomes.is_empty() {
            return DeployStatus::Failed;
        }
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let clean = outcomes
            .iter()
            .filter(|o| o.success && o.manifest_error.is_none())
            .count();
        if clean == outcomes.len() {
            DeployStatus::Success
        } else if succeeded == 0 {
            DeployStatus::Failed
        } else {
            DeployStatus::Partial
        }
    }
}

/// 单节点拉取状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    Success,
    Failed,
}

/// 单节点镜像拉取结果，创建后不再修改
#[derive(Clone, Debug, Serialize)]
pub struct ImagePullOutcome {
    /// 节点 hostname
    pub node: String,
    pub status: PullStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImagePullOutcome {
    pub fn success(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            status: PullStatus::Success,
            digest: None,
            image_id: None,
            error: None,
        }
    }

    pub fn failed(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            status: PullStatus::Failed,
            digest: None,
            image_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PullStatus::Success
    }
}

/// 一次镜像同步的汇总
#[derive(Clone, Debug, Serialize)]
pub struct SyncReport {
    pub image: String,
    pub outcomes: Vec<ImagePullOutcome>,
}

impl SyncReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// 至少一个节点成功即可继续部署
    pub fn is_usable(&self) -> bool {
        self.succeeded() > 0
    }

    pub fn all_succeeded(&self) -> bool {
        self.total() > 0 && self.succeeded() == self.total()
    }

    /// e.g. "2/3 nodes"
    pub fn summary(&self) -> String {
        format!("{}/{} nodes", self.succeeded(), self.total())
    }
}

/// 健康检查终态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Failed,
    Timeout,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Failed => "failed",
            HealthState::Timeout => "timeout",
        }
    }
}

/// 失败任务详情
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FailedTask {
    pub node: String,
    pub error: String,
    pub state: String,
}

/// 健康检查结果
#[derive(Clone, Debug, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub running_tasks: u64,
    pub desired_replicas: u64,
    pub failed_tasks: Vec<FailedTask>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    pub fn describe(&self) -> String {
        match self.state {
            HealthState::Healthy => format!(
                "healthy ({}/{} running)",
                self.running_tasks, self.desired_replicas
            ),
            HealthState::Timeout => format!(
                "health check timed out ({}/{} running)",
                self.running_tasks, self.desired_replicas
            ),
            HealthState::Failed => {
                let details: Vec<String> = self
                    .failed_tasks
                    .iter()
                    .map(|t| format!("{} [{}]: {}", t.node, t.state, t.error))
                    .collect();
                format!(
                    "tasks failing ({}/{} running): {}",
                    self.running_tasks,
                    self.desired_replicas,
                    details.join("; ")
                )
            }
        }
    }
}

/// manifest 提交信息
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManifestCommit {
    pub commit_id: String,
    pub branch: String,
    pub file_path: String,
}

/// 单个服务的部署结果，返回给调用方后不再修改
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentOutcome {
    pub service_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub pull_outcomes: Vec<ImagePullOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_commit: Option<ManifestCommit>,
    /// manifest 记录失败（镜像已经上线，属于部分成功）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_error: Option<String>,
    pub message: String,
}

impl DeploymentOutcome {
    /// 在服务变更之前就失败的结果
    pub fn failed(service_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            success: false,
            image: None,
            pull_outcomes: Vec::new(),
            health: None,
            manifest_commit: None,
            manifest_error: None,
            message: message.into(),
        }
    }
}

/// 部署任务信息
#[derive(Clone, Debug, Serialize)]
pub struct DeployTask {
    pub id: String,
    /// 本次部署涉及的逻辑服务名
    pub services: Vec<String>,
    pub status: DeployStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcomes: Vec<DeploymentOutcome>,
}

impl DeployTask {
    /// 创建新任务
    pub fn new(id: String, services: Vec<String>) -> Self {
        Self {
            id,
            services,
            status: DeployStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
        }
    }

    /// 设置任务完成
    pub fn complete(&mut self, outcomes: Vec<DeploymentOutcome>) {
        self.status = DeployStatus::summarize(&outcomes);
        self.finished_at = Some(Utc::now());
        self.outcomes = outcomes;
    }

    pub fn involves(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(success: bool, manifest_error: Option<&str>) -> DeploymentOutcome {
        DeploymentOutcome {
            manifest_error: manifest_error.map(String::from),
            success,
            ..DeploymentOutcome::failed("svc", "")
        }
    }

    #[test]
    fn test_deploy_status_is_terminal() {
        assert!(!DeployStatus::Running.is_terminal());
        assert!(DeployStatus::Success.is_terminal());
        assert!(DeployStatus::Partial.is_terminal());
        assert!(DeployStatus::Failed.is_terminal());
    }

    #[test]
    fn test_summarize_outcomes() {
        assert_eq!(DeployStatus::summarize(&[]), DeployStatus::Failed);
        assert_eq!(
            DeployStatus::summarize(&[outcome(true, None), outcome(true, None)]),
            DeployStatus::Success
        );
        assert_eq!(
            DeployStatus::summarize(&[outcome(true, Some("missing service"))]),
            DeployStatus::Partial
        );
        assert_eq!(
            DeployStatus::summarize(&[outcome(true, None), outcome(false, None)]),
            DeployStatus::Partial
        );
        assert_eq!(
            DeployStatus::summarize(&[outcome(false, None)]),
            DeployStatus::Failed
        );
    }

    #[test]
    fn test_sync_report_usability() {
        let report = SyncReport {
            image: "api:1.3.0".to_string(),
            outcomes: vec![
                ImagePullOutcome::success("node-1"),
                ImagePullOutcome::failed("node-2", "timeout"),
            ],
        };
        assert!(report.is_usable());
        assert!(!report.all_succeeded());
        assert_eq!(report.summary(), "1/2 nodes");

        let empty = SyncReport {
            image: "api:1.3.0".to_string(),
            outcomes: vec![ImagePullOutcome::failed("node-1", "denied")],
        };
        assert!(!empty.is_usable());
    }

    #[test]
    fn test_task_complete_sets_status() {
        let mut task = DeployTask::new("d-1".to_string(), vec!["api".to_string()]);
        assert!(task.involves("api"));
        task.complete(vec![outcome(true, None)]);
        assert_eq!(task.status, DeployStatus::Success);
        assert!(task.finished_at.is_some());
    }
}
