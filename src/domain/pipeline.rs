//! CI 流水线相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 流水线状态
///
/// 初始为 `NotStarted`，终态为 success / failed / canceled / skipped
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    NotStarted,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
}

impl PipelineStatus {
    /// 从源码托管平台的状态字符串解析
    pub fn from_api(s: &str) -> Self {
        match s {
            "running" => PipelineStatus::Running,
            "success" => PipelineStatus::Success,
            "failed" => PipelineStatus::Failed,
            "canceled" | "cancelled" => PipelineStatus::Canceled,
            "skipped" => PipelineStatus::Skipped,
            // created / waiting_for_resource / preparing / pending / manual / scheduled
            _ => PipelineStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::NotStarted => "not_started",
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Success => "success",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Canceled => "canceled",
            PipelineStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Success
                | PipelineStatus::Failed
                | PipelineStatus::Canceled
                | PipelineStatus::Skipped
        )
    }
}

/// 源码托管平台返回的流水线
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineInfo {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub web_url: Option<String>,
}

/// 一次轮询观测到的流水线状态
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PipelineObservation {
    pub pipeline_id: u64,
    pub status: PipelineStatus,
    pub url: Option<String>,
}

/// 监控事件类型
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// 状态变化（非终态）
    Progress,
    /// 流水线到达终态
    Completed,
    /// 该提交没有配置 CI
    NoPipeline,
    /// 监控到达时间上限仍未结束
    TimedOut,
}

impl PipelineEventKind {
    pub fn is_final(&self) -> bool {
        !matches!(self, PipelineEventKind::Progress)
    }
}

/// 流水线监控事件
#[derive(Clone, Debug, Serialize)]
pub struct PipelineEvent {
    pub deployment_id: String,
    pub kind: PipelineEventKind,
    pub repo_id: String,
    pub commit_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<u64>,
    pub status: PipelineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_api() {
        assert_eq!(PipelineStatus::from_api("created"), PipelineStatus::Pending);
        assert_eq!(PipelineStatus::from_api("running"), PipelineStatus::Running);
        assert_eq!(PipelineStatus::from_api("cancelled"), PipelineStatus::Canceled);
        assert!(PipelineStatus::from_api("skipped").is_terminal());
        assert!(!PipelineStatus::NotStarted.is_terminal());
    }

    #[test]
    fn test_event_kind_final() {
        assert!(!PipelineEventKind::Progress.is_final());
        assert!(PipelineEventKind::Completed.is_final());
        assert!(PipelineEventKind::TimedOut.is_final());
    }
}
