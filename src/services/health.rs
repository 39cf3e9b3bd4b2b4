//! 服务健康检查
//!
//! 轮询服务任务直到收敛、失败或超时，三种结果都是终态

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::env::constants::MAX_FAILED_TASK_DETAILS;
use crate::config::HealthSettings;
use crate::domain::cluster::{ClusterTask, ServiceSpec, TaskState};
use crate::domain::deploy::{FailedTask, HealthState, HealthStatus};
use crate::infra::cluster::ClusterApi;

pub struct HealthVerifier {
    cluster: Arc<dyn ClusterApi>,
    settings: HealthSettings,
}

impl HealthVerifier {
    pub fn new(cluster: Arc<dyn ClusterApi>, settings: HealthSettings) -> Self {
        Self { cluster, settings }
    }

    pub fn default_timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// 轮询直到得出结论
    ///
    /// 第一次检查前先等一个间隔，给调度器时间替换旧任务
    pub async fn check_health(&self, service: &ServiceSpec, timeout: Duration) -> HealthStatus {
        let started_at = Utc::now();
        let deadline = Instant::now() + timeout;
        let hostnames = self.node_hostnames().await;
        let mut running = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;

            let tasks = match self.cluster.list_tasks(&service.id).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Failed to list tasks, will retry");
                    continue;
                }
            };

            let observed = evaluate(&tasks, service.desired_replicas, started_at, &hostnames);
            running = observed.running_tasks;
            debug!(
                service = %service.name,
                running = observed.running_tasks,
                desired = service.desired_replicas,
                "Health poll"
            );
            if let Some(status) = observed.verdict {
                info!(service = %service.name, state = status.state.as_str(), "Health check finished");
                return status;
            }
        }

        warn!(service = %service.name, running = running, desired = service.desired_replicas, "Health check timed out");
        HealthStatus {
            state: HealthState::Timeout,
            running_tasks: running,
            desired_replicas: service.desired_replicas,
            failed_tasks: Vec::new(),
        }
    }

    /// 节点 ID 到 hostname 的映射，获取失败时直接显示节点 ID
    async fn node_hostnames(&self) -> HashMap<String, String> {
        match self.cluster.list_nodes().await {
            Ok(nodes) => nodes.into_iter().map(|n| (n.id, n.hostname)).collect(),
            Err(e) => {
                debug!(error = %e, "Cannot resolve node hostnames");
                HashMap::new()
            }
        }
    }
}

struct Observation {
    running_tasks: u64,
    verdict: Option<HealthStatus>,
}

/// 单次轮询的判定
///
/// 只统计期望状态为 running 的任务；失败任务必须晚于最近一个运行中任务
/// （没有运行中任务时晚于检查开始时间）才算数，避免把上一次部署残留的失败算进来
fn evaluate(
    tasks: &[ClusterTask],
    desired: u64,
    started_at: DateTime<Utc>,
    hostnames: &HashMap<String, String>,
) -> Observation {
    let wanted: Vec<&ClusterTask> = tasks
        .iter()
        .filter(|t| t.desired_state == TaskState::Running)
        .collect();
    let running = wanted.iter().filter(|t| t.state == TaskState::Running).count() as u64;
    let starting = wanted.iter().any(|t| t.state.is_starting());

    if running == desired && !starting {
        return Observation {
            running_tasks: running,
            verdict: Some(HealthStatus {
                state: HealthState::Healthy,
                running_tasks: running,
                desired_replicas: desired,
                failed_tasks: Vec::new(),
            }),
        };
    }

    let last_good = tasks
        .iter()
        .filter(|t| t.state == TaskState::Running)
        .map(|t| t.updated_at)
        .max()
        .unwrap_or(started_at);

    let mut failures: Vec<&ClusterTask> = tasks
        .iter()
        .filter(|t| t.state.is_failure() && t.updated_at > last_good)
        .collect();

    if failures.is_empty() || running >= desired {
        return Observation {
            running_tasks: running,
            verdict: None,
        };
    }

    failures.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    let failed_tasks = failures
        .into_iter()
        .take(MAX_FAILED_TASK_DETAILS)
        .map(|t| FailedTask {
            node: hostnames.get(&t.node_id).cloned().unwrap_or_else(|| t.node_id.clone()),
            error: t.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            state: t.state.as_str().to_string(),
        })
        .collect();

    Observation {
        running_tasks: running,
        verdict: Some(HealthStatus {
            state: HealthState::Failed,
            running_tasks: running,
            desired_replicas: desired,
            failed_tasks,
        }),
    }
}
