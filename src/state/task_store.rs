//! 部署记录存储
//!
//! 管理进行中的部署和历史记录，自动清理过期记录

use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::env::constants::{MAX_ACTIVE_TASKS, MAX_TASK_HISTORY};
use crate::domain::deploy::{DeployTask, DeploymentOutcome};

/// 部署无法登记的原因
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("service '{service}' is already being deployed by {deployment_id}")]
    ServiceBusy { service: String, deployment_id: String },

    #[error("too many deployments in progress")]
    AtCapacity,
}

/// 部署记录存储
///
/// 进行中的部署按 ID 索引，完成后移入有界历史记录
pub struct TaskStore {
    /// 进行中的部署
    tasks: RwLock<HashMap<String, DeployTask>>,
    /// 历史记录（最新在前）
    history: RwLock<VecDeque<DeployTask>>,
    /// 最大进行中部署数
    max_active: usize,
    /// 最大历史记录数
    max_history: usize,
    /// 记录保留时间
    retention: Duration,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::with_config(MAX_ACTIVE_TASKS, MAX_TASK_HISTORY, 24)
    }

    /// 使用自定义配置创建
    pub fn with_config(max_active: usize, max_history: usize, retention_hours: i64) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_active,
            max_history,
            retention: Duration::hours(retention_hours),
        }
    }

    /// 登记新部署
    ///
    /// 检查和写入在同一把写锁内完成：涉及的服务已有进行中的部署，或达到上限时拒绝
    pub async fn create(&self, task: DeployTask) -> Result<String, AdmitError> {
        let mut tasks = self.tasks.write().await;

        for service in &task.services {
            if let Some(running) = tasks
                .values()
                .find(|t| !t.status.is_terminal() && t.involves(service))
            {
                return Err(AdmitError::ServiceBusy {
                    service: service.clone(),
                    deployment_id: running.id.clone(),
                });
            }
        }
        if tasks.len() >= self.max_active {
            return Err(AdmitError::AtCapacity);
        }

        let task_id = task.id.clone();
        tasks.insert(task_id.clone(), task);
        Ok(task_id)
    }

    /// 获取进行中的部署
    pub async fn get(&self, task_id: &str) -> Option<DeployTask> {
        let tasks = self.tasks.read().await;
        tasks.get(task_id).cloned()
    }

    /// 获取部署（先查进行中，再查历史记录）
    pub async fn get_any(&self, task_id: &str) -> Option<DeployTask> {
        if let Some(task) = self.get(task_id).await {
            return Some(task);
        }
        let history = self.history.read().await;
        history.iter().find(|t| t.id == task_id).cloned()
    }

    /// 所有进行中的部署
    pub async fn get_all(&self) -> Vec<DeployTask> {
        let tasks = self.tasks.read().await;
        tasks.values().cloned().collect()
    }

    /// 写入结果并移到历史记录，返回完成后的记录
    pub async fn finish(&self, task_id: &str, outcomes: Vec<DeploymentOutcome>) -> Option<DeployTask> {
        let task = {
            let mut tasks = self.tasks.write().await;
            tasks.remove(task_id).map(|mut task| {
                task.complete(outcomes);
                task
            })
        }?;

        self.add_to_history(task.clone()).await;
        Some(task)
    }

    /// 添加到历史记录
    pub async fn add_to_history(&self, task: DeployTask) {
        let mut history = self.history.write().await;
        history.push_front(task);

        while history.len() > self.max_history {
            history.pop_back();
        }
    }

    /// 查询历史记录
    ///
    /// `service` 匹配部署涉及的任意逻辑服务，`status` 为状态字符串
    pub async fn get_history(&self, limit: usize, service: Option<&str>, status: Option<&str>) -> Vec<DeployTask> {
        let history = self.history.read().await;

        history
            .iter()
            .filter(|task| {
                let service_match = service.map_or(true, |s| task.involves(s));
                let status_match = status.map_or(true, |s| task.status.as_str() == s);
                service_match && status_match
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn history_count(&self) -> usize {
        let history = self.history.read().await;
        history.len()
    }

    /// 清理过期记录
    ///
    /// 移除超过保留时间的已完成部署
    pub async fn cleanup_stale(&self) {
        let cutoff = Utc::now() - self.retention;

        {
            let mut tasks = self.tasks.write().await;
            tasks.retain(|_, task| !task.status.is_terminal() || task.finished_at.map_or(true, |t| t > cutoff));
        }

        {
            let mut history = self.history.write().await;
            history.retain(|task| task.finished_at.map_or(true, |t| t > cutoff));
        }
    }

    pub async fn active_count(&self) -> usize {
        let tasks = self.tasks.read().await;
        tasks.len()
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
