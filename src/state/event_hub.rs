//! 部署事件通道
//!
//! 每个部署一个广播通道，SSE 订阅者从这里接收部署结果和流水线事件

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::domain::deploy::{DeployStatus, DeploymentOutcome};
use crate::domain::pipeline::PipelineEvent;
use crate::infra::notifier::PipelineEventSink;

/// 通道容量
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// 推送给订阅者的事件
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEvent {
    /// 集群与 manifest 阶段结束
    DeployFinished {
        status: DeployStatus,
        outcomes: Vec<DeploymentOutcome>,
    },
    Pipeline(PipelineEvent),
}

impl DeployEvent {
    /// SSE 事件名
    pub fn name(&self) -> &'static str {
        match self {
            DeployEvent::DeployFinished { .. } => "deploy",
            DeployEvent::Pipeline(_) => "pipeline",
        }
    }
}

struct EventChannel {
    sender: broadcast::Sender<DeployEvent>,
    created_at: DateTime<Utc>,
    /// 部署结果已发出
    finished: bool,
}

/// 事件中心
pub struct EventHub {
    channels: RwLock<HashMap<String, EventChannel>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 创建通道，已存在时返回现有发送者
    pub async fn create(&self, deployment_id: &str) -> broadcast::Sender<DeployEvent> {
        let mut channels = self.channels.write().await;

        if let Some(channel) = channels.get(deployment_id) {
            return channel.sender.clone();
        }

        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        channels.insert(
            deployment_id.to_string(),
            EventChannel {
                sender: sender.clone(),
                created_at: Utc::now(),
                finished: false,
            },
        );
        sender
    }

    pub async fn subscribe(&self, deployment_id: &str) -> Option<broadcast::Receiver<DeployEvent>> {
        let channels = self.channels.read().await;
        channels.get(deployment_id).map(|c| c.sender.subscribe())
    }

    /// 发布事件，没有订阅者时直接丢弃
    pub async fn publish(&self, deployment_id: &str, event: DeployEvent) {
        let mut channels = self.channels.write().await;
        let Some(channel) = channels.get_mut(deployment_id) else {
            debug!(deployment_id = %deployment_id, "No event channel for deployment");
            return;
        };
        if matches!(event, DeployEvent::DeployFinished { .. }) {
            channel.finished = true;
        }
        let _ = channel.sender.send(event);
    }

    pub async fn is_finished(&self, deployment_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.get(deployment_id).map_or(true, |c| c.finished)
    }

    pub async fn exists(&self, deployment_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.contains_key(deployment_id)
    }

    /// 移除过期通道
    ///
    /// 创建超过 `max_age_hours` 且部署已结束、没有订阅者的通道。
    /// 部署结束后流水线事件还会继续到达，所以不能一结束就删除。
    pub async fn cleanup_expired(&self, max_age_hours: i64) {
        let now = Utc::now();
        let mut channels = self.channels.write().await;

        channels.retain(|_, channel| {
            if (now - channel.created_at).num_hours() < max_age_hours {
                return true;
            }
            !channel.finished || channel.sender.receiver_count() > 0
        });
    }

    pub async fn count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineEventSink for EventHub {
    async fn emit(&self, event: PipelineEvent) {
        let deployment_id = event.deployment_id.clone();
        self.publish(&deployment_id, DeployEvent::Pipeline(event)).await;
    }
}
