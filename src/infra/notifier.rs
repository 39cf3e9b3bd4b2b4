//! 流水线事件通知
//!
//! 定义 `PipelineEventSink`，并提供回调 webhook 实现（带重试）

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::domain::pipeline::PipelineEvent;

/// 流水线事件接收方
///
/// 监控任务通过它把进度推送给调用方，而不是通过返回值
#[async_trait]
pub trait PipelineEventSink: Send + Sync {
    async fn emit(&self, event: PipelineEvent);
}

/// 回调通知客户端
///
/// 把事件 POST 到配置的回调 URL
#[derive(Clone)]
pub struct CallbackNotifier {
    client: Client,
    callback_url: Option<String>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl CallbackNotifier {
    /// 创建新的通知客户端
    ///
    /// # Arguments
    /// * `callback_url` - 回调 URL（可选，未配置时所有通知静默跳过）
    pub fn new(callback_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            callback_url,
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }

    /// 发送事件（带重试）
    pub async fn notify(&self, event: &PipelineEvent) -> Result<(), NotifyError> {
        let url = match &self.callback_url {
            Some(url) => url,
            None => return Ok(()),
        };

        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match self.client.post(url).json(event).send().await {
                Ok(resp) => {
                    if resp.status().is_success() {
                        info!(
                            deployment_id = %event.deployment_id,
                            status = %event.status.as_str(),
                            attempt = attempt,
                            "Notified callback"
                        );
                        return Ok(());
                    }
                    warn!(
                        deployment_id = %event.deployment_id,
                        status = %resp.status(),
                        attempt = attempt,
                        "Callback returned non-success status"
                    );
                }
                Err(e) => {
                    warn!(
                        deployment_id = %event.deployment_id,
                        error = %e,
                        attempt = attempt,
                        "Failed to notify callback, will retry"
                    );
                    last_error = Some(e);
                }
            }

            // 重试前等待
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        error!(
            deployment_id = %event.deployment_id,
            attempts = self.max_attempts,
            "Failed to notify callback after all attempts"
        );

        match last_error {
            Some(e) => Err(NotifyError::Network(e)),
            None => Err(NotifyError::NonSuccessStatus),
        }
    }
}

#[async_trait]
impl PipelineEventSink for CallbackNotifier {
    /// 在后台投递，重试不占用监控的轮询周期
    async fn emit(&self, event: PipelineEvent) {
        if self.callback_url.is_none() {
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            // 失败已经记录日志
            let _ = notifier.notify(&event).await;
        });
    }
}

/// 通知错误类型
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// 网络错误
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),
    /// 服务端返回非成功状态码
    #[error("Server returned non-success status")]
    NonSuccessStatus,
}

/// 同时投递给多个接收方
pub struct FanoutSink {
    sinks: Vec<Arc<dyn PipelineEventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn PipelineEventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl PipelineEventSink for FanoutSink {
    async fn emit(&self, event: PipelineEvent) {
        join_all(self.sinks.iter().map(|sink| sink.emit(event.clone()))).await;
    }
}
