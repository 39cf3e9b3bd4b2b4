//! Rollout Agent - 集群滚动部署代理
//!
//! 把镜像预拉取到各节点、更新集群服务、检查健康、回写 manifest 并跟踪流水线

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EnvConfig;
use crate::state::AppState;

/// 清理过期部署记录和事件通道的间隔
const CLEANUP_INTERVAL_SECS: u64 = 600;

/// 事件通道保留时长（小时）
const EVENT_CHANNEL_MAX_AGE_HOURS: i64 = 2;

/// 命令行覆盖的运行参数
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 覆盖 PORT 环境变量
    pub port_override: Option<u16>,
}

/// 初始化并运行代理，直到 `shutdown` 被取消
pub async fn init_and_run_agent_with_config(
    runtime: RuntimeConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        tracing::info!(port, "Port overridden from command line");
        config.port = port;
    }
    let port = config.port;

    let state = Arc::new(AppState::from_config(config));
    spawn_cleanup(state.clone(), shutdown.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!(
        addr = %addr,
        version = crate::config::env::constants::VERSION,
        "Rollout agent listening"
    );

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server error")?;

    tracing::info!("Rollout agent stopped");
    Ok(())
}

/// 定期清理部署历史和事件通道
fn spawn_cleanup(state: Arc<AppState>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        // 第一次 tick 立即返回
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    state.task_store.cleanup_stale().await;
                    state.event_hub.cleanup_expired(EVENT_CHANNEL_MAX_AGE_HOURS).await;
                    let active = state.task_store.active_count().await;
                    let channels = state.event_hub.count().await;
                    tracing::debug!(active, channels, "Cleanup finished");
                }
            }
        }
    })
}
