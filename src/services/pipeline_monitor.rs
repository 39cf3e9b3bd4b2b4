//! 流水线监控
//!
//! manifest 提交后在后台轮询该提交的 CI 流水线，通过 `PipelineEventSink` 推送进度。
//! 每个部署一个独立任务，状态只保存在任务内部。

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MonitorSettings;
use crate::domain::pipeline::{PipelineEvent, PipelineEventKind, PipelineObservation, PipelineStatus};
use crate::infra::notifier::PipelineEventSink;
use crate::infra::source_control::{SourceControlApi, SourceControlError};

/// 流水线状态跟踪
///
/// 决定每次观测是否需要发出事件，保证终态事件只发一次
#[derive(Debug)]
pub struct PipelineTracker {
    last: PipelineStatus,
    finished: bool,
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self {
            last: PipelineStatus::NotStarted,
            finished: false,
        }
    }

    pub fn last_status(&self) -> PipelineStatus {
        self.last
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 记录一次观测，状态变化或到达终态时返回事件类型
    pub fn observe(&mut self, observation: &PipelineObservation) -> Option<PipelineEventKind> {
        if self.finished {
            return None;
        }
        if observation.status.is_terminal() {
            self.last = observation.status;
            self.finished = true;
            return Some(PipelineEventKind::Completed);
        }
        if observation.status != self.last {
            self.last = observation.status;
            return Some(PipelineEventKind::Progress);
        }
        None
    }

    /// 一直没有出现流水线
    pub fn absent(&mut self) -> Option<PipelineEventKind> {
        self.finish_with(PipelineEventKind::NoPipeline)
    }

    /// 到达监控上限
    pub fn timed_out(&mut self) -> Option<PipelineEventKind> {
        self.finish_with(PipelineEventKind::TimedOut)
    }

    fn finish_with(&mut self, kind: PipelineEventKind) -> Option<PipelineEventKind> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(kind)
    }
}

impl Default for PipelineTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次监控的目标
#[derive(Clone, Debug)]
pub struct WatchTarget {
    pub deployment_id: String,
    pub repo_id: String,
    pub commit_sha: String,
}

pub struct PipelineMonitor {
    source_control: Arc<dyn SourceControlApi>,
    sink: Arc<dyn PipelineEventSink>,
    settings: MonitorSettings,
}

impl PipelineMonitor {
    pub fn new(
        source_control: Arc<dyn SourceControlApi>,
        sink: Arc<dyn PipelineEventSink>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            source_control,
            sink,
            settings,
        }
    }

    /// 启动后台监控任务，不随请求结束而取消
    pub fn spawn(self: &Arc<Self>, target: WatchTarget) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.watch(target).await })
    }

    /// 轮询直到终态、确认无流水线或到达时间上限
    pub async fn watch(&self, target: WatchTarget) {
        let started = Instant::now();
        let mut tracker = PipelineTracker::new();
        let mut last_observation: Option<PipelineObservation> = None;

        info!(
            deployment_id = %target.deployment_id,
            repo = %target.repo_id,
            commit = %target.commit_sha,
            "Watching pipeline"
        );
        tokio::time::sleep(self.settings.grace_period).await;

        loop {
            let elapsed = started.elapsed();
            match self.latest(&target).await {
                Ok(Some(observation)) => {
                    if let Some(kind) = tracker.observe(&observation) {
                        self.emit(&target, kind, Some(&observation), tracker.last_status()).await;
                    }
                    last_observation = Some(observation);
                }
                Ok(None) if last_observation.is_none() && elapsed >= self.settings.absent_after => {
                    if let Some(kind) = tracker.absent() {
                        info!(deployment_id = %target.deployment_id, "No pipeline configured for commit");
                        self.emit(&target, kind, None, PipelineStatus::NotStarted).await;
                    }
                }
                Ok(None) => {
                    debug!(deployment_id = %target.deployment_id, "Pipeline not registered yet");
                }
                Err(e) => {
                    warn!(deployment_id = %target.deployment_id, error = %e, "Failed to query pipelines");
                }
            }

            if tracker.is_finished() {
                return;
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.ceiling {
                if let Some(kind) = tracker.timed_out() {
                    warn!(
                        deployment_id = %target.deployment_id,
                        status = tracker.last_status().as_str(),
                        "Pipeline monitor reached its ceiling"
                    );
                    self.emit(&target, kind, last_observation.as_ref(), tracker.last_status())
                        .await;
                }
                return;
            }
            tokio::time::sleep(self.settings.poll_interval.min(self.settings.ceiling - elapsed)).await;
        }
    }

    /// 该提交最新的一条流水线
    async fn latest(&self, target: &WatchTarget) -> Result<Option<PipelineObservation>, SourceControlError> {
        let pipelines = self
            .source_control
            .list_pipelines(&target.repo_id, &target.commit_sha)
            .await?;
        Ok(pipelines.into_iter().max_by_key(|p| p.id).map(|p| PipelineObservation {
            pipeline_id: p.id,
            status: PipelineStatus::from_api(&p.status),
            url: p.web_url,
        }))
    }

    async fn emit(
        &self,
        target: &WatchTarget,
        kind: PipelineEventKind,
        observation: Option<&PipelineObservation>,
        status: PipelineStatus,
    ) {
        debug!(deployment_id = %target.deployment_id, kind = ?kind, status = status.as_str(), "Pipeline event");
        self.sink
            .emit(PipelineEvent {
                deployment_id: target.deployment_id.clone(),
                kind,
                repo_id: target.repo_id.clone(),
                commit_sha: target.commit_sha.clone(),
                pipeline_id: observation.map(|o| o.pipeline_id),
                status,
                url: observation.and_then(|o| o.url.clone()),
                timestamp: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pipeline, FakeSourceControl, RecordingSink};
    use std::time::Duration;

    fn observation(status: PipelineStatus) -> PipelineObservation {
        PipelineObservation {
            pipeline_id: 1,
            status,
            url: None,
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            grace_period: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            ceiling: Duration::from_millis(300),
            absent_after: Duration::from_millis(30),
        }
    }

    fn target() -> WatchTarget {
        WatchTarget {
            deployment_id: "d-1".to_string(),
            repo_id: "ops/deploy".to_string(),
            commit_sha: "abc123".to_string(),
        }
    }

    #[test]
    fn test_tracker_emits_progress_on_change_only() {
        let mut tracker = PipelineTracker::new();
        assert_eq!(
            tracker.observe(&observation(PipelineStatus::Pending)),
            Some(PipelineEventKind::Progress)
        );
        assert_eq!(tracker.observe(&observation(PipelineStatus::Pending)), None);
        assert_eq!(
            tracker.observe(&observation(PipelineStatus::Running)),
            Some(PipelineEventKind::Progress)
        );
    }

    #[test]
    fn test_tracker_single_terminal_event() {
        let mut tracker = PipelineTracker::new();
        assert_eq!(
            tracker.observe(&observation(PipelineStatus::Success)),
            Some(PipelineEventKind::Completed)
        );
        assert_eq!(tracker.observe(&observation(PipelineStatus::Success)), None);
        assert_eq!(tracker.timed_out(), None);
        assert_eq!(tracker.absent(), None);
        assert_eq!(tracker.last_status(), PipelineStatus::Success);
    }

    #[tokio::test]
    async fn test_watch_reports_progress_then_completion() {
        let scm = Arc::new(FakeSourceControl::new().with_pipeline_script(vec![
            vec![],
            vec![pipeline(7, "pending")],
            vec![pipeline(7, "running")],
            vec![pipeline(7, "running")],
            vec![pipeline(7, "success")],
        ]));
        let sink = Arc::new(RecordingSink::default());
        let monitor = PipelineMonitor::new(scm.clone(), sink.clone(), settings());

        monitor.watch(target()).await;

        let kinds: Vec<PipelineEventKind> = sink.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PipelineEventKind::Progress,
                PipelineEventKind::Progress,
                PipelineEventKind::Completed
            ]
        );
        let last = sink.events().pop().unwrap();
        assert_eq!(last.status, PipelineStatus::Success);
        assert_eq!(last.pipeline_id, Some(7));
        assert!(last.url.is_some());
        // 终态后停止轮询
        assert_eq!(scm.pipeline_polls(), 5);
    }

    #[tokio::test]
    async fn test_watch_without_pipeline() {
        let scm = Arc::new(FakeSourceControl::new());
        let sink = Arc::new(RecordingSink::default());
        let monitor = PipelineMonitor::new(scm, sink.clone(), settings());

        monitor.watch(target()).await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PipelineEventKind::NoPipeline);
        assert_eq!(events[0].status, PipelineStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_watch_times_out_once() {
        let scm = Arc::new(FakeSourceControl::new().with_pipeline_script(vec![vec![pipeline(3, "running")]]));
        let sink = Arc::new(RecordingSink::default());
        let monitor = PipelineMonitor::new(
            scm,
            sink.clone(),
            MonitorSettings {
                ceiling: Duration::from_millis(40),
                ..settings()
            },
        );

        monitor.watch(target()).await;

        let kinds: Vec<PipelineEventKind> = sink.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![PipelineEventKind::Progress, PipelineEventKind::TimedOut]);
        assert_eq!(sink.events()[1].status, PipelineStatus::Running);
    }

    #[tokio::test]
    async fn test_spawned_monitor_is_detached() {
        let scm = Arc::new(FakeSourceControl::new().with_pipeline_script(vec![vec![pipeline(1, "failed")]]));
        let sink = Arc::new(RecordingSink::default());
        let monitor = Arc::new(PipelineMonitor::new(scm, sink.clone(), settings()));

        monitor.spawn(target()).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, PipelineStatus::Failed);
    }
}
