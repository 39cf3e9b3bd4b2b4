//! 部署管理 API
//!
//! 包含 /deploy/*, /deployments/* 端点

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::deploy::{DeployTask, DeploymentOutcome};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::deploy::{DeployOptions, ServiceTarget};
use crate::state::{AdmitError, AppState, DeployEvent};

/// 单服务部署请求
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub tag: String,
    #[serde(flatten)]
    pub options: DeployOptions,
}

/// 批量部署请求
#[derive(Debug, Clone, Deserialize)]
pub struct BatchDeployRequest {
    pub services: Vec<ServiceTarget>,
    #[serde(flatten)]
    pub options: DeployOptions,
}

/// 触发部署响应
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub deployment_id: String,
    pub services: Vec<String>,
    pub status: String,
    pub stream_url: String,
}

/// 部署历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 服务名过滤
    pub service: Option<String>,
    /// 状态过滤 (running, success, partial, failed)
    pub status: Option<String>,
}

fn default_limit() -> usize {
    20
}

/// 部署历史响应
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub deployments: Vec<DeployTask>,
    pub total: usize,
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy", post(trigger_batch))
        .route("/deploy/:service", post(trigger_deploy))
        .route("/deployments/recent", get(get_recent_deployments))
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/events", get(stream_events))
}

/// 部署单个服务
///
/// POST /deploy/:service
/// 需要 API Key
async fn trigger_deploy(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<Json<TriggerResponse>> {
    // 提前拒绝未登记的服务，避免创建注定失败的部署
    state.services.resolve(&service).await?;

    let target = ServiceTarget {
        service,
        tag: request.tag,
    };
    start(state, vec![target], request.options).await
}

/// 批量部署
///
/// POST /deploy
/// 需要 API Key
async fn trigger_batch(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchDeployRequest>,
) -> ApiResult<Json<TriggerResponse>> {
    if request.services.is_empty() {
        return Err(ApiError::bad_request("services must not be empty"));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = request.services.iter().find(|t| !seen.insert(t.service.as_str())) {
        return Err(ApiError::bad_request(format!("service '{}' listed more than once", dup.service)));
    }
    start(state, request.services, request.options).await
}

/// 登记部署并在后台执行
async fn start(state: Arc<AppState>, targets: Vec<ServiceTarget>, options: DeployOptions) -> ApiResult<Json<TriggerResponse>> {
    if let Some(target) = targets.iter().find(|t| t.tag.trim().is_empty()) {
        return Err(ApiError::bad_request(format!("tag for '{}' must not be empty", target.service)));
    }

    let deployment_id = uuid::Uuid::new_v4().to_string();
    let services: Vec<String> = targets.iter().map(|t| t.service.clone()).collect();

    state
        .task_store
        .create(DeployTask::new(deployment_id.clone(), services.clone()))
        .await
        .map_err(|e| match e {
            AdmitError::ServiceBusy { .. } => ApiError::conflict(e.to_string()),
            AdmitError::AtCapacity => ApiError::service_unavailable(e.to_string()),
        })?;
    state.event_hub.create(&deployment_id).await;

    info!(deployment_id = %deployment_id, services = ?services, "Deployment accepted");

    let response = TriggerResponse {
        deployment_id: deployment_id.clone(),
        services,
        status: "running".to_string(),
        stream_url: format!("/deployments/{}/events", deployment_id),
    };

    // 在后台执行部署（非阻塞）
    tokio::spawn(async move {
        let outcomes = match targets.as_slice() {
            [target] => vec![state.orchestrator.deploy(&deployment_id, target, &options).await],
            _ => state.orchestrator.deploy_batch(&deployment_id, &targets, &options).await,
        };

        if let Some(task) = state.task_store.finish(&deployment_id, outcomes).await {
            info!(deployment_id = %deployment_id, status = task.status.as_str(), "Deployment recorded");
            state
                .event_hub
                .publish(
                    &deployment_id,
                    DeployEvent::DeployFinished {
                        status: task.status,
                        outcomes: task.outcomes,
                    },
                )
                .await;
        }
    });

    Ok(Json(response))
}

/// 获取部署记录
///
/// GET /deployments/:id
/// 无需认证
async fn get_deployment(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<DeployTask>> {
    let task = state
        .task_store
        .get_any(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", id)))?;
    Ok(Json(task))
}

/// 最近的部署（进行中的在前）
///
/// GET /deployments/recent
/// 无需认证
async fn get_recent_deployments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let mut deployments: Vec<DeployTask> = state
        .task_store
        .get_all()
        .await
        .into_iter()
        .filter(|task| {
            let service_match = query.service.as_deref().map_or(true, |s| task.involves(s));
            let status_match = query.status.as_deref().map_or(true, |s| task.status.as_str() == s);
            service_match && status_match
        })
        .collect();
    deployments.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let history = state
        .task_store
        .get_history(query.limit, query.service.as_deref(), query.status.as_deref())
        .await;
    deployments.extend(history);
    deployments.truncate(query.limit);

    let total = deployments.len();
    Json(HistoryResponse { deployments, total })
}

/// 部署事件流
///
/// GET /deployments/:id/events
/// 无需认证
///
/// 先推送部署结果，再推送每个 manifest 提交的流水线事件，全部到达终态后关闭
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let rx = state
        .event_hub
        .subscribe(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}' not found or expired", id)))?;

    // 订阅前部署已经结束时，先补发一次结果
    let finished = state
        .task_store
        .get_any(&id)
        .await
        .filter(|task| task.status.is_terminal());

    let stream = deployment_events(id, rx, finished).map(|event| Ok::<_, Infallible>(sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// 部署结果和流水线事件，全部流水线结束后停止
///
/// 流水线终态可能先于部署结果到达（广播顺序不保证跨发送者），先计数，拿到结果后再扣除
fn deployment_events(
    id: String,
    mut rx: broadcast::Receiver<DeployEvent>,
    finished: Option<DeployTask>,
) -> impl Stream<Item = DeployEvent> {
    async_stream::stream! {
        let mut pending: Option<usize> = None;
        let mut early_finals = 0usize;
        let mut done = false;

        if let Some(task) = finished {
            let count = pending_pipelines(&task.outcomes);
            yield DeployEvent::DeployFinished { status: task.status, outcomes: task.outcomes };
            pending = Some(count);
            done = count == 0;
        }

        while !done {
            match rx.recv().await {
                Ok(event) => {
                    match &event {
                        // 已经补发过结果
                        DeployEvent::DeployFinished { .. } if pending.is_some() => continue,
                        DeployEvent::DeployFinished { outcomes, .. } => {
                            pending = Some(pending_pipelines(outcomes).saturating_sub(early_finals));
                        }
                        DeployEvent::Pipeline(pipeline) if pipeline.kind.is_final() => match pending {
                            Some(n) => pending = Some(n.saturating_sub(1)),
                            None => early_finals += 1,
                        },
                        DeployEvent::Pipeline(_) => {}
                    }
                    yield event;
                    done = pending == Some(0);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(deployment_id = %id, lagged = n, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => done = true,
            }
        }
    }
}

fn sse_event(event: &DeployEvent) -> Event {
    let json = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.name()).data(json)
}

/// 需要等待的流水线数（每个 manifest 提交一个）
fn pending_pipelines(outcomes: &[DeploymentOutcome]) -> usize {
    outcomes
        .iter()
        .filter_map(|o| o.manifest_commit.as_ref())
        .map(|c| c.commit_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, ServiceMapping, ServiceRegistry, ServiceResolver};
    use crate::domain::cluster::TaskState;
    use crate::domain::deploy::{DeployStatus, ManifestCommit};
    use crate::services::deploy::{DeploymentOrchestrator, EngineSettings};
    use crate::state::EventHub;
    use crate::testing::{ready_node, service_spec, task, FakeCluster, FakeSourceControl};
    use std::time::Duration;

    fn app_state() -> Arc<AppState> {
        let cluster = Arc::new(
            FakeCluster::new(vec![ready_node("n1")])
                .with_service(service_spec("api", "team/api:1.0", 1))
                .with_task_script(vec![vec![task("n1", TaskState::Running, TaskState::Running, 5)]]),
        );
        let services: Arc<dyn ServiceResolver> = Arc::new(ServiceRegistry::from_static(vec![ServiceMapping {
            name: "api".to_string(),
            cluster_service: None,
            image_repository: None,
            registry_project_id: None,
            manifest: None,
        }]));
        let event_hub = Arc::new(EventHub::new());
        let mut settings = EngineSettings::default();
        settings.health.poll_interval = Duration::from_millis(5);
        settings.health.timeout = Duration::from_millis(200);
        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            services.clone(),
            cluster,
            None,
            Arc::new(FakeSourceControl::new()),
            event_hub.clone(),
            settings,
        ));
        Arc::new(AppState::new(EnvConfig::from_env(), services, orchestrator, event_hub))
    }

    fn request(tag: &str) -> Json<DeployRequest> {
        Json(DeployRequest {
            tag: tag.to_string(),
            options: DeployOptions::default(),
        })
    }

    async fn wait_finished(state: &AppState, id: &str) -> DeployTask {
        for _ in 0..100 {
            if let Some(task) = state.task_store.get_any(id).await {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment {} did not finish", id);
    }

    #[tokio::test]
    async fn test_deploy_runs_in_background_and_publishes_result() {
        let state = app_state();

        let Json(response) = trigger_deploy(RequireApiKey, State(state.clone()), Path("api".to_string()), request("1.1"))
            .await
            .unwrap();
        assert_eq!(response.status, "running");
        assert_eq!(response.stream_url, format!("/deployments/{}/events", response.deployment_id));

        let mut events = state.event_hub.subscribe(&response.deployment_id).await.unwrap();
        let task = wait_finished(&state, &response.deployment_id).await;
        assert_eq!(task.status, DeployStatus::Success);
        assert_eq!(task.outcomes.len(), 1);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, DeployEvent::DeployFinished { status: DeployStatus::Success, .. }));
    }

    #[tokio::test]
    async fn test_unknown_service_is_rejected() {
        let state = app_state();
        let err = trigger_deploy(RequireApiKey, State(state), Path("ghost".to_string()), request("1.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_deploy_of_same_service_conflicts() {
        let state = app_state();
        trigger_deploy(RequireApiKey, State(state.clone()), Path("api".to_string()), request("1.1"))
            .await
            .unwrap();
        let err = trigger_deploy(RequireApiKey, State(state), Path("api".to_string()), request("1.2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_batch_validation() {
        let state = app_state();
        let target = ServiceTarget {
            service: "api".to_string(),
            tag: "1.1".to_string(),
        };

        let empty = BatchDeployRequest {
            services: Vec::new(),
            options: DeployOptions::default(),
        };
        let err = trigger_batch(RequireApiKey, State(state.clone()), Json(empty)).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let duplicated = BatchDeployRequest {
            services: vec![target.clone(), target],
            options: DeployOptions::default(),
        };
        let err = trigger_batch(RequireApiKey, State(state), Json(duplicated)).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_missing_deployment() {
        let state = app_state();
        let err = get_deployment(State(state), Path("nope".to_string())).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn test_request_options_are_flattened() {
        let request: BatchDeployRequest = serde_json::from_str(
            r#"{"services":[{"service":"api","tag":"1.1"}],"update_manifest":true,"retry_on_conflict":true}"#,
        )
        .unwrap();
        assert!(request.options.update_manifest);
        assert!(request.options.retry_on_conflict);
        assert!(request.options.release_tag.is_none());
    }

    #[tokio::test]
    async fn test_event_stream_counts_pipeline_that_finishes_first() {
        let (tx, rx) = broadcast::channel(8);
        let outcome = DeploymentOutcome {
            success: true,
            manifest_commit: Some(ManifestCommit {
                commit_id: "c1".to_string(),
                branch: "main".to_string(),
                file_path: "stack.yml".to_string(),
            }),
            ..DeploymentOutcome::failed("api", "")
        };
        let pipeline_done = crate::domain::pipeline::PipelineEvent {
            deployment_id: "d-1".to_string(),
            kind: crate::domain::pipeline::PipelineEventKind::Completed,
            repo_id: "ops/deploy".to_string(),
            commit_sha: "c1".to_string(),
            pipeline_id: Some(3),
            status: crate::domain::pipeline::PipelineStatus::Success,
            url: None,
            timestamp: chrono::Utc::now(),
        };

        tx.send(DeployEvent::Pipeline(pipeline_done)).unwrap();
        tx.send(DeployEvent::DeployFinished {
            status: DeployStatus::Success,
            outcomes: vec![outcome],
        })
        .unwrap();

        let events: Vec<DeployEvent> = tokio::time::timeout(
            Duration::from_secs(1),
            deployment_events("d-1".to_string(), rx, None).collect(),
        )
        .await
        .expect("stream should close once every pipeline finished");

        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["pipeline", "deploy"]);
        drop(tx);
    }

    #[test]
    fn test_pending_pipelines_counts_distinct_commits() {
        let committed = |id: &str| DeploymentOutcome {
            manifest_commit: Some(ManifestCommit {
                commit_id: id.to_string(),
                branch: "main".to_string(),
                file_path: "stack.yml".to_string(),
            }),
            ..DeploymentOutcome::failed("svc", "")
        };
        let outcomes = vec![committed("c1"), committed("c1"), committed("c2"), DeploymentOutcome::failed("x", "")];
        assert_eq!(pending_pipelines(&outcomes), 2);
        assert_eq!(pending_pipelines(&[]), 0);
    }
}
