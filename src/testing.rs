//! 测试用的内存实现
//!
//! 每个 fake 都记录收到的调用，测试通过这些记录断言行为

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::domain::cluster::{
    ClusterNode, ClusterTask, ImageRef, NodeImage, NodeRole, NodeState, ServiceSpec, TaskState,
};
use crate::domain::pipeline::{PipelineEvent, PipelineInfo};
use crate::domain::registry::RegistryCredential;
use crate::infra::cluster::{ClusterApi, ClusterError};
use crate::infra::notifier::PipelineEventSink;
use crate::infra::registry::{IssuedToken, RegistryError, RegistryTokenApi};
use crate::infra::source_control::{CommitInfo, RepoFile, SourceControlApi, SourceControlError};

pub fn ready_node(hostname: &str) -> ClusterNode {
    ClusterNode {
        id: format!("id-{}", hostname),
        hostname: hostname.to_string(),
        role: NodeRole::Worker,
        state: NodeState::Ready,
    }
}

pub fn down_node(hostname: &str) -> ClusterNode {
    ClusterNode {
        state: NodeState::Down,
        ..ready_node(hostname)
    }
}

pub fn service_spec(name: &str, image: &str, replicas: u64) -> ServiceSpec {
    ServiceSpec {
        id: format!("svc-{}", name),
        name: name.to_string(),
        version_index: 10,
        image: image.to_string(),
        desired_replicas: replicas,
        force_update: 0,
        raw_spec: serde_json::json!({ "Name": name }),
    }
}

/// `node` 为 hostname，fake 内部换成节点 ID；`age_secs` 为距今秒数
pub fn task(node: &str, state: TaskState, desired: TaskState, age_secs: i64) -> ClusterTask {
    ClusterTask {
        id: format!("task-{}-{}-{}", node, state.as_str(), age_secs),
        node_id: format!("id-{}", node),
        state,
        desired_state: desired,
        error: None,
        updated_at: Utc::now() - ChronoDuration::seconds(age_secs),
    }
}

pub fn failed_task(node: &str, error: &str, age_secs: i64) -> ClusterTask {
    ClusterTask {
        error: Some(error.to_string()),
        ..task(node, TaskState::Failed, TaskState::Running, age_secs)
    }
}

/// 一次 update_service 调用
#[derive(Clone, Debug)]
pub struct RecordedUpdate {
    pub service: String,
    pub image: String,
    pub version: u64,
    pub force_update: u64,
    pub with_credential: bool,
}

/// 集群 API fake
#[derive(Default)]
pub struct FakeCluster {
    nodes: Vec<ClusterNode>,
    services: Mutex<HashMap<String, ServiceSpec>>,
    failing_pulls: HashSet<String>,
    hanging_pulls: HashSet<String>,
    node_images: HashMap<String, Vec<NodeImage>>,
    conflicts_remaining: AtomicUsize,
    task_scripts: Mutex<HashMap<String, VecDeque<Vec<ClusterTask>>>>,
    pulls: Mutex<Vec<(String, String)>>,
    updates: Mutex<Vec<RecordedUpdate>>,
}

impl FakeCluster {
    pub fn new(nodes: Vec<ClusterNode>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn with_service(self, spec: ServiceSpec) -> Self {
        self.services
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec);
        self
    }

    pub fn fail_pull_on(mut self, hostname: &str) -> Self {
        self.failing_pulls.insert(hostname.to_string());
        self
    }

    /// 该节点的拉取永远不返回
    pub fn hang_pull_on(mut self, hostname: &str) -> Self {
        self.hanging_pulls.insert(hostname.to_string());
        self
    }

    pub fn with_node_images(mut self, hostname: &str, images: Vec<NodeImage>) -> Self {
        self.node_images.insert(hostname.to_string(), images);
        self
    }

    /// 前 `n` 次 update_service 返回版本冲突
    pub fn with_conflicts(self, n: usize) -> Self {
        self.conflicts_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// 每次 list_tasks 依次返回一组任务，最后一组重复返回
    pub fn with_task_script(self, script: Vec<Vec<ClusterTask>>) -> Self {
        self.with_service_tasks("*", script)
    }

    /// 只对某个服务 ID 生效的任务脚本
    pub fn with_service_tasks(self, service_id: &str, script: Vec<Vec<ClusterTask>>) -> Self {
        self.task_scripts
            .lock()
            .unwrap()
            .insert(service_id.to_string(), script.into());
        self
    }

    pub fn pulls(&self) -> Vec<(String, String)> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn pulls_of(&self, image: &str) -> usize {
        self.pulls().iter().filter(|(_, i)| i == image).count()
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        Ok(self.nodes.clone())
    }

    async fn get_service(&self, name: &str) -> Result<ServiceSpec, ClusterError> {
        self.services
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn pull_image(
        &self,
        node: &ClusterNode,
        image: &ImageRef,
        _credential: Option<&RegistryCredential>,
    ) -> Result<(), ClusterError> {
        self.pulls
            .lock()
            .unwrap()
            .push((node.hostname.clone(), image.to_string()));
        if self.failing_pulls.contains(&node.hostname) {
            return Err(ClusterError::Pull(format!("connection reset by {}", node.hostname)));
        }
        if self.hanging_pulls.contains(&node.hostname) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn list_node_images(&self, node: &ClusterNode) -> Result<Vec<NodeImage>, ClusterError> {
        self.node_images
            .get(&node.hostname)
            .cloned()
            .ok_or_else(|| ClusterError::Malformed(format!("no image list for {}", node.hostname)))
    }

    async fn update_service(
        &self,
        spec: &ServiceSpec,
        expected_version: u64,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), ClusterError> {
        self.updates.lock().unwrap().push(RecordedUpdate {
            service: spec.name.clone(),
            image: spec.image.clone(),
            version: expected_version,
            force_update: spec.force_update,
            with_credential: credential.is_some(),
        });

        let mut services = self.services.lock().unwrap();
        let current = services
            .get_mut(&spec.name)
            .ok_or_else(|| ClusterError::NotFound(spec.name.clone()))?;

        if self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            // 模拟其他写入者抢先更新
            current.version_index += 1;
            return Err(ClusterError::Conflict {
                service: spec.name.clone(),
                version: expected_version,
            });
        }
        if current.version_index != expected_version {
            return Err(ClusterError::Conflict {
                service: spec.name.clone(),
                version: expected_version,
            });
        }

        current.version_index += 1;
        current.image = spec.image.clone();
        current.force_update = spec.force_update;
        Ok(())
    }

    async fn list_tasks(&self, service_id: &str) -> Result<Vec<ClusterTask>, ClusterError> {
        let mut scripts = self.task_scripts.lock().unwrap();
        let key = if scripts.contains_key(service_id) { service_id } else { "*" };
        let Some(script) = scripts.get_mut(key) else {
            return Ok(Vec::new());
        };
        let tasks = if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        };
        Ok(tasks)
    }
}

/// 仓库令牌 fake
pub struct FakeRegistry {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    failing: AtomicBool,
    issued: AtomicUsize,
}

impl FakeRegistry {
    /// `credentials` 为 "user:pass"
    pub fn new(credentials: &str, expires_at: Option<DateTime<Utc>>) -> Self {
        use base64::Engine;
        Self {
            token: base64::engine::general_purpose::STANDARD.encode(credentials),
            expires_at,
            failing: AtomicBool::new(false),
            issued: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryTokenApi for FakeRegistry {
    async fn issue_token(&self) -> Result<IssuedToken, RegistryError> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RegistryError::Empty);
        }
        Ok(IssuedToken {
            authorization_token: self.token.clone(),
            registry_host: "registry.example.com".to_string(),
            expires_at: self.expires_at,
        })
    }
}

/// 一次 commit_file 调用
#[derive(Clone, Debug)]
pub struct RecordedCommit {
    pub repo: String,
    pub branch: String,
    pub path: String,
    pub content: String,
    pub message: String,
}

/// 源码托管平台 fake
#[derive(Default)]
pub struct FakeSourceControl {
    /// (repo, path, branch) -> 文件
    files: Mutex<HashMap<(String, String, String), RepoFile>>,
    failing_repos: HashSet<String>,
    /// 读取文件后让出执行权，让并发的写入者插进来
    yield_after_read: bool,
    stale_rejections: AtomicUsize,
    pipeline_script: Mutex<VecDeque<Vec<PipelineInfo>>>,
    pipeline_polls: AtomicUsize,
    commits: Mutex<Vec<RecordedCommit>>,
    tags: Mutex<Vec<(String, String, String)>>,
}

impl FakeSourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, repo: &str, path: &str, branch: &str, content: &str) -> Self {
        self.files.lock().unwrap().insert(
            (repo.to_string(), path.to_string(), branch.to_string()),
            RepoFile {
                content: content.to_string(),
                last_commit_id: "seed".to_string(),
            },
        );
        self
    }

    pub fn with_read_yield(mut self) -> Self {
        self.yield_after_read = true;
        self
    }

    /// 该仓库的提交全部失败
    pub fn fail_commits_to(mut self, repo: &str) -> Self {
        self.failing_repos.insert(repo.to_string());
        self
    }

    /// 每次 list_pipelines 依次返回一组流水线，最后一组重复返回
    pub fn with_pipeline_script(self, script: Vec<Vec<PipelineInfo>>) -> Self {
        *self.pipeline_script.lock().unwrap() = script.into();
        self
    }

    pub fn file(&self, repo: &str, path: &str, branch: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(repo.to_string(), path.to_string(), branch.to_string()))
            .map(|f| f.content.clone())
    }

    /// 因 `last_commit_id` 过期被拒绝的提交次数
    pub fn stale_rejections(&self) -> usize {
        self.stale_rejections.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.commits.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<(String, String, String)> {
        self.tags.lock().unwrap().clone()
    }

    pub fn pipeline_polls(&self) -> usize {
        self.pipeline_polls.load(Ordering::SeqCst)
    }
}

pub fn pipeline(id: u64, status: &str) -> PipelineInfo {
    PipelineInfo {
        id,
        status: status.to_string(),
        web_url: Some(format!("https://git.example.com/pipelines/{}", id)),
    }
}

#[async_trait]
impl SourceControlApi for FakeSourceControl {
    async fn get_file(&self, repo: &str, path: &str, branch: &str) -> Result<RepoFile, SourceControlError> {
        let file = self
            .files
            .lock()
            .unwrap()
            .get(&(repo.to_string(), path.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| SourceControlError::FileNotFound {
                path: path.to_string(),
                branch: branch.to_string(),
            })?;
        if self.yield_after_read {
            tokio::task::yield_now().await;
        }
        Ok(file)
    }

    async fn commit_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
        last_commit_id: &str,
    ) -> Result<CommitInfo, SourceControlError> {
        if self.failing_repos.contains(repo) {
            return Err(SourceControlError::Status {
                status: reqwest::StatusCode::FORBIDDEN,
                body: "push rejected".to_string(),
            });
        }

        let key = (repo.to_string(), path.to_string(), branch.to_string());
        let mut files = self.files.lock().unwrap();
        let current = files.get(&key).map(|f| f.last_commit_id.as_str());
        if current.is_some_and(|id| id != last_commit_id) {
            self.stale_rejections.fetch_add(1, Ordering::SeqCst);
            return Err(SourceControlError::StaleFile { path: path.to_string() });
        }

        let mut commits = self.commits.lock().unwrap();
        commits.push(RecordedCommit {
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            message: message.to_string(),
        });
        let id = format!("commit-{}", commits.len());
        files.insert(
            key,
            RepoFile {
                content: content.to_string(),
                last_commit_id: id.clone(),
            },
        );

        Ok(CommitInfo { id, web_url: None })
    }

    async fn create_tag(
        &self,
        repo: &str,
        tag_name: &str,
        target: &str,
        _message: &str,
    ) -> Result<(), SourceControlError> {
        self.tags
            .lock()
            .unwrap()
            .push((repo.to_string(), tag_name.to_string(), target.to_string()));
        Ok(())
    }

    async fn list_pipelines(&self, _repo: &str, _sha: &str) -> Result<Vec<PipelineInfo>, SourceControlError> {
        self.pipeline_polls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.pipeline_script.lock().unwrap();
        let pipelines = if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        };
        Ok(pipelines)
    }
}

/// 记录收到的流水线事件
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineEventSink for RecordingSink {
    async fn emit(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}
