//! 部署编排
//!
//! 单服务和批量部署共用同一条流程：
//! 解析白名单 → 按目标镜像分组拉取 → 逐个更新并检查健康 → 按仓库分组提交 manifest → 后台监控流水线。
//! 所有错误都转换成 `DeploymentOutcome`，不会抛给调用方。

pub mod manifest_writer;

use futures::future::join_all;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{HealthSettings, ManifestPolicy, MonitorSettings, ServiceMapping, ServiceResolver};
use crate::domain::cluster::{ClusterNode, ImageRef, ServiceSpec};
use crate::domain::deploy::{DeploymentOutcome, SyncReport};
use crate::error::DeployError;
use crate::infra::cluster::ClusterApi;
use crate::infra::notifier::PipelineEventSink;
use crate::infra::source_control::SourceControlApi;
use crate::services::credential::CredentialCache;
use crate::services::health::HealthVerifier;
use crate::services::image_sync::NodeImageSynchronizer;
use crate::services::pipeline_monitor::{PipelineMonitor, WatchTarget};
use crate::services::service_updater::ServiceUpdater;

pub use manifest_writer::{FileUpdate, ManifestEntry, ManifestFile, ManifestWriter};

/// 部署目标：逻辑服务名 + 镜像 tag
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceTarget {
    pub service: String,
    pub tag: String,
}

/// 部署选项
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeployOptions {
    /// 上线后把新 tag 写回 manifest
    #[serde(default)]
    pub update_manifest: bool,
    /// 单服务部署时在 manifest 仓库打发布 tag
    #[serde(default)]
    pub release_tag: Option<String>,
    /// 版本冲突时重新读取服务并重试一次
    #[serde(default)]
    pub retry_on_conflict: bool,
}

/// 编排器的可调参数
#[derive(Clone, Debug, Default)]
pub struct EngineSettings {
    pub health: HealthSettings,
    pub pipeline: MonitorSettings,
    pub policy: ManifestPolicy,
}

pub struct DeploymentOrchestrator {
    resolver: Arc<dyn ServiceResolver>,
    cluster: Arc<dyn ClusterApi>,
    synchronizer: NodeImageSynchronizer,
    updater: ServiceUpdater,
    verifier: HealthVerifier,
    manifests: ManifestWriter,
    monitor: Arc<PipelineMonitor>,
    policy: ManifestPolicy,
}

/// 已解析、等待上线的服务
struct Rollout {
    /// 在请求中的位置，用于按输入顺序返回结果
    index: usize,
    mapping: ServiceMapping,
    tag: String,
    spec: ServiceSpec,
    image: ImageRef,
}

/// 已经走完集群阶段的服务
struct Applied {
    rollout: Rollout,
    outcome: DeploymentOutcome,
    /// 服务规格已提交到集群
    updated: bool,
    /// 所有就绪节点都拉取成功
    all_nodes: bool,
    /// manifest 处理后的目标 ref（提交 ID 或未变更时的分支），发布 tag 指向它
    manifest_ref: Option<String>,
}

impl Applied {
    /// 没有改动集群的结果
    fn aborted(rollout: Rollout, report: &SyncReport, message: String) -> Self {
        Self {
            outcome: DeploymentOutcome {
                image: Some(rollout.image.to_string()),
                pull_outcomes: report.outcomes.clone(),
                ..DeploymentOutcome::failed(&rollout.mapping.name, message)
            },
            updated: false,
            all_nodes: report.all_succeeded(),
            manifest_ref: None,
            rollout,
        }
    }
}

impl DeploymentOrchestrator {
    pub fn new(
        resolver: Arc<dyn ServiceResolver>,
        cluster: Arc<dyn ClusterApi>,
        credentials: Option<Arc<CredentialCache>>,
        source_control: Arc<dyn SourceControlApi>,
        sink: Arc<dyn PipelineEventSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            synchronizer: NodeImageSynchronizer::new(cluster.clone(), credentials.clone()),
            updater: ServiceUpdater::new(cluster.clone(), credentials),
            verifier: HealthVerifier::new(cluster.clone(), settings.health),
            manifests: ManifestWriter::new(source_control.clone()),
            monitor: Arc::new(PipelineMonitor::new(source_control, sink, settings.pipeline)),
            policy: settings.policy,
            resolver,
            cluster,
        }
    }

    /// 部署单个服务
    pub async fn deploy(&self, deployment_id: &str, target: &ServiceTarget, options: &DeployOptions) -> DeploymentOutcome {
        info!(
            deployment_id = %deployment_id,
            service = %target.service,
            tag = %target.tag,
            "Starting deployment"
        );
        self.run(deployment_id, std::slice::from_ref(target), options)
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| DeploymentOutcome::failed(&target.service, "deployment produced no outcome"))
    }

    /// 批量部署，结果顺序与 `targets` 一致
    ///
    /// 目标镜像相同的服务只拉取一次；同一 manifest 文件只提交一次
    pub async fn deploy_batch(
        &self,
        deployment_id: &str,
        targets: &[ServiceTarget],
        options: &DeployOptions,
    ) -> Vec<DeploymentOutcome> {
        info!(deployment_id = %deployment_id, count = targets.len(), "Starting batch deployment");
        if options.release_tag.is_some() {
            warn!(deployment_id = %deployment_id, "Release tags are only created for single-service deployments");
        }
        let options = DeployOptions {
            release_tag: None,
            ..options.clone()
        };
        self.run(deployment_id, targets, &options).await
    }

    async fn run(&self, deployment_id: &str, targets: &[ServiceTarget], options: &DeployOptions) -> Vec<DeploymentOutcome> {
        let mut settled: Vec<(usize, DeploymentOutcome)> = Vec::with_capacity(targets.len());
        let mut rollouts = Vec::with_capacity(targets.len());

        let prepared = join_all(targets.iter().map(|t| self.prepare(t))).await;
        for (index, (target, result)) in targets.iter().zip(prepared).enumerate() {
            match result {
                Ok((mapping, spec, image)) => rollouts.push(Rollout {
                    index,
                    mapping,
                    tag: target.tag.clone(),
                    spec,
                    image,
                }),
                Err(e) => {
                    warn!(deployment_id = %deployment_id, service = %target.service, error = %e, "Cannot deploy service");
                    settled.push((index, DeploymentOutcome::failed(&target.service, e.to_string())));
                }
            }
        }

        if !rollouts.is_empty() {
            match self.cluster.list_nodes().await {
                Ok(nodes) => {
                    let mut groups: BTreeMap<ImageRef, Vec<Rollout>> = BTreeMap::new();
                    for rollout in rollouts {
                        groups.entry(rollout.image.clone()).or_default().push(rollout);
                    }

                    let applied: Vec<Applied> = join_all(
                        groups
                            .into_iter()
                            .map(|(image, members)| self.run_group(&nodes, image, members, options)),
                    )
                    .await
                    .into_iter()
                    .flatten()
                    .collect();

                    let applied = self.record_manifests(deployment_id, applied, options).await;
                    settled.extend(applied.into_iter().map(|a| (a.rollout.index, a.outcome)));
                }
                Err(e) => {
                    error!(deployment_id = %deployment_id, error = %e, "Cannot list cluster nodes");
                    for rollout in rollouts {
                        settled.push((
                            rollout.index,
                            DeploymentOutcome::failed(&rollout.mapping.name, format!("cannot list cluster nodes: {}", e)),
                        ));
                    }
                }
            }
        }

        settled.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<DeploymentOutcome> = settled.into_iter().map(|(_, outcome)| outcome).collect();
        info!(
            deployment_id = %deployment_id,
            succeeded = outcomes.iter().filter(|o| o.success).count(),
            total = outcomes.len(),
            "Deployment finished"
        );
        outcomes
    }

    /// 解析白名单并读取服务当前规格，得出目标镜像
    async fn prepare(&self, target: &ServiceTarget) -> Result<(ServiceMapping, ServiceSpec, ImageRef), DeployError> {
        let mapping = self.resolver.resolve(&target.service).await?;
        let spec = self.cluster.get_service(mapping.cluster_service_name()).await?;
        let base = match &mapping.image_repository {
            Some(repository) => ImageRef::parse(repository),
            None => ImageRef::parse(&spec.image),
        };
        let image = base.with_tag(&target.tag);
        debug!(service = %target.service, from = %spec.image, to = %image, "Resolved target image");
        Ok((mapping, spec, image))
    }

    /// 拉取一次镜像，然后各服务独立更新
    async fn run_group(
        &self,
        nodes: &[ClusterNode],
        image: ImageRef,
        members: Vec<Rollout>,
        options: &DeployOptions,
    ) -> Vec<Applied> {
        let services: Vec<&str> = members.iter().map(|r| r.mapping.name.as_str()).collect();
        info!(image = %image, services = ?services, "Synchronizing image");

        let report = self.synchronizer.sync_image(nodes, &image).await;
        if !report.is_usable() {
            let err = DeployError::TotalPullFailure {
                image: image.to_string(),
                attempted: report.total(),
            };
            error!(image = %image, error = %err, "Aborting before service update");
            return members
                .into_iter()
                .map(|rollout| Applied::aborted(rollout, &report, err.to_string()))
                .collect();
        }

        join_all(members.into_iter().map(|rollout| self.apply(rollout, &report, options))).await
    }

    async fn apply(&self, rollout: Rollout, report: &SyncReport, options: &DeployOptions) -> Applied {
        let updated = match self.update(&rollout, options).await {
            Ok(spec) => spec,
            Err(e) => {
                error!(service = %rollout.mapping.name, error = %e, "Service update failed");
                let message = format!("{} pulled on {}; update failed: {}", rollout.image, report.summary(), e);
                return Applied::aborted(rollout, report, message);
            }
        };

        let health = self
            .verifier
            .check_health(&updated, self.verifier.default_timeout())
            .await;

        let outcome = DeploymentOutcome {
            service_name: rollout.mapping.name.clone(),
            success: health.is_healthy(),
            image: Some(rollout.image.to_string()),
            pull_outcomes: report.outcomes.clone(),
            message: format!("{} pulled on {}; {}", rollout.image, report.summary(), health.describe()),
            health: Some(health),
            manifest_commit: None,
            manifest_error: None,
        };

        Applied {
            outcome,
            updated: true,
            all_nodes: report.all_succeeded(),
            manifest_ref: None,
            rollout,
        }
    }

    async fn update(&self, rollout: &Rollout, options: &DeployOptions) -> Result<ServiceSpec, DeployError> {
        match self.updater.update_service(&rollout.spec, &rollout.image).await {
            Err(e) if e.is_conflict() && options.retry_on_conflict => {
                warn!(service = %rollout.spec.name, error = %e, "Retrying update with a fresh service version");
                let fresh = self.cluster.get_service(&rollout.spec.name).await?;
                self.updater.update_service(&fresh, &rollout.image).await
            }
            result => result,
        }
    }

    /// 把已上线的 tag 写回 manifest
    ///
    /// 不同仓库并发，同一仓库内的文件顺序提交。manifest 失败不影响 `success`。
    async fn record_manifests(&self, deployment_id: &str, mut applied: Vec<Applied>, options: &DeployOptions) -> Vec<Applied> {
        if !options.update_manifest {
            return applied;
        }

        // repo -> 文件 -> (applied 下标, 写入项)
        let mut repos: BTreeMap<String, BTreeMap<ManifestFile, Vec<(usize, ManifestEntry)>>> = BTreeMap::new();
        for (i, item) in applied.iter_mut().enumerate() {
            if !item.updated {
                continue;
            }
            let Some(location) = item.rollout.mapping.manifest.clone() else {
                debug!(service = %item.rollout.mapping.name, "No manifest configured");
                continue;
            };
            if let Some(reason) = blocked_by_policy(&self.policy, item) {
                info!(service = %item.rollout.mapping.name, reason = reason, "Manifest update skipped");
                item.outcome.manifest_error = Some(reason.to_string());
                item.outcome
                    .message
                    .push_str(&format!("; manifest not updated: {}", reason));
                continue;
            }

            let entry = ManifestEntry {
                key: item
                    .rollout
                    .mapping
                    .manifest_key()
                    .unwrap_or(&item.rollout.mapping.name)
                    .to_string(),
                tag: item.rollout.tag.clone(),
            };
            let file = ManifestFile {
                repo_id: location.repo_id.clone(),
                file_path: location.file_path,
                branch: location.branch,
            };
            repos
                .entry(location.repo_id)
                .or_default()
                .entry(file)
                .or_default()
                .push((i, entry));
        }

        let results = join_all(repos.into_values().map(|files| async move {
            let (members, batch): (Vec<Vec<usize>>, Vec<(ManifestFile, Vec<ManifestEntry>)>) = files
                .into_iter()
                .map(|(file, items)| {
                    let (indices, entries): (Vec<usize>, Vec<ManifestEntry>) = items.into_iter().unzip();
                    (indices, (file, entries))
                })
                .unzip();
            members
                .into_iter()
                .zip(self.manifests.update_repo(batch).await)
                .collect::<Vec<_>>()
        }))
        .await;

        for (indices, (file, result)) in results.into_iter().flatten() {
            match result {
                Ok(FileUpdate::Committed(commit)) => {
                    info!(
                        deployment_id = %deployment_id,
                        repo = %file.repo_id,
                        path = %file.file_path,
                        commit = %commit.commit_id,
                        "Manifest committed"
                    );
                    self.monitor.spawn(WatchTarget {
                        deployment_id: deployment_id.to_string(),
                        repo_id: file.repo_id.clone(),
                        commit_sha: commit.commit_id.clone(),
                    });
                    for i in indices {
                        let item = &mut applied[i];
                        item.outcome
                            .message
                            .push_str(&format!("; manifest committed {}", short_sha(&commit.commit_id)));
                        item.outcome.manifest_commit = Some(commit.clone());
                        item.manifest_ref = Some(commit.commit_id.clone());
                    }
                }
                Ok(FileUpdate::Unchanged) => {
                    for i in indices {
                        let item = &mut applied[i];
                        item.outcome
                            .message
                            .push_str(&format!("; manifest already at {}", item.rollout.tag));
                        item.manifest_ref = Some(file.branch.clone());
                    }
                }
                Err(e) => {
                    for i in indices {
                        let item = &mut applied[i];
                        item.outcome.manifest_error = Some(e.to_string());
                        item.outcome
                            .message
                            .push_str(&format!("; manifest not updated: {}", e));
                    }
                }
            }
        }

        if let Some(tag) = &options.release_tag {
            for item in applied.iter_mut() {
                let (Some(target), Some(location)) = (&item.manifest_ref, &item.rollout.mapping.manifest) else {
                    continue;
                };
                match self.manifests.create_release_tag(&location.repo_id, tag, target).await {
                    Ok(()) => {
                        info!(repo = %location.repo_id, tag = %tag, target = %target, "Release tag created");
                        item.outcome.message.push_str(&format!("; tagged {}", tag));
                    }
                    Err(e) => {
                        warn!(repo = %location.repo_id, tag = %tag, error = %e, "Release tag failed");
                        item.outcome
                            .message
                            .push_str(&format!("; release tag {} failed: {}", tag, e));
                    }
                }
            }
        }

        applied
    }
}

fn blocked_by_policy(policy: &ManifestPolicy, item: &Applied) -> Option<&'static str> {
    if policy.require_all_nodes && !item.all_nodes {
        return Some("image is missing on some nodes");
    }
    if policy.require_healthy && !item.outcome.success {
        return Some("service is not healthy");
    }
    None
}

fn short_sha(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
